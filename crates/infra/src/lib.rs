//! Infrastructure layer: job records, sandboxed execution, artifact storage.
//!
//! - `jobs`: the job record store, orchestrator, handoff, sweeper and the
//!   request-facing service
//! - `sandbox`: both sides of the isolated render process
//! - `storage`: filesystem layout for job and project artifacts
//! - `config`: limits and knobs, loaded from the environment

pub mod config;
pub mod jobs;
pub mod sandbox;
pub mod storage;

pub use config::{ConfigError, PipelineConfig, RenderLimits, RetentionConfig, SandboxConfig};
