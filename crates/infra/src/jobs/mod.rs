//! Render jobs: records, orchestration, artifact handoff and retention.
//!
//! ## Flow
//!
//! - `JobService::submit` creates a `pending` record and schedules
//!   `Orchestrator::process` on the runtime
//! - the orchestrator flips the job to `processing`, runs the sandbox and
//!   checks the page and size budgets
//! - `ArtifactHandoff` settles a single owner for the artifact (the job, or
//!   the project's compiled output)
//! - exactly one terminal transition is recorded, with diagnostics
//! - `RetentionSweeper` later deletes terminal jobs past the retention window

pub mod diagnostics;
pub mod handoff;
pub mod orchestrator;
pub mod postgres;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod types;

pub use diagnostics::{degraded_payload, Diagnostics, PhaseDiagnostics, SandboxReport, Termination};
pub use handoff::{ArtifactHandoff, ArtifactOwner};
pub use orchestrator::{JobFailure, Orchestrator, OrchestratorError};
pub use postgres::PostgresJobStore;
pub use service::{JobFilter, JobService, ServiceError};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use sweeper::{RetentionSweeper, SweepReport, SweeperHandle, ABANDONED_MESSAGE};
pub use types::{CompletedOutput, Job, JobId, JobSource, JobStatus, TransitionError};
