//! Isolated execution of the compile + render pipeline.
//!
//! One OS process per job. The parent ([`ProcessSandbox`]) writes a
//! [`SandboxRequest`] to the child's stdin and reads exactly one
//! [`SandboxReply`] line from its stdout; the artifact itself travels through
//! a scratch file the parent owns. The child ([`run_child`]) carries its own
//! wall-clock guard, and the parent enforces a second, slightly larger bound
//! with escalating termination.

pub mod child;
pub mod pipeline;
pub mod process;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use folio_engine::{Document, ProjectSource, RenderOptions};

use crate::jobs::{Diagnostics, JobId, SandboxReport};

pub use child::{run_child, TIMEOUT_EXIT_CODE};
pub use pipeline::{run_pipeline, PipelineFailure, RenderedArtifact};
pub use process::{Execution, ProcessSandbox};

/// Work handed to the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxSource {
    Project(ProjectSource),
    Inline { document: Document },
}

/// Parent-side description of one sandbox run.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxInput {
    pub job_id: JobId,
    pub source: SandboxSource,
    pub options: RenderOptions,
    pub timeout: Duration,
    /// Artifacts larger than this are rejected before being read.
    pub max_artifact_bytes: u64,
}

/// Request written to the child's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub job_id: JobId,
    pub source: SandboxSource,
    pub options: RenderOptions,
    pub timeout_ms: u64,
    /// Where the child writes the artifact bytes on success.
    pub artifact_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Compile,
    Render,
    Timeout,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Compile => "compile",
            FailureKind::Render => "render",
            FailureKind::Timeout => "timeout",
            FailureKind::Unknown => "unknown",
        }
    }
}

/// The single line the child writes to stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SandboxReply {
    Success {
        page_count: u32,
        size_bytes: u64,
        diagnostics: Diagnostics,
    },
    Failure {
        kind: FailureKind,
        error: String,
        diagnostics: Diagnostics,
    },
}

/// Result of a sandbox run that produced a report.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxOutcome {
    Success {
        artifact: Vec<u8>,
        page_count: u32,
        diagnostics: Diagnostics,
    },
    Failure {
        kind: FailureKind,
        error: String,
        diagnostics: Diagnostics,
    },
}

/// The sandbox did not produce a usable report.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to start sandbox: {0}")]
    Spawn(String),

    #[error("no result within {timeout_ms} ms; sandbox process {}", .report.termination)]
    TimedOut { timeout_ms: u64, report: SandboxReport },

    #[error("sandbox exited without a result ({})", .report.exit_description())]
    NoResult { report: SandboxReport },

    #[error("malformed sandbox result: {message}")]
    Protocol { message: String, report: SandboxReport },

    #[error("sandbox artifact unusable: {message}")]
    Artifact { message: String, report: SandboxReport },

    #[error("artifact is {size_bytes} bytes, limit is {limit}")]
    Oversized {
        size_bytes: u64,
        limit: u64,
        report: SandboxReport,
    },
}

impl SandboxError {
    pub fn report(&self) -> Option<&SandboxReport> {
        match self {
            SandboxError::Spawn(_) => None,
            SandboxError::TimedOut { report, .. }
            | SandboxError::NoResult { report }
            | SandboxError::Protocol { report, .. }
            | SandboxError::Artifact { report, .. }
            | SandboxError::Oversized { report, .. } => Some(report),
        }
    }
}

/// Runs one job's pipeline in isolation.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run(&self, input: SandboxInput) -> Result<SandboxOutcome, SandboxError>;
}
