//! Drives one job from `pending` to exactly one terminal state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{error, info, instrument, warn};

use folio_core::ProjectId;
use folio_engine::ProjectSource;

use super::diagnostics::Diagnostics;
use super::handoff::ArtifactHandoff;
use super::store::{JobStore, JobStoreError};
use super::types::{CompletedOutput, Job, JobId, JobSource, JobStatus};
use crate::config::RenderLimits;
use crate::sandbox::{
    FailureKind, Sandbox, SandboxError, SandboxInput, SandboxOutcome, SandboxSource,
};

/// Why a job failed. The message is stored verbatim on the job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobFailure {
    #[error("{0}")]
    Compile(String),
    #[error("{0}")]
    Render(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    BudgetExceeded(String),
    #[error("{0}")]
    Infrastructure(String),
}

impl JobFailure {
    /// The `error_kind` recorded in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            JobFailure::Compile(_) => "compile",
            JobFailure::Render(_) => "render",
            JobFailure::Timeout(_) => "timeout",
            JobFailure::BudgetExceeded(_) => "budget_exceeded",
            JobFailure::Infrastructure(_) => "infrastructure",
        }
    }

    fn from_reported(kind: FailureKind, error: String) -> Self {
        match kind {
            FailureKind::Compile => JobFailure::Compile(error),
            FailureKind::Render => JobFailure::Render(error),
            FailureKind::Timeout => JobFailure::Timeout(error),
            FailureKind::Unknown => JobFailure::Infrastructure(error),
        }
    }

    fn from_sandbox(err: &SandboxError) -> Self {
        match err {
            SandboxError::TimedOut { .. } => JobFailure::Timeout(err.to_string()),
            SandboxError::Oversized { .. } => JobFailure::BudgetExceeded(err.to_string()),
            _ => JobFailure::Infrastructure(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// In-process single flight per project.
///
/// Held from sandbox start until the terminal transition, so compiled output
/// is only replaced by one job at a time. It does not order against cancels:
/// a cancel after the handoff keeps the job cancelled but the project's new
/// output stays.
#[derive(Debug, Default)]
struct ProjectLocks {
    locks: Mutex<HashMap<ProjectId, Arc<AsyncMutex<()>>>>,
}

impl ProjectLocks {
    async fn acquire(&self, project_id: ProjectId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries only referenced by the map are idle.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(project_id).or_default())
        };
        lock.lock_owned().await
    }
}

/// The job worker.
///
/// Constructed explicitly with its store, sandbox, handoff and limits.
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    sandbox: Arc<dyn Sandbox>,
    handoff: ArtifactHandoff,
    limits: RenderLimits,
    project_locks: ProjectLocks,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        sandbox: Arc<dyn Sandbox>,
        handoff: ArtifactHandoff,
        limits: RenderLimits,
    ) -> Self {
        Self {
            store,
            sandbox,
            handoff,
            limits,
            project_locks: ProjectLocks::default(),
        }
    }

    pub fn limits(&self) -> &RenderLimits {
        &self.limits
    }

    pub fn handoff(&self) -> &ArtifactHandoff {
        &self.handoff
    }

    /// Run a job to a terminal state and return the final record.
    ///
    /// Jobs already terminal are returned untouched. Only store errors escape;
    /// every pipeline failure ends in a `failed` transition.
    #[instrument(skip_all, fields(job_id = %job_id), err)]
    pub async fn process(&self, job_id: JobId) -> Result<Job, OrchestratorError> {
        let job = self.store.get(job_id, None).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }

        let job = match self
            .store
            .transition(job_id, JobStatus::Processing, None, None)
            .await
        {
            Ok(job) => job,
            // Cancelled between the read and the flip.
            Err(JobStoreError::InvalidTransition(_)) => return Ok(self.store.get(job_id, None).await?),
            Err(e) => return Err(e.into()),
        };

        let _project_guard = match job.project_id() {
            Some(project_id) => Some(self.project_locks.acquire(project_id).await),
            None => None,
        };

        info!(job_id = %job_id, owner_id = %job.owner_id, "job processing");
        let input = self.sandbox_input(&job);
        let result = self.sandbox.run(input).await;

        // Cancellation does not interrupt the sandbox; its result is discarded instead.
        let current = self.store.get(job_id, None).await?;
        if current.status != JobStatus::Processing {
            info!(job_id = %job_id, status = %current.status, "discarding sandbox result");
            return Ok(current);
        }

        match result {
            Ok(SandboxOutcome::Success {
                artifact,
                page_count,
                diagnostics,
            }) => self.complete(&job, artifact, page_count, diagnostics).await,
            Ok(SandboxOutcome::Failure {
                kind,
                error,
                diagnostics,
            }) => {
                self.fail(job_id, JobFailure::from_reported(kind, error), diagnostics)
                    .await
            }
            Err(err) => {
                let diagnostics = Diagnostics::default().with_sandbox(err.report().cloned());
                self.fail(job_id, JobFailure::from_sandbox(&err), diagnostics)
                    .await
            }
        }
    }

    fn sandbox_input(&self, job: &Job) -> SandboxInput {
        let source = match &job.source {
            JobSource::Project(project_id) => SandboxSource::Project(ProjectSource {
                owner_id: job.owner_id,
                project_id: *project_id,
                source_dir: self
                    .handoff
                    .storage()
                    .project_source_dir(job.owner_id, *project_id),
            }),
            JobSource::Inline(document) => SandboxSource::Inline {
                document: document.clone(),
            },
        };
        SandboxInput {
            job_id: job.id,
            source,
            options: job.options.clone(),
            timeout: self.limits.timeout,
            max_artifact_bytes: self.limits.max_bytes,
        }
    }

    async fn complete(
        &self,
        job: &Job,
        artifact: Vec<u8>,
        page_count: u32,
        diagnostics: Diagnostics,
    ) -> Result<Job, OrchestratorError> {
        let size_bytes = artifact.len() as u64;
        if let Err(failure) = self.limits.check(page_count, size_bytes) {
            return self.fail(job.id, failure, diagnostics).await;
        }

        let owner = match self.handoff.finalize(job, artifact).await {
            Ok(owner) => owner,
            Err(e) => {
                let failure = JobFailure::Infrastructure(format!("failed to store artifact: {e}"));
                return self.fail(job.id, failure, diagnostics).await;
            }
        };

        let output = CompletedOutput {
            output_ref: owner.job_ref(),
            size_bytes,
            page_count,
            diagnostics: Some(diagnostics.to_payload()),
        };
        match self.store.attach_output(job.id, output).await {
            Ok(completed) => {
                info!(
                    job_id = %job.id,
                    page_count,
                    size_bytes,
                    transferred = completed.output_ref.is_none(),
                    "job completed"
                );
                Ok(completed)
            }
            Err(JobStoreError::InvalidTransition(_)) => {
                // Cancelled while finalizing; the job must not keep a file.
                if let Err(e) = self.handoff.discard(&owner).await {
                    warn!(job_id = %job.id, error = %e, "failed to discard artifact of cancelled job");
                }
                Ok(self.store.get(job.id, None).await?)
            }
            Err(e) => {
                if let Err(discard) = self.handoff.discard(&owner).await {
                    warn!(job_id = %job.id, error = %discard, "failed to discard artifact");
                }
                Err(e.into())
            }
        }
    }

    async fn fail(
        &self,
        job_id: JobId,
        failure: JobFailure,
        diagnostics: Diagnostics,
    ) -> Result<Job, OrchestratorError> {
        let error_kind = failure.kind();
        error!(job_id = %job_id, error_kind, error = %failure, "job failed");

        let payload = diagnostics.with_error_kind(error_kind).to_payload();
        match self
            .store
            .transition(job_id, JobStatus::Failed, Some(failure.to_string()), Some(payload))
            .await
        {
            Ok(job) => Ok(job),
            Err(JobStoreError::InvalidTransition(_)) => Ok(self.store.get(job_id, None).await?),
            Err(e) => Err(e.into()),
        }
    }
}
