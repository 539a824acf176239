//! Job operations exposed to the request layer.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use folio_core::OwnerId;
use folio_engine::RenderOptions;

use super::orchestrator::Orchestrator;
use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobId, JobSource, JobStatus};
use crate::storage::{ArtifactStorage, StorageError};

pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {job_id} is {status} and can no longer be cancelled")]
    NotCancellable { job_id: JobId, status: JobStatus },

    #[error("job {job_id} is {status}, not completed")]
    NotCompleted { job_id: JobId, status: JobStatus },

    #[error("artifact for job {0} is missing")]
    ArtifactMissing(JobId),

    #[error(transparent)]
    Store(JobStoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<JobStoreError> for ServiceError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::NotFound(id) => ServiceError::NotFound(id),
            other => ServiceError::Store(other),
        }
    }
}

/// Filters for [`JobService::list_jobs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    orchestrator: Arc<Orchestrator>,
    storage: ArtifactStorage,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, orchestrator: Arc<Orchestrator>) -> Self {
        let storage = orchestrator.handoff().storage().clone();
        Self {
            store,
            orchestrator,
            storage,
        }
    }

    pub async fn create_job(
        &self,
        owner_id: OwnerId,
        source: JobSource,
        options: RenderOptions,
    ) -> Result<Job, ServiceError> {
        let job = self.store.create(owner_id, source, options).await?;
        info!(job_id = %job.id, owner_id = %owner_id, project_id = ?job.project_id(), "job created");
        Ok(job)
    }

    /// Create a job and schedule its processing without waiting for it.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn submit(
        &self,
        owner_id: OwnerId,
        source: JobSource,
        options: RenderOptions,
    ) -> Result<Job, ServiceError> {
        let job = self.create_job(owner_id, source, options).await?;
        self.schedule(job.id);
        Ok(job)
    }

    /// Fire-and-forget `process`. If the task errors or panics the job is
    /// failed on a best-effort basis so it never stays in `processing`.
    pub fn schedule(&self, job_id: JobId) {
        let orchestrator = Arc::clone(&self.orchestrator);
        let store = Arc::clone(&self.store);

        tokio::spawn(async move {
            let outcome = tokio::spawn(async move { orchestrator.process(job_id).await }).await;
            let message = match outcome {
                Ok(Ok(_)) => return,
                Ok(Err(e)) => format!("job processing aborted: {e}"),
                Err(e) => format!("job processing crashed: {e}"),
            };
            error!(job_id = %job_id, error = %message, "job processing did not finish");

            let diagnostics = serde_json::json!({ "error_kind": "infrastructure" });
            match store
                .transition(job_id, JobStatus::Failed, Some(message), Some(diagnostics))
                .await
            {
                Ok(_) | Err(JobStoreError::InvalidTransition(_)) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "best-effort failure transition failed"),
            }
        });
    }

    pub async fn get_job(&self, job_id: JobId, owner_id: OwnerId) -> Result<Job, ServiceError> {
        Ok(self.store.get(job_id, Some(owner_id)).await?)
    }

    /// Newest first. The limit is clamped to `1..=100`.
    pub async fn list_jobs(&self, owner_id: OwnerId, filter: JobFilter) -> Result<Vec<Job>, ServiceError> {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        Ok(self
            .store
            .list(owner_id, filter.status, limit, filter.offset)
            .await?)
    }

    /// Cancel a pending or processing job. An in-flight sandbox is not
    /// interrupted; its result is discarded when it arrives.
    pub async fn cancel_job(&self, job_id: JobId, owner_id: OwnerId) -> Result<Job, ServiceError> {
        let job = self.store.get(job_id, Some(owner_id)).await?;
        if job.status.is_terminal() {
            return Err(ServiceError::NotCancellable {
                job_id,
                status: job.status,
            });
        }

        match self
            .store
            .transition(job_id, JobStatus::Cancelled, None, None)
            .await
        {
            Ok(job) => {
                info!(job_id = %job_id, "job cancelled");
                Ok(job)
            }
            Err(JobStoreError::InvalidTransition(_)) => {
                let job = self.store.get(job_id, Some(owner_id)).await?;
                Err(ServiceError::NotCancellable {
                    job_id,
                    status: job.status,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Bytes of a completed job's artifact, wherever it currently lives.
    ///
    /// Transferred output is shared by every job of the project. When a later
    /// render has replaced it, its size no longer matches this job's record
    /// and the artifact is reported missing.
    pub async fn download(&self, job_id: JobId, owner_id: OwnerId) -> Result<Vec<u8>, ServiceError> {
        let job = self.store.get(job_id, Some(owner_id)).await?;
        if job.status != JobStatus::Completed {
            return Err(ServiceError::NotCompleted {
                job_id,
                status: job.status,
            });
        }

        let path = match (&job.output_ref, job.project_id()) {
            (Some(output_ref), _) => output_ref.clone(),
            (None, Some(project_id)) => self.storage.project_output_path(job.owner_id, project_id),
            (None, None) => return Err(ServiceError::ArtifactMissing(job_id)),
        };
        let expected = job.size_bytes;
        let read = self
            .storage
            .run_blocking(move |storage| {
                if let Some(expected) = expected {
                    let found = storage.size(&path)?;
                    if found != expected {
                        warn!(job_id = %job_id, expected, found, "stored artifact no longer matches job");
                        return Ok(None);
                    }
                }
                storage.read(&path).map(Some)
            })
            .await;
        match read {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) | Err(StorageError::NotFound(_)) => Err(ServiceError::ArtifactMissing(job_id)),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use folio_core::ProjectId;
    use folio_engine::Document;

    use crate::config::RenderLimits;
    use crate::jobs::{ArtifactHandoff, Diagnostics, InMemoryJobStore};
    use crate::sandbox::{Sandbox, SandboxError, SandboxInput, SandboxOutcome};

    struct PdfSandbox;

    #[async_trait]
    impl Sandbox for PdfSandbox {
        async fn run(&self, input: SandboxInput) -> Result<SandboxOutcome, SandboxError> {
            Ok(SandboxOutcome::Success {
                artifact: format!("%PDF {}", input.job_id).into_bytes(),
                page_count: 1,
                diagnostics: Diagnostics::default(),
            })
        }
    }

    struct PanickingSandbox;

    #[async_trait]
    impl Sandbox for PanickingSandbox {
        async fn run(&self, _input: SandboxInput) -> Result<SandboxOutcome, SandboxError> {
            panic!("sandbox driver bug");
        }
    }

    fn service(sandbox: Arc<dyn Sandbox>) -> (tempfile::TempDir, JobService) {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryJobStore::arc();
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            sandbox,
            ArtifactHandoff::new(ArtifactStorage::new(dir.path())),
            RenderLimits::default(),
        ));
        (dir, JobService::new(store, orchestrator))
    }

    fn inline() -> JobSource {
        JobSource::Inline(Document::from_pages("t", vec!["a".into()]))
    }

    async fn wait_terminal(service: &JobService, job: &Job) -> Job {
        for _ in 0..200 {
            let current = service.get_job(job.id, job.owner_id).await.unwrap();
            if current.status.is_terminal() {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never reached a terminal state", job.id);
    }

    #[tokio::test]
    async fn submit_then_download() {
        let (_dir, service) = service(Arc::new(PdfSandbox));
        let owner = OwnerId::new();
        let job = service
            .submit(owner, inline(), RenderOptions::default())
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let done = wait_terminal(&service, &job).await;
        assert_eq!(done.status, JobStatus::Completed);
        let bytes = service.download(job.id, owner).await.unwrap();
        assert_eq!(bytes, format!("%PDF {}", job.id).into_bytes());
    }

    #[tokio::test]
    async fn download_follows_transferred_ownership() {
        let (_dir, service) = service(Arc::new(PdfSandbox));
        let owner = OwnerId::new();
        let job = service
            .submit(owner, JobSource::Project(ProjectId::new()), RenderOptions::default())
            .await
            .unwrap();

        let done = wait_terminal(&service, &job).await;
        assert!(done.output_ref.is_none());
        assert!(service.download(job.id, owner).await.unwrap().starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn replaced_project_output_is_not_served_for_an_older_job() {
        let (_dir, service) = service(Arc::new(PdfSandbox));
        let owner = OwnerId::new();
        let project_id = ProjectId::new();
        let job = service
            .submit(owner, JobSource::Project(project_id), RenderOptions::default())
            .await
            .unwrap();
        wait_terminal(&service, &job).await;

        let output = service.storage.project_output_path(owner, project_id);
        service
            .storage
            .write_atomic(&output, b"%PDF rendered later by another job")
            .unwrap();

        let err = service.download(job.id, owner).await.unwrap_err();
        assert!(matches!(err, ServiceError::ArtifactMissing(id) if id == job.id));
    }

    #[tokio::test]
    async fn panicking_task_leaves_job_failed() {
        let (_dir, service) = service(Arc::new(PanickingSandbox));
        let owner = OwnerId::new();
        let job = service
            .submit(owner, inline(), RenderOptions::default())
            .await
            .unwrap();

        let done = wait_terminal(&service, &job).await;
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error_message.unwrap().contains("crashed"));
    }

    #[tokio::test]
    async fn cancel_rules() {
        let (_dir, service) = service(Arc::new(PdfSandbox));
        let owner = OwnerId::new();
        let job = service
            .create_job(owner, inline(), RenderOptions::default())
            .await
            .unwrap();

        assert!(matches!(
            service.cancel_job(job.id, OwnerId::new()).await,
            Err(ServiceError::NotFound(_))
        ));
        let cancelled = service.cancel_job(job.id, owner).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        assert!(matches!(
            service.cancel_job(job.id, owner).await,
            Err(ServiceError::NotCancellable { status: JobStatus::Cancelled, .. })
        ));
        assert!(matches!(
            service.download(job.id, owner).await,
            Err(ServiceError::NotCompleted { .. })
        ));
    }

    #[tokio::test]
    async fn list_clamps_limit_and_filters() {
        let (_dir, service) = service(Arc::new(PdfSandbox));
        let owner = OwnerId::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let job = service
                .create_job(owner, inline(), RenderOptions::default())
                .await
                .unwrap();
            ids.push(job.id);
        }
        service.cancel_job(ids[0], owner).await.unwrap();

        let one = service
            .list_jobs(owner, JobFilter { limit: Some(0), ..JobFilter::default() })
            .await
            .unwrap();
        assert_eq!(one.len(), 1);

        let pending = service
            .list_jobs(
                owner,
                JobFilter {
                    status: Some(JobStatus::Pending),
                    ..JobFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|j| j.id != ids[0]));
    }
}
