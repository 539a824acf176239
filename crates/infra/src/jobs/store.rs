//! Job record storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use folio_core::OwnerId;
use folio_engine::RenderOptions;

use super::types::{CompletedOutput, Job, JobId, JobSource, JobStatus, TransitionError};

/// Job record store.
///
/// Every mutation is applied as one unit: status, outcome fields and
/// diagnostics are written together or not at all.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a pending job.
    async fn create(
        &self,
        owner_id: OwnerId,
        source: JobSource,
        options: RenderOptions,
    ) -> Result<Job, JobStoreError>;

    /// Fetch a job. With `owner_id`, a job owned by someone else is `NotFound`.
    async fn get(&self, job_id: JobId, owner_id: Option<OwnerId>) -> Result<Job, JobStoreError>;

    /// An owner's jobs, newest first.
    async fn list(
        &self,
        owner_id: OwnerId,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Move a job along the state machine.
    async fn transition(
        &self,
        job_id: JobId,
        to: JobStatus,
        error: Option<String>,
        diagnostics: Option<JsonValue>,
    ) -> Result<Job, JobStoreError>;

    /// Complete a `processing` job together with its output fields.
    async fn attach_output(
        &self,
        job_id: JobId,
        output: CompletedOutput,
    ) -> Result<Job, JobStoreError>;

    /// Terminal jobs whose `completed_at` is before `cutoff`.
    async fn list_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// Jobs still `processing` that started before `cutoff`.
    async fn list_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a fully formed record (fixtures, imports).
    pub fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".to_string()))
    }

    /// Apply `f` to a copy and only store it if `f` succeeds.
    fn mutate<F>(&self, job_id: JobId, f: F) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), TransitionError>,
    {
        let mut jobs = self.write()?;
        let current = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        let mut next = current.clone();
        f(&mut next)?;
        *current = next.clone();
        Ok(next)
    }
}

fn newest_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(
        &self,
        owner_id: OwnerId,
        source: JobSource,
        options: RenderOptions,
    ) -> Result<Job, JobStoreError> {
        let job = Job::new(owner_id, source, options);
        self.insert(job.clone())?;
        Ok(job)
    }

    async fn get(&self, job_id: JobId, owner_id: Option<OwnerId>) -> Result<Job, JobStoreError> {
        let jobs = self.read()?;
        match jobs.get(&job_id) {
            Some(job) if owner_id.is_none_or(|o| o == job.owner_id) => Ok(job.clone()),
            _ => Err(JobStoreError::NotFound(job_id)),
        }
    }

    async fn list(
        &self,
        owner_id: OwnerId,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.owner_id == owner_id && status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();

        newest_first(&mut result);
        Ok(result.into_iter().skip(offset).take(limit).collect())
    }

    async fn transition(
        &self,
        job_id: JobId,
        to: JobStatus,
        error: Option<String>,
        diagnostics: Option<JsonValue>,
    ) -> Result<Job, JobStoreError> {
        self.mutate(job_id, |job| {
            job.apply_transition(to, error, diagnostics, Utc::now())
                .map(|_| ())
        })
    }

    async fn attach_output(
        &self,
        job_id: JobId,
        output: CompletedOutput,
    ) -> Result<Job, JobStoreError> {
        self.mutate(job_id, |job| job.apply_output(output, Utc::now()))
    }

    async fn list_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        Ok(jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.completed_at.is_some_and(|c| c < cutoff))
            .cloned()
            .collect())
    }

    async fn list_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        Ok(jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Processing && j.started_at.is_some_and(|s| s < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.write()?
            .remove(&job_id)
            .map(|_| ())
            .ok_or(JobStoreError::NotFound(job_id))
    }
}
