//! Artifact handoff from job storage to permanent project storage.

use tracing::{info, warn};

use super::types::Job;
use crate::storage::{ArtifactStorage, StorageError, StoragePath};

/// Who owns a finalized artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactOwner {
    /// The job's own storage holds the artifact.
    Job(StoragePath),
    /// Ownership moved to the project's compiled output.
    Project(StoragePath),
}

impl ArtifactOwner {
    /// The reference recorded on the job row; `None` once the project owns it.
    pub fn job_ref(&self) -> Option<StoragePath> {
        match self {
            ArtifactOwner::Job(path) => Some(path.clone()),
            ArtifactOwner::Project(_) => None,
        }
    }

    pub fn path(&self) -> &StoragePath {
        match self {
            ArtifactOwner::Job(path) | ArtifactOwner::Project(path) => path,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactHandoff {
    storage: ArtifactStorage,
}

impl ArtifactHandoff {
    pub fn new(storage: ArtifactStorage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &ArtifactStorage {
        &self.storage
    }

    /// Persist an artifact and settle its single owner.
    ///
    /// The bytes always land in job storage first. Project jobs then move
    /// the file into the project's compiled output; if that move fails the
    /// job keeps the artifact. The filesystem work runs on the blocking pool.
    ///
    /// A project move replaces the previous compiled output before the job
    /// row is completed. Callers hold the project's lock so no other render
    /// interleaves, but a cancel landing in between leaves the new output in
    /// place; project files are never rolled back.
    pub async fn finalize(&self, job: &Job, artifact: Vec<u8>) -> Result<ArtifactOwner, StorageError> {
        let (job_id, owner_id, project_id) = (job.id, job.owner_id, job.project_id());
        self.storage
            .run_blocking(move |storage| {
                let job_path = storage.job_artifact_path(job_id);
                storage.write_atomic(&job_path, &artifact)?;

                let Some(project_id) = project_id else {
                    return Ok(ArtifactOwner::Job(job_path));
                };

                let project_path = storage.project_output_path(owner_id, project_id);
                match storage.move_artifact(&job_path, &project_path) {
                    Ok(()) => {
                        info!(job_id = %job_id, project_id = %project_id, path = %project_path, "artifact handed to project");
                        Ok(ArtifactOwner::Project(project_path))
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, project_id = %project_id, error = %e, "project handoff failed; job keeps artifact");
                        Ok(ArtifactOwner::Job(job_path))
                    }
                }
            })
            .await
    }

    /// Remove an artifact the job still owns. Project-owned files are never touched.
    pub async fn discard(&self, owner: &ArtifactOwner) -> Result<(), StorageError> {
        if let ArtifactOwner::Job(path) = owner {
            let path = path.clone();
            self.storage
                .run_blocking(move |storage| storage.delete(&path).map(|_| ()))
                .await?;
        }
        Ok(())
    }
}
