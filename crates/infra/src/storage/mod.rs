//! Filesystem layout for artifacts.
//!
//! ```text
//! <root>/jobs/<job_id>/output.pdf                        job-owned artifact
//! <root>/projects/<owner>/<project>/compiled/output.pdf  project-owned artifact
//! <root>/projects/<owner>/<project>/source/              project sources
//! <root>/scratch/<job_id>/                               sandbox exchange area
//! ```
//!
//! Paths stored on job records are relative to the root so a deployment can
//! move the root without rewriting rows.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use folio_core::{OwnerId, ProjectId};

use crate::jobs::JobId;

const ARTIFACT_FILE: &str = "output.pdf";

/// A storage location relative to the artifact root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoragePath(String);

impl StoragePath {
    /// Validate a relative path: no absolute paths, no `..` segments.
    pub fn new(path: impl Into<String>) -> Result<Self, StorageError> {
        let path = path.into();
        let valid = !path.is_empty()
            && Path::new(&path)
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidPath(path));
        }
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StoragePath {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StoragePath> for String {
    fn from(value: StoragePath) -> Self {
        value.0
    }
}

impl std::fmt::Display for StoragePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid storage path: {0}")]
    InvalidPath(String),

    #[error("artifact not found: {0}")]
    NotFound(StoragePath),

    #[error("storage I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("storage task failed: {0}")]
    Task(String),
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Artifact storage rooted at a single directory.
#[derive(Debug, Clone)]
pub struct ArtifactStorage {
    root: PathBuf,
}

impl ArtifactStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, path: &StoragePath) -> PathBuf {
        self.root.join(&path.0)
    }

    pub fn job_artifact_path(&self, job_id: JobId) -> StoragePath {
        StoragePath(format!("jobs/{job_id}/{ARTIFACT_FILE}"))
    }

    pub fn project_output_path(&self, owner_id: OwnerId, project_id: ProjectId) -> StoragePath {
        StoragePath(format!(
            "projects/{owner_id}/{project_id}/compiled/{ARTIFACT_FILE}"
        ))
    }

    pub fn project_source_dir(&self, owner_id: OwnerId, project_id: ProjectId) -> PathBuf {
        self.root
            .join("projects")
            .join(owner_id.to_string())
            .join(project_id.to_string())
            .join("source")
    }

    /// Per-job directory the sandbox child writes its artifact into.
    pub fn scratch_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join("scratch").join(job_id.to_string())
    }

    /// Run filesystem work on the blocking pool, off the async workers.
    pub async fn run_blocking<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(&ArtifactStorage) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.clone();
        tokio::task::spawn_blocking(move || op(&storage))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }

    /// Write `bytes` to `path` via a temporary file renamed into place.
    pub fn write_atomic(&self, path: &StoragePath, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path);
        let dir = parent_dir(&target)?;
        fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StorageError::io(dir, e))?;
        tmp.as_file_mut()
            .write_all(bytes)
            .map_err(|e| StorageError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| StorageError::io(tmp.path(), e))?;
        tmp.persist(&target)
            .map_err(|e| StorageError::io(&target, e.error))?;
        Ok(())
    }

    pub fn read(&self, path: &StoragePath) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path);
        fs::read(&full).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(path.clone()),
            _ => StorageError::io(&full, e),
        })
    }

    /// Size in bytes of a stored artifact.
    pub fn size(&self, path: &StoragePath) -> Result<u64, StorageError> {
        let full = self.resolve(path);
        fs::metadata(&full)
            .map(|meta| meta.len())
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => StorageError::NotFound(path.clone()),
                _ => StorageError::io(&full, e),
            })
    }

    pub fn exists(&self, path: &StoragePath) -> bool {
        self.resolve(path).is_file()
    }

    /// Delete an artifact. Returns `false` if it was already gone.
    ///
    /// The containing directory is removed too when it ends up empty.
    pub fn delete(&self, path: &StoragePath) -> Result<bool, StorageError> {
        let full = self.resolve(path);
        match fs::remove_file(&full) {
            Ok(()) => {
                if let Some(dir) = full.parent() {
                    let _ = fs::remove_dir(dir);
                }
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(&full, e)),
        }
    }

    /// Move an artifact, replacing whatever is at `to`.
    ///
    /// The rename is atomic within one filesystem. If the source is still
    /// present afterwards it is removed so no second copy lingers.
    pub fn move_artifact(&self, from: &StoragePath, to: &StoragePath) -> Result<(), StorageError> {
        let src = self.resolve(from);
        let dst = self.resolve(to);
        let dir = parent_dir(&dst)?;
        fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;

        fs::rename(&src, &dst).map_err(|e| StorageError::io(&dst, e))?;

        if src.exists() {
            tracing::warn!(source = %from, "artifact source still present after move; removing");
            self.delete(from)?;
        } else if let Some(dir) = src.parent() {
            let _ = fs::remove_dir(dir);
        }
        Ok(())
    }
}

fn parent_dir(path: &Path) -> Result<&Path, StorageError> {
    path.parent()
        .ok_or_else(|| StorageError::InvalidPath(path.display().to_string()))
}
