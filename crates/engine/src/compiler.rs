use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use folio_core::{OwnerId, ProjectId};

use crate::document::{DeviceProfile, Document};

/// Location of a project's sources, handed to the compiler.
///
/// Project file layout is owned by the project store; the pipeline only
/// passes the directory through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSource {
    pub owner_id: OwnerId,
    pub project_id: ProjectId,
    pub source_dir: PathBuf,
}

/// Statistics reported by a compile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileStats {
    pub files: usize,
    pub source_bytes: u64,
    pub pages: usize,
}

/// Result of expanding a project into a renderable document.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledDocument {
    pub document: Document,
    pub stats: CompileStats,
    /// Non-fatal findings (skipped files, empty pages, ...).
    pub warnings: Vec<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("invalid project: {0}")]
    InvalidProject(String),

    #[error("template error in {file}: {message}")]
    Template { file: String, message: String },

    #[error("failed to read project sources: {0}")]
    Io(String),
}

/// Expands a project's templates into a renderable document.
pub trait DocumentCompiler: Send + Sync {
    fn compile(
        &self,
        project: &ProjectSource,
        profile: &DeviceProfile,
    ) -> Result<CompiledDocument, CompileError>;
}
