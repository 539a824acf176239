use thiserror::Error;

use crate::document::Document;

/// Bytes produced by a render plus any non-fatal warnings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOutput {
    pub bytes: Vec<u8>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("unknown device profile: {0}")]
    UnknownProfile(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// A warning escalated because the job asked for strict rendering.
    #[error("strict mode: {0}")]
    Strict(String),

    #[error("engine failure: {0}")]
    Engine(String),
}

/// Lays out a document for a device profile and produces the artifact bytes.
pub trait DocumentRenderer: Send + Sync {
    fn render(
        &self,
        document: &Document,
        profile_name: &str,
        deterministic: bool,
        strict: bool,
    ) -> Result<RenderOutput, RenderError>;
}
