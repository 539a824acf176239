//! Tracing and logging setup shared by the folio binaries.

/// Tracing configuration (filters, output format, writers).
pub mod tracing;

pub use tracing::{LogFormat, LogTarget};

/// Initialize process-wide tracing for an orchestrating process.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogFormat::from_env(), LogTarget::Stdout);
}

/// Initialize tracing inside a sandbox child.
///
/// The child's stdout carries its single result line, so every log record
/// goes to stderr where the parent picks it up.
pub fn init_sandbox() {
    tracing::init(LogFormat::from_env(), LogTarget::Stderr);
}
