//! Tracing/logging initialization.
//!
//! JSON records with timestamps by default, filtered through `RUST_LOG`.
//! Set `FOLIO_LOG_FORMAT=pretty` for human-readable output during development.

use tracing_subscriber::EnvFilter;

/// Output encoding for log records.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// Reads `FOLIO_LOG_FORMAT`; anything other than `pretty` means JSON.
    pub fn from_env() -> Self {
        match std::env::var("FOLIO_LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

/// Where log records are written.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Stderr,
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(format: LogFormat, target: LogTarget) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match (format, target) {
        (LogFormat::Json, LogTarget::Stdout) => builder.json().with_target(false).try_init(),
        (LogFormat::Json, LogTarget::Stderr) => builder
            .json()
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init(),
        (LogFormat::Pretty, LogTarget::Stdout) => builder.with_target(true).try_init(),
        (LogFormat::Pretty, LogTarget::Stderr) => builder
            .with_target(true)
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .try_init(),
    };
}
