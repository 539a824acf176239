//! Structured per-job diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One pipeline phase (`compile` or `render`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseDiagnostics {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Phase-specific statistics.
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub stats: JsonValue,
}

impl PhaseDiagnostics {
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.started_at = Some(now);
    }

    pub fn succeed(&mut self, now: DateTime<Utc>, stats: JsonValue, warnings: Vec<String>) {
        self.completed_at = Some(now);
        self.stats = stats;
        self.warnings.extend(warnings);
    }

    pub fn fail(&mut self, now: DateTime<Utc>, error: impl Into<String>) {
        self.completed_at = Some(now);
        self.error = Some(error.into());
    }

    /// A phase that had nothing to do.
    pub fn skipped(now: DateTime<Utc>, stats: JsonValue) -> Self {
        Self {
            started_at: Some(now),
            completed_at: Some(now),
            stats,
            ..Default::default()
        }
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && self.completed_at.is_none()
    }
}

/// How the sandbox process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Exited on its own.
    Exited,
    /// Stopped by SIGTERM.
    Terminated,
    /// Force-killed.
    Killed,
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Termination::Exited => "exited",
            Termination::Terminated => "terminated",
            Termination::Killed => "killed",
        })
    }
}

/// Parent-side record of one sandbox process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxReport {
    pub pid: Option<u32>,
    /// `"exit code N"`, `"signal N"`, or `None` if the status could not be reaped.
    pub exit_status: Option<String>,
    pub wall_ms: u64,
    pub termination: Termination,
}

impl SandboxReport {
    pub fn exit_description(&self) -> &str {
        self.exit_status.as_deref().unwrap_or("unknown exit status")
    }
}

/// Diagnostics stored on the job record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub compile: PhaseDiagnostics,
    pub render: PhaseDiagnostics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxReport>,
    /// Failure classification, set on the failed path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl Diagnostics {
    pub fn with_sandbox(mut self, report: Option<SandboxReport>) -> Self {
        if report.is_some() {
            self.sandbox = report;
        }
        self
    }

    pub fn with_error_kind(mut self, kind: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self
    }

    /// Serialize for storage. Never fails: an unserializable record is
    /// replaced by a degraded marker.
    pub fn to_payload(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or_else(|e| degraded_payload(&e.to_string()))
    }
}

/// Marker stored when the structured diagnostics are unavailable.
pub fn degraded_payload(reason: &str) -> JsonValue {
    serde_json::json!({
        "degraded": true,
        "reason": reason,
    })
}
