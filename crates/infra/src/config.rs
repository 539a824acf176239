//! Pipeline configuration.
//!
//! Every knob has a documented fallback; a value that is present but
//! malformed is an error rather than a silent default.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::JobFailure;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_PAGES: u32 = 1000;
pub const DEFAULT_MAX_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_STORAGE_ROOT: &str = "folio-data";

/// Subcommand the default sandbox program is invoked with.
pub const SANDBOX_SUBCOMMAND: &str = "sandbox";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },

    #[error("cannot locate the current executable for the default sandbox: {0}")]
    CurrentExe(String),
}

impl ConfigError {
    fn invalid(key: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            message: message.into(),
        }
    }
}

/// Budgets enforced on every job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderLimits {
    /// Wall-clock budget handed to the sandbox's inner guard.
    pub timeout: Duration,
    pub max_pages: u32,
    pub max_bytes: u64,
}

impl Default for RenderLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_pages: DEFAULT_MAX_PAGES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl RenderLimits {
    /// Check a successful render against the page and size budgets.
    pub fn check(&self, page_count: u32, size_bytes: u64) -> Result<(), JobFailure> {
        if page_count > self.max_pages {
            return Err(JobFailure::BudgetExceeded(format!(
                "rendered {page_count} pages, limit is {}",
                self.max_pages
            )));
        }
        if size_bytes > self.max_bytes {
            return Err(JobFailure::BudgetExceeded(format!(
                "artifact is {size_bytes} bytes, limit is {}",
                self.max_bytes
            )));
        }
        Ok(())
    }
}

/// How the sandbox process is launched and torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Program that speaks the sandbox protocol on stdin/stdout.
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra time the orchestrating side waits beyond the job timeout.
    pub grace: Duration,
    /// Time allowed between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Address-space limit applied inside the child (Linux only).
    pub memory_limit_bytes: Option<u64>,
}

impl SandboxConfig {
    pub fn for_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            grace: DEFAULT_GRACE,
            kill_grace: DEFAULT_KILL_GRACE,
            memory_limit_bytes: None,
        }
    }

    /// Re-invoke the running binary with the `sandbox` subcommand.
    pub fn current_exe() -> Result<Self, ConfigError> {
        let exe = std::env::current_exe().map_err(|e| ConfigError::CurrentExe(e.to_string()))?;
        Ok(Self::for_program(exe).with_args([SANDBOX_SUBCOMMAND]))
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Terminal jobs older than this are reclaimed.
    pub window: Duration,
    pub sweep_interval: Duration,
    /// Jobs stuck in `processing` longer than this are failed. `None` disables reclaim.
    pub stale_after: Option<Duration>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_RETENTION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            stale_after: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub storage_root: PathBuf,
    pub database_url: Option<String>,
    pub limits: RenderLimits,
    pub sandbox: SandboxConfig,
    pub retention: RetentionConfig,
}

impl PipelineConfig {
    /// Load from `FOLIO_*` environment variables.
    ///
    /// | Variable | Fallback |
    /// |----------|----------|
    /// | `FOLIO_STORAGE_ROOT` | `folio-data` |
    /// | `DATABASE_URL` | unset (in-memory store) |
    /// | `FOLIO_RENDER_TIMEOUT_SECS` | 120 |
    /// | `FOLIO_MAX_PAGES` | 1000 |
    /// | `FOLIO_MAX_BYTES` | 52428800 |
    /// | `FOLIO_SANDBOX_PROGRAM` | current executable + `sandbox` |
    /// | `FOLIO_SANDBOX_GRACE_SECS` | 5 |
    /// | `FOLIO_KILL_GRACE_SECS` | 2 |
    /// | `FOLIO_SANDBOX_MEMORY_BYTES` | unset |
    /// | `FOLIO_RETENTION_HOURS` | 24 |
    /// | `FOLIO_SWEEP_INTERVAL_SECS` | 600 |
    /// | `FOLIO_STALE_PROCESSING_SECS` | unset (reclaim disabled) |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let limits = RenderLimits {
            timeout: positive_secs(get("FOLIO_RENDER_TIMEOUT_SECS"), "FOLIO_RENDER_TIMEOUT_SECS")?
                .unwrap_or(DEFAULT_TIMEOUT),
            max_pages: positive::<u32>(get("FOLIO_MAX_PAGES"), "FOLIO_MAX_PAGES")?
                .unwrap_or(DEFAULT_MAX_PAGES),
            max_bytes: positive::<u64>(get("FOLIO_MAX_BYTES"), "FOLIO_MAX_BYTES")?
                .unwrap_or(DEFAULT_MAX_BYTES),
        };

        let mut sandbox = match get("FOLIO_SANDBOX_PROGRAM") {
            Some(program) => SandboxConfig::for_program(program),
            None => SandboxConfig::current_exe()?,
        };
        if let Some(grace) = positive_secs(get("FOLIO_SANDBOX_GRACE_SECS"), "FOLIO_SANDBOX_GRACE_SECS")? {
            sandbox.grace = grace;
        }
        if let Some(kill_grace) = positive_secs(get("FOLIO_KILL_GRACE_SECS"), "FOLIO_KILL_GRACE_SECS")? {
            sandbox.kill_grace = kill_grace;
        }
        sandbox.memory_limit_bytes =
            positive::<u64>(get("FOLIO_SANDBOX_MEMORY_BYTES"), "FOLIO_SANDBOX_MEMORY_BYTES")?;

        let window = match positive::<u64>(get("FOLIO_RETENTION_HOURS"), "FOLIO_RETENTION_HOURS")? {
            Some(hours) => hours_to_duration(hours)
                .ok_or_else(|| ConfigError::invalid("FOLIO_RETENTION_HOURS", "too large"))?,
            None => DEFAULT_RETENTION,
        };
        let retention = RetentionConfig {
            window,
            sweep_interval: positive_secs(
                get("FOLIO_SWEEP_INTERVAL_SECS"),
                "FOLIO_SWEEP_INTERVAL_SECS",
            )?
            .unwrap_or(DEFAULT_SWEEP_INTERVAL),
            stale_after: positive_secs(
                get("FOLIO_STALE_PROCESSING_SECS"),
                "FOLIO_STALE_PROCESSING_SECS",
            )?,
        };

        let config = Self {
            storage_root: get("FOLIO_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT)),
            database_url: get("DATABASE_URL"),
            limits,
            sandbox,
            retention,
        };
        config.validate()?;
        Ok(config)
    }

    /// Longest a healthy job can stay in `processing`: the job timeout, the
    /// outer grace, then the SIGTERM to SIGKILL window.
    pub fn max_processing_time(&self) -> Duration {
        self.limits
            .timeout
            .saturating_add(self.sandbox.grace)
            .saturating_add(self.sandbox.kill_grace)
    }

    /// Cross-field checks. Stale reclaim must not fire on a job that is
    /// still inside its own time bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(stale_after) = self.retention.stale_after {
            let bound = self.max_processing_time();
            if stale_after <= bound {
                return Err(ConfigError::invalid(
                    "FOLIO_STALE_PROCESSING_SECS",
                    format!(
                        "{}s does not exceed the {}s a job may legitimately run",
                        stale_after.as_secs(),
                        bound.as_secs()
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// `None` when the hour count does not fit in a `Duration` of seconds.
pub fn hours_to_duration(hours: u64) -> Option<Duration> {
    hours.checked_mul(60 * 60).map(Duration::from_secs)
}

fn positive<T>(raw: Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: T = raw
        .trim()
        .parse()
        .map_err(|e| ConfigError::invalid(key, format!("'{raw}': {e}")))?;
    if value <= T::default() {
        return Err(ConfigError::invalid(key, "must be greater than zero"));
    }
    Ok(Some(value))
}

fn positive_secs(raw: Option<String>, key: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(positive::<u64>(raw, key)?.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn fallbacks_apply_when_unset() {
        let config = PipelineConfig::from_lookup(lookup(&[("FOLIO_SANDBOX_PROGRAM", "/bin/true")])).unwrap();
        assert_eq!(config.limits, RenderLimits::default());
        assert_eq!(config.retention, RetentionConfig::default());
        assert_eq!(config.sandbox.grace, DEFAULT_GRACE);
        assert_eq!(config.sandbox.kill_grace, DEFAULT_KILL_GRACE);
        assert_eq!(config.storage_root, PathBuf::from(DEFAULT_STORAGE_ROOT));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn values_are_read_from_the_environment() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("FOLIO_SANDBOX_PROGRAM", "/bin/true"),
            ("FOLIO_RENDER_TIMEOUT_SECS", "30"),
            ("FOLIO_MAX_PAGES", "10"),
            ("FOLIO_RETENTION_HOURS", "1"),
            ("FOLIO_STALE_PROCESSING_SECS", "900"),
        ]))
        .unwrap();
        assert_eq!(config.limits.timeout, Duration::from_secs(30));
        assert_eq!(config.limits.max_pages, 10);
        assert_eq!(config.retention.window, Duration::from_secs(3600));
        assert_eq!(config.retention.stale_after, Some(Duration::from_secs(900)));
    }

    #[test]
    fn malformed_or_zero_values_are_rejected() {
        let err = PipelineConfig::from_lookup(lookup(&[
            ("FOLIO_SANDBOX_PROGRAM", "/bin/true"),
            ("FOLIO_MAX_PAGES", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "FOLIO_MAX_PAGES", .. }));

        let err = PipelineConfig::from_lookup(lookup(&[
            ("FOLIO_SANDBOX_PROGRAM", "/bin/true"),
            ("FOLIO_RENDER_TIMEOUT_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "FOLIO_RENDER_TIMEOUT_SECS", .. }));
    }

    #[test]
    fn budget_check_names_the_exceeded_limit() {
        let limits = RenderLimits {
            max_pages: 1000,
            max_bytes: 2048,
            ..RenderLimits::default()
        };
        assert!(limits.check(1000, 2048).is_ok());

        let err = limits.check(1500, 10).unwrap_err();
        assert!(matches!(err, JobFailure::BudgetExceeded(ref m) if m.contains("1500 pages")));
        assert!(matches!(limits.check(1, 4096), Err(JobFailure::BudgetExceeded(_))));
    }

    #[test]
    fn stale_threshold_must_outlast_a_running_job() {
        let err = PipelineConfig::from_lookup(lookup(&[
            ("FOLIO_SANDBOX_PROGRAM", "/bin/true"),
            ("FOLIO_STALE_PROCESSING_SECS", "60"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "FOLIO_STALE_PROCESSING_SECS", .. }));

        // 120s timeout + 5s grace + 2s kill grace.
        let at_bound = PipelineConfig::from_lookup(lookup(&[
            ("FOLIO_SANDBOX_PROGRAM", "/bin/true"),
            ("FOLIO_STALE_PROCESSING_SECS", "127"),
        ]));
        assert!(at_bound.is_err());

        let config = PipelineConfig::from_lookup(lookup(&[
            ("FOLIO_SANDBOX_PROGRAM", "/bin/true"),
            ("FOLIO_STALE_PROCESSING_SECS", "128"),
        ]))
        .unwrap();
        assert_eq!(config.retention.stale_after, Some(Duration::from_secs(128)));
    }

    #[test]
    fn huge_retention_is_rejected_not_overflowed() {
        assert_eq!(hours_to_duration(2), Some(Duration::from_secs(7200)));
        assert_eq!(hours_to_duration(u64::MAX), None);

        let err = PipelineConfig::from_lookup(lookup(&[
            ("FOLIO_SANDBOX_PROGRAM", "/bin/true"),
            ("FOLIO_RETENTION_HOURS", "18446744073709551615"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "FOLIO_RETENTION_HOURS", .. }));
    }
}
