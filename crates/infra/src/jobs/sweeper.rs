//! Retention sweeper: reclaims terminal jobs past their retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobStatus};
use crate::config::RetentionConfig;
use crate::storage::ArtifactStorage;

/// Message recorded on jobs reclaimed from `processing`.
pub const ABANDONED_MESSAGE: &str = "job abandoned in processing; orchestrator did not finish it";

/// Outcome of one sweeper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub deleted: usize,
    pub failed: usize,
    pub reclaimed: usize,
}

pub struct RetentionSweeper {
    store: Arc<dyn JobStore>,
    storage: ArtifactStorage,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn JobStore>, storage: ArtifactStorage, config: RetentionConfig) -> Self {
        Self {
            store,
            storage,
            config,
        }
    }

    /// Delete terminal jobs that completed more than `window` ago, together
    /// with any artifact file the job still owns.
    ///
    /// A job that cannot be removed is logged and counted; the pass goes on.
    pub async fn sweep(&self, window: Duration) -> Result<SweepReport, JobStoreError> {
        let cutoff = cutoff(window);
        let expired = self.store.list_expired(cutoff).await?;

        let mut report = SweepReport {
            examined: expired.len(),
            ..SweepReport::default()
        };
        for job in expired {
            match self.remove(&job).await {
                Ok(()) => {
                    debug!(job_id = %job.id, "expired job removed");
                    report.deleted += 1;
                }
                Err(message) => {
                    warn!(job_id = %job.id, error = %message, "failed to remove expired job");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn remove(&self, job: &Job) -> Result<(), String> {
        // Only the job's own reference is ever deleted; transferred output
        // lives under the project and is not referenced here.
        if let Some(output_ref) = job.output_ref.clone() {
            self.storage
                .run_blocking(move |storage| storage.delete(&output_ref))
                .await
                .map_err(|e| e.to_string())?;
        }
        match self.store.delete(job.id).await {
            Ok(()) | Err(JobStoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Fail jobs stuck in `processing` since before `threshold` ago.
    pub async fn reclaim_stale(&self, threshold: Duration) -> Result<usize, JobStoreError> {
        let cutoff = cutoff(threshold);
        let stale = self.store.list_stale_processing(cutoff).await?;

        let mut reclaimed = 0;
        for job in stale {
            let diagnostics = abandoned_diagnostics(job.diagnostics.clone());
            match self
                .store
                .transition(
                    job.id,
                    JobStatus::Failed,
                    Some(ABANDONED_MESSAGE.to_string()),
                    Some(diagnostics),
                )
                .await
            {
                Ok(_) => {
                    warn!(job_id = %job.id, started_at = ?job.started_at, "reclaimed abandoned job");
                    reclaimed += 1;
                }
                // Finished in the meantime.
                Err(JobStoreError::InvalidTransition(_)) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to reclaim job"),
            }
        }
        Ok(reclaimed)
    }

    /// One configured pass: stale reclaim (if enabled) then retention.
    pub async fn run_once(&self) -> Result<SweepReport, JobStoreError> {
        let reclaimed = match self.config.stale_after {
            Some(threshold) => self.reclaim_stale(threshold).await?,
            None => 0,
        };
        let mut report = self.sweep(self.config.window).await?;
        report.reclaimed = reclaimed;
        Ok(report)
    }

    /// Run passes every `sweep_interval` until the handle is shut down.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let interval = self.config.sweep_interval;

        let join = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), window_secs = self.config.window.as_secs(), "retention sweeper started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => match self.run_once().await {
                        Ok(report) => info!(
                            examined = report.examined,
                            deleted = report.deleted,
                            failed = report.failed,
                            reclaimed = report.reclaimed,
                            "sweep finished"
                        ),
                        Err(e) => error!(error = %e, "sweep failed"),
                    },
                }
            }
            info!("retention sweeper stopped");
        });

        SweeperHandle {
            shutdown: Some(shutdown_tx),
            join,
        }
    }
}

/// `now - age`, clamped to the earliest representable instant.
fn cutoff(age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn abandoned_diagnostics(existing: Option<JsonValue>) -> JsonValue {
    match existing {
        Some(JsonValue::Object(mut map)) => {
            map.insert("error_kind".to_string(), "infrastructure".into());
            JsonValue::Object(map)
        }
        _ => json!({ "error_kind": "infrastructure" }),
    }
}

/// Handle to a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop after the current pass and wait for the task to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.join.await {
            error!(error = %e, "retention sweeper task failed");
        }
    }
}
