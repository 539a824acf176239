//! Core job types and the status state machine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use folio_core::{DomainError, OwnerId, ProjectId};
use folio_engine::{Document, RenderOptions};

use crate::storage::StoragePath;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s)
            .map(Self)
            .map_err(|e| DomainError::invalid_id(format!("JobId: {e}")))
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// What a job renders: a stored project, or a document supplied inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    Project(ProjectId),
    Inline(Document),
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid transition from {from} to {to}")]
    Invalid { from: JobStatus, to: JobStatus },

    /// `completed` is only reachable through `attach_output`.
    #[error("a job can only complete by attaching its output")]
    CompletionRequiresOutput,
}

/// Output fields recorded atomically with the `completed` status.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedOutput {
    /// Job-owned artifact location; `None` once ownership moved to the project.
    pub output_ref: Option<StoragePath>,
    pub size_bytes: u64,
    pub page_count: u32,
    pub diagnostics: Option<JsonValue>,
}

/// A render job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_id: OwnerId,
    pub source: JobSource,
    pub options: RenderOptions,
    pub status: JobStatus,
    /// Present iff `status == Failed`.
    pub error_message: Option<String>,
    pub output_ref: Option<StoragePath>,
    pub size_bytes: Option<u64>,
    pub page_count: Option<u32>,
    pub diagnostics: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(owner_id: OwnerId, source: JobSource, options: RenderOptions) -> Self {
        Self {
            id: JobId::new(),
            owner_id,
            source,
            options,
            status: JobStatus::Pending,
            error_message: None,
            output_ref: None,
            size_bytes: None,
            page_count: None,
            diagnostics: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn project_id(&self) -> Option<ProjectId> {
        match self.source {
            JobSource::Project(id) => Some(id),
            JobSource::Inline(_) => None,
        }
    }

    /// Apply a status change in place.
    ///
    /// Returns `Ok(false)` for the `processing -> processing` no-op, which
    /// leaves the record untouched.
    pub fn apply_transition(
        &mut self,
        to: JobStatus,
        error: Option<String>,
        diagnostics: Option<JsonValue>,
        now: DateTime<Utc>,
    ) -> Result<bool, TransitionError> {
        let from = self.status;
        if from.is_terminal() {
            return Err(TransitionError::Invalid { from, to });
        }

        match (from, to) {
            (JobStatus::Processing, JobStatus::Processing) => return Ok(false),
            (_, JobStatus::Completed) => return Err(TransitionError::CompletionRequiresOutput),
            (JobStatus::Pending, JobStatus::Processing) => {
                self.started_at.get_or_insert(now);
            }
            (_, JobStatus::Failed) => {
                self.error_message = Some(error.unwrap_or_else(|| "job failed".to_string()));
                self.completed_at.get_or_insert(now);
            }
            (_, JobStatus::Cancelled) => {
                self.completed_at.get_or_insert(now);
            }
            _ => return Err(TransitionError::Invalid { from, to }),
        }

        self.status = to;
        if diagnostics.is_some() {
            self.diagnostics = diagnostics;
        }
        Ok(true)
    }

    /// Complete the job with its output. Only valid from `processing`.
    pub fn apply_output(
        &mut self,
        output: CompletedOutput,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status != JobStatus::Processing {
            return Err(TransitionError::Invalid {
                from: self.status,
                to: JobStatus::Completed,
            });
        }

        self.status = JobStatus::Completed;
        self.output_ref = output.output_ref;
        self.size_bytes = Some(output.size_bytes);
        self.page_count = Some(output.page_count);
        self.error_message = None;
        self.completed_at.get_or_insert(now);
        if output.diagnostics.is_some() {
            self.diagnostics = output.diagnostics;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn job() -> Job {
        Job::new(
            OwnerId::new(),
            JobSource::Inline(Document::from_pages("t", vec!["p".into()])),
            RenderOptions::default(),
        )
    }

    fn output() -> CompletedOutput {
        CompletedOutput {
            output_ref: None,
            size_bytes: 1024,
            page_count: 3,
            diagnostics: None,
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in ["pending", "processing", "completed", "failed", "cancelled"] {
            assert_eq!(s.parse::<JobStatus>().unwrap().as_str(), s);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn processing_is_idempotent_and_started_at_is_set_once() {
        let mut job = job();
        let t0 = Utc::now();
        assert!(job.apply_transition(JobStatus::Processing, None, None, t0).unwrap());
        let t1 = t0 + chrono::Duration::seconds(5);
        assert!(!job.apply_transition(JobStatus::Processing, None, None, t1).unwrap());
        assert_eq!(job.started_at, Some(t0));
    }

    #[test]
    fn completion_requires_output_and_processing() {
        let mut job = job();
        let now = Utc::now();
        assert_eq!(
            job.apply_transition(JobStatus::Completed, None, None, now),
            Err(TransitionError::CompletionRequiresOutput)
        );
        assert!(job.apply_output(output(), now).is_err());

        job.apply_transition(JobStatus::Processing, None, None, now).unwrap();
        job.apply_output(output(), now).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.page_count, Some(3));
        assert_eq!(job.size_bytes, Some(1024));
        assert!(job.error_message.is_none());
    }

    #[test]
    fn failure_records_message_and_diagnostics() {
        let mut job = job();
        let now = Utc::now();
        job.apply_transition(JobStatus::Processing, None, None, now).unwrap();
        job.apply_transition(
            JobStatus::Failed,
            Some("render error: boom".into()),
            Some(serde_json::json!({"render": {"error": "boom"}})),
            now,
        )
        .unwrap();
        assert_eq!(job.error_message.as_deref(), Some("render error: boom"));
        assert!(job.diagnostics.is_some());
        assert_eq!(job.completed_at, Some(now));
    }

    fn any_status() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Pending),
            Just(JobStatus::Processing),
            Just(JobStatus::Completed),
            Just(JobStatus::Failed),
            Just(JobStatus::Cancelled),
        ]
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Transition(JobStatus),
        Attach,
    }

    fn any_op() -> impl Strategy<Value = Op> {
        prop_oneof![any_status().prop_map(Op::Transition), Just(Op::Attach)]
    }

    fn rank(status: JobStatus) -> u8 {
        match status {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            _ => 2,
        }
    }

    proptest! {
        #[test]
        fn observed_statuses_follow_the_one_way_machine(ops in proptest::collection::vec(any_op(), 0..24)) {
            let mut job = job();
            let start = Utc::now();
            let mut terminal_transitions = 0;
            let mut last = job.status;

            for (i, op) in ops.into_iter().enumerate() {
                let now = start + chrono::Duration::seconds(i as i64);
                let was_processing = job.status == JobStatus::Processing;
                let result = match op {
                    Op::Transition(to) => job.apply_transition(to, Some("e".into()), None, now).map(|_| ()),
                    Op::Attach => job.apply_output(output(), now),
                };

                if let Op::Attach = op {
                    prop_assert_eq!(result.is_ok(), was_processing);
                }
                if last.is_terminal() {
                    prop_assert!(result.is_err());
                    prop_assert_eq!(job.status, last);
                }
                if !last.is_terminal() && job.status.is_terminal() {
                    terminal_transitions += 1;
                }
                prop_assert!(rank(job.status) >= rank(last));
                last = job.status;
            }

            prop_assert!(terminal_transitions <= 1);
            if let (Some(s), Some(c)) = (job.started_at, job.completed_at) {
                prop_assert!(s <= c);
            }
            prop_assert_eq!(job.error_message.is_some(), job.status == JobStatus::Failed);
            prop_assert_eq!(job.page_count.is_some(), job.status == JobStatus::Completed);
            prop_assert_eq!(job.size_bytes.is_some(), job.status == JobStatus::Completed);
        }
    }
}
