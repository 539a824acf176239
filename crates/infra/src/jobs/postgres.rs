//! Postgres-backed job record store.
//!
//! Each mutation runs in one transaction: the row is locked with
//! `SELECT ... FOR UPDATE`, the state machine in [`Job`] decides the new
//! record, and a single `UPDATE` writes every mutable column. A rejected
//! transition rolls back without touching the row.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database (unique violation `23505`) | `AlreadyExists` |
//! | Database (other), PoolClosed, Other | `Storage` |
//! | Row decode failures | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use folio_core::{OwnerId, ProjectId};
use folio_engine::{Document, RenderOptions};

use super::store::{JobStore, JobStoreError};
use super::types::{CompletedOutput, Job, JobId, JobSource, JobStatus, TransitionError};
use crate::storage::StoragePath;

const SELECT_JOB: &str = r#"
    SELECT
        id,
        owner_id,
        project_id,
        inline_document,
        options,
        status,
        error_message,
        output_ref,
        size_bytes,
        page_count,
        diagnostics,
        created_at,
        started_at,
        completed_at
    FROM render_jobs
"#;

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `render_jobs` table and its indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS render_jobs (
                id UUID PRIMARY KEY,
                owner_id UUID NOT NULL,
                project_id UUID NULL,
                inline_document JSONB NULL,
                options JSONB NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT NULL,
                output_ref TEXT NULL,
                size_bytes BIGINT NULL,
                page_count INTEGER NULL,
                diagnostics JSONB NULL,
                created_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ NULL,
                completed_at TIMESTAMPTZ NULL,
                CONSTRAINT render_jobs_one_source
                    CHECK ((project_id IS NULL) <> (inline_document IS NULL)),
                CONSTRAINT render_jobs_status
                    CHECK (status IN ('pending', 'processing', 'completed', 'failed', 'cancelled'))
            )
            "#,
            "CREATE INDEX IF NOT EXISTS render_jobs_owner_created \
             ON render_jobs (owner_id, created_at DESC)",
            "CREATE INDEX IF NOT EXISTS render_jobs_status_completed \
             ON render_jobs (status, completed_at)",
        ];

        for sql in statements {
            sqlx::query(sql)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    /// Lock a row, let `f` mutate it, and write it back in the same transaction.
    async fn mutate<F>(&self, operation: &str, job_id: JobId, f: F) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<bool, TransitionError> + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!("{SELECT_JOB} WHERE id = $1 FOR UPDATE"))
            .bind(job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        let Some(row) = row else {
            rollback(tx).await?;
            return Err(JobStoreError::NotFound(job_id));
        };

        let mut job = job_from_row(&row)?;
        match f(&mut job) {
            Ok(true) => {}
            Ok(false) => {
                rollback(tx).await?;
                return Ok(job);
            }
            Err(e) => {
                rollback(tx).await?;
                return Err(e.into());
            }
        }

        update_job(&mut tx, &job, operation).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    async fn fetch_many(
        &self,
        operation: &str,
        filter: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!("{SELECT_JOB} WHERE {filter}"))
            .bind(cutoff)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, source, options), fields(owner_id = %owner_id), err)]
    async fn create(
        &self,
        owner_id: OwnerId,
        source: JobSource,
        options: RenderOptions,
    ) -> Result<Job, JobStoreError> {
        let job = Job::new(owner_id, source, options);
        let (project_id, inline_document) = split_source(&job.source);

        sqlx::query(
            r#"
            INSERT INTO render_jobs (
                id, owner_id, project_id, inline_document, options, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.owner_id.as_uuid())
        .bind(project_id)
        .bind(inline_document)
        .bind(to_json(&job.options)?)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("create", e)
            }
        })?;

        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId, owner_id: Option<OwnerId>) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!(
            "{SELECT_JOB} WHERE id = $1 AND ($2::uuid IS NULL OR owner_id = $2)"
        ))
        .bind(job_id.as_uuid())
        .bind(owner_id.map(Uuid::from))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(JobStoreError::NotFound(job_id)),
        }
    }

    #[instrument(skip(self), fields(owner_id = %owner_id), err)]
    async fn list(
        &self,
        owner_id: OwnerId,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"{SELECT_JOB}
            WHERE owner_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4"#
        ))
        .bind(owner_id.as_uuid())
        .bind(status.map(|s| s.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, error, diagnostics), fields(job_id = %job_id, to = %to), err)]
    async fn transition(
        &self,
        job_id: JobId,
        to: JobStatus,
        error: Option<String>,
        diagnostics: Option<JsonValue>,
    ) -> Result<Job, JobStoreError> {
        self.mutate("transition", job_id, move |job| {
            job.apply_transition(to, error, diagnostics, Utc::now())
        })
        .await
    }

    #[instrument(skip(self, output), fields(job_id = %job_id, page_count = output.page_count), err)]
    async fn attach_output(
        &self,
        job_id: JobId,
        output: CompletedOutput,
    ) -> Result<Job, JobStoreError> {
        self.mutate("attach_output", job_id, move |job| {
            job.apply_output(output, Utc::now()).map(|_| true)
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn list_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        self.fetch_many(
            "list_expired",
            "status IN ('completed', 'failed', 'cancelled') AND completed_at < $1",
            cutoff,
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn list_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.fetch_many(
            "list_stale_processing",
            "status = 'processing' AND started_at < $1",
            cutoff,
        )
        .await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let result = sqlx::query("DELETE FROM render_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(())
    }
}

async fn update_job(
    tx: &mut Transaction<'_, Postgres>,
    job: &Job,
    operation: &str,
) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE render_jobs SET
            status = $2,
            error_message = $3,
            output_ref = $4,
            size_bytes = $5,
            page_count = $6,
            diagnostics = $7,
            started_at = $8,
            completed_at = $9
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(job.error_message.as_deref())
    .bind(job.output_ref.as_ref().map(StoragePath::as_str))
    .bind(job.size_bytes.map(|s| i64::try_from(s).unwrap_or(i64::MAX)))
    .bind(job.page_count.map(|p| i32::try_from(p).unwrap_or(i32::MAX)))
    .bind(job.diagnostics.as_ref())
    .bind(job.started_at)
    .bind(job.completed_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

async fn rollback(tx: Transaction<'_, Postgres>) -> Result<(), JobStoreError> {
    tx.rollback()
        .await
        .map_err(|e| map_sqlx_error("rollback", e))
}

fn split_source(source: &JobSource) -> (Option<Uuid>, Option<JsonValue>) {
    match source {
        JobSource::Project(id) => (Some(*id.as_uuid()), None),
        JobSource::Inline(doc) => (None, Some(doc.as_json().clone())),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<JsonValue, JobStoreError> {
    serde_json::to_value(value).map_err(|e| JobStoreError::Storage(format!("serialize: {e}")))
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode job row: {e}"));
    let invalid = |msg: String| JobStoreError::Storage(format!("invalid job row: {msg}"));

    let project_id: Option<Uuid> = row.try_get("project_id").map_err(decode)?;
    let inline_document: Option<JsonValue> = row.try_get("inline_document").map_err(decode)?;
    let source = match (project_id, inline_document) {
        (Some(id), None) => JobSource::Project(ProjectId::from_uuid(id)),
        (None, Some(doc)) => JobSource::Inline(Document::new(doc)),
        _ => return Err(invalid("expected exactly one of project_id, inline_document".into())),
    };

    let options: JsonValue = row.try_get("options").map_err(decode)?;
    let options: RenderOptions =
        serde_json::from_value(options).map_err(|e| invalid(format!("options: {e}")))?;

    let status: String = row.try_get("status").map_err(decode)?;
    let status: JobStatus = status.parse().map_err(|e| invalid(format!("{e}")))?;

    let output_ref: Option<String> = row.try_get("output_ref").map_err(decode)?;
    let output_ref = output_ref
        .map(StoragePath::new)
        .transpose()
        .map_err(|e| invalid(e.to_string()))?;

    let size_bytes: Option<i64> = row.try_get("size_bytes").map_err(decode)?;
    let page_count: Option<i32> = row.try_get("page_count").map_err(decode)?;
    let owner_id: Uuid = row.try_get("owner_id").map_err(decode)?;
    let id: Uuid = row.try_get("id").map_err(decode)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        owner_id: OwnerId::from_uuid(owner_id),
        source,
        options,
        status,
        error_message: row.try_get("error_message").map_err(decode)?,
        output_ref,
        size_bytes: size_bytes.map(|s| s.max(0) as u64),
        page_count: page_count.map(|p| p.max(0) as u32),
        diagnostics: row.try_get("diagnostics").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        started_at: row.try_get("started_at").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs only when `FOLIO_TEST_DATABASE_URL` points at a scratch database.
    async fn store() -> Option<PostgresJobStore> {
        let url = std::env::var("FOLIO_TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        let store = PostgresJobStore::new(pool);
        store.ensure_schema().await.ok()?;
        Some(store)
    }

    #[tokio::test]
    async fn lifecycle_against_postgres() {
        let Some(store) = store().await else {
            return;
        };
        let owner = OwnerId::new();
        let job = store
            .create(
                owner,
                JobSource::Inline(Document::from_pages("t", vec!["p".into()])),
                RenderOptions::default(),
            )
            .await
            .unwrap();

        let processing = store
            .transition(job.id, JobStatus::Processing, None, None)
            .await
            .unwrap();
        assert!(processing.started_at.is_some());

        let done = store
            .attach_output(
                job.id,
                CompletedOutput {
                    output_ref: None,
                    size_bytes: 1024,
                    page_count: 3,
                    diagnostics: Some(serde_json::json!({"render": {}})),
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);

        let fetched = store.get(job.id, Some(owner)).await.unwrap();
        assert_eq!(fetched.page_count, Some(3));
        assert_eq!(fetched.size_bytes, Some(1024));

        let err = store
            .transition(job.id, JobStatus::Failed, Some("late".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidTransition(_)));
        assert!(matches!(
            store.get(job.id, Some(OwnerId::new())).await,
            Err(JobStoreError::NotFound(_))
        ));

        store.delete(job.id).await.unwrap();
    }

    #[test]
    fn sources_split_into_exclusive_columns() {
        let project = ProjectId::new();
        let (p, d) = split_source(&JobSource::Project(project));
        assert_eq!(p, Some(*project.as_uuid()));
        assert!(d.is_none());

        let (p, d) = split_source(&JobSource::Inline(Document::from_pages("t", vec![])));
        assert!(p.is_none());
        assert!(d.is_some());
    }
}
