//! Postgres-backed job store.
//!
//! ## Guarantees
//!
//! - `enqueue` is a single `INSERT ... ON CONFLICT (idempotency_key) DO NOTHING`;
//!   the unique index is the only deduplication mechanism (no read-before-write).
//! - `acquire` is a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED)`
//!   statement, so concurrent workers skip rows another transaction holds instead
//!   of waiting for them.
//! - `fail` and `recover_stale` lock the rows they rewrite and apply the same
//!   backoff rules as the in-memory store.
//! - `complete` never resurrects a dead-lettered job; it reports `InvalidState`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | JobStoreError |
//! |------------|-----------------|---------------|
//! | Duplicate idempotency key | none | absorbed by `ON CONFLICT DO NOTHING`; `enqueue` returns `Ok(None)` |
//! | Database (other) | any | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |
//! | Row decode | N/A | `Corrupt` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::{instrument, warn};
use uuid::Uuid;

use surveyline_core::{Clock, SystemClock, TenantId};

use super::store::{JobStats, JobStore, JobStoreError, LEASE_EXPIRED, log_failure};
use super::types::{BackoffPolicy, FailureDisposition, Job, JobId, JobSource, JobStatus, NewJob};

const JOB_COLUMNS: &str = "id, tenant_id, idempotency_key, source, event_type, payload, status, \
     attempts, max_attempts, next_retry_at, processed_at, error_message, created_at, updated_at";

/// Postgres job queue.
///
/// `PostgresJobStore` is `Send + Sync` and cheap to clone; all access goes
/// through the SQLx pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            clock: Arc::new(SystemClock),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    async fn write_back(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job: &Job,
    ) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                attempts = $3,
                next_retry_at = $4,
                processed_at = $5,
                error_message = $6,
                updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(job.id.0)
        .bind(job.status.as_str())
        .bind(job.attempts as i32)
        .bind(job.next_retry_at)
        .bind(job.processed_at)
        .bind(job.error_message.as_deref())
        .bind(job.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("write_back", e))?;
        Ok(())
    }

    async fn lock_for_update(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job_id: JobId,
    ) -> Result<Job, JobStoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_for_update", e))?;

        row.ok_or(JobStoreError::NotFound(job_id))?.try_into()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(idempotency_key = %job.idempotency_key), err)]
    async fn enqueue(&self, job: NewJob) -> Result<Option<JobId>, JobStoreError> {
        let job = Job::from_new(job, self.clock.now());

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (
                id, tenant_id, idempotency_key, source, event_type, payload, status,
                attempts, max_attempts, next_retry_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $7, $8, $8, $8)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(job.id.0)
        .bind(job.tenant_id.as_uuid())
        .bind(&job.idempotency_key)
        .bind(job.source.as_str())
        .bind(&job.event_type)
        .bind(&job.payload)
        .bind(job.max_attempts as i32)
        .bind(job.created_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        Ok(inserted.map(JobId::from_uuid))
    }

    #[instrument(skip(self), err)]
    async fn acquire(&self) -> Result<Option<Job>, JobStoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE jobs
            SET status = 'processing', updated_at = $1
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'pending' AND next_retry_at <= $1
                ORDER BY next_retry_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(self.clock.now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("acquire", e))?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn acquire_by_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE jobs
            SET status = 'processing', updated_at = $2
            WHERE id = (
                SELECT id FROM jobs
                WHERE id = $1 AND status = 'pending'
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .bind(self.clock.now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("acquire_by_id", e))?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn complete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                processed_at = COALESCE(processed_at, $2),
                next_retry_at = NULL,
                updated_at = CASE WHEN status = 'completed' THEN updated_at ELSE $2 END
            WHERE id = $1 AND status <> 'failed'
            "#,
        )
        .bind(job_id.0)
        .bind(self.clock.now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        if result.rows_affected() == 0 {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
                    .bind(job_id.0)
                    .fetch_optional(&*self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("complete", e))?;
            return Err(match status {
                None => JobStoreError::NotFound(job_id),
                Some(status) => JobStoreError::InvalidState {
                    id: job_id,
                    status: JobStatus::parse(&status).ok_or_else(|| {
                        JobStoreError::Corrupt(format!("unknown status '{status}'"))
                    })?,
                },
            });
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(job_id = %job_id), err)]
    async fn fail(&self, job_id: JobId, error: &str) -> Result<FailureDisposition, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut job = self.lock_for_update(&mut tx, job_id).await?;
        if job.status.is_terminal() {
            return Err(JobStoreError::InvalidState {
                id: job_id,
                status: job.status,
            });
        }

        let disposition = job.apply_failure(error, &self.backoff, self.clock.now());
        self.write_back(&mut tx, &job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        log_failure(&job, &disposition);
        Ok(disposition)
    }

    #[instrument(skip(self, error), fields(job_id = %job_id), err)]
    async fn fail_permanently(&self, job_id: JobId, error: &str) -> Result<(), JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut job = self.lock_for_update(&mut tx, job_id).await?;
        if job.status.is_terminal() {
            return Err(JobStoreError::InvalidState {
                id: job_id,
                status: job.status,
            });
        }

        job.apply_permanent_failure(error, self.clock.now());
        self.write_back(&mut tx, &job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        warn!(job_id = %job_id, error = %error, "job failed permanently");
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn release(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = CASE WHEN status = 'processing' THEN 'pending' ELSE status END,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(job_id.0)
        .bind(self.clock.now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn recover_stale(&self, older_than: Duration) -> Result<usize, JobStoreError> {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::from_std(older_than).unwrap_or_default();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = 'processing' AND updated_at < $1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("recover_stale", e))?;

        let mut recovered = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = Job::try_from(row)?;
            let disposition = job.apply_failure(LEASE_EXPIRED, &self.backoff, now);
            self.write_back(&mut tx, &job).await?;
            recovered.push((job, disposition));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        for (job, disposition) in &recovered {
            log_failure(job, disposition);
        }
        if !recovered.is_empty() {
            warn!(recovered = recovered.len(), "recovered stale processing jobs");
        }
        Ok(recovered.len())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(job_id.0)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM jobs WHERE tenant_id = $1 GROUP BY status",
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for (status, count) in rows {
            let count = count.max(0) as usize;
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => stats.pending = count,
                Some(JobStatus::Processing) => stats.processing = count,
                Some(JobStatus::Completed) => stats.completed = count,
                Some(JobStatus::Failed) => stats.failed = count,
                None => return Err(JobStoreError::Corrupt(format!("unknown status '{status}'"))),
            }
        }
        Ok(stats)
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    tenant_id: Uuid,
    idempotency_key: String,
    source: String,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    next_retry_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| JobStoreError::Corrupt(format!("unknown status '{}'", row.status)))?;
        let source = JobSource::parse(&row.source)
            .ok_or_else(|| JobStoreError::Corrupt(format!("unknown source '{}'", row.source)))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            idempotency_key: row.idempotency_key,
            source,
            event_type: row.event_type,
            payload: row.payload,
            status,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            next_retry_at: row.next_retry_at,
            processed_at: row.processed_at,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {operation} ({}): {}",
            db_err.code().as_deref().unwrap_or("unknown"),
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            JobStoreError::Corrupt(format!("decode error in {operation}: {err}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
