//! Job storage boundary and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use surveyline_core::{Clock, SystemClock, TenantId};

use super::types::{BackoffPolicy, FailureDisposition, Job, JobId, JobStatus, NewJob};

/// Error recorded on jobs reclaimed from a dead worker.
pub const LEASE_EXPIRED: &str = "lease expired";

/// Durable work queue.
///
/// Implementations must make `enqueue` race-free through a uniqueness constraint
/// on the idempotency key and make the claim in `acquire`/`acquire_by_id` atomic
/// so that concurrent workers never receive the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending job. Returns `None` when the idempotency key already exists.
    async fn enqueue(&self, job: NewJob) -> Result<Option<JobId>, JobStoreError>;

    /// Claim the oldest-due pending job.
    async fn acquire(&self) -> Result<Option<Job>, JobStoreError>;

    /// Claim a specific job, only if it is still pending.
    async fn acquire_by_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Mark a job completed. Completing twice is a no-op; a dead-lettered job
    /// stays `failed` and yields `InvalidState`.
    async fn complete(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// Record a failed attempt; retries with backoff or dead-letters.
    async fn fail(&self, job_id: JobId, error: &str) -> Result<FailureDisposition, JobStoreError>;

    /// Record a non-retryable failure.
    async fn fail_permanently(&self, job_id: JobId, error: &str) -> Result<(), JobStoreError>;

    /// Return a claimed job to `pending` without consuming an attempt.
    async fn release(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// Treat `processing` jobs untouched for longer than `older_than` as failed
    /// attempts. Returns how many were recovered.
    async fn recover_stale(&self, older_than: Duration) -> Result<usize, JobStoreError>;

    /// Tenant-scoped read.
    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Job counts per status for a tenant.
    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id} is {status}")]
    InvalidState { id: JobId, status: JobStatus },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt job row: {0}")]
    Corrupt(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn enqueue(&self, job: NewJob) -> Result<Option<JobId>, JobStoreError> {
        (**self).enqueue(job).await
    }

    async fn acquire(&self) -> Result<Option<Job>, JobStoreError> {
        (**self).acquire().await
    }

    async fn acquire_by_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).acquire_by_id(job_id).await
    }

    async fn complete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        (**self).complete(job_id).await
    }

    async fn fail(&self, job_id: JobId, error: &str) -> Result<FailureDisposition, JobStoreError> {
        (**self).fail(job_id, error).await
    }

    async fn fail_permanently(&self, job_id: JobId, error: &str) -> Result<(), JobStoreError> {
        (**self).fail_permanently(job_id, error).await
    }

    async fn release(&self, job_id: JobId) -> Result<(), JobStoreError> {
        (**self).release(job_id).await
    }

    async fn recover_stale(&self, older_than: Duration) -> Result<usize, JobStoreError> {
        (**self).recover_stale(older_than).await
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(tenant_id, job_id).await
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        (**self).stats(tenant_id).await
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    /// Unique index over idempotency keys.
    keys: HashMap<String, JobId>,
}

/// In-memory job store for tests/dev.
///
/// A single mutex stands in for the row lock: claims are atomic, so concurrent
/// acquirers never observe the same pending job.
#[derive(Debug)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total rows, all tenants.
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, new: NewJob) -> Result<Option<JobId>, JobStoreError> {
        let now = self.clock.now();
        let mut inner = self.lock();

        if let Some(existing) = inner.keys.get(&new.idempotency_key) {
            debug!(
                idempotency_key = %new.idempotency_key,
                existing_job_id = %existing,
                "duplicate enqueue ignored"
            );
            return Ok(None);
        }

        let job = Job::from_new(new, now);
        let id = job.id;
        info!(
            job_id = %id,
            tenant_id = %job.tenant_id,
            event_type = %job.event_type,
            idempotency_key = %job.idempotency_key,
            "job enqueued"
        );
        inner.keys.insert(job.idempotency_key.clone(), id);
        inner.jobs.insert(id, job);
        Ok(Some(id))
    }

    async fn acquire(&self) -> Result<Option<Job>, JobStoreError> {
        let now = self.clock.now();
        let mut inner = self.lock();

        // Oldest-due first; ties broken by creation order.
        let next = inner
            .jobs
            .values()
            .filter(|j| j.is_acquirable(now))
            .min_by_key(|j| (j.next_retry_at, j.created_at, j.id.0))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            inner.jobs.get_mut(&id).map(|job| {
                job.mark_processing(now);
                job.clone()
            })
        }))
    }

    async fn acquire_by_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let now = self.clock.now();
        let mut inner = self.lock();

        match inner.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.mark_processing(now);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;

        if job.status == JobStatus::Failed {
            return Err(JobStoreError::InvalidState {
                id: job_id,
                status: job.status,
            });
        }
        if job.mark_completed(now) {
            debug!(job_id = %job_id, "job completed");
        }
        Ok(())
    }

    async fn fail(&self, job_id: JobId, error: &str) -> Result<FailureDisposition, JobStoreError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;

        if job.status.is_terminal() {
            return Err(JobStoreError::InvalidState {
                id: job_id,
                status: job.status,
            });
        }

        let disposition = job.apply_failure(error, &self.backoff, now);
        log_failure(job, &disposition);
        Ok(disposition)
    }

    async fn fail_permanently(&self, job_id: JobId, error: &str) -> Result<(), JobStoreError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;

        if job.status.is_terminal() {
            return Err(JobStoreError::InvalidState {
                id: job_id,
                status: job.status,
            });
        }

        job.apply_permanent_failure(error, now);
        warn!(job_id = %job_id, error = %error, "job failed permanently");
        Ok(())
    }

    async fn release(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        job.release(now);
        Ok(())
    }

    async fn recover_stale(&self, older_than: Duration) -> Result<usize, JobStoreError> {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::from_std(older_than).unwrap_or_default();
        let mut inner = self.lock();

        let mut recovered = 0;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Processing && job.updated_at < cutoff {
                let disposition = job.apply_failure(LEASE_EXPIRED, &self.backoff, now);
                log_failure(job, &disposition);
                recovered += 1;
            }
        }

        if recovered > 0 {
            warn!(recovered, "recovered stale processing jobs");
        }
        Ok(recovered)
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let inner = self.lock();
        Ok(inner
            .jobs
            .get(&job_id)
            .filter(|j| j.tenant_id == tenant_id)
            .cloned())
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let inner = self.lock();
        let mut stats = JobStats::default();

        for job in inner.jobs.values().filter(|j| j.tenant_id == tenant_id) {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }

        Ok(stats)
    }
}

pub(crate) fn log_failure(job: &Job, disposition: &FailureDisposition) {
    match disposition {
        FailureDisposition::Retrying {
            attempts,
            next_retry_at,
        } => info!(
            job_id = %job.id,
            event_type = %job.event_type,
            attempts,
            max_attempts = job.max_attempts,
            next_retry_at = %next_retry_at,
            error = job.error_message.as_deref().unwrap_or_default(),
            "job failed; retry scheduled"
        ),
        FailureDisposition::DeadLettered { attempts } => warn!(
            job_id = %job.id,
            event_type = %job.event_type,
            attempts,
            error = job.error_message.as_deref().unwrap_or_default(),
            "job dead-lettered"
        ),
    }
}
