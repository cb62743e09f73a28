//! Core job types and the retry/backoff policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use surveyline_core::TenantId;

/// Attempts allowed when the enqueuer does not override it.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
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

/// Where a job came from. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSource {
    Webhook,
    Internal,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Webhook => "webhook",
            JobSource::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "webhook" => Some(JobSource::Webhook),
            "internal" => Some(JobSource::Internal),
            _ => None,
        }
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `next_retry_at` and an acquirer
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// Finished successfully
    Completed,
    /// Attempts exhausted or explicitly non-retryable (dead-lettered)
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff: `min(base * factor^(attempts-1), max)`.
///
/// The queue is the only place delays are computed; handlers never choose them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    /// 30s, 2min, then capped at 8min.
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            factor: 4,
            max_delay: Duration::from_secs(8 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Delay after the given number of recorded attempts (1-indexed).
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        let multiplier = self.factor.checked_pow(attempts - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Request to enqueue a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub tenant_id: TenantId,
    pub idempotency_key: String,
    pub source: JobSource,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(
        tenant_id: TenantId,
        idempotency_key: impl Into<String>,
        source: JobSource,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            tenant_id,
            idempotency_key: idempotency_key.into(),
            source,
            event_type: event_type.into(),
            payload,
            max_attempts: None,
        }
    }

    /// Override the attempt ceiling for this job.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Tenant scope
    pub tenant_id: TenantId,
    /// Globally unique; the sole deduplication mechanism
    pub idempotency_key: String,
    pub source: JobSource,
    /// Selects the handler
    pub event_type: String,
    /// Handler-interpreted payload
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Processing attempts recorded so far (starts at 0)
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest time the job may be acquired; cleared once terminal
    pub next_retry_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a recorded failure did to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to `pending`, eligible again at `next_retry_at`.
    Retrying {
        attempts: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Permanently `failed`.
    DeadLettered { attempts: u32 },
}

impl Job {
    /// Materialize an enqueue request.
    pub fn from_new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            tenant_id: new.tenant_id,
            idempotency_key: new.idempotency_key,
            source: new.source,
            event_type: new.event_type,
            payload: new.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            next_retry_at: Some(now),
            processed_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending and due.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Whether the attempt currently running is the last one the job allows.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts + 1 >= self.max_attempts
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.updated_at = now;
    }

    /// Returns `false` when the job was already completed (no-op).
    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == JobStatus::Completed {
            return false;
        }
        self.status = JobStatus::Completed;
        self.processed_at = Some(now);
        self.next_retry_at = None;
        self.updated_at = now;
        true
    }

    /// Record a failed attempt and schedule the retry or dead-letter the job.
    pub fn apply_failure(
        &mut self,
        error: impl Into<String>,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> FailureDisposition {
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.error_message = Some(error.into());
        self.updated_at = now;

        if self.attempts < self.max_attempts {
            let delay = backoff.delay_for_attempt(self.attempts);
            let next = now + chrono::Duration::from_std(delay).unwrap_or_default();
            self.status = JobStatus::Pending;
            self.next_retry_at = Some(next);
            FailureDisposition::Retrying {
                attempts: self.attempts,
                next_retry_at: next,
            }
        } else {
            self.status = JobStatus::Failed;
            self.next_retry_at = None;
            self.processed_at = Some(now);
            FailureDisposition::DeadLettered {
                attempts: self.attempts,
            }
        }
    }

    /// Terminal failure regardless of the remaining budget.
    pub fn apply_permanent_failure(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.error_message = Some(error.into());
        self.status = JobStatus::Failed;
        self.next_retry_at = None;
        self.processed_at = Some(now);
        self.updated_at = now;
    }

    /// Give a claimed job back untouched (attempts and due time unchanged).
    pub fn release(&mut self, now: DateTime<Utc>) {
        if self.status == JobStatus::Processing {
            self.status = JobStatus::Pending;
            self.updated_at = now;
        }
    }
}
