//! Webhook ingestion: route, enqueue idempotently, optionally handle inline.
//!
//! The job queue is the correctness path. The inline fast path only closes the
//! loop early; when it fails the job is released back to `pending` and the
//! processor retries it.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::directory::{ConnectionDirectory, DirectoryError};
use crate::handlers::{MESSAGE_RECEIVED, STATUS_UPDATED};
use crate::jobs::{
    HandlerRegistry, JobId, JobOutcome, JobSource, JobStore, JobStoreError, NewJob, run_isolated,
};

use super::parser::{Direction, WebhookEvent};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("failed to encode job payload: {0}")]
    Encode(String),
}

/// Per-event result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestResult {
    Queued,
    /// Handled inline; the job is already `completed`.
    Completed,
    Duplicate,
    /// Outbound echo.
    Ignored,
    UnknownPhone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventReport {
    pub message_id: String,
    pub result: IngestResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

/// Aggregate webhook outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Accepted,
    Duplicate,
    Ignored,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Accepted => "accepted",
            WebhookStatus::Duplicate => "duplicate",
            WebhookStatus::Ignored => "ignored",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub results: Vec<EventReport>,
}

impl IngestReport {
    /// Anything queued or completed wins, then duplicates, otherwise ignored.
    pub fn status(&self) -> WebhookStatus {
        let any = |wanted: &[IngestResult]| self.results.iter().any(|r| wanted.contains(&r.result));
        if any(&[IngestResult::Queued, IngestResult::Completed]) {
            WebhookStatus::Accepted
        } else if any(&[IngestResult::Duplicate]) {
            WebhookStatus::Duplicate
        } else {
            WebhookStatus::Ignored
        }
    }

    pub fn count(&self, result: IngestResult) -> usize {
        self.results.iter().filter(|r| r.result == result).count()
    }
}

/// Turns parsed webhook events into jobs.
pub struct WebhookIngestor {
    jobs: Arc<dyn JobStore>,
    connections: Arc<dyn ConnectionDirectory>,
    handlers: HandlerRegistry,
    fast_path_types: HashSet<String>,
}

impl WebhookIngestor {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        connections: Arc<dyn ConnectionDirectory>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            jobs,
            connections,
            handlers,
            fast_path_types: HashSet::from(["interactive".to_string()]),
        }
    }

    /// Replace the message types handled inline.
    pub fn with_fast_path_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.fast_path_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub async fn ingest(&self, events: Vec<WebhookEvent>) -> Result<IngestReport, IngestError> {
        let mut report = IngestReport::default();
        for event in events {
            report.results.push(self.ingest_one(event).await?);
        }

        info!(
            events = report.results.len(),
            queued = report.count(IngestResult::Queued),
            completed = report.count(IngestResult::Completed),
            duplicate = report.count(IngestResult::Duplicate),
            ignored = report.count(IngestResult::Ignored),
            unknown_phone = report.count(IngestResult::UnknownPhone),
            "webhook ingested"
        );
        Ok(report)
    }

    async fn ingest_one(&self, event: WebhookEvent) -> Result<EventReport, IngestError> {
        let (phone_number_id, message_id, key, event_type, payload, fast_path) = match &event {
            WebhookEvent::Message(m) => {
                if m.direction == Direction::Outbound {
                    debug!(message_id = %m.message_id, "outbound echo ignored");
                    return Ok(report(&m.message_id, IngestResult::Ignored, None));
                }
                (
                    &m.phone_number_id,
                    &m.message_id,
                    m.idempotency_key(),
                    MESSAGE_RECEIVED,
                    serde_json::to_value(m),
                    self.fast_path_types.contains(&m.message_type),
                )
            }
            WebhookEvent::Status(s) => (
                &s.phone_number_id,
                &s.provider_message_id,
                s.idempotency_key(),
                STATUS_UPDATED,
                serde_json::to_value(s),
                false,
            ),
        };
        let payload = payload.map_err(|e| IngestError::Encode(e.to_string()))?;

        let Some(tenant_id) = self
            .connections
            .tenant_for_phone_number_id(phone_number_id)
            .await?
        else {
            warn!(phone_number_id = %phone_number_id, message_id = %message_id, "unknown phone number id");
            return Ok(report(message_id, IngestResult::UnknownPhone, None));
        };

        let job = NewJob::new(tenant_id, key, JobSource::Webhook, event_type, payload);
        let Some(job_id) = self.jobs.enqueue(job).await? else {
            debug!(tenant_id = %tenant_id, message_id = %message_id, "duplicate webhook event");
            return Ok(report(message_id, IngestResult::Duplicate, None));
        };

        let result = if fast_path {
            self.try_inline(job_id).await?
        } else {
            IngestResult::Queued
        };
        Ok(report(message_id, result, Some(job_id)))
    }

    async fn try_inline(&self, job_id: JobId) -> Result<IngestResult, IngestError> {
        // The processor may have claimed it already.
        let Some(job) = self.jobs.acquire_by_id(job_id).await? else {
            return Ok(IngestResult::Queued);
        };
        let Some(handler) = self.handlers.get(&job.event_type) else {
            self.jobs.release(job_id).await?;
            return Ok(IngestResult::Queued);
        };

        match run_isolated(handler, job).await {
            JobOutcome::Completed => {
                self.jobs.complete(job_id).await?;
                debug!(job_id = %job_id, "webhook event handled inline");
                Ok(IngestResult::Completed)
            }
            JobOutcome::RetryableFailure(reason) | JobOutcome::TerminalFailure(reason) => {
                warn!(job_id = %job_id, reason = %reason, "inline handling failed; left for processor");
                self.jobs.release(job_id).await?;
                Ok(IngestResult::Queued)
            }
        }
    }
}

fn report(message_id: &str, result: IngestResult, job_id: Option<JobId>) -> EventReport {
    EventReport {
        message_id: message_id.to_string(),
        result,
        job_id,
    }
}
