//! Handler contract and the event-type dispatch table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use super::types::Job;

/// Result of running a handler.
///
/// The processor pattern-matches on this; handlers never pick retry delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Done. The job is completed even if the business operation itself
    /// reached a terminal failure (e.g. an undeliverable survey).
    Completed,
    /// Transient problem; the queue decides whether another attempt happens.
    RetryableFailure(String),
    /// Retrying cannot help; the job fails permanently.
    TerminalFailure(String),
}

impl JobOutcome {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::RetryableFailure(reason.into())
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        Self::TerminalFailure(reason.into())
    }
}

/// Per-event-type business logic.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobOutcome;
}

/// Run `handler` on its own task so a panic surfaces as a retryable failure
/// instead of unwinding into the caller.
pub async fn run_isolated(handler: Arc<dyn JobHandler>, job: Job) -> JobOutcome {
    let job_id = job.id;
    match tokio::spawn(async move { handler.handle(&job).await }).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(job_id = %job_id, error = %e, "job handler panicked");
            JobOutcome::retryable(format!("handler panicked: {e}"))
        }
    }
}

/// Map from event type to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for an event type.
    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(event_type.into(), handler);
    }

    pub fn with(mut self, event_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.register(event_type, handler);
        self
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(event_type).cloned()
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.event_types().collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("event_types", &types)
            .finish()
    }
}

#[async_trait]
impl<F> JobHandler for F
where
    F: Fn(&Job) -> JobOutcome + Send + Sync,
{
    async fn handle(&self, job: &Job) -> JobOutcome {
        self(job)
    }
}
