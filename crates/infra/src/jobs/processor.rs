//! Polling job processor.
//!
//! The processor is a generic dispatch loop: acquire one job, look up its handler
//! by event type, run it, and report the outcome back to the store. It holds no
//! business knowledge.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handler::{HandlerRegistry, JobOutcome, run_isolated};
use super::store::{JobStore, JobStoreError};
use super::types::{FailureDisposition, Job, JobId};

/// Job processor configuration.
#[derive(Debug, Clone)]
pub struct JobProcessorConfig {
    /// Sleep between polls when the queue is empty
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
    /// Lease timeout for `processing` jobs; `None` disables recovery
    pub stale_after: Option<Duration>,
    /// Run stale recovery every N polls
    pub stale_check_every: u32,
}

impl Default for JobProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            name: "job-processor".to_string(),
            stale_after: Some(Duration::from_secs(600)),
            stale_check_every: 12,
        }
    }
}

impl JobProcessorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after = stale_after;
        self
    }
}

/// How a processed job was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    Retrying { attempts: u32 },
    DeadLettered { attempts: u32 },
    /// Terminal handler failure; no further attempts.
    Abandoned,
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Nothing was due.
    Idle,
    Processed {
        job_id: JobId,
        event_type: String,
        resolution: Resolution,
    },
}

/// Processor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ProcessorStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub stale_recovered: u64,
}

impl ProcessorStats {
    fn record(&mut self, resolution: &Resolution) {
        self.processed += 1;
        match resolution {
            Resolution::Completed => self.succeeded += 1,
            Resolution::Retrying { .. } => self.retried += 1,
            Resolution::DeadLettered { .. } | Resolution::Abandoned => self.dead_lettered += 1,
        }
    }
}

/// Handle to a running processor.
#[derive(Debug)]
pub struct ProcessorHandle {
    stop: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<ProcessorStats>>,
}

impl ProcessorHandle {
    /// Stop polling and wait for the loop to exit.
    ///
    /// A job that is being handled when the signal arrives runs to completion.
    /// Returns the final counters.
    pub async fn stop(mut self) -> ProcessorStats {
        let _ = self.stop.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "job processor task ended abnormally");
            }
        }
        self.stats()
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Background job processor.
pub struct JobProcessor<S: JobStore> {
    store: S,
    handlers: HandlerRegistry,
}

impl<S: JobStore + 'static> JobProcessor<S> {
    pub fn new(store: S, handlers: HandlerRegistry) -> Self {
        Self { store, handlers }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Acquire and process at most one job.
    pub async fn tick(&self) -> Result<Tick, JobStoreError> {
        let Some(job) = self.store.acquire().await? else {
            return Ok(Tick::Idle);
        };

        debug!(
            job_id = %job.id,
            event_type = %job.event_type,
            attempts = job.attempts,
            "claimed job"
        );

        let job_id = job.id;
        let event_type = job.event_type.clone();
        let outcome = self.run_handler(job).await;
        let resolution = self.resolve(job_id, &event_type, outcome).await?;

        Ok(Tick::Processed {
            job_id,
            event_type,
            resolution,
        })
    }

    /// Invoke the handler for an already-claimed job.
    ///
    /// Missing handlers and handler panics both surface as retryable failures, so
    /// a claimed job always leaves `processing`.
    pub async fn run_handler(&self, job: Job) -> JobOutcome {
        let Some(handler) = self.handlers.get(&job.event_type) else {
            warn!(job_id = %job.id, event_type = %job.event_type, "no handler for job");
            return JobOutcome::retryable(format!(
                "no handler registered for event type '{}'",
                job.event_type
            ));
        };

        run_isolated(handler, job).await
    }

    async fn resolve(
        &self,
        job_id: JobId,
        event_type: &str,
        outcome: JobOutcome,
    ) -> Result<Resolution, JobStoreError> {
        match outcome {
            JobOutcome::Completed => {
                self.store.complete(job_id).await?;
                debug!(job_id = %job_id, event_type, "job completed");
                Ok(Resolution::Completed)
            }
            JobOutcome::RetryableFailure(reason) => {
                match self.store.fail(job_id, &reason).await? {
                    FailureDisposition::Retrying { attempts, .. } => {
                        Ok(Resolution::Retrying { attempts })
                    }
                    FailureDisposition::DeadLettered { attempts } => {
                        Ok(Resolution::DeadLettered { attempts })
                    }
                }
            }
            JobOutcome::TerminalFailure(reason) => {
                self.store.fail_permanently(job_id, &reason).await?;
                Ok(Resolution::Abandoned)
            }
        }
    }

    /// Spawn the polling loop on the tokio runtime.
    pub fn spawn(self, config: JobProcessorConfig) -> ProcessorHandle
    where
        S: 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ProcessorStats::default()));
        let loop_stats = stats.clone();

        let join = tokio::spawn(async move {
            processor_loop(self, config, stop_rx, loop_stats).await;
        });

        ProcessorHandle {
            stop: stop_tx,
            join: Some(join),
            stats,
        }
    }
}

async fn processor_loop<S: JobStore + 'static>(
    processor: JobProcessor<S>,
    config: JobProcessorConfig,
    mut stop_rx: watch::Receiver<bool>,
    stats: Arc<Mutex<ProcessorStats>>,
) {
    info!(processor = %config.name, "job processor started");
    let mut polls: u64 = 0;

    loop {
        if *stop_rx.borrow() {
            break;
        }

        if let Some(stale_after) = config.stale_after {
            if polls % u64::from(config.stale_check_every.max(1)) == 0 {
                match processor.store.recover_stale(stale_after).await {
                    Ok(0) => {}
                    Ok(n) => {
                        stats
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .stale_recovered += n as u64;
                    }
                    Err(e) => error!(processor = %config.name, error = %e, "stale job recovery failed"),
                }
            }
        }
        polls = polls.wrapping_add(1);

        match processor.tick().await {
            Ok(Tick::Processed {
                job_id,
                event_type,
                resolution,
            }) => {
                debug!(
                    processor = %config.name,
                    job_id = %job_id,
                    event_type = %event_type,
                    resolution = ?resolution,
                    "job processed"
                );
                stats
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(&resolution);
                // Drain the backlog before sleeping.
                continue;
            }
            Ok(Tick::Idle) => {}
            Err(e) => {
                error!(processor = %config.name, error = %e, "job processing failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = stop_rx.changed() => {}
        }
    }

    info!(processor = %config.name, "job processor stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use surveyline_core::{ManualClock, TenantId};

    use super::*;
    use crate::jobs::handler::JobHandler;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobSource, JobStatus, NewJob};

    struct Counting {
        calls: AtomicUsize,
        outcome: JobOutcome,
    }

    #[async_trait]
    impl JobHandler for Counting {
        async fn handle(&self, _job: &Job) -> JobOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    struct Panicking;

    #[async_trait]
    impl JobHandler for Panicking {
        async fn handle(&self, _job: &Job) -> JobOutcome {
            panic!("boom");
        }
    }

    fn setup() -> (Arc<ManualClock>, Arc<InMemoryJobStore>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
        (clock, store)
    }

    async fn enqueue(store: &InMemoryJobStore, tenant: TenantId, event_type: &str) -> JobId {
        store
            .enqueue(NewJob::new(
                tenant,
                format!("{event_type}:{}", uuid::Uuid::now_v7()),
                JobSource::Internal,
                event_type,
                serde_json::json!({}),
            ))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn idle_when_queue_is_empty() {
        let (_clock, store) = setup();
        let processor = JobProcessor::new(store, HandlerRegistry::new());
        assert_eq!(processor.tick().await.unwrap(), Tick::Idle);
    }

    #[tokio::test]
    async fn completed_outcome_completes_job() {
        let (_clock, store) = setup();
        let tenant = TenantId::new();
        let id = enqueue(&store, tenant, "survey.send").await;

        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            outcome: JobOutcome::Completed,
        });
        let registry = HandlerRegistry::new().with("survey.send", handler.clone());
        let processor = JobProcessor::new(store.clone(), registry);

        let tick = processor.tick().await.unwrap();
        assert_eq!(
            tick,
            Tick::Processed {
                job_id: id,
                event_type: "survey.send".to_string(),
                resolution: Resolution::Completed,
            }
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let job = store.get(tenant, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn retryable_outcome_schedules_retry_then_dead_letters() {
        let (clock, store) = setup();
        let tenant = TenantId::new();
        let id = enqueue(&store, tenant, "survey.send").await;

        let registry = HandlerRegistry::new().with(
            "survey.send",
            Arc::new(|_job: &Job| JobOutcome::retryable("provider timeout")),
        );
        let processor = JobProcessor::new(store.clone(), registry);

        let first = processor.tick().await.unwrap();
        assert!(matches!(
            first,
            Tick::Processed { resolution: Resolution::Retrying { attempts: 1 }, .. }
        ));
        // Not due yet.
        assert_eq!(processor.tick().await.unwrap(), Tick::Idle);

        clock.advance(Duration::from_secs(30));
        let second = processor.tick().await.unwrap();
        assert!(matches!(
            second,
            Tick::Processed { resolution: Resolution::Retrying { attempts: 2 }, .. }
        ));

        clock.advance(Duration::from_secs(120));
        let third = processor.tick().await.unwrap();
        assert!(matches!(
            third,
            Tick::Processed { resolution: Resolution::DeadLettered { attempts: 3 }, .. }
        ));

        let job = store.get(tenant, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("provider timeout"));
        assert!(job.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn terminal_outcome_fails_immediately() {
        let (_clock, store) = setup();
        let tenant = TenantId::new();
        let id = enqueue(&store, tenant, "survey.send").await;

        let registry = HandlerRegistry::new().with(
            "survey.send",
            Arc::new(|_job: &Job| JobOutcome::terminal("malformed payload")),
        );
        let processor = JobProcessor::new(store.clone(), registry);

        let tick = processor.tick().await.unwrap();
        assert!(matches!(tick, Tick::Processed { resolution: Resolution::Abandoned, .. }));
        let job = store.get(tenant, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn missing_handler_is_a_retryable_failure() {
        let (_clock, store) = setup();
        let tenant = TenantId::new();
        let id = enqueue(&store, tenant, "unknown.event").await;

        let processor = JobProcessor::new(store.clone(), HandlerRegistry::new());
        processor.tick().await.unwrap();

        let job = store.get(tenant, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(
            job.error_message.as_deref(),
            Some("no handler registered for event type 'unknown.event'")
        );
    }

    #[tokio::test]
    async fn panicking_handler_does_not_leave_job_processing() {
        let (_clock, store) = setup();
        let tenant = TenantId::new();
        let id = enqueue(&store, tenant, "survey.send").await;

        let registry = HandlerRegistry::new().with("survey.send", Arc::new(Panicking));
        let processor = JobProcessor::new(store.clone(), registry);
        processor.tick().await.unwrap();

        let job = store.get(tenant, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn spawned_processor_drains_backlog_and_stops() {
        let store = Arc::new(InMemoryJobStore::new());
        let tenant = TenantId::new();
        for _ in 0..5 {
            enqueue(&store, tenant, "survey.send").await;
        }

        let registry =
            HandlerRegistry::new().with("survey.send", Arc::new(|_job: &Job| JobOutcome::Completed));
        let handle = JobProcessor::new(store.clone(), registry).spawn(
            JobProcessorConfig::default()
                .with_name("test-processor")
                .with_poll_interval(Duration::from_millis(10)),
        );

        for _ in 0..100 {
            if handle.stats().succeeded == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = handle.stop().await;
        assert_eq!(stats.processed, 5);
        assert_eq!(stats.succeeded, 5);
        assert_eq!(store.stats(tenant).await.unwrap().completed, 5);
    }
}
