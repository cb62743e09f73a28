//! Durable job queue and the polling processor that drains it.
//!
//! ## Components
//!
//! - `Job` / `NewJob`: queue records, status machine and backoff policy
//! - `JobStore`: enqueue/acquire/complete/fail contract (in-memory and Postgres)
//! - `JobHandler` / `HandlerRegistry`: per-event-type business logic
//! - `JobProcessor`: acquire, dispatch, record outcome

pub mod handler;
pub mod postgres;
pub mod processor;
pub mod store;
pub mod types;

pub use handler::{HandlerRegistry, JobHandler, JobOutcome, run_isolated};
pub use postgres::PostgresJobStore;
pub use processor::{
    JobProcessor, JobProcessorConfig, ProcessorHandle, ProcessorStats, Resolution, Tick,
};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError, LEASE_EXPIRED};
pub use types::{
    BackoffPolicy, DEFAULT_MAX_ATTEMPTS, FailureDisposition, Job, JobId, JobSource, JobStatus,
    NewJob,
};
