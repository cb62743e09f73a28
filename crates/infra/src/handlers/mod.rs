//! Concrete job handlers and the event types they are registered under.

pub mod inbound_response;
pub mod status_update;
pub mod survey_send;

use std::sync::Arc;

use serde::de::DeserializeOwned;

use surveyline_core::Clock;

use crate::deliveries::DeliveryStore;
use crate::directory::SurveyDirectory;
use crate::jobs::{HandlerRegistry, Job, JobOutcome, JobStore};
use crate::messaging::MessagingProvider;

pub use inbound_response::InboundResponseHandler;
pub use status_update::StatusUpdateHandler;
pub use survey_send::{SurveySendHandler, SurveySendPayload};

pub const SURVEY_SEND: &str = "survey.send";
pub const MESSAGE_RECEIVED: &str = "kapso.message.received";
pub const STATUS_UPDATED: &str = "kapso.status.updated";

/// Decode a job payload; a malformed payload can never succeed on retry.
pub(crate) fn decode_payload<T: DeserializeOwned>(job: &Job) -> Result<T, JobOutcome> {
    serde_json::from_value(job.payload.clone()).map_err(|e| {
        tracing::error!(job_id = %job.id, event_type = %job.event_type, error = %e, "malformed job payload");
        JobOutcome::terminal(format!("malformed payload: {e}"))
    })
}

/// Registry with every handler this service runs.
pub fn default_registry(
    jobs: Arc<dyn JobStore>,
    deliveries: Arc<dyn DeliveryStore>,
    surveys: Arc<dyn SurveyDirectory>,
    provider: Arc<dyn MessagingProvider>,
    clock: Arc<dyn Clock>,
) -> HandlerRegistry {
    HandlerRegistry::new()
        .with(
            SURVEY_SEND,
            Arc::new(SurveySendHandler::new(
                deliveries.clone(),
                surveys,
                provider,
                clock.clone(),
            )),
        )
        .with(
            MESSAGE_RECEIVED,
            Arc::new(InboundResponseHandler::new(deliveries.clone(), clock.clone())),
        )
        .with(
            STATUS_UPDATED,
            Arc::new(StatusUpdateHandler::new(jobs, deliveries, clock)),
        )
}
