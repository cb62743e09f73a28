//! `kapso.message.received`: match an inbound reply to the delivery that
//! prompted it and record the response.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use surveyline_core::Clock;
use surveyline_delivery::{SurveyResponse, recipient_hash};

use crate::deliveries::{DeliveryStore, DeliveryStoreError};
use crate::jobs::{Job, JobHandler, JobOutcome};
use crate::webhooks::InboundMessage;

use super::decode_payload;

const MAX_CONFLICT_RETRIES: usize = 3;

pub struct InboundResponseHandler {
    deliveries: Arc<dyn DeliveryStore>,
    clock: Arc<dyn Clock>,
}

impl InboundResponseHandler {
    pub fn new(deliveries: Arc<dyn DeliveryStore>, clock: Arc<dyn Clock>) -> Self {
        Self { deliveries, clock }
    }
}

#[async_trait]
impl JobHandler for InboundResponseHandler {
    async fn handle(&self, job: &Job) -> JobOutcome {
        let message: InboundMessage = match decode_payload(job) {
            Ok(m) => m,
            Err(outcome) => return outcome,
        };

        let hash = recipient_hash(&message.customer_phone);
        let mut delivery = match self
            .deliveries
            .find_latest_open_by_recipient(job.tenant_id, &hash)
            .await
        {
            Ok(Some(d)) => d,
            Ok(None) => {
                debug!(
                    tenant_id = %job.tenant_id,
                    message_id = %message.message_id,
                    "no open delivery for sender; message ignored"
                );
                return JobOutcome::Completed;
            }
            Err(e) => return JobOutcome::retryable(e.to_string()),
        };

        let now = self.clock.now();
        let response =
            SurveyResponse::for_delivery(&delivery, &message.message_id, &message.content, now);
        match self.deliveries.insert_response(&response).await {
            // A previous attempt may have recorded it before failing the update.
            Ok(()) | Err(DeliveryStoreError::DuplicateResponse(_)) => {}
            Err(e) => return JobOutcome::retryable(e.to_string()),
        }

        for _ in 0..MAX_CONFLICT_RETRIES {
            let read_status = delivery.status;
            if let Err(e) = delivery.mark_responded(now) {
                debug!(delivery_id = %delivery.id, error = %e, "delivery no longer awaiting a reply");
                return JobOutcome::Completed;
            }
            match self.deliveries.update(&delivery, read_status).await {
                Ok(()) => {
                    info!(
                        delivery_id = %delivery.id,
                        survey_id = %delivery.survey_id,
                        message_id = %message.message_id,
                        "survey response recorded"
                    );
                    return JobOutcome::Completed;
                }
                Err(DeliveryStoreError::Conflict { .. }) => {
                    delivery = match self.deliveries.get(job.tenant_id, delivery.id).await {
                        Ok(Some(d)) => d,
                        Ok(None) => return JobOutcome::Completed,
                        Err(e) => return JobOutcome::retryable(e.to_string()),
                    };
                }
                Err(e) => return JobOutcome::retryable(e.to_string()),
            }
        }
        JobOutcome::retryable("concurrent delivery updates")
    }
}
