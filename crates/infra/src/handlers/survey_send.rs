//! `survey.send`: deliver a survey's opening message through the provider.
//!
//! The job's retry budget and the delivery's terminal state are decided
//! separately. A permanent provider error (or a transient one on the job's final
//! attempt) makes the delivery `undeliverable` while the job itself completes.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use surveyline_core::{Clock, DeliveryId};
use surveyline_delivery::{Delivery, DeliveryStatus};

use crate::deliveries::{DeliveryStore, DeliveryStoreError};
use crate::directory::SurveyDirectory;
use crate::jobs::{Job, JobHandler, JobOutcome};
use crate::messaging::{MessagingProvider, OutboundMessage};

use super::decode_payload;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveySendPayload {
    pub delivery_id: DeliveryId,
}

pub struct SurveySendHandler {
    deliveries: Arc<dyn DeliveryStore>,
    surveys: Arc<dyn SurveyDirectory>,
    provider: Arc<dyn MessagingProvider>,
    clock: Arc<dyn Clock>,
}

impl SurveySendHandler {
    pub fn new(
        deliveries: Arc<dyn DeliveryStore>,
        surveys: Arc<dyn SurveyDirectory>,
        provider: Arc<dyn MessagingProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            deliveries,
            surveys,
            provider,
            clock,
        }
    }

    /// Persist `delivery` if it is still in the `expected` status it was read in.
    /// When another writer got there first its state is kept.
    async fn save(
        &self,
        delivery: &Delivery,
        expected: DeliveryStatus,
        then: JobOutcome,
    ) -> JobOutcome {
        match self.deliveries.update(delivery, expected).await {
            Ok(()) => then,
            Err(DeliveryStoreError::Conflict { actual, .. }) => {
                warn!(
                    delivery_id = %delivery.id,
                    expected = %expected,
                    actual = %actual,
                    "delivery changed during send; keeping the stored state"
                );
                then
            }
            Err(e) => JobOutcome::retryable(format!("failed to persist delivery: {e}")),
        }
    }

    async fn give_up(
        &self,
        mut delivery: Delivery,
        expected: DeliveryStatus,
        reason: String,
    ) -> JobOutcome {
        let now = self.clock.now();
        if let Err(e) = delivery.mark_undeliverable(&reason, now) {
            warn!(delivery_id = %delivery.id, error = %e, "cannot mark delivery undeliverable");
            return JobOutcome::Completed;
        }
        warn!(delivery_id = %delivery.id, reason = %reason, "delivery undeliverable");
        self.save(&delivery, expected, JobOutcome::Completed).await
    }
}

#[async_trait]
impl JobHandler for SurveySendHandler {
    async fn handle(&self, job: &Job) -> JobOutcome {
        let payload: SurveySendPayload = match decode_payload(job) {
            Ok(p) => p,
            Err(outcome) => return outcome,
        };

        let mut delivery = match self.deliveries.get(job.tenant_id, payload.delivery_id).await {
            Ok(Some(d)) => d,
            Ok(None) => {
                warn!(job_id = %job.id, delivery_id = %payload.delivery_id, "delivery not found; nothing to send");
                return JobOutcome::Completed;
            }
            Err(e) => return JobOutcome::retryable(e.to_string()),
        };

        let read_status = delivery.status;
        match read_status {
            DeliveryStatus::Pending => {
                if let Err(e) = delivery.mark_queued(self.clock.now()) {
                    return JobOutcome::terminal(e.to_string());
                }
            }
            DeliveryStatus::Queued | DeliveryStatus::Failed => {}
            // Already sent (re-run after a lost completion) or terminal.
            _ => {
                info!(delivery_id = %delivery.id, status = %delivery.status, "delivery already past send");
                return JobOutcome::Completed;
            }
        }

        let survey = match self.surveys.get_survey(job.tenant_id, delivery.survey_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                return self
                    .give_up(delivery, read_status, "survey not found".to_string())
                    .await;
            }
            Err(e) => return JobOutcome::retryable(e.to_string()),
        };
        if !survey.active {
            return self.give_up(delivery, read_status, "survey inactive".to_string()).await;
        }

        let message = OutboundMessage {
            to: delivery.recipient_address.clone(),
            body: survey.message.clone(),
            flow_id: survey.flow_id.clone(),
        };

        match self.provider.send(&message).await {
            Ok(receipt) => {
                if let Err(e) = delivery.mark_sent(&receipt.provider_delivery_id, self.clock.now()) {
                    return JobOutcome::terminal(e.to_string());
                }
                info!(
                    delivery_id = %delivery.id,
                    provider_delivery_id = %receipt.provider_delivery_id,
                    "survey sent"
                );
                self.save(&delivery, read_status, JobOutcome::Completed).await
            }
            Err(err) if err.retryable && !job.is_final_attempt() => {
                let reason = err.to_string();
                if let Err(e) = delivery.mark_failed(&reason, self.clock.now()) {
                    return JobOutcome::terminal(e.to_string());
                }
                warn!(
                    delivery_id = %delivery.id,
                    attempt = job.attempts + 1,
                    code = %err.code,
                    "transient provider failure; will retry"
                );
                self.save(&delivery, read_status, JobOutcome::retryable(reason)).await
            }
            Err(err) => self.give_up(delivery, read_status, err.to_string()).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use surveyline_core::{ManualClock, SurveyId, TenantId};
    use surveyline_delivery::{NewDelivery, PhoneNumber};

    use super::*;
    use crate::deliveries::InMemoryDeliveryStore;
    use crate::directory::{InMemoryDirectory, SurveySummary};
    use crate::handlers::SURVEY_SEND;
    use crate::jobs::{JobSource, NewJob};
    use crate::messaging::{ProviderError, SendReceipt, StubMessagingProvider};

    struct Fixture {
        tenant: TenantId,
        deliveries: Arc<InMemoryDeliveryStore>,
        directory: Arc<InMemoryDirectory>,
        provider: Arc<StubMessagingProvider>,
        handler: SurveySendHandler,
        survey: SurveySummary,
    }

    fn fixture() -> Fixture {
        let tenant = TenantId::new();
        let deliveries = InMemoryDeliveryStore::arc();
        let directory = InMemoryDirectory::arc();
        let provider = Arc::new(StubMessagingProvider::new());
        let survey = SurveySummary {
            id: SurveyId::new(),
            name: "NPS".to_string(),
            active: true,
            message: "How likely are you to recommend us?".to_string(),
            flow_id: None,
        };
        directory.add_survey(tenant, survey.clone());
        let handler = SurveySendHandler::new(
            deliveries.clone(),
            directory.clone(),
            provider.clone(),
            Arc::new(ManualClock::starting_now()),
        );
        Fixture {
            tenant,
            deliveries,
            directory,
            provider,
            handler,
            survey,
        }
    }

    async fn queued_delivery(f: &Fixture, survey_id: SurveyId) -> Delivery {
        let mut d = Delivery::new(
            NewDelivery {
                tenant_id: f.tenant,
                survey_id,
                recipient: PhoneNumber::parse("+5511999999999").unwrap(),
                metadata: BTreeMap::new(),
            },
            Utc::now(),
        );
        d.mark_queued(Utc::now()).unwrap();
        f.deliveries.insert(&d).await.unwrap();
        d
    }

    fn job(f: &Fixture, delivery_id: DeliveryId, attempts: u32) -> Job {
        let mut job = Job::from_new(
            NewJob::new(
                f.tenant,
                format!("survey.send:{delivery_id}"),
                JobSource::Internal,
                SURVEY_SEND,
                serde_json::to_value(SurveySendPayload { delivery_id }).unwrap(),
            ),
            Utc::now(),
        );
        job.attempts = attempts;
        job
    }

    async fn reload(f: &Fixture, id: DeliveryId) -> Delivery {
        f.deliveries.get(f.tenant, id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn success_marks_sent_and_completes() {
        let f = fixture();
        let d = queued_delivery(&f, f.survey.id).await;

        let outcome = f.handler.handle(&job(&f, d.id, 0)).await;

        assert_eq!(outcome, JobOutcome::Completed);
        let d = reload(&f, d.id).await;
        assert_eq!(d.status, DeliveryStatus::Sent);
        assert!(d.provider_delivery_id.is_some());
        assert_eq!(f.provider.sent()[0].body, f.survey.message);
    }

    #[tokio::test]
    async fn transient_failure_before_final_attempt_retries() {
        let f = fixture();
        let d = queued_delivery(&f, f.survey.id).await;
        f.provider.push_error(ProviderError::retryable("timeout", "provider timed out"));

        let outcome = f.handler.handle(&job(&f, d.id, 0)).await;

        assert!(matches!(outcome, JobOutcome::RetryableFailure(_)));
        let d = reload(&f, d.id).await;
        assert_eq!(d.status, DeliveryStatus::Failed);
        assert_eq!(d.retry_count, 1);
        assert!(d.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn transient_failure_on_final_attempt_is_undeliverable_but_completes() {
        let f = fixture();
        let d = queued_delivery(&f, f.survey.id).await;
        f.provider.push_error(ProviderError::retryable("timeout", "provider timed out"));

        let outcome = f.handler.handle(&job(&f, d.id, 2)).await;

        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(reload(&f, d.id).await.status, DeliveryStatus::Undeliverable);
    }

    #[tokio::test]
    async fn permanent_failure_is_undeliverable_immediately() {
        let f = fixture();
        let d = queued_delivery(&f, f.survey.id).await;
        f.provider.push_error(ProviderError::permanent("131026", "invalid recipient"));

        let outcome = f.handler.handle(&job(&f, d.id, 0)).await;

        assert_eq!(outcome, JobOutcome::Completed);
        let d = reload(&f, d.id).await;
        assert_eq!(d.status, DeliveryStatus::Undeliverable);
        assert!(d.error_message.unwrap().contains("131026"));
    }

    #[tokio::test]
    async fn retry_after_failure_can_succeed() {
        let f = fixture();
        let d = queued_delivery(&f, f.survey.id).await;
        f.provider.push_error(ProviderError::retryable("timeout", "slow"));

        f.handler.handle(&job(&f, d.id, 0)).await;
        let outcome = f.handler.handle(&job(&f, d.id, 1)).await;

        assert_eq!(outcome, JobOutcome::Completed);
        let d = reload(&f, d.id).await;
        assert_eq!(d.status, DeliveryStatus::Sent);
        assert!(d.error_message.is_none());
    }

    #[tokio::test]
    async fn inactive_survey_is_undeliverable_without_sending() {
        let f = fixture();
        let inactive = SurveySummary {
            id: SurveyId::new(),
            active: false,
            ..f.survey.clone()
        };
        f.directory.add_survey(f.tenant, inactive.clone());
        let d = queued_delivery(&f, inactive.id).await;

        let outcome = f.handler.handle(&job(&f, d.id, 0)).await;

        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(reload(&f, d.id).await.status, DeliveryStatus::Undeliverable);
        assert!(f.provider.sent().is_empty());
    }

    #[tokio::test]
    async fn already_sent_delivery_is_not_resent() {
        let f = fixture();
        let d = queued_delivery(&f, f.survey.id).await;
        f.handler.handle(&job(&f, d.id, 0)).await;

        let outcome = f.handler.handle(&job(&f, d.id, 0)).await;

        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(f.provider.sent().len(), 1);
    }

    /// Provider whose call overlaps with another worker finishing the same send.
    struct OverlappingProvider {
        deliveries: Arc<InMemoryDeliveryStore>,
        tenant: TenantId,
        delivery_id: DeliveryId,
    }

    #[async_trait]
    impl MessagingProvider for OverlappingProvider {
        async fn send(&self, _message: &OutboundMessage) -> Result<SendReceipt, ProviderError> {
            let mut other = self
                .deliveries
                .get(self.tenant, self.delivery_id)
                .await
                .unwrap()
                .unwrap();
            other.mark_sent("wamid.first", Utc::now()).unwrap();
            other.mark_responded(Utc::now()).unwrap();
            self.deliveries
                .update(&other, DeliveryStatus::Queued)
                .await
                .unwrap();
            Ok(SendReceipt {
                provider_delivery_id: "wamid.second".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn overlapping_send_keeps_the_stored_state() {
        let f = fixture();
        let d = queued_delivery(&f, f.survey.id).await;
        let handler = SurveySendHandler::new(
            f.deliveries.clone(),
            f.directory.clone(),
            Arc::new(OverlappingProvider {
                deliveries: f.deliveries.clone(),
                tenant: f.tenant,
                delivery_id: d.id,
            }),
            Arc::new(ManualClock::starting_now()),
        );

        let outcome = handler.handle(&job(&f, d.id, 0)).await;

        assert_eq!(outcome, JobOutcome::Completed);
        let d = reload(&f, d.id).await;
        assert_eq!(d.status, DeliveryStatus::Responded);
        assert_eq!(d.provider_delivery_id.as_deref(), Some("wamid.first"));
    }

    #[tokio::test]
    async fn malformed_payload_is_terminal() {
        let f = fixture();
        let mut bad = job(&f, DeliveryId::new(), 0);
        bad.payload = serde_json::json!({ "nope": true });

        assert!(matches!(
            f.handler.handle(&bad).await,
            JobOutcome::TerminalFailure(_)
        ));
    }
}
