//! `kapso.status.updated`: apply provider delivery reports.
//!
//! A retryable failure report moves the delivery to `failed` and schedules a
//! fresh `survey.send` for it, keyed by the delivery's retry count so every
//! re-attempt is enqueued at most once. With the retry budget spent the
//! delivery becomes `undeliverable` instead.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use surveyline_core::Clock;
use surveyline_delivery::{Delivery, DeliveryStatus, ProviderStatus, StatusApplication};

use crate::deliveries::{DeliveryStore, DeliveryStoreError};
use crate::jobs::{Job, JobHandler, JobOutcome, JobSource, JobStore, NewJob};
use crate::webhooks::StatusUpdate;

use super::{SURVEY_SEND, SurveySendPayload, decode_payload};

/// Re-reads allowed when a concurrent writer moves the delivery between our
/// read and our write.
const MAX_CONFLICT_RETRIES: usize = 3;

pub struct StatusUpdateHandler {
    jobs: Arc<dyn JobStore>,
    deliveries: Arc<dyn DeliveryStore>,
    clock: Arc<dyn Clock>,
}

impl StatusUpdateHandler {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        deliveries: Arc<dyn DeliveryStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs,
            deliveries,
            clock,
        }
    }

    /// One read-apply-write pass. `Err` only for a lost compare-and-set.
    async fn apply(
        &self,
        job: &Job,
        update: &StatusUpdate,
    ) -> Result<JobOutcome, DeliveryStoreError> {
        let mut delivery = match self
            .deliveries
            .find_by_provider_id(job.tenant_id, &update.provider_message_id)
            .await
        {
            Ok(Some(d)) => d,
            Ok(None) => {
                debug!(
                    provider_message_id = %update.provider_message_id,
                    "status for unknown provider message ignored"
                );
                return Ok(JobOutcome::Completed);
            }
            Err(e) => return Ok(JobOutcome::retryable(e.to_string())),
        };
        let read_status = delivery.status;

        // A repeated failure report for the same send: the retry was already
        // counted, only make sure the re-attempt exists.
        if read_status == DeliveryStatus::Failed
            && matches!(update.status, ProviderStatus::Failed { retryable: true, .. })
        {
            return Ok(self.schedule_resend(&delivery).await);
        }

        match delivery.apply_provider_status(&update.status, self.clock.now()) {
            StatusApplication::Applied(status) => {
                match self.deliveries.update(&delivery, read_status).await {
                    Ok(()) => {}
                    Err(e @ DeliveryStoreError::Conflict { .. }) => return Err(e),
                    Err(e) => return Ok(JobOutcome::retryable(e.to_string())),
                }
                info!(delivery_id = %delivery.id, status = %status, "provider status applied");
                if status == DeliveryStatus::Failed {
                    return Ok(self.schedule_resend(&delivery).await);
                }
            }
            StatusApplication::Ignored => {
                debug!(
                    delivery_id = %delivery.id,
                    current = %delivery.status,
                    reported = update.status_name(),
                    "provider status ignored"
                );
            }
        }
        Ok(JobOutcome::Completed)
    }

    async fn schedule_resend(&self, delivery: &Delivery) -> JobOutcome {
        let payload = match serde_json::to_value(SurveySendPayload {
            delivery_id: delivery.id,
        }) {
            Ok(p) => p,
            Err(e) => return JobOutcome::terminal(e.to_string()),
        };
        let job = NewJob::new(
            delivery.tenant_id,
            format!("{SURVEY_SEND}:{}:{}", delivery.id, delivery.retry_count),
            JobSource::Internal,
            SURVEY_SEND,
            payload,
        );

        match self.jobs.enqueue(job).await {
            Ok(Some(job_id)) => {
                info!(
                    delivery_id = %delivery.id,
                    job_id = %job_id,
                    retry_count = delivery.retry_count,
                    "survey re-send scheduled"
                );
                JobOutcome::Completed
            }
            Ok(None) => {
                debug!(delivery_id = %delivery.id, "survey re-send already scheduled");
                JobOutcome::Completed
            }
            Err(e) => JobOutcome::retryable(format!("failed to schedule re-send: {e}")),
        }
    }
}

#[async_trait]
impl JobHandler for StatusUpdateHandler {
    async fn handle(&self, job: &Job) -> JobOutcome {
        let update: StatusUpdate = match decode_payload(job) {
            Ok(u) => u,
            Err(outcome) => return outcome,
        };

        for _ in 0..MAX_CONFLICT_RETRIES {
            match self.apply(job, &update).await {
                Ok(outcome) => return outcome,
                Err(e) => {
                    debug!(job_id = %job.id, error = %e, "delivery changed underneath; re-reading");
                }
            }
        }
        warn!(
            job_id = %job.id,
            provider_message_id = %update.provider_message_id,
            "delivery kept changing while applying status"
        );
        JobOutcome::retryable("concurrent delivery updates")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use surveyline_core::{ManualClock, SurveyId, TenantId};
    use surveyline_delivery::{NewDelivery, PhoneNumber};

    use super::*;
    use crate::deliveries::{InMemoryDeliveryStore, StaleReads};
    use crate::handlers::STATUS_UPDATED;
    use crate::jobs::InMemoryJobStore;

    fn status_job(tenant: TenantId, status: ProviderStatus) -> Job {
        let update = StatusUpdate {
            phone_number_id: "pn-1".to_string(),
            provider_message_id: "wamid.out".to_string(),
            status,
        };
        Job::from_new(
            NewJob::new(
                tenant,
                update.idempotency_key(),
                JobSource::Webhook,
                STATUS_UPDATED,
                serde_json::to_value(&update).unwrap(),
            ),
            Utc::now(),
        )
    }

    fn throttled() -> ProviderStatus {
        ProviderStatus::Failed {
            error: "130429: Rate limit hit".to_string(),
            retryable: true,
        }
    }

    struct Fixture {
        tenant: TenantId,
        store: Arc<InMemoryDeliveryStore>,
        jobs: Arc<InMemoryJobStore>,
        delivery: Delivery,
        handler: StatusUpdateHandler,
    }

    fn sent_delivery(tenant: TenantId) -> Delivery {
        let mut d = Delivery::new(
            NewDelivery {
                tenant_id: tenant,
                survey_id: SurveyId::new(),
                recipient: PhoneNumber::parse("+5511999999999").unwrap(),
                metadata: BTreeMap::new(),
            },
            Utc::now(),
        );
        d.mark_queued(Utc::now()).unwrap();
        d.mark_sent("wamid.out", Utc::now()).unwrap();
        d
    }

    async fn setup() -> Fixture {
        let store = InMemoryDeliveryStore::arc();
        let jobs = InMemoryJobStore::arc();
        let tenant = TenantId::new();
        let delivery = sent_delivery(tenant);
        store.insert(&delivery).await.unwrap();
        let handler = StatusUpdateHandler::new(
            jobs.clone(),
            store.clone(),
            Arc::new(ManualClock::starting_now()),
        );
        Fixture {
            tenant,
            store,
            jobs,
            delivery,
            handler,
        }
    }

    #[tokio::test]
    async fn delivered_report_marks_delivered() {
        let f = setup().await;
        let outcome = f.handler.handle(&status_job(f.tenant, ProviderStatus::Delivered)).await;

        assert_eq!(outcome, JobOutcome::Completed);
        let d = f.store.get(f.tenant, f.delivery.id).await.unwrap().unwrap();
        assert_eq!(d.status, DeliveryStatus::Delivered);
        assert!(d.delivered_at.is_some());
    }

    #[tokio::test]
    async fn permanent_failure_marks_undeliverable() {
        let f = setup().await;
        f.handler
            .handle(&status_job(
                f.tenant,
                ProviderStatus::Failed {
                    error: "131000: Something went wrong".to_string(),
                    retryable: false,
                },
            ))
            .await;

        let d = f.store.get(f.tenant, f.delivery.id).await.unwrap().unwrap();
        assert_eq!(d.status, DeliveryStatus::Undeliverable);
        assert_eq!(d.error_message.as_deref(), Some("131000: Something went wrong"));
        assert!(f.jobs.is_empty());
    }

    #[tokio::test]
    async fn retryable_failure_schedules_a_resend() {
        let f = setup().await;
        let outcome = f.handler.handle(&status_job(f.tenant, throttled())).await;
        assert_eq!(outcome, JobOutcome::Completed);

        let d = f.store.get(f.tenant, f.delivery.id).await.unwrap().unwrap();
        assert_eq!(d.status, DeliveryStatus::Failed);
        assert_eq!(d.retry_count, 1);

        // A redelivered report neither spends budget nor duplicates the job.
        f.handler.handle(&status_job(f.tenant, throttled())).await;
        assert_eq!(
            f.store.get(f.tenant, f.delivery.id).await.unwrap().unwrap().retry_count,
            1
        );
        assert_eq!(f.jobs.len(), 1);

        let resend = f.jobs.acquire().await.unwrap().unwrap();
        assert_eq!(resend.event_type, SURVEY_SEND);
        assert_eq!(resend.source, JobSource::Internal);
        assert_eq!(resend.idempotency_key, format!("survey.send:{}:1", f.delivery.id));
        let payload: SurveySendPayload = serde_json::from_value(resend.payload).unwrap();
        assert_eq!(payload.delivery_id, f.delivery.id);
    }

    #[tokio::test]
    async fn retryable_failure_with_budget_spent_is_undeliverable() {
        let f = setup().await;
        let mut d = f.delivery.clone();
        d.retry_count = d.max_retries;
        f.store.update(&d, DeliveryStatus::Sent).await.unwrap();

        let outcome = f.handler.handle(&status_job(f.tenant, throttled())).await;

        assert_eq!(outcome, JobOutcome::Completed);
        let d = f.store.get(f.tenant, f.delivery.id).await.unwrap().unwrap();
        assert_eq!(d.status, DeliveryStatus::Undeliverable);
        assert!(f.jobs.is_empty());
    }

    #[tokio::test]
    async fn reports_after_response_are_ignored() {
        let f = setup().await;
        let mut d = f.delivery.clone();
        d.mark_responded(Utc::now()).unwrap();
        f.store.update(&d, DeliveryStatus::Sent).await.unwrap();

        let outcome = f.handler.handle(&status_job(f.tenant, ProviderStatus::Delivered)).await;

        assert_eq!(outcome, JobOutcome::Completed);
        let d = f.store.get(f.tenant, d.id).await.unwrap().unwrap();
        assert_eq!(d.status, DeliveryStatus::Responded);
    }

    #[tokio::test]
    async fn read_receipts_and_unknown_ids_are_no_ops() {
        let f = setup().await;
        f.handler.handle(&status_job(f.tenant, ProviderStatus::Read)).await;
        assert_eq!(
            f.store.get(f.tenant, f.delivery.id).await.unwrap().unwrap().status,
            DeliveryStatus::Sent
        );

        let other_tenant = f
            .handler
            .handle(&status_job(TenantId::new(), ProviderStatus::Delivered))
            .await;
        assert_eq!(other_tenant, JobOutcome::Completed);
    }

    #[tokio::test]
    async fn late_report_does_not_clobber_a_concurrent_response() {
        let f = setup().await;
        let mut replied = f.delivery.clone();
        replied.mark_responded(Utc::now()).unwrap();
        f.store.update(&replied, DeliveryStatus::Sent).await.unwrap();

        let racing = StaleReads::new(f.store.clone(), f.delivery.clone());
        let handler = StatusUpdateHandler::new(
            f.jobs.clone(),
            Arc::new(racing),
            Arc::new(ManualClock::starting_now()),
        );

        let outcome = handler.handle(&status_job(f.tenant, ProviderStatus::Delivered)).await;

        assert_eq!(outcome, JobOutcome::Completed);
        let d = f.store.get(f.tenant, f.delivery.id).await.unwrap().unwrap();
        assert_eq!(d.status, DeliveryStatus::Responded);
        assert!(d.responded_at.is_some());
    }
}
