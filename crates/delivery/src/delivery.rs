//! Delivery aggregate and its state machine.
//!
//! ```text
//! pending -> queued -> sent -> delivered -> responded
//!              |        |  \-> responded
//!              |        \-> failed <-> (re-attempt) -> sent | undeliverable
//!              \-> failed | undeliverable
//! ```
//!
//! `responded` and `undeliverable` are terminal. Provider status events that
//! arrive after a response are ignored rather than rejected.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use surveyline_core::{DeliveryId, DomainError, SurveyId, TenantId};

use crate::phone::PhoneNumber;

/// Default number of provider re-attempts for one delivery.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Delivery status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Queued,
    Sent,
    Delivered,
    Failed,
    Undeliverable,
    Responded,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Queued => "queued",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Undeliverable => "undeliverable",
            DeliveryStatus::Responded => "responded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Undeliverable | DeliveryStatus::Responded)
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Queued, Sent)
                | (Queued, Failed)
                | (Queued, Undeliverable)
                | (Sent, Delivered)
                | (Sent, Responded)
                | (Sent, Failed)
                | (Sent, Undeliverable)
                | (Delivered, Responded)
                | (Failed, Sent)
                | (Failed, Failed)
                | (Failed, Undeliverable)
        )
    }
}

impl core::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for DeliveryStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "queued" => Ok(DeliveryStatus::Queued),
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            "undeliverable" => Ok(DeliveryStatus::Undeliverable),
            "responded" => Ok(DeliveryStatus::Responded),
            other => Err(DomainError::validation(format!("unknown delivery status '{other}'"))),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("illegal delivery transition {from} -> {to}")]
    IllegalTransition {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },
}

impl From<DeliveryError> for DomainError {
    fn from(value: DeliveryError) -> Self {
        DomainError::invariant(value.to_string())
    }
}

/// Status reported by the messaging provider for a message it accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ProviderStatus {
    Sent,
    Delivered,
    Read,
    Failed { error: String, retryable: bool },
}

/// What applying a provider status did to the delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusApplication {
    Applied(DeliveryStatus),
    /// Late, duplicate or superseded event (e.g. after a response).
    Ignored,
}

/// Input for a new delivery.
#[derive(Debug, Clone)]
pub struct NewDelivery {
    pub tenant_id: TenantId,
    pub survey_id: SurveyId,
    pub recipient: PhoneNumber,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Record of one attempt to deliver a survey to one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub tenant_id: TenantId,
    pub survey_id: SurveyId,
    pub recipient_address: String,
    pub recipient_address_hash: String,
    pub status: DeliveryStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub provider_delivery_id: Option<String>,
    pub error_message: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl Delivery {
    pub fn new(input: NewDelivery, now: DateTime<Utc>) -> Self {
        Self {
            id: DeliveryId::new(),
            tenant_id: input.tenant_id,
            survey_id: input.survey_id,
            recipient_address_hash: input.recipient.hash(),
            recipient_address: input.recipient.as_str().to_string(),
            status: DeliveryStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            provider_delivery_id: None,
            error_message: None,
            metadata: input.metadata,
            created_at: now,
            updated_at: now,
            delivered_at: None,
            responded_at: None,
        }
    }

    fn transition(&mut self, to: DeliveryStatus, now: DateTime<Utc>) -> Result<(), DeliveryError> {
        if !self.status.can_transition_to(to) {
            return Err(DeliveryError::IllegalTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// The send job was accepted by the queue.
    pub fn mark_queued(&mut self, now: DateTime<Utc>) -> Result<(), DeliveryError> {
        self.transition(DeliveryStatus::Queued, now)
    }

    /// The provider accepted the message.
    pub fn mark_sent(
        &mut self,
        provider_delivery_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        self.transition(DeliveryStatus::Sent, now)?;
        self.provider_delivery_id = Some(provider_delivery_id.into());
        self.error_message = None;
        Ok(())
    }

    pub fn mark_delivered(&mut self, now: DateTime<Utc>) -> Result<(), DeliveryError> {
        self.transition(DeliveryStatus::Delivered, now)?;
        self.delivered_at = Some(now);
        Ok(())
    }

    pub fn mark_responded(&mut self, now: DateTime<Utc>) -> Result<(), DeliveryError> {
        self.transition(DeliveryStatus::Responded, now)?;
        self.responded_at = Some(now);
        Ok(())
    }

    /// Transient failure; another attempt is expected.
    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        self.transition(DeliveryStatus::Failed, now)?;
        self.retry_count += 1;
        self.error_message = Some(error.into());
        Ok(())
    }

    /// Terminal failure.
    pub fn mark_undeliverable(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        self.transition(DeliveryStatus::Undeliverable, now)?;
        self.error_message = Some(error.into());
        Ok(())
    }

    /// Whether another provider attempt fits in the retry budget.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Apply an asynchronous provider status event.
    ///
    /// Events that do not correspond to a legal edge from the current status
    /// (out-of-order, duplicated, or arriving after a response) are ignored.
    /// A retryable failure with no retries left is terminal.
    pub fn apply_provider_status(
        &mut self,
        status: &ProviderStatus,
        now: DateTime<Utc>,
    ) -> StatusApplication {
        if self.status == DeliveryStatus::Responded {
            return StatusApplication::Ignored;
        }

        let result = match status {
            ProviderStatus::Sent | ProviderStatus::Read => return StatusApplication::Ignored,
            ProviderStatus::Delivered => self.mark_delivered(now),
            ProviderStatus::Failed { error, retryable: true } if self.has_retries_left() => {
                self.mark_failed(error.clone(), now)
            }
            ProviderStatus::Failed { error, retryable: true } => {
                self.mark_undeliverable(format!("{error} (retries exhausted)"), now)
            }
            ProviderStatus::Failed { error, retryable: false } => {
                self.mark_undeliverable(error.clone(), now)
            }
        };

        match result {
            Ok(()) => StatusApplication::Applied(self.status),
            Err(_) => StatusApplication::Ignored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_delivery() -> Delivery {
        Delivery::new(
            NewDelivery {
                tenant_id: TenantId::new(),
                survey_id: SurveyId::new(),
                recipient: PhoneNumber::parse("+5511999999999").unwrap(),
                metadata: BTreeMap::new(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn starts_pending_with_default_budget() {
        let d = new_delivery();
        assert_eq!(d.status, DeliveryStatus::Pending);
        assert_eq!(d.retry_count, 0);
        assert_eq!(d.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(d.recipient_address_hash.len(), 64);
    }

    #[test]
    fn happy_path_to_responded() {
        let mut d = new_delivery();
        let now = Utc::now();
        d.mark_queued(now).unwrap();
        d.mark_sent("wamid.1", now).unwrap();
        d.mark_delivered(now).unwrap();
        d.mark_responded(now).unwrap();

        assert_eq!(d.status, DeliveryStatus::Responded);
        assert_eq!(d.provider_delivery_id.as_deref(), Some("wamid.1"));
        assert!(d.delivered_at.is_some());
        assert!(d.responded_at.is_some());
    }

    #[test]
    fn cannot_skip_states() {
        let mut d = new_delivery();
        let err = d.mark_sent("wamid.1", Utc::now()).unwrap_err();
        assert_eq!(
            err,
            DeliveryError::IllegalTransition {
                from: DeliveryStatus::Pending,
                to: DeliveryStatus::Sent
            }
        );
        assert_eq!(d.status, DeliveryStatus::Pending);
    }

    #[test]
    fn failure_loop_counts_retries_and_ends_sent() {
        let mut d = new_delivery();
        let now = Utc::now();
        d.mark_queued(now).unwrap();
        d.mark_failed("timeout", now).unwrap();
        d.mark_failed("timeout again", now).unwrap();
        assert_eq!(d.retry_count, 2);
        assert_eq!(d.error_message.as_deref(), Some("timeout again"));

        d.mark_sent("wamid.2", now).unwrap();
        assert_eq!(d.status, DeliveryStatus::Sent);
        assert!(d.error_message.is_none());
    }

    #[test]
    fn undeliverable_is_terminal() {
        let mut d = new_delivery();
        let now = Utc::now();
        d.mark_queued(now).unwrap();
        d.mark_undeliverable("invalid recipient", now).unwrap();
        assert!(d.status.is_terminal());
        assert!(d.mark_sent("wamid.3", now).is_err());
        assert!(d.mark_failed("x", now).is_err());
    }

    #[test]
    fn provider_status_after_response_is_ignored() {
        let mut d = new_delivery();
        let now = Utc::now();
        d.mark_queued(now).unwrap();
        d.mark_sent("wamid.1", now).unwrap();
        d.mark_responded(now).unwrap();

        let applied = d.apply_provider_status(&ProviderStatus::Delivered, now);
        assert_eq!(applied, StatusApplication::Ignored);
        let applied = d.apply_provider_status(
            &ProviderStatus::Failed {
                error: "late".into(),
                retryable: false,
            },
            now,
        );
        assert_eq!(applied, StatusApplication::Ignored);
        assert_eq!(d.status, DeliveryStatus::Responded);
    }

    #[test]
    fn provider_failure_classification() {
        let now = Utc::now();

        let mut transient = new_delivery();
        transient.mark_queued(now).unwrap();
        transient.mark_sent("wamid.1", now).unwrap();
        assert_eq!(
            transient.apply_provider_status(
                &ProviderStatus::Failed {
                    error: "throttled".into(),
                    retryable: true
                },
                now
            ),
            StatusApplication::Applied(DeliveryStatus::Failed)
        );

        let mut permanent = new_delivery();
        permanent.mark_queued(now).unwrap();
        permanent.mark_sent("wamid.2", now).unwrap();
        assert_eq!(
            permanent.apply_provider_status(
                &ProviderStatus::Failed {
                    error: "not on whatsapp".into(),
                    retryable: false
                },
                now
            ),
            StatusApplication::Applied(DeliveryStatus::Undeliverable)
        );
    }

    #[test]
    fn retryable_provider_failure_respects_retry_budget() {
        let now = Utc::now();
        let throttled = ProviderStatus::Failed {
            error: "throttled".into(),
            retryable: true,
        };

        let mut d = new_delivery();
        d.mark_queued(now).unwrap();
        for attempt in 0..d.max_retries {
            d.mark_sent(format!("wamid.{attempt}"), now).unwrap();
            assert_eq!(
                d.apply_provider_status(&throttled, now),
                StatusApplication::Applied(DeliveryStatus::Failed)
            );
        }
        assert!(!d.has_retries_left());

        d.mark_sent("wamid.last", now).unwrap();
        assert_eq!(
            d.apply_provider_status(&throttled, now),
            StatusApplication::Applied(DeliveryStatus::Undeliverable)
        );
        assert_eq!(d.retry_count, d.max_retries);
        assert_eq!(d.error_message.as_deref(), Some("throttled (retries exhausted)"));
    }

    #[test]
    fn duplicate_delivered_event_is_ignored() {
        let mut d = new_delivery();
        let now = Utc::now();
        d.mark_queued(now).unwrap();
        d.mark_sent("wamid.1", now).unwrap();
        assert_eq!(
            d.apply_provider_status(&ProviderStatus::Delivered, now),
            StatusApplication::Applied(DeliveryStatus::Delivered)
        );
        assert_eq!(
            d.apply_provider_status(&ProviderStatus::Delivered, now),
            StatusApplication::Ignored
        );
    }

    #[test]
    fn status_strings_round_trip() {
        for s in [
            DeliveryStatus::Pending,
            DeliveryStatus::Queued,
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered,
            DeliveryStatus::Failed,
            DeliveryStatus::Undeliverable,
            DeliveryStatus::Responded,
        ] {
            assert_eq!(s.as_str().parse::<DeliveryStatus>().unwrap(), s);
        }
    }
}
