use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use surveyline_core::{DeliveryId, ResponseId, SurveyId, TenantId};

use crate::delivery::Delivery;

/// A recipient's reply matched to the delivery that prompted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyResponse {
    pub id: ResponseId,
    pub tenant_id: TenantId,
    pub delivery_id: DeliveryId,
    pub survey_id: SurveyId,
    /// Provider message id of the inbound reply.
    pub provider_message_id: String,
    pub content: String,
    /// Caller metadata echoed back from the delivery.
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub received_at: DateTime<Utc>,
}

impl SurveyResponse {
    pub fn for_delivery(
        delivery: &Delivery,
        provider_message_id: impl Into<String>,
        content: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ResponseId::new(),
            tenant_id: delivery.tenant_id,
            delivery_id: delivery.id,
            survey_id: delivery.survey_id,
            provider_message_id: provider_message_id.into(),
            content: content.into(),
            metadata: delivery.metadata.clone(),
            received_at,
        }
    }
}
