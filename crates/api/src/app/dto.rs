use std::collections::BTreeMap;

use serde::Deserialize;

use surveyline_delivery::Delivery;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SendSurveyRequest {
    pub phone: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

// -------------------------
// Response mapping
// -------------------------

/// Public view of a delivery. The plaintext recipient stays server-side.
pub fn delivery_to_json(d: &Delivery) -> serde_json::Value {
    serde_json::json!({
        "id": d.id.to_string(),
        "tenant_id": d.tenant_id.to_string(),
        "survey_id": d.survey_id.to_string(),
        "recipient_address_hash": d.recipient_address_hash,
        "status": d.status.as_str(),
        "retry_count": d.retry_count,
        "max_retries": d.max_retries,
        "provider_delivery_id": d.provider_delivery_id,
        "error_message": d.error_message,
        "metadata": d.metadata,
        "created_at": d.created_at,
        "updated_at": d.updated_at,
        "delivered_at": d.delivered_at,
        "responded_at": d.responded_at,
    })
}
