//! Kapso webhook payload normalization.
//!
//! Accepts a single event object or a batch `{"data": [...]}`. Each item is
//! either a message event (carries `message`) or a provider status event
//! (carries `status`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use surveyline_delivery::ProviderStatus;

/// Prefix of every idempotency key derived from a webhook.
pub const WEBHOOK_SOURCE: &str = "kapso";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebhookParseError {
    #[error("body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("missing required field '{0}'")]
    MissingField(String),
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
}

impl WebhookParseError {
    fn missing(field: impl Into<String>) -> Self {
        Self::MissingField(field.into())
    }

    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Canonical inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Tenant routing key
    pub phone_number_id: String,
    pub customer_phone: String,
    /// Provider message id; source of the idempotency key
    pub message_id: String,
    pub content: String,
    pub direction: Direction,
    pub message_type: String,
}

impl InboundMessage {
    pub fn idempotency_key(&self) -> String {
        format!("{WEBHOOK_SOURCE}:{}", self.message_id)
    }
}

/// Provider status report for a message we sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub phone_number_id: String,
    /// Provider id of the outbound message
    pub provider_message_id: String,
    pub status: ProviderStatus,
}

impl StatusUpdate {
    pub fn status_name(&self) -> &'static str {
        match self.status {
            ProviderStatus::Sent => "sent",
            ProviderStatus::Delivered => "delivered",
            ProviderStatus::Read => "read",
            ProviderStatus::Failed { .. } => "failed",
        }
    }

    pub fn idempotency_key(&self) -> String {
        format!(
            "{WEBHOOK_SOURCE}:status:{}:{}",
            self.provider_message_id,
            self.status_name()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    Message(InboundMessage),
    Status(StatusUpdate),
}

/// Parse a raw webhook body into events, in payload order.
pub fn parse_webhook(body: &[u8]) -> Result<Vec<WebhookEvent>, WebhookParseError> {
    let root: Value =
        serde_json::from_slice(body).map_err(|e| WebhookParseError::InvalidJson(e.to_string()))?;

    if !root.is_object() {
        return Err(WebhookParseError::invalid("$", "expected a JSON object"));
    }

    match root.get("data") {
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| parse_item(item, &format!("data[{i}]")))
            .collect(),
        Some(_) => Err(WebhookParseError::invalid("data", "expected an array")),
        None => parse_item(&root, "").map(|event| vec![event]),
    }
}

fn path(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn parse_item(item: &Value, prefix: &str) -> Result<WebhookEvent, WebhookParseError> {
    if !item.is_object() {
        return Err(WebhookParseError::invalid(
            if prefix.is_empty() { "$" } else { prefix },
            "expected an object",
        ));
    }

    let phone_number_id = str_at(item, "/phone_number_id")
        .ok_or_else(|| WebhookParseError::missing(path(prefix, "phone_number_id")))?
        .to_string();

    if let Some(message) = item.get("message") {
        let prefix = path(prefix, "message");
        return parse_message(message, phone_number_id, &prefix).map(WebhookEvent::Message);
    }
    if let Some(status) = item.get("status") {
        let prefix = path(prefix, "status");
        return parse_status(status, phone_number_id, &prefix).map(WebhookEvent::Status);
    }

    Err(WebhookParseError::missing(path(prefix, "message")))
}

fn parse_message(
    message: &Value,
    phone_number_id: String,
    prefix: &str,
) -> Result<InboundMessage, WebhookParseError> {
    let message_id = str_at(message, "/id")
        .ok_or_else(|| WebhookParseError::missing(path(prefix, "id")))?
        .to_string();
    let message_type = str_at(message, "/type")
        .ok_or_else(|| WebhookParseError::missing(path(prefix, "type")))?
        .to_string();
    let customer_phone = str_at(message, "/from")
        .or_else(|| str_at(message, "/conversation/phone_number"))
        .ok_or_else(|| WebhookParseError::missing(path(prefix, "from")))?
        .to_string();

    let direction = match str_at(message, "/kapso/direction") {
        Some("inbound") => Direction::Inbound,
        Some("outbound") => Direction::Outbound,
        Some(other) => {
            return Err(WebhookParseError::invalid(
                path(prefix, "kapso.direction"),
                format!("unknown direction '{other}'"),
            ));
        }
        None => return Err(WebhookParseError::missing(path(prefix, "kapso.direction"))),
    };

    Ok(InboundMessage {
        phone_number_id,
        customer_phone,
        message_id,
        content: extract_content(message),
        direction,
        message_type,
    })
}

/// First non-empty content source, in order of specificity.
fn extract_content(message: &Value) -> String {
    const SOURCES: [&str; 6] = [
        "/text/body",
        "/interactive/nfm_reply/response_json",
        "/interactive/button_reply/title",
        "/interactive/list_reply/title",
        "/button/text",
        "/kapso/content",
    ];

    SOURCES
        .iter()
        .find_map(|p| str_at(message, p))
        .unwrap_or_default()
        .to_string()
}

fn parse_status(
    status: &Value,
    phone_number_id: String,
    prefix: &str,
) -> Result<StatusUpdate, WebhookParseError> {
    let provider_message_id = str_at(status, "/id")
        .ok_or_else(|| WebhookParseError::missing(path(prefix, "id")))?
        .to_string();

    let status_value = match str_at(status, "/status") {
        Some("sent") => ProviderStatus::Sent,
        Some("delivered") => ProviderStatus::Delivered,
        Some("read") => ProviderStatus::Read,
        Some("failed") => {
            let error = status.get("error");
            let code = error
                .and_then(|e| e.get("code"))
                .map(|c| match c {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "unknown".to_string());
            let title = error
                .and_then(|e| str_at(e, "/title"))
                .unwrap_or("delivery failed");
            let retryable = error
                .and_then(|e| e.get("retryable"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            ProviderStatus::Failed {
                error: format!("{code}: {title}"),
                retryable,
            }
        }
        Some(other) => {
            return Err(WebhookParseError::invalid(
                path(prefix, "status"),
                format!("unknown status '{other}'"),
            ));
        }
        None => return Err(WebhookParseError::missing(path(prefix, "status"))),
    };

    Ok(StatusUpdate {
        phone_number_id,
        provider_message_id,
        status: status_value,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(value: Value) -> Result<Vec<WebhookEvent>, WebhookParseError> {
        parse_webhook(value.to_string().as_bytes())
    }

    fn message(value: Value) -> InboundMessage {
        match parse(value).unwrap().remove(0) {
            WebhookEvent::Message(m) => m,
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn parses_single_text_message() {
        let m = message(json!({
            "phone_number_id": "pn-1",
            "message": {
                "id": "wamid.1",
                "type": "text",
                "from": "5511999999999",
                "text": { "body": "9" },
                "kapso": { "direction": "inbound" }
            }
        }));

        assert_eq!(m.phone_number_id, "pn-1");
        assert_eq!(m.customer_phone, "5511999999999");
        assert_eq!(m.content, "9");
        assert_eq!(m.direction, Direction::Inbound);
        assert_eq!(m.message_type, "text");
        assert_eq!(m.idempotency_key(), "kapso:wamid.1");
    }

    #[test]
    fn content_falls_back_through_interactive_shapes() {
        let m = message(json!({
            "phone_number_id": "pn-1",
            "message": {
                "id": "wamid.2",
                "type": "interactive",
                "conversation": { "phone_number": "+5511999999999" },
                "interactive": { "nfm_reply": { "response_json": "{\"score\":10}" } },
                "kapso": { "direction": "inbound" }
            }
        }));
        assert_eq!(m.customer_phone, "+5511999999999");
        assert_eq!(m.content, "{\"score\":10}");

        let m = message(json!({
            "phone_number_id": "pn-1",
            "message": {
                "id": "wamid.3",
                "type": "interactive",
                "from": "5511999999999",
                "interactive": { "button_reply": { "title": "Yes" } },
                "kapso": { "direction": "inbound" }
            }
        }));
        assert_eq!(m.content, "Yes");
    }

    #[test]
    fn parses_batches_in_order() {
        let events = parse(json!({
            "data": [
                {
                    "phone_number_id": "pn-1",
                    "message": {
                        "id": "a", "type": "text", "from": "1",
                        "kapso": { "direction": "inbound", "content": "hi" }
                    }
                },
                {
                    "phone_number_id": "pn-1",
                    "status": { "id": "wamid.out", "status": "delivered" }
                }
            ]
        }))
        .unwrap();

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], WebhookEvent::Message(m) if m.content == "hi"));
        assert!(matches!(
            &events[1],
            WebhookEvent::Status(s) if s.status == ProviderStatus::Delivered
                && s.idempotency_key() == "kapso:status:wamid.out:delivered"
        ));
    }

    #[test]
    fn failed_status_carries_error_and_retryability() {
        let events = parse(json!({
            "phone_number_id": "pn-1",
            "status": {
                "id": "wamid.out",
                "status": "failed",
                "error": { "code": 131047, "title": "Re-engagement message", "retryable": true }
            }
        }))
        .unwrap();

        assert_eq!(
            events[0],
            WebhookEvent::Status(StatusUpdate {
                phone_number_id: "pn-1".to_string(),
                provider_message_id: "wamid.out".to_string(),
                status: ProviderStatus::Failed {
                    error: "131047: Re-engagement message".to_string(),
                    retryable: true,
                },
            })
        );
    }

    #[test]
    fn missing_required_fields_are_reported_with_path() {
        assert_eq!(
            parse(json!({ "message": {} })).unwrap_err(),
            WebhookParseError::MissingField("phone_number_id".to_string())
        );
        assert_eq!(
            parse(json!({
                "data": [{ "phone_number_id": "pn-1", "message": { "type": "text" } }]
            }))
            .unwrap_err(),
            WebhookParseError::MissingField("data[0].message.id".to_string())
        );
        assert_eq!(
            parse(json!({
                "phone_number_id": "pn-1",
                "message": { "id": "x", "type": "text", "from": "1" }
            }))
            .unwrap_err(),
            WebhookParseError::MissingField("message.kapso.direction".to_string())
        );
    }

    #[test]
    fn rejects_non_json_and_wrong_shapes() {
        assert!(matches!(
            parse_webhook(b"not json"),
            Err(WebhookParseError::InvalidJson(_))
        ));
        assert!(matches!(
            parse(json!([1, 2])),
            Err(WebhookParseError::InvalidField { .. })
        ));
        assert!(matches!(
            parse(json!({ "data": {} })),
            Err(WebhookParseError::InvalidField { .. })
        ));
    }
}
