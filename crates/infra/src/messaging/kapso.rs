//! Kapso (WhatsApp) HTTP client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{MessagingProvider, OutboundMessage, ProviderError, SendReceipt};

/// Connection settings for [`KapsoClient`].
#[derive(Debug, Clone)]
pub struct KapsoConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

/// Messaging provider backed by the Kapso REST API.
#[derive(Debug, Clone)]
pub struct KapsoClient {
    http_client: Arc<HttpClient>,
    base_url: String,
    api_key: String,
}

impl KapsoClient {
    pub fn new(config: KapsoConfig) -> Result<Self, ProviderError> {
        let http_client = HttpClient::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::permanent("client_init", e.to_string()))?;

        Ok(Self {
            http_client: Arc::new(http_client),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    to: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<TextBody<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interactive: Option<FlowBody<'a>>,
}

#[derive(Debug, Serialize)]
struct TextBody<'a> {
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct FlowBody<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    body: TextBody<'a>,
    flow_id: &'a str,
}

impl<'a> SendRequest<'a> {
    fn from_message(message: &'a OutboundMessage) -> Self {
        match message.flow_id.as_deref() {
            Some(flow_id) => Self {
                to: &message.to,
                kind: "interactive",
                text: None,
                interactive: Some(FlowBody {
                    kind: "flow",
                    body: TextBody {
                        body: &message.body,
                    },
                    flow_id,
                }),
            },
            None => Self {
                to: &message.to,
                kind: "text",
                text: Some(TextBody {
                    body: &message.body,
                }),
                interactive: None,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

/// Classify a non-2xx response. 408, 429 and 5xx are transient; other 4xx are not.
fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|e| e.error.code.as_ref())
        .map(|c| match c {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| format!("http_{}", status.as_u16()));
    let message = parsed
        .and_then(|e| e.error.message)
        .unwrap_or_else(|| format!("HTTP {status}"));

    let retryable = status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error();

    ProviderError {
        code,
        message,
        retryable,
    }
}

fn classify_transport(err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::retryable("timeout", err.to_string())
    } else if err.is_connect() || err.is_request() {
        ProviderError::retryable("connection", err.to_string())
    } else {
        ProviderError::retryable("transport", err.to_string())
    }
}

#[async_trait]
impl MessagingProvider for KapsoClient {
    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, ProviderError> {
        let url = format!("{}/messages", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&SendRequest::from_message(message))
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = classify_status(status, &body);
            warn!(
                status = status.as_u16(),
                code = %err.code,
                retryable = err.retryable,
                "kapso rejected message"
            );
            return Err(err);
        }

        let parsed: SendResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::retryable("invalid_response", e.to_string()))?;

        let id = parsed
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| {
                ProviderError::retryable("invalid_response", "response carried no message id")
            })?;

        debug!(provider_delivery_id = %id, "kapso accepted message");
        Ok(SendReceipt {
            provider_delivery_id: id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR, "").retryable);
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").retryable);
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").retryable);
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "").retryable);
    }

    #[test]
    fn client_errors_are_permanent_and_keep_provider_code() {
        let body = r#"{"error":{"code":131026,"message":"Message undeliverable"}}"#;
        let err = classify_status(StatusCode::BAD_REQUEST, body);
        assert!(!err.retryable);
        assert_eq!(err.code, "131026");
        assert_eq!(err.message, "Message undeliverable");

        let err = classify_status(StatusCode::UNPROCESSABLE_ENTITY, "not json");
        assert!(!err.retryable);
        assert_eq!(err.code, "http_422");
    }

    #[test]
    fn flow_messages_use_interactive_shape() {
        let message = OutboundMessage {
            to: "+5511999999999".to_string(),
            body: "Rate us".to_string(),
            flow_id: Some("flow-1".to_string()),
        };
        let json = serde_json::to_value(SendRequest::from_message(&message)).unwrap();
        assert_eq!(json["type"], "interactive");
        assert_eq!(json["interactive"]["flow_id"], "flow-1");
        assert!(json.get("text").is_none());

        let plain = OutboundMessage {
            flow_id: None,
            ..message
        };
        let json = serde_json::to_value(SendRequest::from_message(&plain)).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"]["body"], "Rate us");
    }
}
