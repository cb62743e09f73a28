//! Outbound messaging provider contract and clients.

pub mod kapso;
pub mod stub;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use kapso::{KapsoClient, KapsoConfig};
pub use stub::StubMessagingProvider;

/// A message to deliver to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// E.164 recipient
    pub to: String,
    pub body: String,
    /// Interactive flow to attach instead of plain text
    pub flow_id: Option<String>,
}

/// Provider acknowledgement of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub provider_delivery_id: String,
}

/// Typed provider failure. `retryable` drives the send handler's decision.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("provider error {code}: {message}")]
pub struct ProviderError {
    /// Machine-readable code
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

#[async_trait]
pub trait MessagingProvider: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, ProviderError>;
}
