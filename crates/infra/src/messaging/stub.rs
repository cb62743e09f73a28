//! Scripted provider for dev mode and tests.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::{MessagingProvider, OutboundMessage, ProviderError, SendReceipt};

/// Returns queued outcomes in order, then succeeds with generated ids.
#[derive(Debug, Default)]
pub struct StubMessagingProvider {
    script: Mutex<VecDeque<Result<SendReceipt, ProviderError>>>,
    sent: Mutex<Vec<OutboundMessage>>,
}

impl StubMessagingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next unscripted send.
    pub fn push_outcome(&self, outcome: Result<SendReceipt, ProviderError>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
    }

    pub fn push_error(&self, error: ProviderError) {
        self.push_outcome(Err(error));
    }

    /// Every message passed to `send`, including failed ones.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MessagingProvider for StubMessagingProvider {
    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, ProviderError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match scripted {
            Some(outcome) => outcome,
            None => {
                let id = format!("stub.{}", Uuid::now_v7());
                info!(to = %message.to, provider_delivery_id = %id, "stub provider accepted message");
                Ok(SendReceipt {
                    provider_delivery_id: id,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutboundMessage {
        OutboundMessage {
            to: "+5511999999999".to_string(),
            body: "hello".to_string(),
            flow_id: None,
        }
    }

    #[tokio::test]
    async fn scripted_outcomes_come_first() {
        let stub = StubMessagingProvider::new();
        stub.push_error(ProviderError::retryable("timeout", "slow"));

        assert!(stub.send(&message()).await.unwrap_err().retryable);
        assert!(stub.send(&message()).await.unwrap().provider_delivery_id.starts_with("stub."));
        assert_eq!(stub.sent().len(), 2);
    }
}
