//! Delivery persistence contract and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use surveyline_core::{DeliveryId, TenantId};
use surveyline_delivery::{Delivery, DeliveryStatus, SurveyResponse};

/// Delivery store errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryStoreError {
    #[error("delivery not found: {0}")]
    NotFound(DeliveryId),

    #[error("delivery already exists: {0}")]
    AlreadyExists(DeliveryId),

    /// The stored status no longer matches the one the caller read.
    #[error("delivery {id} changed concurrently: expected {expected}, found {actual}")]
    Conflict {
        id: DeliveryId,
        expected: DeliveryStatus,
        actual: DeliveryStatus,
    },

    #[error("response for provider message '{0}' already recorded")]
    DuplicateResponse(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Persistence for deliveries and the responses matched to them.
///
/// Every read is tenant-scoped; a delivery of another tenant is reported as
/// absent.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn insert(&self, delivery: &Delivery) -> Result<(), DeliveryStoreError>;

    async fn get(
        &self,
        tenant_id: TenantId,
        id: DeliveryId,
    ) -> Result<Option<Delivery>, DeliveryStoreError>;

    /// Overwrite the mutable fields of an existing delivery, provided its
    /// stored status is still `expected` (the status it had when it was read).
    /// Otherwise nothing is written and `Conflict` is returned.
    async fn update(
        &self,
        delivery: &Delivery,
        expected: DeliveryStatus,
    ) -> Result<(), DeliveryStoreError>;

    /// Most recent delivery to `recipient_hash` still awaiting a reply
    /// (`sent` or `delivered`).
    async fn find_latest_open_by_recipient(
        &self,
        tenant_id: TenantId,
        recipient_hash: &str,
    ) -> Result<Option<Delivery>, DeliveryStoreError>;

    async fn find_by_provider_id(
        &self,
        tenant_id: TenantId,
        provider_delivery_id: &str,
    ) -> Result<Option<Delivery>, DeliveryStoreError>;

    /// Record a response. A second response with the same provider message id
    /// is rejected with `DuplicateResponse`.
    async fn insert_response(&self, response: &SurveyResponse) -> Result<(), DeliveryStoreError>;

    async fn responses_for(
        &self,
        tenant_id: TenantId,
        delivery_id: DeliveryId,
    ) -> Result<Vec<SurveyResponse>, DeliveryStoreError>;
}

#[async_trait]
impl<T: DeliveryStore + ?Sized> DeliveryStore for Arc<T> {
    async fn insert(&self, delivery: &Delivery) -> Result<(), DeliveryStoreError> {
        (**self).insert(delivery).await
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        id: DeliveryId,
    ) -> Result<Option<Delivery>, DeliveryStoreError> {
        (**self).get(tenant_id, id).await
    }

    async fn update(
        &self,
        delivery: &Delivery,
        expected: DeliveryStatus,
    ) -> Result<(), DeliveryStoreError> {
        (**self).update(delivery, expected).await
    }

    async fn find_latest_open_by_recipient(
        &self,
        tenant_id: TenantId,
        recipient_hash: &str,
    ) -> Result<Option<Delivery>, DeliveryStoreError> {
        (**self)
            .find_latest_open_by_recipient(tenant_id, recipient_hash)
            .await
    }

    async fn find_by_provider_id(
        &self,
        tenant_id: TenantId,
        provider_delivery_id: &str,
    ) -> Result<Option<Delivery>, DeliveryStoreError> {
        (**self)
            .find_by_provider_id(tenant_id, provider_delivery_id)
            .await
    }

    async fn insert_response(&self, response: &SurveyResponse) -> Result<(), DeliveryStoreError> {
        (**self).insert_response(response).await
    }

    async fn responses_for(
        &self,
        tenant_id: TenantId,
        delivery_id: DeliveryId,
    ) -> Result<Vec<SurveyResponse>, DeliveryStoreError> {
        (**self).responses_for(tenant_id, delivery_id).await
    }
}

#[derive(Debug, Default)]
struct Inner {
    deliveries: HashMap<DeliveryId, Delivery>,
    responses: Vec<SurveyResponse>,
}

/// In-memory delivery store for dev mode and tests.
#[derive(Debug, Default)]
pub struct InMemoryDeliveryStore {
    inner: Mutex<Inner>,
}

impl InMemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_open(status: DeliveryStatus) -> bool {
    matches!(status, DeliveryStatus::Sent | DeliveryStatus::Delivered)
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn insert(&self, delivery: &Delivery) -> Result<(), DeliveryStoreError> {
        let mut inner = self.lock();
        if inner.deliveries.contains_key(&delivery.id) {
            return Err(DeliveryStoreError::AlreadyExists(delivery.id));
        }
        inner.deliveries.insert(delivery.id, delivery.clone());
        debug!(delivery_id = %delivery.id, tenant_id = %delivery.tenant_id, "delivery inserted");
        Ok(())
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        id: DeliveryId,
    ) -> Result<Option<Delivery>, DeliveryStoreError> {
        Ok(self
            .lock()
            .deliveries
            .get(&id)
            .filter(|d| d.tenant_id == tenant_id)
            .cloned())
    }

    async fn update(
        &self,
        delivery: &Delivery,
        expected: DeliveryStatus,
    ) -> Result<(), DeliveryStoreError> {
        let mut inner = self.lock();
        match inner.deliveries.get_mut(&delivery.id) {
            Some(existing) if existing.tenant_id == delivery.tenant_id => {
                if existing.status != expected {
                    return Err(DeliveryStoreError::Conflict {
                        id: delivery.id,
                        expected,
                        actual: existing.status,
                    });
                }
                *existing = delivery.clone();
                Ok(())
            }
            _ => Err(DeliveryStoreError::NotFound(delivery.id)),
        }
    }

    async fn find_latest_open_by_recipient(
        &self,
        tenant_id: TenantId,
        recipient_hash: &str,
    ) -> Result<Option<Delivery>, DeliveryStoreError> {
        Ok(self
            .lock()
            .deliveries
            .values()
            .filter(|d| {
                d.tenant_id == tenant_id
                    && d.recipient_address_hash == recipient_hash
                    && is_open(d.status)
            })
            .max_by_key(|d| (d.created_at, *d.id.as_uuid()))
            .cloned())
    }

    async fn find_by_provider_id(
        &self,
        tenant_id: TenantId,
        provider_delivery_id: &str,
    ) -> Result<Option<Delivery>, DeliveryStoreError> {
        Ok(self
            .lock()
            .deliveries
            .values()
            .find(|d| {
                d.tenant_id == tenant_id
                    && d.provider_delivery_id.as_deref() == Some(provider_delivery_id)
            })
            .cloned())
    }

    async fn insert_response(&self, response: &SurveyResponse) -> Result<(), DeliveryStoreError> {
        let mut inner = self.lock();
        if inner
            .responses
            .iter()
            .any(|r| r.provider_message_id == response.provider_message_id)
        {
            return Err(DeliveryStoreError::DuplicateResponse(
                response.provider_message_id.clone(),
            ));
        }
        inner.responses.push(response.clone());
        Ok(())
    }

    async fn responses_for(
        &self,
        tenant_id: TenantId,
        delivery_id: DeliveryId,
    ) -> Result<Vec<SurveyResponse>, DeliveryStoreError> {
        Ok(self
            .lock()
            .responses
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.delivery_id == delivery_id)
            .cloned()
            .collect())
    }
}

/// Serves one outdated snapshot from the next lookup, as if another writer
/// moved the delivery between a handler's read and its write.
#[cfg(test)]
pub(crate) struct StaleReads {
    inner: Arc<InMemoryDeliveryStore>,
    stale: Mutex<Option<Delivery>>,
}

#[cfg(test)]
impl StaleReads {
    pub fn new(inner: Arc<InMemoryDeliveryStore>, stale: Delivery) -> Self {
        Self {
            inner,
            stale: Mutex::new(Some(stale)),
        }
    }

    fn take_stale(&self) -> Option<Delivery> {
        self.stale.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[cfg(test)]
#[async_trait]
impl DeliveryStore for StaleReads {
    async fn insert(&self, delivery: &Delivery) -> Result<(), DeliveryStoreError> {
        self.inner.insert(delivery).await
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        id: DeliveryId,
    ) -> Result<Option<Delivery>, DeliveryStoreError> {
        self.inner.get(tenant_id, id).await
    }

    async fn update(
        &self,
        delivery: &Delivery,
        expected: DeliveryStatus,
    ) -> Result<(), DeliveryStoreError> {
        self.inner.update(delivery, expected).await
    }

    async fn find_latest_open_by_recipient(
        &self,
        tenant_id: TenantId,
        recipient_hash: &str,
    ) -> Result<Option<Delivery>, DeliveryStoreError> {
        match self.take_stale() {
            Some(stale) => Ok(Some(stale)),
            None => {
                self.inner
                    .find_latest_open_by_recipient(tenant_id, recipient_hash)
                    .await
            }
        }
    }

    async fn find_by_provider_id(
        &self,
        tenant_id: TenantId,
        provider_delivery_id: &str,
    ) -> Result<Option<Delivery>, DeliveryStoreError> {
        match self.take_stale() {
            Some(stale) => Ok(Some(stale)),
            None => {
                self.inner
                    .find_by_provider_id(tenant_id, provider_delivery_id)
                    .await
            }
        }
    }

    async fn insert_response(&self, response: &SurveyResponse) -> Result<(), DeliveryStoreError> {
        self.inner.insert_response(response).await
    }

    async fn responses_for(
        &self,
        tenant_id: TenantId,
        delivery_id: DeliveryId,
    ) -> Result<Vec<SurveyResponse>, DeliveryStoreError> {
        self.inner.responses_for(tenant_id, delivery_id).await
    }
}
