//! Postgres-backed delivery store.
//!
//! Response deduplication relies on the `survey_responses_message_unique`
//! constraint; a unique violation (`23505`) on insert surfaces as
//! `DuplicateResponse`.
//!
//! `update` is a compare-and-set on `status`: the row is only written while it
//! still holds the status the caller read.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

use surveyline_core::{DeliveryId, ResponseId, SurveyId, TenantId};
use surveyline_delivery::{Delivery, DeliveryStatus, SurveyResponse};

use super::store::{DeliveryStore, DeliveryStoreError};

const DELIVERY_COLUMNS: &str = "id, tenant_id, survey_id, recipient_address, recipient_address_hash, \
     status, retry_count, max_retries, provider_delivery_id, error_message, metadata, \
     created_at, updated_at, delivered_at, responded_at";

const RESPONSE_COLUMNS: &str =
    "id, tenant_id, delivery_id, survey_id, provider_message_id, content, metadata, received_at";

/// Postgres delivery store.
#[derive(Debug, Clone)]
pub struct PostgresDeliveryStore {
    pool: Arc<PgPool>,
}

impl PostgresDeliveryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl DeliveryStore for PostgresDeliveryStore {
    #[instrument(skip(self, delivery), fields(delivery_id = %delivery.id), err)]
    async fn insert(&self, delivery: &Delivery) -> Result<(), DeliveryStoreError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO deliveries ({DELIVERY_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#
        ))
        .bind(delivery.id.as_uuid())
        .bind(delivery.tenant_id.as_uuid())
        .bind(delivery.survey_id.as_uuid())
        .bind(&delivery.recipient_address)
        .bind(&delivery.recipient_address_hash)
        .bind(delivery.status.as_str())
        .bind(delivery.retry_count as i32)
        .bind(delivery.max_retries as i32)
        .bind(delivery.provider_delivery_id.as_deref())
        .bind(delivery.error_message.as_deref())
        .bind(Json(&delivery.metadata))
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .bind(delivery.delivered_at)
        .bind(delivery.responded_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if unique_violation(&e) {
                DeliveryStoreError::AlreadyExists(delivery.id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(delivery_id = %id), err)]
    async fn get(
        &self,
        tenant_id: TenantId,
        id: DeliveryId,
    ) -> Result<Option<Delivery>, DeliveryStoreError> {
        let row: Option<DeliveryRow> = sqlx::query_as(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(Delivery::try_from).transpose()
    }

    #[instrument(skip(self, delivery), fields(delivery_id = %delivery.id), err)]
    async fn update(
        &self,
        delivery: &Delivery,
        expected: DeliveryStatus,
    ) -> Result<(), DeliveryStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE deliveries
            SET status = $3,
                retry_count = $4,
                max_retries = $5,
                provider_delivery_id = $6,
                error_message = $7,
                metadata = $8,
                updated_at = $9,
                delivered_at = $10,
                responded_at = $11
            WHERE tenant_id = $1 AND id = $2 AND status = $12
            "#,
        )
        .bind(delivery.tenant_id.as_uuid())
        .bind(delivery.id.as_uuid())
        .bind(delivery.status.as_str())
        .bind(delivery.retry_count as i32)
        .bind(delivery.max_retries as i32)
        .bind(delivery.provider_delivery_id.as_deref())
        .bind(delivery.error_message.as_deref())
        .bind(Json(&delivery.metadata))
        .bind(delivery.updated_at)
        .bind(delivery.delivered_at)
        .bind(delivery.responded_at)
        .bind(expected.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let current: Option<String> = sqlx::query_scalar(
            "SELECT status FROM deliveries WHERE tenant_id = $1 AND id = $2",
        )
        .bind(delivery.tenant_id.as_uuid())
        .bind(delivery.id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        match current {
            None => Err(DeliveryStoreError::NotFound(delivery.id)),
            Some(status) => Err(DeliveryStoreError::Conflict {
                id: delivery.id,
                expected,
                actual: status
                    .parse()
                    .map_err(|e| DeliveryStoreError::Corrupt(format!("status: {e}")))?,
            }),
        }
    }

    #[instrument(skip(self, recipient_hash), err)]
    async fn find_latest_open_by_recipient(
        &self,
        tenant_id: TenantId,
        recipient_hash: &str,
    ) -> Result<Option<Delivery>, DeliveryStoreError> {
        let row: Option<DeliveryRow> = sqlx::query_as(&format!(
            r#"
            SELECT {DELIVERY_COLUMNS} FROM deliveries
            WHERE tenant_id = $1
              AND recipient_address_hash = $2
              AND status IN ('sent', 'delivered')
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(recipient_hash)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_latest_open_by_recipient", e))?;

        row.map(Delivery::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_by_provider_id(
        &self,
        tenant_id: TenantId,
        provider_delivery_id: &str,
    ) -> Result<Option<Delivery>, DeliveryStoreError> {
        let row: Option<DeliveryRow> = sqlx::query_as(&format!(
            r#"
            SELECT {DELIVERY_COLUMNS} FROM deliveries
            WHERE tenant_id = $1 AND provider_delivery_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(provider_delivery_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_provider_id", e))?;

        row.map(Delivery::try_from).transpose()
    }

    #[instrument(skip(self, response), fields(delivery_id = %response.delivery_id), err)]
    async fn insert_response(&self, response: &SurveyResponse) -> Result<(), DeliveryStoreError> {
        sqlx::query(&format!(
            "INSERT INTO survey_responses ({RESPONSE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(response.id.as_uuid())
        .bind(response.tenant_id.as_uuid())
        .bind(response.delivery_id.as_uuid())
        .bind(response.survey_id.as_uuid())
        .bind(&response.provider_message_id)
        .bind(&response.content)
        .bind(Json(&response.metadata))
        .bind(response.received_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if unique_violation(&e) {
                DeliveryStoreError::DuplicateResponse(response.provider_message_id.clone())
            } else {
                map_sqlx_error("insert_response", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(delivery_id = %delivery_id), err)]
    async fn responses_for(
        &self,
        tenant_id: TenantId,
        delivery_id: DeliveryId,
    ) -> Result<Vec<SurveyResponse>, DeliveryStoreError> {
        let rows: Vec<ResponseRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RESPONSE_COLUMNS} FROM survey_responses
            WHERE tenant_id = $1 AND delivery_id = $2
            ORDER BY received_at ASC
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(delivery_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("responses_for", e))?;

        Ok(rows.into_iter().map(SurveyResponse::from).collect())
    }
}

#[derive(Debug, FromRow)]
struct DeliveryRow {
    id: Uuid,
    tenant_id: Uuid,
    survey_id: Uuid,
    recipient_address: String,
    recipient_address_hash: String,
    status: String,
    retry_count: i32,
    max_retries: i32,
    provider_delivery_id: Option<String>,
    error_message: Option<String>,
    metadata: Json<BTreeMap<String, serde_json::Value>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
    responded_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeliveryRow> for Delivery {
    type Error = DeliveryStoreError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let status: DeliveryStatus = row
            .status
            .parse()
            .map_err(|_| DeliveryStoreError::Corrupt(format!("unknown status '{}'", row.status)))?;

        Ok(Delivery {
            id: DeliveryId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            survey_id: SurveyId::from_uuid(row.survey_id),
            recipient_address: row.recipient_address,
            recipient_address_hash: row.recipient_address_hash,
            status,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            provider_delivery_id: row.provider_delivery_id,
            error_message: row.error_message,
            metadata: row.metadata.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
            delivered_at: row.delivered_at,
            responded_at: row.responded_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ResponseRow {
    id: Uuid,
    tenant_id: Uuid,
    delivery_id: Uuid,
    survey_id: Uuid,
    provider_message_id: String,
    content: String,
    metadata: Json<BTreeMap<String, serde_json::Value>>,
    received_at: DateTime<Utc>,
}

impl From<ResponseRow> for SurveyResponse {
    fn from(row: ResponseRow) -> Self {
        SurveyResponse {
            id: ResponseId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            delivery_id: DeliveryId::from_uuid(row.delivery_id),
            survey_id: SurveyId::from_uuid(row.survey_id),
            provider_message_id: row.provider_message_id,
            content: row.content,
            metadata: row.metadata.0,
            received_at: row.received_at,
        }
    }
}

fn unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DeliveryStoreError {
    match err {
        sqlx::Error::Database(db_err) => DeliveryStoreError::Storage(format!(
            "database error in {operation} ({}): {}",
            db_err.code().as_deref().unwrap_or("unknown"),
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            DeliveryStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            DeliveryStoreError::Corrupt(format!("decode error in {operation}: {err}"))
        }
        _ => DeliveryStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
