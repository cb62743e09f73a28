use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use uuid::Uuid;

use surveyline_core::DeliveryId;

use crate::app::errors::{json_error, store_error_to_response};
use crate::app::{dto, services::AppServices};
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new().route("/:id", get(get_delivery))
}

pub async fn get_delivery(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(id) = Uuid::parse_str(&id).map(DeliveryId::from_uuid) else {
        return not_found();
    };

    let delivery = match services.deliveries.get(tenant.tenant_id(), id).await {
        Ok(Some(delivery)) => delivery,
        Ok(None) => return not_found(),
        Err(e) => return store_error_to_response(e),
    };

    let responses = match services.deliveries.responses_for(tenant.tenant_id(), id).await {
        Ok(responses) => responses,
        Err(e) => return store_error_to_response(e),
    };

    let mut body = dto::delivery_to_json(&delivery);
    body["responses"] = responses
        .iter()
        .map(|r| {
            serde_json::json!({
                "id": r.id.to_string(),
                "provider_message_id": r.provider_message_id,
                "content": r.content,
                "received_at": r.received_at,
            })
        })
        .collect();

    (StatusCode::OK, Json(body)).into_response()
}

fn not_found() -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "DELIVERY_NOT_FOUND", "delivery not found")
}
