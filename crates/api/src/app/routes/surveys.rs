use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use uuid::Uuid;

use surveyline_core::SurveyId;

use crate::app::errors::{json_error, send_error_to_response};
use crate::app::{dto, services::AppServices};
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new().route("/:survey_id/send", post(send_survey))
}

pub async fn send_survey(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(survey_id): Path<String>,
    body: Result<Json<dto::SendSurveyRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "INVALID_REQUEST", e.body_text()),
    };

    let Ok(survey_id) = Uuid::parse_str(&survey_id).map(SurveyId::from_uuid) else {
        return json_error(StatusCode::NOT_FOUND, "SURVEY_NOT_FOUND", "survey not found");
    };

    match services.send_survey(tenant.tenant_id(), survey_id, body).await {
        Ok(delivery) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "delivery_id": delivery.id.to_string(),
                "status": delivery.status.as_str(),
            })),
        )
            .into_response(),
        Err(e) => send_error_to_response(e),
    }
}
