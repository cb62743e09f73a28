use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};

use surveyline_infra::webhooks::{parse_webhook, WebhookStatus, SIGNATURE_HEADER};

use crate::app::errors::json_error;
use crate::app::services::AppServices;

/// Provider callback: verify, parse, enqueue.
///
/// The signature is checked against the raw body before anything is parsed.
pub async fn receive_kapso(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if let Err(e) = services.verifier.verify(&body, signature) {
        tracing::warn!(error = %e, "webhook rejected: bad signature");
        return json_error(StatusCode::UNAUTHORIZED, "INVALID_SIGNATURE", e.to_string());
    }

    let events = match parse_webhook(&body) {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!(error = %e, "webhook rejected: malformed payload");
            return json_error(StatusCode::BAD_REQUEST, "INVALID_PAYLOAD", e.to_string());
        }
    };

    let report = match services.ingestor.ingest(events).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, "webhook ingestion failed");
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                "failed to record webhook",
            );
        }
    };

    let status = report.status();
    let code = match status {
        WebhookStatus::Accepted => StatusCode::ACCEPTED,
        WebhookStatus::Duplicate | WebhookStatus::Ignored => StatusCode::OK,
    };

    (
        code,
        Json(serde_json::json!({
            "status": status.as_str(),
            "results": report.results,
        })),
    )
        .into_response()
}
