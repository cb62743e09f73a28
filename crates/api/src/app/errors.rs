use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use surveyline_infra::deliveries::DeliveryStoreError;

use super::services::SendSurveyError;

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn send_error_to_response(err: SendSurveyError) -> axum::response::Response {
    match err {
        SendSurveyError::InvalidPhone(msg) => json_error(StatusCode::BAD_REQUEST, "INVALID_PHONE", msg),
        SendSurveyError::SurveyNotFound => {
            json_error(StatusCode::NOT_FOUND, "SURVEY_NOT_FOUND", "survey not found")
        }
        SendSurveyError::SurveyInactive => {
            json_error(StatusCode::BAD_REQUEST, "SURVEY_INACTIVE", "survey is not active")
        }
        SendSurveyError::Directory(e) => {
            tracing::error!(error = %e, "survey lookup failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", "survey directory unavailable")
        }
        SendSurveyError::Internal(msg) => {
            tracing::error!(error = %msg, "survey send failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "internal error")
        }
    }
}

pub fn store_error_to_response(err: DeliveryStoreError) -> axum::response::Response {
    match err {
        DeliveryStoreError::NotFound(_) => {
            json_error(StatusCode::NOT_FOUND, "DELIVERY_NOT_FOUND", "delivery not found")
        }
        other => {
            tracing::error!(error = %other, "delivery store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "internal error")
        }
    }
}
