use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use surveyline_infra::directory::ApiKeyDirectory;
use surveyline_infra::rate_limit::{RateLimitDecision, RateLimiter};

use crate::app::errors::json_error;
use crate::context::TenantContext;

const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

#[derive(Clone)]
pub struct AuthState {
    pub api_keys: Arc<dyn ApiKeyDirectory>,
}

/// Resolve the bearer API key to a tenant and attach [`TenantContext`].
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(api_key) = extract_bearer(req.headers()) else {
        return unauthorized();
    };

    let tenant_id = match state.api_keys.tenant_for_api_key(api_key).await {
        Ok(Some(tenant_id)) => tenant_id,
        Ok(None) => return unauthorized(),
        Err(e) => {
            tracing::error!(error = %e, "api key lookup failed");
            return json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "UNAVAILABLE",
                "authentication backend unavailable",
            );
        }
    };

    req.extensions_mut().insert(TenantContext::new(tenant_id));
    next.run(req).await
}

fn unauthorized() -> Response {
    json_error(
        StatusCode::UNAUTHORIZED,
        "UNAUTHORIZED",
        "missing or invalid API key",
    )
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(axum::http::header::AUTHORIZATION)?;
    let token = header.to_str().ok()?.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// Per-tenant fixed-window throttling. Must run inside [`auth_middleware`].
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(tenant) = req.extensions().get::<TenantContext>().copied() else {
        return unauthorized();
    };

    let decision = limiter.check(tenant.tenant_id());
    if !decision.allowed {
        let retry_after = decision.retry_after_secs(limiter.clock().now());
        tracing::warn!(
            tenant_id = %tenant.tenant_id(),
            limit = decision.limit,
            retry_after,
            "rate limit exceeded"
        );
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "RATE_LIMITED",
                "message": "rate limit exceeded",
                "retry_after": retry_after,
            })),
        )
            .into_response();
        insert_rate_limit_headers(response.headers_mut(), &decision, 0);
        response
            .headers_mut()
            .insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry_after));
        return response;
    }

    limiter.increment(tenant.tenant_id());
    let remaining = decision.remaining.saturating_sub(1);

    let mut response = next.run(req).await;
    insert_rate_limit_headers(response.headers_mut(), &decision, remaining);
    response
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision, remaining: u32) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(decision.reset_at.timestamp()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer(&headers), None);

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer key-123 "),
        );
        assert_eq!(extract_bearer(&headers), Some("key-123"));

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic abc"),
        );
        assert_eq!(extract_bearer(&headers), None);

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer   "),
        );
        assert_eq!(extract_bearer(&headers), None);
    }
}
