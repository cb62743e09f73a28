use axum::{
    routing::{get, post},
    Router,
};

pub mod deliveries;
pub mod surveys;
pub mod system;
pub mod webhooks;

/// Router for all authenticated (tenant-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/surveys", surveys::router())
        .nest("/deliveries", deliveries::router())
}

/// Unauthenticated endpoints; webhooks authenticate by signature.
pub fn public_router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/webhooks/kapso", post(webhooks::receive_kapso))
}
