//! Infrastructure layer: job queue, delivery persistence, webhook ingestion,
//! messaging providers and the handlers that tie them together.

pub mod deliveries;
pub mod directory;
pub mod handlers;
pub mod jobs;
pub mod messaging;
pub mod rate_limit;
pub mod webhooks;


/// Apply the embedded schema migrations (jobs, deliveries, responses).
pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
