use std::sync::Arc;

use anyhow::Context;

use surveyline_api::app::{self, AppServices, services::RATE_LIMIT_SWEEP_INTERVAL};
use surveyline_api::config::ApiConfig;
use surveyline_infra::jobs::JobProcessorConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    surveyline_observability::init();

    let config = ApiConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(
        AppServices::from_config(&config)
            .await
            .context("failed to initialize services")?,
    );

    let processor = services.processor().spawn(
        JobProcessorConfig::default()
            .with_name("surveyline-api")
            .with_poll_interval(config.job_poll_interval)
            .with_stale_after(config.job_stale_after),
    );
    let sweeper = services.rate_limiter.spawn_sweeper(RATE_LIMIT_SWEEP_INTERVAL);

    let app = app::build_app(services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shutting down job processor");
    sweeper.abort();
    let stats = processor.stop().await;
    tracing::info!(
        processed = stats.processed,
        succeeded = stats.succeeded,
        retried = stats.retried,
        dead_lettered = stats.dead_lettered,
        "job processor stopped"
    );

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
