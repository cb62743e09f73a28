//! Service wiring: stores, directories, provider, webhook ingestion and the
//! survey-send use case.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use surveyline_core::{Clock, SurveyId, SystemClock, TenantId};
use surveyline_delivery::{Delivery, DeliveryStatus, NewDelivery, PhoneNumber};
use surveyline_infra::deliveries::{DeliveryStore, InMemoryDeliveryStore, PostgresDeliveryStore};
use surveyline_infra::directory::{
    ApiKeyDirectory, ConnectionDirectory, DirectoryError, InMemoryDirectory, SurveyDirectory,
    SurveySummary,
};
use surveyline_infra::handlers::{self, SURVEY_SEND, SurveySendPayload};
use surveyline_infra::jobs::{
    HandlerRegistry, InMemoryJobStore, JobProcessor, JobSource, JobStore, NewJob, PostgresJobStore,
};
use surveyline_infra::messaging::{
    KapsoClient, KapsoConfig, MessagingProvider, ProviderError, StubMessagingProvider,
};
use surveyline_infra::rate_limit::RateLimiter;
use surveyline_infra::webhooks::{SignatureVerifier, WebhookIngestor};

use crate::app::dto::SendSurveyRequest;
use crate::config::ApiConfig;

/// API key of the tenant seeded in dev mode.
pub const DEV_API_KEY: &str = "dev-api-key";
/// Provider phone-number id routed to the dev tenant.
pub const DEV_PHONE_NUMBER_ID: &str = "dev-phone-number-id";
/// How often expired rate-limit windows are swept.
pub const RATE_LIMIT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migrations failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("messaging provider setup failed: {0}")]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Error)]
pub enum SendSurveyError {
    #[error("{0}")]
    InvalidPhone(String),
    #[error("survey not found")]
    SurveyNotFound,
    #[error("survey is not active")]
    SurveyInactive,
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("{0}")]
    Internal(String),
}

/// Everything the services depend on but do not own.
#[derive(Clone)]
pub struct Collaborators {
    pub jobs: Arc<dyn JobStore>,
    pub deliveries: Arc<dyn DeliveryStore>,
    pub connections: Arc<dyn ConnectionDirectory>,
    pub surveys: Arc<dyn SurveyDirectory>,
    pub api_keys: Arc<dyn ApiKeyDirectory>,
    pub provider: Arc<dyn MessagingProvider>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// In-memory stores over a single directory.
    pub fn in_memory(
        directory: Arc<InMemoryDirectory>,
        provider: Arc<dyn MessagingProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs: Arc::new(InMemoryJobStore::with_clock(clock.clone())),
            deliveries: InMemoryDeliveryStore::arc(),
            connections: directory.clone(),
            surveys: directory.clone(),
            api_keys: directory,
            provider,
            clock,
        }
    }

    /// Postgres when `DATABASE_URL` is set, otherwise in-memory; Kapso when
    /// configured, otherwise the stub provider.
    pub async fn from_config(config: &ApiConfig) -> Result<Self, BootstrapError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let directory = InMemoryDirectory::arc();
        if config.dev_mode {
            seed_dev_tenant(&directory);
        }

        let provider: Arc<dyn MessagingProvider> = match &config.kapso {
            Some(kapso) => Arc::new(KapsoClient::new(KapsoConfig {
                base_url: kapso.base_url.clone(),
                api_key: kapso.api_key.clone(),
                timeout: config.provider_timeout,
            })?),
            None => {
                tracing::warn!("KAPSO_API_URL not set; using stub messaging provider");
                Arc::new(StubMessagingProvider::new())
            }
        };

        let mut collaborators = Self::in_memory(directory, provider, clock.clone());

        if let Some(url) = &config.database_url {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await?;
            surveyline_infra::migrate(&pool).await?;
            tracing::info!("connected to postgres; migrations applied");

            collaborators.jobs = Arc::new(PostgresJobStore::new(pool.clone()).with_clock(clock));
            collaborators.deliveries = Arc::new(PostgresDeliveryStore::new(pool));
        } else {
            tracing::warn!("DATABASE_URL not set; using in-memory stores");
        }

        Ok(collaborators)
    }
}

fn seed_dev_tenant(directory: &InMemoryDirectory) {
    let tenant_id = TenantId::from_uuid(Uuid::from_u128(1));
    let survey_id = SurveyId::from_uuid(Uuid::from_u128(1));

    directory.add_api_key(DEV_API_KEY, tenant_id);
    directory.add_connection(DEV_PHONE_NUMBER_ID, tenant_id);
    directory.add_survey(
        tenant_id,
        SurveySummary {
            id: survey_id,
            name: "Dev survey".to_string(),
            active: true,
            message: "How likely are you to recommend us? Reply 0-10.".to_string(),
            flow_id: None,
        },
    );

    tracing::info!(
        tenant_id = %tenant_id,
        survey_id = %survey_id,
        api_key = DEV_API_KEY,
        phone_number_id = DEV_PHONE_NUMBER_ID,
        "seeded dev tenant"
    );
}

/// Shared state behind every route.
pub struct AppServices {
    pub jobs: Arc<dyn JobStore>,
    pub deliveries: Arc<dyn DeliveryStore>,
    pub surveys: Arc<dyn SurveyDirectory>,
    pub api_keys: Arc<dyn ApiKeyDirectory>,
    pub ingestor: WebhookIngestor,
    pub verifier: SignatureVerifier,
    pub rate_limiter: Arc<RateLimiter>,
    pub handlers: HandlerRegistry,
    pub clock: Arc<dyn Clock>,
}

impl AppServices {
    pub fn new(
        collaborators: Collaborators,
        webhook_secret: &str,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        let Collaborators {
            jobs,
            deliveries,
            connections,
            surveys,
            api_keys,
            provider,
            clock,
        } = collaborators;

        let handlers = handlers::default_registry(
            jobs.clone(),
            deliveries.clone(),
            surveys.clone(),
            provider,
            clock.clone(),
        );
        let ingestor = WebhookIngestor::new(jobs.clone(), connections, handlers.clone());

        Self {
            jobs,
            deliveries,
            surveys,
            api_keys,
            ingestor,
            verifier: SignatureVerifier::new(webhook_secret),
            rate_limiter,
            handlers,
            clock,
        }
    }

    /// Production wiring from configuration.
    pub async fn from_config(config: &ApiConfig) -> Result<Self, BootstrapError> {
        let collaborators = Collaborators::from_config(config).await?;
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_per_window,
            config.rate_limit_window,
            collaborators.clock.clone(),
        ));
        Ok(Self::new(collaborators, &config.webhook_secret, limiter))
    }

    /// A processor over this service's queue and handlers.
    pub fn processor(&self) -> JobProcessor<Arc<dyn JobStore>> {
        JobProcessor::new(self.jobs.clone(), self.handlers.clone())
    }

    /// Validate, record a `queued` delivery and enqueue its send job.
    pub async fn send_survey(
        &self,
        tenant_id: TenantId,
        survey_id: SurveyId,
        request: SendSurveyRequest,
    ) -> Result<Delivery, SendSurveyError> {
        let recipient = PhoneNumber::parse(request.phone.trim())
            .map_err(|e| SendSurveyError::InvalidPhone(e.to_string()))?;

        let survey = self
            .surveys
            .get_survey(tenant_id, survey_id)
            .await?
            .ok_or(SendSurveyError::SurveyNotFound)?;
        if !survey.active {
            return Err(SendSurveyError::SurveyInactive);
        }

        let now = self.clock.now();
        let mut delivery = Delivery::new(
            NewDelivery {
                tenant_id,
                survey_id,
                recipient,
                metadata: request.metadata,
            },
            now,
        );
        self.deliveries
            .insert(&delivery)
            .await
            .map_err(|e| SendSurveyError::Internal(e.to_string()))?;

        delivery
            .mark_queued(now)
            .map_err(|e| SendSurveyError::Internal(e.to_string()))?;
        self.deliveries
            .update(&delivery, DeliveryStatus::Pending)
            .await
            .map_err(|e| SendSurveyError::Internal(e.to_string()))?;

        let payload = serde_json::to_value(SurveySendPayload {
            delivery_id: delivery.id,
        })
        .map_err(|e| SendSurveyError::Internal(e.to_string()))?;
        let job = NewJob::new(
            tenant_id,
            format!("{SURVEY_SEND}:{}", delivery.id),
            JobSource::Internal,
            SURVEY_SEND,
            payload,
        );

        match self.jobs.enqueue(job).await {
            Ok(job_id) => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    delivery_id = %delivery.id,
                    job_id = ?job_id,
                    "survey send queued"
                );
                Ok(delivery)
            }
            Err(e) => {
                self.abandon(&mut delivery, &e.to_string()).await;
                Err(SendSurveyError::Internal(format!("failed to enqueue send job: {e}")))
            }
        }
    }

    /// Best effort: a delivery whose job never made it into the queue is closed.
    async fn abandon(&self, delivery: &mut Delivery, reason: &str) {
        let now = self.clock.now();
        if delivery
            .mark_undeliverable(format!("enqueue failed: {reason}"), now)
            .is_ok()
        {
            if let Err(e) = self.deliveries.update(delivery, DeliveryStatus::Queued).await {
                tracing::error!(delivery_id = %delivery.id, error = %e, "failed to close abandoned delivery");
            }
        }
    }
}
