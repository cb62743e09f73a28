//! Narrow lookups into collaborators this service does not own: messaging
//! connections, survey definitions and API keys.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use surveyline_core::{SurveyId, TenantId};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Routes a provider phone-number id to the tenant that owns the connection.
#[async_trait]
pub trait ConnectionDirectory: Send + Sync {
    async fn tenant_for_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> Result<Option<TenantId>, DirectoryError>;
}

/// What the send path needs to know about a survey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveySummary {
    pub id: SurveyId,
    pub name: String,
    pub active: bool,
    /// Opening message sent to the recipient.
    pub message: String,
    /// Provider flow to attach, when the survey is flow-based.
    pub flow_id: Option<String>,
}

#[async_trait]
pub trait SurveyDirectory: Send + Sync {
    async fn get_survey(
        &self,
        tenant_id: TenantId,
        survey_id: SurveyId,
    ) -> Result<Option<SurveySummary>, DirectoryError>;
}

/// Resolves a bearer API key to its tenant.
#[async_trait]
pub trait ApiKeyDirectory: Send + Sync {
    async fn tenant_for_api_key(&self, api_key: &str) -> Result<Option<TenantId>, DirectoryError>;
}

#[derive(Debug, Default)]
struct Tables {
    connections: HashMap<String, TenantId>,
    surveys: HashMap<(TenantId, SurveyId), SurveySummary>,
    api_keys: HashMap<String, TenantId>,
}

/// In-memory directory for dev mode and tests.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    tables: RwLock<Tables>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn add_connection(&self, phone_number_id: impl Into<String>, tenant_id: TenantId) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .insert(phone_number_id.into(), tenant_id);
    }

    pub fn add_survey(&self, tenant_id: TenantId, survey: SurveySummary) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .surveys
            .insert((tenant_id, survey.id), survey);
    }

    pub fn add_api_key(&self, api_key: impl Into<String>, tenant_id: TenantId) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .api_keys
            .insert(api_key.into(), tenant_id);
    }
}

#[async_trait]
impl ConnectionDirectory for InMemoryDirectory {
    async fn tenant_for_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> Result<Option<TenantId>, DirectoryError> {
        Ok(self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .get(phone_number_id)
            .copied())
    }
}

#[async_trait]
impl SurveyDirectory for InMemoryDirectory {
    async fn get_survey(
        &self,
        tenant_id: TenantId,
        survey_id: SurveyId,
    ) -> Result<Option<SurveySummary>, DirectoryError> {
        Ok(self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .surveys
            .get(&(tenant_id, survey_id))
            .cloned())
    }
}

#[async_trait]
impl ApiKeyDirectory for InMemoryDirectory {
    async fn tenant_for_api_key(&self, api_key: &str) -> Result<Option<TenantId>, DirectoryError> {
        Ok(self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .api_keys
            .get(api_key)
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn surveys_are_tenant_scoped() {
        let dir = InMemoryDirectory::new();
        let tenant = TenantId::new();
        let survey = SurveySummary {
            id: SurveyId::new(),
            name: "NPS".to_string(),
            active: true,
            message: "How likely are you to recommend us?".to_string(),
            flow_id: None,
        };
        dir.add_survey(tenant, survey.clone());

        assert_eq!(dir.get_survey(tenant, survey.id).await.unwrap(), Some(survey.clone()));
        assert_eq!(dir.get_survey(TenantId::new(), survey.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn connections_and_keys_resolve_to_tenants() {
        let dir = InMemoryDirectory::new();
        let tenant = TenantId::new();
        dir.add_connection("pn-1", tenant);
        dir.add_api_key("sk_test", tenant);

        assert_eq!(dir.tenant_for_phone_number_id("pn-1").await.unwrap(), Some(tenant));
        assert_eq!(dir.tenant_for_phone_number_id("pn-2").await.unwrap(), None);
        assert_eq!(dir.tenant_for_api_key("sk_test").await.unwrap(), Some(tenant));
        assert_eq!(dir.tenant_for_api_key("nope").await.unwrap(), None);
    }
}
