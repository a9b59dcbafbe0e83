//! Azure Connector
//!
//! One scope per subscription. Tokens come from Microsoft Entra ID using a
//! client secret or a federated workload identity token.

mod enumerators;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::{AzureConfig, DEFAULT_IGNORE_TAG};
use crate::connectors::{
    oauth, CloudConnector, ConnectorContext, CredentialSpec, ResourceEnumerator, ScanScope, ScopedCredential,
};
use crate::error::ConnectorError;
use crate::retry::RetryPolicy;
use crate::types::ProviderKind;

pub use enumerators::{
    ArmClient, ArmKind, ArmListing, CONTAINER_GROUPS, DNS_ZONES, PUBLIC_IP_ADDRESSES, SQL_SERVERS,
    STORAGE_ACCOUNTS,
};

/// Token audience for Azure Resource Manager
const ARM_SCOPE: &str = "https://management.azure.com/.default";
const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureCredentialSpec {
    pub tenant_id: String,
    pub client_id: String,
    pub secret: AzureSecret,
}

#[derive(Clone, PartialEq, Eq)]
pub enum AzureSecret {
    ClientSecret(String),
    /// Federated token file, re-read on every exchange
    FederatedToken(PathBuf),
}

impl std::fmt::Debug for AzureSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AzureSecret::ClientSecret(_) => write!(f, "ClientSecret(<redacted>)"),
            AzureSecret::FederatedToken(path) => write!(f, "FederatedToken({})", path.display()),
        }
    }
}

pub struct AzureConnector {
    config: AzureConfig,
    http: reqwest::Client,
    retry: RetryPolicy,
    authority_host: String,
    arm: ArmClient,
    secret: AzureSecret,
}

impl AzureConnector {
    pub fn new(config: AzureConfig, ctx: &ConnectorContext) -> Self {
        let endpoints = &ctx.settings.endpoints;
        let secret = match config.client_secret.clone().filter(|s| !s.is_empty()) {
            Some(secret) => AzureSecret::ClientSecret(secret),
            None => AzureSecret::FederatedToken(
                ctx.settings
                    .secret_path(config.federated_token_file.as_deref().unwrap_or_default()),
            ),
        };
        Self {
            arm: ArmClient::new(ctx.http.clone(), &endpoints.azure_resource_manager_url, ctx.retry.clone()),
            http: ctx.http.clone(),
            retry: ctx.retry.clone(),
            authority_host: endpoints.azure_authority_host.trim_end_matches('/').to_string(),
            config,
            secret,
        }
    }

    async fn request_token(
        &self,
        subscription_id: &str,
        spec: &AzureCredentialSpec,
    ) -> Result<ScopedCredential, ConnectorError> {
        let token_url = format!("{}/{}/oauth2/v2.0/token", self.authority_host, spec.tenant_id);

        let assertion;
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", spec.client_id.as_str()),
            ("scope", ARM_SCOPE),
        ];
        match &spec.secret {
            AzureSecret::ClientSecret(secret) => form.push(("client_secret", secret.as_str())),
            AzureSecret::FederatedToken(path) => {
                assertion = tokio::fs::read_to_string(path).await.map_err(|e| {
                    ConnectorError::authentication(
                        subscription_id,
                        format!("failed to read federated token from {}: {}", path.display(), e),
                    )
                })?;
                form.push(("client_assertion_type", CLIENT_ASSERTION_TYPE));
                form.push(("client_assertion", assertion.trim()));
            }
        }

        let credential = oauth::request_token(
            &self.http,
            &self.retry,
            ProviderKind::Azure,
            subscription_id,
            &token_url,
            &form,
        )
        .await?;
        info!(subscription = %subscription_id, tenant = %spec.tenant_id, "Azure token obtained");
        Ok(credential)
    }
}

#[async_trait]
impl CloudConnector for AzureConnector {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Azure
    }

    fn scopes(&self) -> Vec<ScanScope> {
        self.config
            .subscription_id
            .iter()
            .map(|subscription_id| ScanScope {
                provider: ProviderKind::Azure,
                account_id: subscription_id.clone(),
                regions: Vec::new(),
                ignore_types: self.config.ignore.iter().cloned().collect(),
                ignore_tags: vec![DEFAULT_IGNORE_TAG.to_string()],
                credential: CredentialSpec::Azure(AzureCredentialSpec {
                    tenant_id: self.config.tenant_id.clone(),
                    client_id: self.config.client_id.clone(),
                    secret: self.secret.clone(),
                }),
            })
            .collect()
    }

    async fn resolve_credential(&self, scope: &ScanScope) -> Result<ScopedCredential, ConnectorError> {
        match &scope.credential {
            CredentialSpec::Azure(spec) => self.request_token(&scope.account_id, spec).await,
            CredentialSpec::Resolved(credential) => Ok(credential.clone()),
            _ => Err(ConnectorError::authentication(
                &scope.account_id,
                "scope does not carry an Azure credential",
            )),
        }
    }

    fn enumerators(&self, scope: &ScanScope) -> Vec<Arc<dyn ResourceEnumerator>> {
        ArmKind::ALL
            .into_iter()
            .map(|kind| -> Arc<dyn ResourceEnumerator> {
                Arc::new(ArmListing::new(self.arm.clone(), &scope.account_id, kind))
            })
            .collect()
    }

    fn healthcheck_payload(&self, scope: &ScanScope) -> serde_json::Value {
        serde_json::json!({ "azure": { "subscription_id": scope.account_id } })
    }
}
