//! GCP Connector
//!
//! One scope per organization, listed through Cloud Asset Inventory.

mod auth;
mod enumerators;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{GcpConfig, Settings, DEFAULT_IGNORE_TAG};
use crate::connectors::{
    CloudConnector, ConnectorContext, CredentialSpec, ResourceEnumerator, ScanScope, ScopedCredential,
};
use crate::error::ConnectorError;
use crate::retry::RetryPolicy;
use crate::types::ProviderKind;

pub use auth::{GcpCredentialSpec, CLOUD_PLATFORM_SCOPE};
pub use enumerators::{
    AssetSearch, AssetTypeListing, ProjectDirectory, CLOUD_SQL_INSTANCE, COMPUTE_ADDRESS, COMPUTE_INSTANCE,
    CONTAINER_CLUSTER, DNS_ZONE, STORAGE_BUCKET,
};

const ASSET_TYPES: [&str; 6] = [
    COMPUTE_INSTANCE,
    COMPUTE_ADDRESS,
    CONTAINER_CLUSTER,
    CLOUD_SQL_INSTANCE,
    DNS_ZONE,
    STORAGE_BUCKET,
];

pub struct GcpConnector {
    config: GcpConfig,
    http: reqwest::Client,
    retry: RetryPolicy,
    settings: Arc<Settings>,
}

impl GcpConnector {
    pub fn new(config: GcpConfig, ctx: &ConnectorContext) -> Self {
        Self {
            config,
            http: ctx.http.clone(),
            retry: ctx.retry.clone(),
            settings: ctx.settings.clone(),
        }
    }

    fn credential_spec(&self) -> GcpCredentialSpec {
        match (&self.config.workload_identity, &self.config.service_account_json_file) {
            (Some(wi), _) => GcpCredentialSpec::WorkloadIdentity {
                audience: wi.audience.clone(),
                token_file: self.settings.secret_path(&wi.token_file),
                service_account_email: self.config.service_account_email.clone(),
            },
            (None, key_file) => {
                GcpCredentialSpec::ServiceAccountKey(self.settings.secret_path(key_file.as_deref().unwrap_or_default()))
            }
        }
    }
}

#[async_trait]
impl CloudConnector for GcpConnector {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Gcp
    }

    fn scopes(&self) -> Vec<ScanScope> {
        vec![ScanScope {
            provider: ProviderKind::Gcp,
            account_id: self.config.organization_id.clone(),
            regions: Vec::new(),
            ignore_types: self.config.ignore.iter().cloned().collect(),
            ignore_tags: vec![DEFAULT_IGNORE_TAG.to_string()],
            credential: CredentialSpec::Gcp(self.credential_spec()),
        }]
    }

    async fn resolve_credential(&self, scope: &ScanScope) -> Result<ScopedCredential, ConnectorError> {
        match &scope.credential {
            CredentialSpec::Gcp(spec) => {
                let endpoints = &self.settings.endpoints;
                let ctx = auth::TokenContext {
                    http: &self.http,
                    retry: &self.retry,
                    sts_url: &endpoints.gcp_sts_url,
                    iam_credentials_url: &endpoints.gcp_iam_credentials_url,
                };
                auth::resolve(&ctx, &scope.account_id, spec).await
            }
            CredentialSpec::Resolved(credential) => Ok(credential.clone()),
            _ => Err(ConnectorError::authentication(
                &scope.account_id,
                "scope does not carry a GCP credential",
            )),
        }
    }

    fn enumerators(&self, scope: &ScanScope) -> Vec<Arc<dyn ResourceEnumerator>> {
        let search = AssetSearch::new(
            self.http.clone(),
            &self.settings.endpoints.gcp_cloud_asset_url,
            &scope.account_id,
            self.retry.clone(),
        );
        let projects = Arc::new(ProjectDirectory::new());
        ASSET_TYPES
            .into_iter()
            .map(|asset_type| -> Arc<dyn ResourceEnumerator> {
                Arc::new(AssetTypeListing::new(search.clone(), projects.clone(), asset_type))
            })
            .collect()
    }

    fn healthcheck_payload(&self, scope: &ScanScope) -> serde_json::Value {
        serde_json::json!({ "gcp": { "organization_id": scope.account_id } })
    }
}
