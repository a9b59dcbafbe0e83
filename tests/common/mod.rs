//! Shared fakes for engine tests: an in-memory connector whose enumerators
//! return canned resources per region.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cloud_connector::config::Settings;
use cloud_connector::connectors::{
    CloudConnector, CredentialSpec, RegionScope, ResourceEnumerator, ScanScope, ScopedCredential,
};
use cloud_connector::error::{ConnectorError, ProviderError, ProviderErrorKind};
use cloud_connector::types::{ProviderKind, RawResource};

pub const ACCOUNT: &str = "123456789012";

pub type Listing = Result<Vec<RawResource>, ProviderErrorKind>;

pub struct FakeEnumerator {
    service: String,
    resource_type: String,
    scope: RegionScope,
    listings: HashMap<String, Listing>,
    delays: HashMap<String, Duration>,
}

impl FakeEnumerator {
    pub fn regional(service: &str) -> Self {
        Self {
            service: service.to_string(),
            resource_type: format!("AWS::{}", service),
            scope: RegionScope::Regional,
            listings: HashMap::new(),
            delays: HashMap::new(),
        }
    }

    pub fn returning(mut self, region: &str, resources: Vec<RawResource>) -> Self {
        self.listings.insert(region.to_string(), Ok(resources));
        self
    }

    pub fn failing(mut self, region: &str, kind: ProviderErrorKind) -> Self {
        self.listings.insert(region.to_string(), Err(kind));
        self
    }

    /// Sleep before yielding anything in `region`.
    pub fn stalling(mut self, region: &str, delay: Duration) -> Self {
        self.delays.insert(region.to_string(), delay);
        self
    }
}

impl ResourceEnumerator for FakeEnumerator {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn service(&self) -> &str {
        &self.service
    }

    fn region_scope(&self) -> RegionScope {
        self.scope
    }

    fn list<'a>(
        &'a self,
        _credential: &'a ScopedCredential,
        region: &'a str,
    ) -> BoxStream<'a, Result<RawResource, ProviderError>> {
        let listing = match self.listings.get(region) {
            Some(Ok(resources)) => stream::iter(resources.clone().into_iter().map(Ok)).boxed(),
            Some(Err(kind)) => stream::iter(vec![Err(ProviderError::new(
                self.resource_type.clone(),
                region,
                *kind,
                "simulated failure",
            ))])
            .boxed(),
            None => stream::empty().boxed(),
        };
        match self.delays.get(region).copied() {
            Some(delay) => stream::once(tokio::time::sleep(delay))
                .filter_map(|()| async { None::<Result<RawResource, ProviderError>> })
                .chain(listing)
                .boxed(),
            None => listing,
        }
    }
}

pub struct FakeConnector {
    pub regions: Vec<String>,
    pub enumerators: Vec<Arc<FakeEnumerator>>,
    pub auth_fails: bool,
}

impl FakeConnector {
    pub fn new(regions: &[&str], enumerators: Vec<FakeEnumerator>) -> Self {
        Self {
            regions: regions.iter().map(|r| r.to_string()).collect(),
            enumerators: enumerators.into_iter().map(Arc::new).collect(),
            auth_fails: false,
        }
    }
}

#[async_trait]
impl CloudConnector for FakeConnector {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Aws
    }

    fn scopes(&self) -> Vec<ScanScope> {
        vec![ScanScope {
            provider: ProviderKind::Aws,
            account_id: ACCOUNT.to_string(),
            regions: self.regions.clone(),
            ignore_types: Default::default(),
            ignore_tags: vec!["censys-cloud-connector-ignore".to_string()],
            credential: CredentialSpec::Resolved(ScopedCredential::token(
                ProviderKind::Aws,
                "fake-token",
                Duration::from_secs(3600),
            )),
        }]
    }

    async fn resolve_credential(&self, scope: &ScanScope) -> Result<ScopedCredential, ConnectorError> {
        if self.auth_fails {
            return Err(ConnectorError::authentication(&scope.account_id, "AssumeRole denied"));
        }
        match &scope.credential {
            CredentialSpec::Resolved(credential) => Ok(credential.clone()),
            _ => Err(ConnectorError::authentication(&scope.account_id, "unexpected credential")),
        }
    }

    fn enumerators(&self, _scope: &ScanScope) -> Vec<Arc<dyn ResourceEnumerator>> {
        self.enumerators
            .iter()
            .map(|e| -> Arc<dyn ResourceEnumerator> { e.clone() })
            .collect()
    }
}

pub fn settings(api_base: &str, state_dir: &Path) -> Settings {
    Settings {
        censys_api_key: Some("test-key".to_string()),
        censys_asm_api_base_url: api_base.to_string(),
        healthcheck_enabled: false,
        state_file: Some(state_dir.join("state.json")),
        ..Settings::default()
    }
}

pub fn ips(values: &[&str]) -> RawResource {
    values
        .iter()
        .fold(RawResource::new(values.join(",")), |resource, ip| resource.with_ip(*ip))
}
