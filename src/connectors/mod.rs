//! Cloud Connectors
//!
//! One connector per provider kind. A connector flattens its configured
//! account tree into scan scopes, resolves a credential per scope and
//! exposes the resource enumerators that apply to it.

pub mod aws;
pub mod azure;
pub mod credentials;
pub mod gcp;
pub mod oauth;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{ProviderAccount, Settings};
use crate::error::{ConnectorError, ProviderError};
use crate::retry::RetryPolicy;
use crate::types::{ProviderKind, RawResource, Tags};

pub use credentials::{AwsKeys, CredentialCache, CredentialValue, ScopedCredential};

/// One account (or subscription / organization) to scan
#[derive(Debug, Clone)]
pub struct ScanScope {
    pub provider: ProviderKind,
    pub account_id: String,
    /// Regions to list regional resource types in
    pub regions: Vec<String>,
    /// Resource types not to enumerate in this scope
    pub ignore_types: BTreeSet<String>,
    /// Resources tagged with any of these keys are ignored
    pub ignore_tags: Vec<String>,
    pub credential: CredentialSpec,
}

impl ScanScope {
    pub fn is_ignored(&self, resource_type: &str, global_ignore: &[String]) -> bool {
        self.ignore_types.contains(resource_type)
            || global_ignore.iter().any(|t| t == resource_type)
    }
}

/// How to obtain a scope's credential
#[derive(Debug, Clone)]
pub enum CredentialSpec {
    Aws(aws::AwsCredentialSpec),
    Azure(azure::AzureCredentialSpec),
    Gcp(gcp::GcpCredentialSpec),
    /// Already resolved, used as is
    Resolved(ScopedCredential),
}

/// Whether an enumerator lists per region or once per scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionScope {
    Regional,
    Global,
}

/// Lists one resource type.
///
/// Implementations page internally and return a lazy stream; calling
/// `list` again restarts from the first page.
pub trait ResourceEnumerator: Send + Sync {
    /// Type tag matched against `ignore` lists, e.g. `AWS::RDS`
    fn resource_type(&self) -> &str;

    /// Service segment of the label, e.g. `RDS`
    fn service(&self) -> &str;

    fn region_scope(&self) -> RegionScope {
        RegionScope::Regional
    }

    fn list<'a>(
        &'a self,
        credential: &'a ScopedCredential,
        region: &'a str,
    ) -> BoxStream<'a, Result<RawResource, ProviderError>>;
}

/// Provider capability interface used by the orchestrator
#[async_trait]
pub trait CloudConnector: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// Account tree flattened into scopes, effective roles resolved
    fn scopes(&self) -> Vec<ScanScope>;

    async fn resolve_credential(&self, scope: &ScanScope) -> Result<ScopedCredential, ConnectorError>;

    /// Enumerators bound to one scope
    fn enumerators(&self, scope: &ScanScope) -> Vec<Arc<dyn ResourceEnumerator>>;

    /// Identifying payload for healthcheck reporting
    fn healthcheck_payload(&self, scope: &ScanScope) -> serde_json::Value {
        let mut payload = serde_json::Map::new();
        payload.insert(
            self.provider().to_string(),
            serde_json::json!({ "account": scope.account_id }),
        );
        serde_json::Value::Object(payload)
    }
}

/// List with ignore-tag filtering applied.
///
/// Resources carrying any of `ignore_tags` are flagged rather than
/// removed, so the aggregator can suppress the same value when it shows up
/// untagged elsewhere.
pub fn list_filtered<'a>(
    enumerator: &'a dyn ResourceEnumerator,
    credential: &'a ScopedCredential,
    region: &'a str,
    ignore_tags: &'a [String],
) -> BoxStream<'a, Result<RawResource, ProviderError>> {
    enumerator
        .list(credential, region)
        .map_ok(move |mut resource| {
            if has_ignore_tag(&resource.tags, ignore_tags) {
                debug!(resource = %resource.id, region, "Resource carries an ignore tag");
                resource.ignored = true;
            }
            resource
        })
        .boxed()
}

/// A tag matches by key, or by value when the key is `Name`.
pub fn has_ignore_tag(tags: &Tags, ignore_tags: &[String]) -> bool {
    let name = tags.get("Name");
    ignore_tags
        .iter()
        .any(|t| tags.contains_key(t) || name == Some(t))
}

/// One page of a paginated listing
pub struct Page {
    pub items: Vec<RawResource>,
    pub next: Option<String>,
}

impl Page {
    pub fn new(items: Vec<RawResource>, next: Option<String>) -> Self {
        Self {
            items,
            next: next.filter(|t| !t.is_empty()),
        }
    }
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Drive `fetch` with continuation tokens until a page has none.
pub fn paginate<'a, F, Fut>(fetch: F) -> BoxStream<'a, Result<RawResource, ProviderError>>
where
    F: FnMut(Option<String>) -> Fut + Send + 'a,
    Fut: Future<Output = Result<Page, ProviderError>> + Send + 'a,
{
    stream::try_unfold((Cursor::Start, fetch), |(cursor, mut fetch)| async move {
        let token = match cursor {
            Cursor::Done => return Ok(None),
            Cursor::Start => None,
            Cursor::Next(token) => Some(token),
        };
        let page = fetch(token).await?;
        let cursor = match page.next {
            Some(next) => Cursor::Next(next),
            None => Cursor::Done,
        };
        let items = stream::iter(page.items.into_iter().map(Ok::<_, ProviderError>));
        Ok(Some((items, (cursor, fetch))))
    })
    .try_flatten()
    .boxed()
}

/// Shared construction context for connectors
#[derive(Clone)]
pub struct ConnectorContext {
    pub http: reqwest::Client,
    pub settings: Arc<Settings>,
    /// Retry policy for enumerator pages and token endpoints
    pub retry: RetryPolicy,
}

/// Build one connector per configured account, keeping only `selected`
/// providers (all when empty).
pub fn build_connectors(
    accounts: &[ProviderAccount],
    selected: &[ProviderKind],
    ctx: &ConnectorContext,
) -> Vec<Arc<dyn CloudConnector>> {
    accounts
        .iter()
        .filter(|account| selected.is_empty() || selected.contains(&account.provider()))
        .map(|account| -> Arc<dyn CloudConnector> {
            match account {
                ProviderAccount::Aws(config) => Arc::new(aws::AwsConnector::new(config.clone(), ctx)),
                ProviderAccount::Azure(config) => Arc::new(azure::AzureConnector::new(config.clone(), ctx)),
                ProviderAccount::Gcp(config) => Arc::new(gcp::GcpConnector::new(config.clone(), ctx)),
            }
        })
        .inspect(|connector| {
            if connector.scopes().is_empty() {
                warn!(provider = %connector.provider(), "Connector has no scopes to scan");
            }
        })
        .collect()
}
