//! GCP Cloud Asset Inventory enumerators
//!
//! Every resource type is one `searchAllResources` query over the
//! organization. Results carry versioned resource bodies; the first
//! version we know how to read is used. Labels are per project, so the
//! project id stands in for the region.

use futures::stream::BoxStream;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::connectors::{paginate, Page, RegionScope, ResourceEnumerator, ScopedCredential};
use crate::error::{ProviderError, ProviderErrorKind};
use crate::retry::RetryPolicy;
use crate::types::{CloudAssetCandidate, ProviderKind, RawResource, Tags};

pub const COMPUTE_INSTANCE: &str = "compute.googleapis.com/Instance";
pub const COMPUTE_ADDRESS: &str = "compute.googleapis.com/Address";
pub const CONTAINER_CLUSTER: &str = "container.googleapis.com/Cluster";
pub const CLOUD_SQL_INSTANCE: &str = "sqladmin.googleapis.com/Instance";
pub const DNS_ZONE: &str = "dns.googleapis.com/ManagedZone";
pub const STORAGE_BUCKET: &str = "storage.googleapis.com/Bucket";
pub const PROJECT: &str = "cloudresourcemanager.googleapis.com/Project";

/// Resource body versions readable per asset type
fn supported_versions(asset_type: &str) -> &'static [&'static str] {
    match asset_type {
        COMPUTE_INSTANCE | COMPUTE_ADDRESS => &["v1", "beta"],
        CONTAINER_CLUSTER | STORAGE_BUCKET => &["v1"],
        CLOUD_SQL_INSTANCE => &["v1", "v1beta4"],
        DNS_ZONE => &["v1", "v2"],
        PROJECT => &["v1", "v1beta1", "v3"],
        _ => &[],
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    name: String,
    /// `projects/<number>`
    project: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(rename = "versionedResources", default)]
    versioned_resources: Vec<VersionedResource>,
}

#[derive(Debug, Deserialize)]
struct VersionedResource {
    version: String,
    #[serde(default)]
    resource: serde_json::Value,
}

impl SearchResult {
    fn project_number(&self) -> Option<&str> {
        self.project.as_deref()?.strip_prefix("projects/")
    }

    fn resource(&self, asset_type: &str) -> Option<(&str, &serde_json::Value)> {
        let supported = supported_versions(asset_type);
        let found = self
            .versioned_resources
            .iter()
            .find(|v| supported.contains(&v.version.as_str()));
        if found.is_none() && !self.versioned_resources.is_empty() {
            let versions: Vec<_> = self.versioned_resources.iter().map(|v| v.version.as_str()).collect();
            warn!(asset_type, ?versions, "No supported API version for resource");
        }
        found.map(|v| (v.version.as_str(), &v.resource))
    }
}

/// Cloud Asset API client bound to one organization
#[derive(Clone)]
pub struct AssetSearch {
    http: reqwest::Client,
    base_url: String,
    organization_id: String,
    retry: RetryPolicy,
}

impl AssetSearch {
    pub fn new(http: reqwest::Client, base_url: &str, organization_id: &str, retry: RetryPolicy) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            organization_id: organization_id.to_string(),
            retry,
        }
    }

    async fn search(
        &self,
        credential: &ScopedCredential,
        asset_type: &str,
        page_token: Option<&str>,
    ) -> Result<SearchResponse, ProviderError> {
        let url = format!(
            "{}/v1/organizations/{}:searchAllResources",
            self.base_url, self.organization_id
        );
        let mut query = vec![("assetTypes", asset_type), ("readMask", "*")];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }

        let operation = format!("{} {}", asset_type, self.organization_id);
        let body = self
            .retry
            .execute(&operation, || async {
                let token = credential.access_token().ok_or_else(|| {
                    ProviderError::new(
                        asset_type,
                        &self.organization_id,
                        ProviderErrorKind::PermissionDenied,
                        "credential is not a bearer token",
                    )
                })?;
                let response = self
                    .http
                    .get(&url)
                    .query(&query)
                    .bearer_auth(token)
                    .send()
                    .await
                    .map_err(|e| ProviderError::transport(asset_type, &self.organization_id, &e))?;
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .map_err(|e| ProviderError::transport(asset_type, &self.organization_id, &e))?;
                if !status.is_success() {
                    return Err(ProviderError::from_status(asset_type, &self.organization_id, status, &body));
                }
                Ok(body)
            })
            .await?;

        serde_json::from_str(&body).map_err(|e| ProviderError::malformed(asset_type, &self.organization_id, e))
    }
}

/// Project number to project id, loaded once per scope and shared by the
/// scope's enumerators
#[derive(Default)]
pub struct ProjectDirectory {
    projects: OnceCell<HashMap<String, String>>,
}

impl ProjectDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get(
        &self,
        search: &AssetSearch,
        credential: &ScopedCredential,
    ) -> Result<&HashMap<String, String>, ProviderError> {
        self.projects
            .get_or_try_init(|| async {
                let mut projects = HashMap::new();
                let mut token: Option<String> = None;
                loop {
                    let page = search.search(credential, PROJECT, token.as_deref()).await?;
                    for result in &page.results {
                        if let Some((number, id)) = parse_project(result) {
                            projects.insert(number, id);
                        }
                    }
                    match page.next_page_token.filter(|t| !t.is_empty()) {
                        Some(next) => token = Some(next),
                        None => break,
                    }
                }
                debug!(count = projects.len(), "Loaded GCP projects");
                Ok(projects)
            })
            .await
    }
}

fn parse_project(result: &SearchResult) -> Option<(String, String)> {
    let (version, resource) = result.resource(PROJECT)?;
    let project_id = resource.get("projectId")?.as_str()?.to_string();
    let number = if version == "v3" {
        resource.get("name")?.as_str()?.strip_prefix("projects/")?.to_string()
    } else {
        match resource.get("projectNumber")? {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => return None,
        }
    };
    Some((number, project_id))
}

fn str_at<'a>(value: &'a serde_json::Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer)?.as_str().filter(|s| !s.is_empty())
}

fn array_at<'a>(value: &'a serde_json::Value, pointer: &str) -> impl Iterator<Item = &'a serde_json::Value> {
    value
        .pointer(pointer)
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
}

/// Addresses, domains and buckets read from one resource body
fn extract(asset_type: &str, resource: &serde_json::Value, project_number: &str) -> RawResource {
    let mut raw = RawResource::default();
    match asset_type {
        COMPUTE_INSTANCE => {
            for nic in array_at(resource, "/networkInterfaces") {
                raw.ips
                    .extend(array_at(nic, "/accessConfigs").filter_map(|c| str_at(c, "/natIP")).map(String::from));
                raw.ips.extend(
                    array_at(nic, "/ipv6AccessConfigs")
                        .filter_map(|c| str_at(c, "/externalIpv6"))
                        .map(String::from),
                );
            }
        }
        COMPUTE_ADDRESS => {
            if str_at(resource, "/addressType") != Some("INTERNAL") {
                raw.ips.extend(str_at(resource, "/address").map(String::from));
            }
        }
        CONTAINER_CLUSTER => {
            raw.ips
                .extend(str_at(resource, "/privateClusterConfig/publicEndpoint").map(String::from));
        }
        CLOUD_SQL_INSTANCE => {
            raw.ips.extend(
                array_at(resource, "/ipAddresses")
                    .filter(|ip| str_at(ip, "/type") != Some("PRIVATE"))
                    .filter_map(|ip| str_at(ip, "/ipAddress"))
                    .map(String::from),
            );
        }
        DNS_ZONE => {
            let public = str_at(resource, "/visibility").map_or(true, |v| v.eq_ignore_ascii_case("public"));
            if public {
                if let Some(name) = str_at(resource, "/dnsName") {
                    raw.domains.push(name.trim_end_matches('.').to_string());
                }
            }
        }
        STORAGE_BUCKET => {
            if let Some(bucket) = str_at(resource, "/id").or_else(|| str_at(resource, "/name")) {
                let public_access = str_at(resource, "/iamConfiguration/publicAccessPrevention").map(String::from);
                raw.buckets.push(CloudAssetCandidate {
                    provider: ProviderKind::Gcp,
                    account_id: project_number.to_string(),
                    bucket: bucket.to_string(),
                    region: str_at(resource, "/location").unwrap_or_default().to_lowercase(),
                    url: format!("https://storage.googleapis.com/{}", bucket),
                    public_access,
                    tags: Tags::new(),
                });
            }
        }
        _ => {}
    }
    raw
}

/// One asset type across the organization
pub struct AssetTypeListing {
    search: AssetSearch,
    projects: Arc<ProjectDirectory>,
    asset_type: &'static str,
}

impl AssetTypeListing {
    pub fn new(search: AssetSearch, projects: Arc<ProjectDirectory>, asset_type: &'static str) -> Self {
        Self {
            search,
            projects,
            asset_type,
        }
    }

    async fn page(&self, credential: &ScopedCredential, token: Option<String>) -> Result<Page, ProviderError> {
        let projects = self.projects.get(&self.search, credential).await?;
        let response = self.search.search(credential, self.asset_type, token.as_deref()).await?;

        let mut items = Vec::new();
        for result in &response.results {
            let Some(number) = result.project_number() else {
                continue;
            };
            let Some(project_id) = projects.get(number) else {
                debug!(asset = %result.name, project = number, "Resource outside known projects");
                continue;
            };
            let Some((_, body)) = result.resource(self.asset_type) else {
                continue;
            };
            let mut raw = extract(self.asset_type, body, number);
            if raw.is_empty() {
                continue;
            }
            raw.id = result.name.clone();
            raw.region = Some(project_id.clone());
            raw.tags = result.labels.clone();
            items.push(raw);
        }
        Ok(Page::new(items, response.next_page_token))
    }
}

impl ResourceEnumerator for AssetTypeListing {
    fn resource_type(&self) -> &str {
        self.asset_type
    }

    fn service(&self) -> &str {
        self.asset_type
    }

    fn region_scope(&self) -> RegionScope {
        RegionScope::Global
    }

    fn list<'a>(
        &'a self,
        credential: &'a ScopedCredential,
        _region: &'a str,
    ) -> BoxStream<'a, Result<RawResource, ProviderError>> {
        paginate(move |token| self.page(credential, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_extract_compute_instance_nat_ips() {
        let body = serde_json::json!({
            "networkInterfaces": [
                {"networkIP": "10.0.0.2", "accessConfigs": [{"natIP": "34.1.1.1"}]},
                {"accessConfigs": [{}]}
            ]
        });
        let raw = extract(COMPUTE_INSTANCE, &body, "42");
        assert_eq!(raw.ips, vec!["34.1.1.1".to_string()]);
    }

    #[test]
    fn test_extract_private_dns_zone_is_empty() {
        let body = serde_json::json!({"dnsName": "corp.internal.", "visibility": "PRIVATE"});
        assert!(extract(DNS_ZONE, &body, "42").is_empty());

        let body = serde_json::json!({"dnsName": "example.com.", "visibility": "PUBLIC"});
        assert_eq!(extract(DNS_ZONE, &body, "42").domains, vec!["example.com".to_string()]);
    }

    #[test]
    fn test_parse_project_versions() {
        let v1: SearchResult = serde_json::from_value(serde_json::json!({
            "name": "//cloudresourcemanager.googleapis.com/projects/p1",
            "versionedResources": [{"version": "v1", "resource": {"projectId": "p1", "projectNumber": "111"}}]
        }))
        .unwrap();
        assert_eq!(parse_project(&v1), Some(("111".into(), "p1".into())));

        let v3: SearchResult = serde_json::from_value(serde_json::json!({
            "versionedResources": [
                {"version": "v9", "resource": {}},
                {"version": "v3", "resource": {"projectId": "p2", "name": "projects/222"}}
            ]
        }))
        .unwrap();
        assert_eq!(parse_project(&v3), Some(("222".into(), "p2".into())));
    }

    #[tokio::test]
    async fn test_bucket_listing_labels_by_project() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/organizations/123:searchAllResources"))
            .and(query_param("assetTypes", PROJECT))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [{
                    "name": "//cloudresourcemanager.googleapis.com/projects/web",
                    "versionedResources": [{"version": "v1", "resource": {"projectId": "web", "projectNumber": "555"}}]
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/organizations/123:searchAllResources"))
            .and(query_param("assetTypes", STORAGE_BUCKET))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [{
                    "name": "//storage.googleapis.com/site-assets",
                    "project": "projects/555",
                    "labels": {"team": "web"},
                    "versionedResources": [{"version": "v1", "resource": {"id": "site-assets", "location": "US"}}]
                }, {
                    "name": "//storage.googleapis.com/orphan",
                    "project": "projects/999",
                    "versionedResources": [{"version": "v1", "resource": {"id": "orphan", "location": "US"}}]
                }]
            })))
            .mount(&server)
            .await;

        let search = AssetSearch::new(
            reqwest::Client::new(),
            &server.uri(),
            "123",
            RetryPolicy::new(2, Duration::from_millis(1)),
        );
        let listing = AssetTypeListing::new(search, Arc::new(ProjectDirectory::new()), STORAGE_BUCKET);
        let credential = ScopedCredential::token(ProviderKind::Gcp, "tok", Duration::from_secs(3600));
        let resources: Vec<RawResource> = listing.list(&credential, "global").try_collect().await.unwrap();

        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].region.as_deref(), Some("web"));
        let bucket = &resources[0].buckets[0];
        assert_eq!(bucket.url, "https://storage.googleapis.com/site-assets");
        assert_eq!(bucket.account_id, "555");
        assert_eq!(bucket.region, "us");
    }
}
