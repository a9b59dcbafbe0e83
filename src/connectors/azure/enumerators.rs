//! Azure Resource Manager enumerators
//!
//! Subscription-wide ARM listings. Every resource reports its own
//! location, which becomes the label region.

use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

use crate::connectors::{paginate, Page, RegionScope, ResourceEnumerator, ScopedCredential};
use crate::error::{ProviderError, ProviderErrorKind};
use crate::retry::RetryPolicy;
use crate::types::{CloudAssetCandidate, ProviderKind, RawResource, Tags};

pub const PUBLIC_IP_ADDRESSES: &str = "Microsoft.Network/publicIPAddresses";
pub const CONTAINER_GROUPS: &str = "Microsoft.ContainerInstance/containerGroups";
pub const SQL_SERVERS: &str = "Microsoft.Sql/servers";
pub const DNS_ZONES: &str = "Microsoft.Network/dnszones";
pub const STORAGE_ACCOUNTS: &str = "Microsoft.Storage/storageAccounts";

/// Bearer-token ARM GET client
#[derive(Clone)]
pub struct ArmClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl ArmClient {
    pub fn new(http: reqwest::Client, base_url: &str, retry: RetryPolicy) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        }
    }

    pub fn url(&self, path: &str, api_version: &str) -> String {
        format!("{}{}?api-version={}", self.base_url, path, api_version)
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        credential: &ScopedCredential,
        url: &str,
        resource_type: &str,
        region: &str,
    ) -> Result<T, ProviderError> {
        let operation = format!("{} {}", resource_type, region);
        let body = self
            .retry
            .execute(&operation, || self.get_once(credential, url, resource_type, region))
            .await?;
        serde_json::from_str(&body).map_err(|e| ProviderError::malformed(resource_type, region, e))
    }

    async fn get_once(
        &self,
        credential: &ScopedCredential,
        url: &str,
        resource_type: &str,
        region: &str,
    ) -> Result<String, ProviderError> {
        let token = credential.access_token().ok_or_else(|| {
            ProviderError::new(
                resource_type,
                region,
                ProviderErrorKind::PermissionDenied,
                "credential is not a bearer token",
            )
        })?;

        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ProviderError::transport(resource_type, region, &e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::transport(resource_type, region, &e))?;
        if !status.is_success() {
            return Err(ProviderError::from_status(resource_type, region, status, &body));
        }
        Ok(body)
    }
}

#[derive(Debug, Deserialize)]
struct ArmPage<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArmResource<P> {
    id: String,
    name: String,
    location: Option<String>,
    #[serde(default)]
    tags: Option<Tags>,
    properties: Option<P>,
}

impl<P> ArmResource<P> {
    /// Resource shell carrying id, location and tags. `None` when the
    /// resource reports no location to label it with.
    fn shell(&self) -> Option<RawResource> {
        let location = self.location.as_deref().filter(|l| !l.is_empty())?;
        Some(
            RawResource::new(self.id.clone())
                .with_region(location)
                .with_tags(self.tags.clone().unwrap_or_default()),
        )
    }
}

#[derive(Debug, Deserialize)]
struct PublicIpProperties {
    #[serde(rename = "ipAddress")]
    ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContainerGroupProperties {
    #[serde(rename = "ipAddress")]
    ip_address: Option<ContainerGroupIp>,
}

#[derive(Debug, Deserialize)]
struct ContainerGroupIp {
    #[serde(rename = "type")]
    kind: Option<String>,
    ip: Option<String>,
    fqdn: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SqlServerProperties {
    #[serde(rename = "fullyQualifiedDomainName")]
    fqdn: Option<String>,
    #[serde(rename = "publicNetworkAccess")]
    public_network_access: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DnsZoneProperties {
    #[serde(rename = "zoneType")]
    zone_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordSetProperties {
    fqdn: Option<String>,
    #[serde(rename = "ARecords", default)]
    a_records: Vec<ARecord>,
    #[serde(rename = "CNAMERecord")]
    cname_record: Option<CnameRecord>,
}

#[derive(Debug, Deserialize)]
struct ARecord {
    #[serde(rename = "ipv4Address")]
    ipv4_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CnameRecord {
    cname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StorageAccountProperties {
    #[serde(rename = "customDomain")]
    custom_domain: Option<CustomDomain>,
    #[serde(rename = "primaryEndpoints")]
    primary_endpoints: Option<PrimaryEndpoints>,
}

#[derive(Debug, Deserialize)]
struct CustomDomain {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PrimaryEndpoints {
    blob: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlobContainerProperties {
    #[serde(rename = "publicAccess")]
    public_access: Option<String>,
}

/// Which ARM collection an [`ArmListing`] walks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmKind {
    PublicIps,
    ContainerGroups,
    SqlServers,
    DnsZones,
    StorageAccounts,
}

impl ArmKind {
    pub const ALL: [ArmKind; 5] = [
        ArmKind::PublicIps,
        ArmKind::ContainerGroups,
        ArmKind::SqlServers,
        ArmKind::DnsZones,
        ArmKind::StorageAccounts,
    ];

    pub fn resource_type(&self) -> &'static str {
        match self {
            ArmKind::PublicIps => PUBLIC_IP_ADDRESSES,
            ArmKind::ContainerGroups => CONTAINER_GROUPS,
            ArmKind::SqlServers => SQL_SERVERS,
            ArmKind::DnsZones => DNS_ZONES,
            ArmKind::StorageAccounts => STORAGE_ACCOUNTS,
        }
    }

    fn api_version(&self) -> &'static str {
        match self {
            ArmKind::PublicIps => "2023-09-01",
            ArmKind::ContainerGroups => "2023-05-01",
            ArmKind::SqlServers => "2021-11-01",
            ArmKind::DnsZones => "2018-05-01",
            ArmKind::StorageAccounts => "2023-01-01",
        }
    }
}

/// One resource type across a subscription
pub struct ArmListing {
    client: ArmClient,
    subscription_id: String,
    kind: ArmKind,
}

impl ArmListing {
    pub fn new(client: ArmClient, subscription_id: impl Into<String>, kind: ArmKind) -> Self {
        Self {
            client,
            subscription_id: subscription_id.into(),
            kind,
        }
    }

    fn first_url(&self) -> String {
        self.client.url(
            &format!(
                "/subscriptions/{}/providers/{}",
                self.subscription_id,
                self.kind.resource_type()
            ),
            self.kind.api_version(),
        )
    }

    async fn fetch<P: DeserializeOwned>(
        &self,
        credential: &ScopedCredential,
        region: &str,
        next: Option<String>,
    ) -> Result<ArmPage<ArmResource<P>>, ProviderError> {
        let url = next.unwrap_or_else(|| self.first_url());
        self.client
            .get(credential, &url, self.kind.resource_type(), region)
            .await
    }

    async fn page(
        &self,
        credential: &ScopedCredential,
        region: &str,
        next: Option<String>,
    ) -> Result<Page, ProviderError> {
        match self.kind {
            ArmKind::PublicIps => {
                let page = self.fetch::<PublicIpProperties>(credential, region, next).await?;
                let items = page
                    .value
                    .iter()
                    .filter_map(|r| {
                        let ip = r.properties.as_ref()?.ip_address.clone()?;
                        Some(r.shell()?.with_ip(ip))
                    })
                    .collect();
                Ok(Page::new(items, page.next_link))
            }
            ArmKind::ContainerGroups => {
                let page = self.fetch::<ContainerGroupProperties>(credential, region, next).await?;
                let items = page
                    .value
                    .iter()
                    .filter_map(|r| {
                        let ip = r.properties.as_ref()?.ip_address.as_ref()?;
                        if ip.kind.as_deref() != Some("Public") {
                            return None;
                        }
                        let mut resource = r.shell()?;
                        resource.ips.extend(ip.ip.clone());
                        resource.domains.extend(ip.fqdn.clone());
                        Some(resource)
                    })
                    .collect();
                Ok(Page::new(items, page.next_link))
            }
            ArmKind::SqlServers => {
                let page = self.fetch::<SqlServerProperties>(credential, region, next).await?;
                let items = page
                    .value
                    .iter()
                    .filter_map(|r| {
                        let props = r.properties.as_ref()?;
                        if props.public_network_access.as_deref() != Some("Enabled") {
                            return None;
                        }
                        Some(r.shell()?.with_domain(props.fqdn.clone()?))
                    })
                    .collect();
                Ok(Page::new(items, page.next_link))
            }
            ArmKind::DnsZones => {
                let page = self.fetch::<DnsZoneProperties>(credential, region, next).await?;
                let mut items = Vec::new();
                for zone in &page.value {
                    let public = zone
                        .properties
                        .as_ref()
                        .and_then(|p| p.zone_type.as_deref())
                        .map_or(true, |t| t == "Public");
                    if !public {
                        continue;
                    }
                    let Some(mut resource) = zone.shell() else {
                        continue;
                    };
                    resource.domains.push(zone.name.clone());
                    self.collect_records(credential, region, &zone.id, &mut resource).await?;
                    items.push(resource);
                }
                Ok(Page::new(items, page.next_link))
            }
            ArmKind::StorageAccounts => {
                let page = self.fetch::<StorageAccountProperties>(credential, region, next).await?;
                let mut items = Vec::new();
                for account in &page.value {
                    let Some(mut resource) = account.shell() else {
                        continue;
                    };
                    let props = account.properties.as_ref();
                    if let Some(domain) = props
                        .and_then(|p| p.custom_domain.as_ref())
                        .and_then(|d| d.name.clone())
                    {
                        resource.domains.push(domain);
                    }
                    let blob_endpoint = props
                        .and_then(|p| p.primary_endpoints.as_ref())
                        .and_then(|e| e.blob.clone())
                        .unwrap_or_else(|| format!("https://{}.blob.core.windows.net/", account.name));
                    let location = resource.region.clone().unwrap_or_default();
                    self.collect_containers(credential, region, account, &blob_endpoint, &location, &mut resource)
                        .await?;
                    items.push(resource);
                }
                Ok(Page::new(items, page.next_link))
            }
        }
    }

    async fn collect_records(
        &self,
        credential: &ScopedCredential,
        region: &str,
        zone_id: &str,
        resource: &mut RawResource,
    ) -> Result<(), ProviderError> {
        let mut next = Some(self.client.url(&format!("{}/all", zone_id), ArmKind::DnsZones.api_version()));
        while let Some(url) = next {
            let page: ArmPage<ArmResource<RecordSetProperties>> =
                self.client.get(credential, &url, DNS_ZONES, region).await?;
            for record in page.value.into_iter().filter_map(|r| r.properties) {
                resource.domains.extend(record.fqdn.map(|f| f.trim_end_matches('.').to_string()));
                resource.domains.extend(record.cname_record.and_then(|c| c.cname));
                resource
                    .ips
                    .extend(record.a_records.into_iter().filter_map(|a| a.ipv4_address));
            }
            next = page.next_link;
        }
        Ok(())
    }

    async fn collect_containers(
        &self,
        credential: &ScopedCredential,
        region: &str,
        account: &ArmResource<StorageAccountProperties>,
        blob_endpoint: &str,
        location: &str,
        resource: &mut RawResource,
    ) -> Result<(), ProviderError> {
        let mut next = Some(self.client.url(
            &format!("{}/blobServices/default/containers", account.id),
            ArmKind::StorageAccounts.api_version(),
        ));
        while let Some(url) = next {
            let page: ArmPage<ArmResource<BlobContainerProperties>> =
                match self.client.get(credential, &url, STORAGE_ACCOUNTS, region).await {
                    Ok(page) => page,
                    // one unreadable account does not fail the listing
                    Err(e) if e.kind == ProviderErrorKind::PermissionDenied => {
                        warn!(account = %account.name, error = %e, "Cannot list storage containers");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
            for container in page.value {
                let url = format!("{}/{}", blob_endpoint.trim_end_matches('/'), container.name);
                resource.buckets.push(CloudAssetCandidate {
                    provider: ProviderKind::Azure,
                    account_id: self.subscription_id.clone(),
                    bucket: format!("{}/{}", account.name, container.name),
                    region: location.to_lowercase(),
                    url,
                    public_access: container.properties.and_then(|p| p.public_access),
                    tags: Tags::new(),
                });
            }
            next = page.next_link;
        }
        Ok(())
    }
}

impl ResourceEnumerator for ArmListing {
    fn resource_type(&self) -> &str {
        self.kind.resource_type()
    }

    fn service(&self) -> &str {
        self.kind.resource_type()
    }

    fn region_scope(&self) -> RegionScope {
        RegionScope::Global
    }

    fn list<'a>(
        &'a self,
        credential: &'a ScopedCredential,
        region: &'a str,
    ) -> BoxStream<'a, Result<RawResource, ProviderError>> {
        paginate(move |next| self.page(credential, region, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn listing(server: &MockServer, kind: ArmKind) -> ArmListing {
        let client = ArmClient::new(
            reqwest::Client::new(),
            &server.uri(),
            RetryPolicy::new(2, Duration::from_millis(1)),
        );
        ArmListing::new(client, "sub-1", kind)
    }

    fn credential() -> ScopedCredential {
        ScopedCredential::token(ProviderKind::Azure, "arm-token", Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_public_ips_follow_next_link() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions/sub-1/providers/Microsoft.Network/publicIPAddresses"))
            .and(query_param("api-version", "2023-09-01"))
            .and(header("authorization", "Bearer arm-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [
                    {"id": "/ip/1", "name": "ip1", "location": "eastus", "properties": {"ipAddress": "20.0.0.1"}},
                    {"id": "/ip/2", "name": "ip2", "location": "eastus", "properties": {}}
                ],
                "nextLink": format!("{}/page2", server.uri())
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [
                    {"id": "/ip/3", "name": "ip3", "location": "westeurope", "tags": {"env": "prod"},
                     "properties": {"ipAddress": "20.0.0.3"}}
                ]
            })))
            .mount(&server)
            .await;

        let listing = listing(&server, ArmKind::PublicIps);
        let credential = credential();
        let resources: Vec<RawResource> = listing.list(&credential, "global").try_collect().await.unwrap();

        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].ips, vec!["20.0.0.1".to_string()]);
        assert_eq!(resources[1].region.as_deref(), Some("westeurope"));
        assert_eq!(resources[1].tags.get("env").map(String::as_str), Some("prod"));
    }

    #[tokio::test]
    async fn test_sql_servers_require_public_access() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions/sub-1/providers/Microsoft.Sql/servers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [
                    {"id": "/sql/1", "name": "a", "location": "eastus",
                     "properties": {"fullyQualifiedDomainName": "a.database.windows.net", "publicNetworkAccess": "Enabled"}},
                    {"id": "/sql/2", "name": "b", "location": "eastus",
                     "properties": {"fullyQualifiedDomainName": "b.database.windows.net", "publicNetworkAccess": "Disabled"}}
                ]
            })))
            .mount(&server)
            .await;

        let listing = listing(&server, ArmKind::SqlServers);
        let credential = credential();
        let resources: Vec<RawResource> = listing.list(&credential, "global").try_collect().await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].domains, vec!["a.database.windows.net".to_string()]);
    }

    #[tokio::test]
    async fn test_storage_accounts_emit_container_assets() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions/sub-1/providers/Microsoft.Storage/storageAccounts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [
                    {"id": "/subscriptions/sub-1/resourceGroups/rg/providers/Microsoft.Storage/storageAccounts/acct",
                     "name": "acct", "location": "eastus",
                     "properties": {
                        "customDomain": {"name": "static.example.com"},
                        "primaryEndpoints": {"blob": "https://acct.blob.core.windows.net/"}
                     }}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/subscriptions/sub-1/resourceGroups/rg/providers/Microsoft.Storage/storageAccounts/acct/blobServices/default/containers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [
                    {"id": "/c/1", "name": "public", "properties": {"publicAccess": "Container"}}
                ]
            })))
            .mount(&server)
            .await;

        let listing = listing(&server, ArmKind::StorageAccounts);
        let credential = credential();
        let resources: Vec<RawResource> = listing.list(&credential, "global").try_collect().await.unwrap();

        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].domains, vec!["static.example.com".to_string()]);
        let asset = &resources[0].buckets[0];
        assert_eq!(asset.url, "https://acct.blob.core.windows.net/public");
        assert_eq!(asset.bucket, "acct/public");
        assert_eq!(asset.public_access.as_deref(), Some("Container"));
        assert_eq!(asset.region, "eastus");
    }

    #[tokio::test]
    async fn test_forbidden_listing_is_permission_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("AuthorizationFailed"))
            .expect(1)
            .mount(&server)
            .await;

        let listing = listing(&server, ArmKind::ContainerGroups);
        let credential = credential();
        let err = listing
            .list(&credential, "global")
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::PermissionDenied);
        assert_eq!(err.resource_type, CONTAINER_GROUPS);
    }
}
