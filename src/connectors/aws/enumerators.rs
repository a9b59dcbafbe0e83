//! AWS resource enumerators
//!
//! Query-API (XML) and REST (JSON) listings normalized into
//! [`RawResource`]s. Services with two API generations (ELB, API Gateway)
//! list both and yield one shape.

use futures::stream::{BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

use super::client::{AwsClient, AwsRequest};
use crate::connectors::{paginate, Page, RegionScope, ResourceEnumerator, ScopedCredential};
use crate::error::ProviderError;
use crate::types::{CloudAssetCandidate, ProviderKind, RawResource, Tags};

pub const API_GATEWAY: &str = "AWS::ApiGateway";
pub const ELB: &str = "AWS::ElasticLoadBalancing";
pub const NETWORK_INTERFACE: &str = "AWS::NetworkInterface";
pub const RDS: &str = "AWS::RDS";
pub const ROUTE53: &str = "AWS::Route53";
pub const S3: &str = "AWS::S3";

fn parse_xml<T: DeserializeOwned>(resource_type: &str, region: &str, body: &str) -> Result<T, ProviderError> {
    quick_xml::de::from_str(body).map_err(|e| ProviderError::malformed(resource_type, region, e))
}

fn parse_json<T: DeserializeOwned>(resource_type: &str, region: &str, body: &str) -> Result<T, ProviderError> {
    serde_json::from_str(body).map_err(|e| ProviderError::malformed(resource_type, region, e))
}

/// EC2-style `<item>` list
#[derive(Debug, Deserialize)]
struct ItemSet<T> {
    #[serde(rename = "item", default = "Vec::new")]
    items: Vec<T>,
}

impl<T> Default for ItemSet<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

/// Query-API `<member>` list
#[derive(Debug, Deserialize)]
struct Members<T> {
    #[serde(rename = "member", default = "Vec::new")]
    members: Vec<T>,
}

impl<T> Default for Members<T> {
    fn default() -> Self {
        Self { members: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
struct Ec2Tag {
    key: String,
    #[serde(default)]
    value: String,
}

fn ec2_tags(set: ItemSet<Ec2Tag>) -> Tags {
    set.items.into_iter().map(|t| (t.key, t.value)).collect()
}

// ---------------------------------------------------------------------------
// ENI
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DescribeNetworkInterfacesResponse {
    #[serde(rename = "networkInterfaceSet", default)]
    interfaces: ItemSet<NetworkInterface>,
    #[serde(rename = "nextToken", default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NetworkInterface {
    #[serde(rename = "networkInterfaceId")]
    id: String,
    #[serde(rename = "privateIpAddressesSet", default)]
    private_ips: ItemSet<PrivateIpAddress>,
    #[serde(rename = "ipv6AddressesSet", default)]
    ipv6: ItemSet<Ipv6Address>,
    #[serde(rename = "tagSet", default)]
    tags: ItemSet<Ec2Tag>,
    #[serde(default)]
    attachment: Option<EniAttachment>,
}

#[derive(Debug, Deserialize)]
struct EniAttachment {
    #[serde(rename = "instanceId", default)]
    instance_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PrivateIpAddress {
    association: Option<Association>,
}

#[derive(Debug, Deserialize)]
struct Association {
    #[serde(rename = "publicIp")]
    public_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Ipv6Address {
    #[serde(rename = "ipv6Address")]
    address: String,
}

#[derive(Debug, Deserialize)]
struct DescribeTagsResponse {
    #[serde(rename = "tagSet", default)]
    tags: ItemSet<TagDescription>,
    #[serde(rename = "nextToken", default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagDescription {
    #[serde(rename = "resourceId")]
    resource_id: String,
    key: String,
    #[serde(default)]
    value: String,
}

/// Most values DescribeTags accepts in one filter
const DESCRIBE_TAGS_MAX_IDS: usize = 200;

/// Public addresses attached to elastic network interfaces
pub struct NetworkInterfaces {
    client: AwsClient,
}

impl NetworkInterfaces {
    pub fn new(client: AwsClient) -> Self {
        Self { client }
    }

    /// Interfaces are listed unfiltered; one without a public IPv4 or an
    /// IPv6 address is dropped here so IPv6-only interfaces are kept.
    async fn page(
        &self,
        credential: &ScopedCredential,
        region: &str,
        token: Option<String>,
    ) -> Result<Page, ProviderError> {
        let mut query = vec![
            ("Action", "DescribeNetworkInterfaces".to_string()),
            ("Version", "2016-11-15".to_string()),
        ];
        if let Some(token) = token {
            query.push(("NextToken", token));
        }
        let body = self
            .client
            .get(
                credential,
                &AwsRequest {
                    service: "ec2",
                    region,
                    path: "/",
                    query,
                    resource_type: NETWORK_INTERFACE,
                },
            )
            .await?;
        let parsed: DescribeNetworkInterfacesResponse = parse_xml(NETWORK_INTERFACE, region, &body)?;

        let public: Vec<(RawResource, Option<String>)> = parsed
            .interfaces
            .items
            .into_iter()
            .filter_map(|eni| {
                let mut resource = RawResource::new(eni.id);
                resource.ips = eni
                    .private_ips
                    .items
                    .into_iter()
                    .filter_map(|p| p.association.and_then(|a| a.public_ip))
                    .chain(eni.ipv6.items.into_iter().map(|a| a.address))
                    .collect();
                if resource.ips.is_empty() {
                    return None;
                }
                resource.tags = ec2_tags(eni.tags);
                Some((resource, eni.attachment.and_then(|a| a.instance_id)))
            })
            .collect();

        let instance_ids: BTreeSet<String> = public.iter().filter_map(|(_, id)| id.clone()).collect();
        let mut instance_tags = self.instance_tags(credential, region, &instance_ids).await?;

        let items = public
            .into_iter()
            .map(|(mut resource, instance_id)| {
                // the interface's own tag wins on a shared key
                if let Some(tags) = instance_id.and_then(|id| instance_tags.remove(&id)) {
                    for (key, value) in tags {
                        resource.tags.entry(key).or_insert(value);
                    }
                }
                resource
            })
            .collect();
        Ok(Page::new(items, parsed.next_token))
    }

    /// Tags of the instances the interfaces are attached to, by instance id
    async fn instance_tags(
        &self,
        credential: &ScopedCredential,
        region: &str,
        instance_ids: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Tags>, ProviderError> {
        let mut by_instance: BTreeMap<String, Tags> = BTreeMap::new();
        let ids: Vec<&String> = instance_ids.iter().collect();

        for chunk in ids.chunks(DESCRIBE_TAGS_MAX_IDS) {
            let mut token: Option<String> = None;
            let names: Vec<String> = (1..=chunk.len()).map(|i| format!("Filter.2.Value.{}", i)).collect();
            loop {
                let mut query = vec![
                    ("Action", "DescribeTags".to_string()),
                    ("Version", "2016-11-15".to_string()),
                    ("Filter.1.Name", "resource-type".to_string()),
                    ("Filter.1.Value.1", "instance".to_string()),
                    ("Filter.2.Name", "resource-id".to_string()),
                ];
                query.extend(names.iter().map(String::as_str).zip(chunk.iter().map(|id| (*id).clone())));
                if let Some(token) = token.take() {
                    query.push(("NextToken", token));
                }
                let body = self
                    .client
                    .get(
                        credential,
                        &AwsRequest {
                            service: "ec2",
                            region,
                            path: "/",
                            query,
                            resource_type: NETWORK_INTERFACE,
                        },
                    )
                    .await?;
                let parsed: DescribeTagsResponse = parse_xml(NETWORK_INTERFACE, region, &body)?;
                for tag in parsed.tags.items {
                    by_instance.entry(tag.resource_id).or_default().insert(tag.key, tag.value);
                }
                match parsed.next_token.filter(|t| !t.is_empty()) {
                    Some(next) => token = Some(next),
                    None => break,
                }
            }
        }
        Ok(by_instance)
    }
}

impl ResourceEnumerator for NetworkInterfaces {
    fn resource_type(&self) -> &str {
        NETWORK_INTERFACE
    }

    fn service(&self) -> &str {
        "ENI"
    }

    fn list<'a>(
        &'a self,
        credential: &'a ScopedCredential,
        region: &'a str,
    ) -> BoxStream<'a, Result<RawResource, ProviderError>> {
        paginate(move |token| self.page(credential, region, token))
    }
}

// ---------------------------------------------------------------------------
// ELB (classic + v2)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DescribeClassicResponse {
    #[serde(rename = "DescribeLoadBalancersResult")]
    result: DescribeClassicResult,
}

#[derive(Debug, Deserialize)]
struct DescribeClassicResult {
    #[serde(rename = "LoadBalancerDescriptions", default)]
    load_balancers: Members<ClassicLoadBalancer>,
    #[serde(rename = "NextMarker", default)]
    next_marker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClassicLoadBalancer {
    #[serde(rename = "LoadBalancerName")]
    name: String,
    #[serde(rename = "DNSName", default)]
    dns_name: Option<String>,
    #[serde(rename = "Scheme", default)]
    scheme: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DescribeV2Response {
    #[serde(rename = "DescribeLoadBalancersResult")]
    result: DescribeV2Result,
}

#[derive(Debug, Deserialize)]
struct DescribeV2Result {
    #[serde(rename = "LoadBalancers", default)]
    load_balancers: Members<LoadBalancerV2>,
    #[serde(rename = "NextMarker", default)]
    next_marker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoadBalancerV2 {
    #[serde(rename = "LoadBalancerArn")]
    arn: String,
    #[serde(rename = "DNSName", default)]
    dns_name: Option<String>,
    #[serde(rename = "Scheme", default)]
    scheme: Option<String>,
}

/// Normalized load balancer, whichever API generation it came from
fn load_balancer(id: String, dns_name: Option<String>, scheme: Option<String>) -> Option<RawResource> {
    if scheme.as_deref() == Some("internal") {
        return None;
    }
    let dns_name = dns_name?;
    Some(RawResource::new(id).with_domain(dns_name))
}

pub struct LoadBalancers {
    client: AwsClient,
}

impl LoadBalancers {
    pub fn new(client: AwsClient) -> Self {
        Self { client }
    }

    async fn query(
        &self,
        credential: &ScopedCredential,
        region: &str,
        version: &str,
        marker: Option<String>,
    ) -> Result<String, ProviderError> {
        let mut query = vec![
            ("Action", "DescribeLoadBalancers".to_string()),
            ("Version", version.to_string()),
        ];
        if let Some(marker) = marker {
            query.push(("Marker", marker));
        }
        self.client
            .get(
                credential,
                &AwsRequest {
                    service: "elasticloadbalancing",
                    region,
                    path: "/",
                    query,
                    resource_type: ELB,
                },
            )
            .await
    }

    async fn classic_page(
        &self,
        credential: &ScopedCredential,
        region: &str,
        marker: Option<String>,
    ) -> Result<Page, ProviderError> {
        let body = self.query(credential, region, "2012-06-01", marker).await?;
        let parsed: DescribeClassicResponse = parse_xml(ELB, region, &body)?;
        let items = parsed
            .result
            .load_balancers
            .members
            .into_iter()
            .filter_map(|lb| load_balancer(lb.name, lb.dns_name, lb.scheme))
            .collect();
        Ok(Page::new(items, parsed.result.next_marker))
    }

    async fn v2_page(
        &self,
        credential: &ScopedCredential,
        region: &str,
        marker: Option<String>,
    ) -> Result<Page, ProviderError> {
        let body = self.query(credential, region, "2015-12-01", marker).await?;
        let parsed: DescribeV2Response = parse_xml(ELB, region, &body)?;
        let items = parsed
            .result
            .load_balancers
            .members
            .into_iter()
            .filter_map(|lb| load_balancer(lb.arn, lb.dns_name, lb.scheme))
            .collect();
        Ok(Page::new(items, parsed.result.next_marker))
    }
}

impl ResourceEnumerator for LoadBalancers {
    fn resource_type(&self) -> &str {
        ELB
    }

    fn service(&self) -> &str {
        "ELB"
    }

    fn list<'a>(
        &'a self,
        credential: &'a ScopedCredential,
        region: &'a str,
    ) -> BoxStream<'a, Result<RawResource, ProviderError>> {
        paginate(move |marker| self.classic_page(credential, region, marker))
            .chain(paginate(move |marker| self.v2_page(credential, region, marker)))
            .boxed()
    }
}

// ---------------------------------------------------------------------------
// API Gateway (REST v1 + HTTP/WebSocket v2)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RestApis {
    #[serde(default)]
    item: Vec<RestApi>,
    position: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RestApi {
    id: String,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct HttpApis {
    #[serde(default)]
    items: Vec<HttpApi>,
    #[serde(rename = "nextToken")]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HttpApi {
    #[serde(rename = "apiId")]
    id: String,
    #[serde(rename = "apiEndpoint")]
    endpoint: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

pub struct ApiGateways {
    client: AwsClient,
}

impl ApiGateways {
    pub fn new(client: AwsClient) -> Self {
        Self { client }
    }

    async fn rest_page(
        &self,
        credential: &ScopedCredential,
        region: &str,
        position: Option<String>,
    ) -> Result<Page, ProviderError> {
        let mut query = vec![("limit", "500".to_string())];
        if let Some(position) = position {
            query.push(("position", position));
        }
        let body = self
            .client
            .get(
                credential,
                &AwsRequest {
                    service: "apigateway",
                    region,
                    path: "/restapis",
                    query,
                    resource_type: API_GATEWAY,
                },
            )
            .await?;
        let parsed: RestApis = parse_json(API_GATEWAY, region, &body)?;
        let items = parsed
            .item
            .into_iter()
            .map(|api| {
                let domain = format!("{}.execute-api.{}.amazonaws.com", api.id, region);
                RawResource::new(api.id).with_domain(domain).with_tags(api.tags)
            })
            .collect();
        Ok(Page::new(items, parsed.position))
    }

    async fn http_page(
        &self,
        credential: &ScopedCredential,
        region: &str,
        token: Option<String>,
    ) -> Result<Page, ProviderError> {
        let mut query = vec![("maxResults", "500".to_string())];
        if let Some(token) = token {
            query.push(("nextToken", token));
        }
        let body = self
            .client
            .get(
                credential,
                &AwsRequest {
                    service: "apigateway",
                    region,
                    path: "/v2/apis",
                    query,
                    resource_type: API_GATEWAY,
                },
            )
            .await?;
        let parsed: HttpApis = parse_json(API_GATEWAY, region, &body)?;
        let items = parsed
            .items
            .into_iter()
            .filter_map(|api| {
                let endpoint = api.endpoint?;
                Some(RawResource::new(api.id).with_domain(endpoint).with_tags(api.tags))
            })
            .collect();
        Ok(Page::new(items, parsed.next_token))
    }
}

impl ResourceEnumerator for ApiGateways {
    fn resource_type(&self) -> &str {
        API_GATEWAY
    }

    fn service(&self) -> &str {
        "API Gateway"
    }

    fn list<'a>(
        &'a self,
        credential: &'a ScopedCredential,
        region: &'a str,
    ) -> BoxStream<'a, Result<RawResource, ProviderError>> {
        paginate(move |position| self.rest_page(credential, region, position))
            .chain(paginate(move |token| self.http_page(credential, region, token)))
            .boxed()
    }
}

// ---------------------------------------------------------------------------
// RDS
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DescribeDbInstancesResponse {
    #[serde(rename = "DescribeDBInstancesResult")]
    result: DescribeDbInstancesResult,
}

#[derive(Debug, Deserialize)]
struct DescribeDbInstancesResult {
    #[serde(rename = "DBInstances", default)]
    instances: DbInstanceList,
    #[serde(rename = "Marker", default)]
    marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DbInstanceList {
    #[serde(rename = "DBInstance", default)]
    items: Vec<DbInstance>,
}

#[derive(Debug, Deserialize)]
struct DbInstance {
    #[serde(rename = "DBInstanceIdentifier")]
    id: String,
    #[serde(rename = "PubliclyAccessible", default)]
    publicly_accessible: bool,
    #[serde(rename = "Endpoint")]
    endpoint: Option<DbEndpoint>,
    #[serde(rename = "TagList", default)]
    tags: TagList,
}

#[derive(Debug, Deserialize)]
struct DbEndpoint {
    #[serde(rename = "Address")]
    address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TagList {
    #[serde(rename = "Tag", default)]
    tags: Vec<QueryTag>,
}

#[derive(Debug, Deserialize)]
struct QueryTag {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value", default)]
    value: String,
}

pub struct DbInstances {
    client: AwsClient,
}

impl DbInstances {
    pub fn new(client: AwsClient) -> Self {
        Self { client }
    }

    async fn page(
        &self,
        credential: &ScopedCredential,
        region: &str,
        marker: Option<String>,
    ) -> Result<Page, ProviderError> {
        let mut query = vec![
            ("Action", "DescribeDBInstances".to_string()),
            ("Version", "2014-10-31".to_string()),
        ];
        if let Some(marker) = marker {
            query.push(("Marker", marker));
        }
        let body = self
            .client
            .get(
                credential,
                &AwsRequest {
                    service: "rds",
                    region,
                    path: "/",
                    query,
                    resource_type: RDS,
                },
            )
            .await?;
        let parsed: DescribeDbInstancesResponse = parse_xml(RDS, region, &body)?;
        let items = parsed
            .result
            .instances
            .items
            .into_iter()
            .filter(|db| db.publicly_accessible)
            .filter_map(|db| {
                let address = db.endpoint.and_then(|e| e.address)?;
                let tags = db.tags.tags.into_iter().map(|t| (t.key, t.value)).collect();
                Some(RawResource::new(db.id).with_domain(address).with_tags(tags))
            })
            .collect();
        Ok(Page::new(items, parsed.result.marker))
    }
}

impl ResourceEnumerator for DbInstances {
    fn resource_type(&self) -> &str {
        RDS
    }

    fn service(&self) -> &str {
        "RDS"
    }

    fn list<'a>(
        &'a self,
        credential: &'a ScopedCredential,
        region: &'a str,
    ) -> BoxStream<'a, Result<RawResource, ProviderError>> {
        paginate(move |marker| self.page(credential, region, marker))
    }
}

// ---------------------------------------------------------------------------
// Route53 hosted zones
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListHostedZonesResponse {
    #[serde(rename = "HostedZones", default)]
    zones: HostedZoneList,
    #[serde(rename = "IsTruncated", default)]
    is_truncated: bool,
    #[serde(rename = "NextMarker", default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct HostedZoneList {
    #[serde(rename = "HostedZone", default)]
    items: Vec<HostedZone>,
}

#[derive(Debug, Deserialize)]
struct HostedZone {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Config")]
    config: Option<HostedZoneConfig>,
}

#[derive(Debug, Deserialize)]
struct HostedZoneConfig {
    #[serde(rename = "PrivateZone", default)]
    private_zone: bool,
}

#[derive(Debug, Deserialize)]
struct ListRecordSetsResponse {
    #[serde(rename = "ResourceRecordSets", default)]
    record_sets: RecordSets,
    #[serde(rename = "IsTruncated", default)]
    is_truncated: bool,
    #[serde(rename = "NextRecordName")]
    next_record_name: Option<String>,
    #[serde(rename = "NextRecordType")]
    next_record_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RecordSets {
    #[serde(rename = "ResourceRecordSet", default)]
    items: Vec<RecordSet>,
}

#[derive(Debug, Deserialize)]
struct RecordSet {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Type")]
    record_type: String,
    #[serde(rename = "ResourceRecords", default)]
    records: ResourceRecords,
}

#[derive(Debug, Default, Deserialize)]
struct ResourceRecords {
    #[serde(rename = "ResourceRecord", default)]
    items: Vec<ResourceRecord>,
}

#[derive(Debug, Deserialize)]
struct ResourceRecord {
    #[serde(rename = "Value")]
    value: String,
}

const RECORD_TYPES: &[&str] = &["A", "AAAA", "CNAME"];

/// Public hosted zones and their address records. Listed once per account.
pub struct HostedZones {
    client: AwsClient,
}

impl HostedZones {
    pub fn new(client: AwsClient) -> Self {
        Self { client }
    }

    async fn zones_page(
        &self,
        credential: &ScopedCredential,
        region: &str,
        marker: Option<String>,
    ) -> Result<Page, ProviderError> {
        let query = marker.map(|m| vec![("marker", m)]).unwrap_or_default();
        let body = self
            .client
            .get(
                credential,
                &AwsRequest {
                    service: "route53",
                    region,
                    path: "/2013-04-01/hostedzone",
                    query,
                    resource_type: ROUTE53,
                },
            )
            .await?;
        let parsed: ListHostedZonesResponse = parse_xml(ROUTE53, region, &body)?;

        let mut items = Vec::new();
        for zone in parsed.zones.items {
            if zone.config.map_or(false, |c| c.private_zone) {
                continue;
            }
            let zone_id = zone.id.trim_start_matches("/hostedzone/").to_string();
            let mut resource = RawResource::new(zone_id.clone()).with_domain(zone.name.trim_end_matches('.'));
            for record in self.records(credential, region, &zone_id).await? {
                resource.domains.push(record.name.trim_end_matches('.').to_string());
                if record.record_type != "CNAME" {
                    resource.ips.extend(record.records.items.into_iter().map(|r| r.value));
                }
            }
            items.push(resource);
        }

        let next = if parsed.is_truncated { parsed.next_marker } else { None };
        Ok(Page::new(items, next))
    }

    /// Address and alias records of one zone, all pages
    async fn records(
        &self,
        credential: &ScopedCredential,
        region: &str,
        zone_id: &str,
    ) -> Result<Vec<RecordSet>, ProviderError> {
        let path = format!("/2013-04-01/hostedzone/{}/rrset", zone_id);
        let mut records = Vec::new();
        let mut start: Option<(String, String)> = None;

        loop {
            let query = match &start {
                Some((name, record_type)) => vec![("name", name.clone()), ("type", record_type.clone())],
                None => Vec::new(),
            };
            let body = self
                .client
                .get(
                    credential,
                    &AwsRequest {
                        service: "route53",
                        region,
                        path: &path,
                        query,
                        resource_type: ROUTE53,
                    },
                )
                .await?;
            let parsed: ListRecordSetsResponse = parse_xml(ROUTE53, region, &body)?;
            records.extend(
                parsed
                    .record_sets
                    .items
                    .into_iter()
                    .filter(|r| RECORD_TYPES.contains(&r.record_type.as_str())),
            );

            match (parsed.is_truncated, parsed.next_record_name, parsed.next_record_type) {
                (true, Some(name), Some(record_type)) => start = Some((name, record_type)),
                _ => break,
            }
        }
        Ok(records)
    }
}

impl ResourceEnumerator for HostedZones {
    fn resource_type(&self) -> &str {
        ROUTE53
    }

    fn service(&self) -> &str {
        "Route53/Zones"
    }

    fn region_scope(&self) -> RegionScope {
        RegionScope::Global
    }

    fn list<'a>(
        &'a self,
        credential: &'a ScopedCredential,
        region: &'a str,
    ) -> BoxStream<'a, Result<RawResource, ProviderError>> {
        paginate(move |marker| self.zones_page(credential, region, marker))
    }
}

// ---------------------------------------------------------------------------
// S3
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListAllMyBucketsResult {
    #[serde(rename = "Buckets", default)]
    buckets: Buckets,
    #[serde(rename = "ContinuationToken")]
    continuation_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Buckets {
    #[serde(rename = "Bucket", default)]
    items: Vec<Bucket>,
}

#[derive(Debug, Deserialize)]
struct Bucket {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct LocationConstraint {
    #[serde(rename = "$text", default)]
    region: String,
}

pub fn bucket_url(bucket: &str, region: &str) -> String {
    format!("https://{}.s3.{}.amazonaws.com", bucket, region)
}

/// Buckets in the account, each labelled with its own region
pub struct StorageBuckets {
    client: AwsClient,
    account_id: String,
}

impl StorageBuckets {
    pub fn new(client: AwsClient, account_id: impl Into<String>) -> Self {
        Self {
            client,
            account_id: account_id.into(),
        }
    }

    async fn page(
        &self,
        credential: &ScopedCredential,
        region: &str,
        token: Option<String>,
    ) -> Result<Page, ProviderError> {
        let query = token
            .map(|t| vec![("continuation-token", t)])
            .unwrap_or_default();
        let body = self
            .client
            .get(
                credential,
                &AwsRequest {
                    service: "s3",
                    region,
                    path: "/",
                    query,
                    resource_type: S3,
                },
            )
            .await?;
        let parsed: ListAllMyBucketsResult = parse_xml(S3, region, &body)?;

        let mut items = Vec::new();
        for bucket in parsed.buckets.items {
            let bucket_region = self.bucket_region(credential, region, &bucket.name).await?;
            let label_region = bucket_region.to_lowercase();
            let asset = CloudAssetCandidate {
                provider: ProviderKind::Aws,
                account_id: self.account_id.clone(),
                bucket: bucket.name.clone(),
                region: label_region.clone(),
                url: bucket_url(&bucket.name, &label_region),
                public_access: None,
                tags: Tags::new(),
            };
            let mut resource = RawResource::new(bucket.name).with_region(label_region);
            resource.buckets.push(asset);
            items.push(resource);
        }
        Ok(Page::new(items, parsed.continuation_token))
    }

    async fn bucket_region(
        &self,
        credential: &ScopedCredential,
        region: &str,
        bucket: &str,
    ) -> Result<String, ProviderError> {
        let path = format!("/{}", bucket);
        let body = self
            .client
            .get(
                credential,
                &AwsRequest {
                    service: "s3",
                    region,
                    path: &path,
                    query: vec![("location", String::new())],
                    resource_type: S3,
                },
            )
            .await?;
        let parsed: LocationConstraint = parse_xml(S3, region, &body)?;
        // Legacy buckets report an empty constraint
        Ok(match parsed.region.trim() {
            "" => "us-east-1".to_string(),
            "EU" => "eu-west-1".to_string(),
            other => other.to_string(),
        })
    }
}

impl ResourceEnumerator for StorageBuckets {
    fn resource_type(&self) -> &str {
        S3
    }

    fn service(&self) -> &str {
        "S3"
    }

    fn region_scope(&self) -> RegionScope {
        RegionScope::Global
    }

    fn list<'a>(
        &'a self,
        credential: &'a ScopedCredential,
        region: &'a str,
    ) -> BoxStream<'a, Result<RawResource, ProviderError>> {
        paginate(move |token| self.page(credential, region, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::credentials::AwsKeys;
    use crate::connectors::list_filtered;
    use crate::retry::RetryPolicy;
    use futures::TryStreamExt;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_network_interfaces() {
        let xml = r#"<DescribeNetworkInterfacesResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
  <requestId>1</requestId>
  <networkInterfaceSet>
    <item>
      <networkInterfaceId>eni-1</networkInterfaceId>
      <privateIpAddressesSet>
        <item>
          <privateIpAddress>10.0.0.1</privateIpAddress>
          <association><publicIp>3.3.3.3</publicIp></association>
        </item>
        <item><privateIpAddress>10.0.0.2</privateIpAddress></item>
      </privateIpAddressesSet>
      <ipv6AddressesSet/>
      <tagSet>
        <item><key>env</key><value>prod</value></item>
      </tagSet>
    </item>
  </networkInterfaceSet>
  <nextToken>abc</nextToken>
</DescribeNetworkInterfacesResponse>"#;

        let parsed: DescribeNetworkInterfacesResponse = parse_xml(NETWORK_INTERFACE, "us-east-1", xml).unwrap();
        assert_eq!(parsed.next_token.as_deref(), Some("abc"));
        let eni = &parsed.interfaces.items[0];
        assert_eq!(eni.id, "eni-1");
        assert_eq!(eni.private_ips.items.len(), 2);
        assert_eq!(
            eni.private_ips.items[0]
                .association
                .as_ref()
                .and_then(|a| a.public_ip.as_deref()),
            Some("3.3.3.3")
        );
        assert_eq!(eni.tags.items[0].key, "env");
    }

    #[tokio::test]
    async fn test_instance_ignore_tag_reaches_interface_and_ipv6_only_is_kept() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(query_param("Action", "DescribeNetworkInterfaces"))
            .and(query_param_is_missing("Filter.1.Name"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<DescribeNetworkInterfacesResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
  <networkInterfaceSet>
    <item>
      <networkInterfaceId>eni-web</networkInterfaceId>
      <privateIpAddressesSet>
        <item><privateIpAddress>10.0.0.1</privateIpAddress><association><publicIp>3.3.3.3</publicIp></association></item>
      </privateIpAddressesSet>
      <attachment><instanceId>i-web</instanceId></attachment>
    </item>
    <item>
      <networkInterfaceId>eni-v6</networkInterfaceId>
      <privateIpAddressesSet><item><privateIpAddress>10.0.0.2</privateIpAddress></item></privateIpAddressesSet>
      <ipv6AddressesSet><item><ipv6Address>2600:1f18::1</ipv6Address></item></ipv6AddressesSet>
      <attachment><instanceId>i-v6</instanceId></attachment>
    </item>
    <item>
      <networkInterfaceId>eni-private</networkInterfaceId>
      <privateIpAddressesSet><item><privateIpAddress>10.0.0.3</privateIpAddress></item></privateIpAddressesSet>
      <attachment><instanceId>i-private</instanceId></attachment>
    </item>
  </networkInterfaceSet>
</DescribeNetworkInterfacesResponse>"#,
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(query_param("Action", "DescribeTags"))
            .and(query_param("Filter.1.Value.1", "instance"))
            .and(query_param("Filter.2.Value.1", "i-v6"))
            .and(query_param("Filter.2.Value.2", "i-web"))
            .and(query_param_is_missing("Filter.2.Value.3"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<DescribeTagsResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
  <tagSet>
    <item><resourceId>i-web</resourceId><resourceType>instance</resourceType><key>censys-cloud-connector-ignore</key><value>true</value></item>
    <item><resourceId>i-v6</resourceId><resourceType>instance</resourceType><key>team</key><value>edge</value></item>
  </tagSet>
</DescribeTagsResponse>"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = AwsClient::new(
            reqwest::Client::new(),
            Some(server.uri()),
            RetryPolicy::new(2, Duration::from_millis(1)),
        );
        let enumerator = NetworkInterfaces::new(client);
        let credential = ScopedCredential::aws(
            AwsKeys {
                access_key_id: "AKIDEXAMPLE".into(),
                secret_access_key: "secret".into(),
                session_token: None,
            },
            Duration::from_secs(3600),
        );
        let ignore_tags = vec!["censys-cloud-connector-ignore".to_string()];
        let resources: Vec<RawResource> = list_filtered(&enumerator, &credential, "us-east-1", &ignore_tags)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(resources.len(), 2);
        let web = resources.iter().find(|r| r.id == "eni-web").unwrap();
        assert!(web.ignored);
        assert_eq!(web.ips, vec!["3.3.3.3".to_string()]);

        let v6 = resources.iter().find(|r| r.id == "eni-v6").unwrap();
        assert!(!v6.ignored);
        assert_eq!(v6.ips, vec!["2600:1f18::1".to_string()]);
        assert_eq!(v6.tags.get("team").map(String::as_str), Some("edge"));
    }

    #[test]
    fn test_parse_classic_and_v2_load_balancers() {
        let classic = r#"<DescribeLoadBalancersResponse>
  <DescribeLoadBalancersResult>
    <LoadBalancerDescriptions>
      <member><LoadBalancerName>web</LoadBalancerName><DNSName>web-1.elb.amazonaws.com</DNSName><Scheme>internet-facing</Scheme></member>
      <member><LoadBalancerName>int</LoadBalancerName><DNSName>internal-int.elb.amazonaws.com</DNSName><Scheme>internal</Scheme></member>
    </LoadBalancerDescriptions>
  </DescribeLoadBalancersResult>
</DescribeLoadBalancersResponse>"#;
        let parsed: DescribeClassicResponse = parse_xml(ELB, "us-east-1", classic).unwrap();
        let resources: Vec<_> = parsed
            .result
            .load_balancers
            .members
            .into_iter()
            .filter_map(|lb| load_balancer(lb.name, lb.dns_name, lb.scheme))
            .collect();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].domains, vec!["web-1.elb.amazonaws.com".to_string()]);

        let v2 = r#"<DescribeLoadBalancersResponse>
  <DescribeLoadBalancersResult>
    <LoadBalancers>
      <member><LoadBalancerArn>arn:alb</LoadBalancerArn><DNSName>alb.elb.amazonaws.com</DNSName><Scheme>internet-facing</Scheme></member>
    </LoadBalancers>
    <NextMarker>m2</NextMarker>
  </DescribeLoadBalancersResult>
</DescribeLoadBalancersResponse>"#;
        let parsed: DescribeV2Response = parse_xml(ELB, "us-east-1", v2).unwrap();
        assert_eq!(parsed.result.next_marker.as_deref(), Some("m2"));
        assert_eq!(parsed.result.load_balancers.members[0].arn, "arn:alb");
    }

    #[test]
    fn test_parse_db_instances() {
        let xml = r#"<DescribeDBInstancesResponse>
  <DescribeDBInstancesResult>
    <DBInstances>
      <DBInstance>
        <DBInstanceIdentifier>db-1</DBInstanceIdentifier>
        <PubliclyAccessible>true</PubliclyAccessible>
        <Endpoint><Address>db-1.abc.us-east-1.rds.amazonaws.com</Address><Port>5432</Port></Endpoint>
        <TagList><Tag><Key>team</Key><Value>data</Value></Tag></TagList>
      </DBInstance>
      <DBInstance>
        <DBInstanceIdentifier>db-2</DBInstanceIdentifier>
        <PubliclyAccessible>false</PubliclyAccessible>
      </DBInstance>
    </DBInstances>
  </DescribeDBInstancesResult>
</DescribeDBInstancesResponse>"#;
        let parsed: DescribeDbInstancesResponse = parse_xml(RDS, "us-east-1", xml).unwrap();
        let instances = parsed.result.instances.items;
        assert_eq!(instances.len(), 2);
        assert!(instances[0].publicly_accessible);
        assert!(!instances[1].publicly_accessible);
        assert_eq!(instances[0].tags.tags[0].key, "team");
    }

    #[test]
    fn test_parse_api_gateway_generations() {
        let v1 = r#"{"item":[{"id":"abc123","name":"orders","tags":{"env":"prod"}}],"position":"next"}"#;
        let parsed: RestApis = parse_json(API_GATEWAY, "us-east-1", v1).unwrap();
        assert_eq!(parsed.item[0].id, "abc123");
        assert_eq!(parsed.position.as_deref(), Some("next"));

        let v2 = r#"{"items":[{"apiId":"xyz","apiEndpoint":"https://xyz.execute-api.us-east-1.amazonaws.com"}]}"#;
        let parsed: HttpApis = parse_json(API_GATEWAY, "us-east-1", v2).unwrap();
        assert_eq!(parsed.items[0].endpoint.as_deref(), Some("https://xyz.execute-api.us-east-1.amazonaws.com"));
        assert!(parsed.next_token.is_none());
    }

    #[test]
    fn test_parse_bucket_location() {
        let xml = r#"<LocationConstraint xmlns="http://s3.amazonaws.com/doc/2006-03-01/">eu-central-1</LocationConstraint>"#;
        let parsed: LocationConstraint = parse_xml(S3, "global", xml).unwrap();
        assert_eq!(parsed.region, "eu-central-1");
        assert_eq!(bucket_url("assets", "eu-central-1"), "https://assets.s3.eu-central-1.amazonaws.com");
    }

    #[test]
    fn test_parse_hosted_zones() {
        let xml = r#"<ListHostedZonesResponse xmlns="https://route53.amazonaws.com/doc/2013-04-01/">
  <HostedZones>
    <HostedZone><Id>/hostedzone/Z1</Id><Name>example.com.</Name><Config><PrivateZone>false</PrivateZone></Config></HostedZone>
    <HostedZone><Id>/hostedzone/Z2</Id><Name>corp.internal.</Name><Config><PrivateZone>true</PrivateZone></Config></HostedZone>
  </HostedZones>
  <IsTruncated>false</IsTruncated>
  <MaxItems>100</MaxItems>
</ListHostedZonesResponse>"#;
        let parsed: ListHostedZonesResponse = parse_xml(ROUTE53, "global", xml).unwrap();
        assert_eq!(parsed.zones.items.len(), 2);
        assert!(!parsed.is_truncated);
        assert!(parsed.zones.items[1].config.as_ref().unwrap().private_zone);
    }

    #[test]
    fn test_parse_record_sets() {
        let xml = r#"<ListResourceRecordSetsResponse xmlns="https://route53.amazonaws.com/doc/2013-04-01/">
  <ResourceRecordSets>
    <ResourceRecordSet>
      <Name>www.example.com.</Name><Type>A</Type><TTL>300</TTL>
      <ResourceRecords><ResourceRecord><Value>3.3.3.3</Value></ResourceRecord></ResourceRecords>
    </ResourceRecordSet>
    <ResourceRecordSet>
      <Name>example.com.</Name><Type>MX</Type><TTL>300</TTL>
      <ResourceRecords><ResourceRecord><Value>10 mail.example.com</Value></ResourceRecord></ResourceRecords>
    </ResourceRecordSet>
  </ResourceRecordSets>
  <IsTruncated>true</IsTruncated>
  <NextRecordName>zz.example.com.</NextRecordName>
  <NextRecordType>A</NextRecordType>
</ListResourceRecordSetsResponse>"#;
        let parsed: ListRecordSetsResponse = parse_xml(ROUTE53, "global", xml).unwrap();
        assert!(parsed.is_truncated);
        assert_eq!(parsed.next_record_name.as_deref(), Some("zz.example.com."));
        let a = &parsed.record_sets.items[0];
        assert_eq!(a.record_type, "A");
        assert_eq!(a.records.items[0].value, "3.3.3.3");
    }
}
