//! Connector Types
//!
//! Core types shared by enumerators, the aggregator and the submission
//! client: provider identity, labels, seeds and cloud assets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cloud provider identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Aws,
    Azure,
    Gcp,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [ProviderKind::Aws, ProviderKind::Azure, ProviderKind::Gcp];

    /// Upper-case form used in labels and `cspLabel`.
    pub fn label(&self) -> &'static str {
        match self {
            ProviderKind::Aws => "AWS",
            ProviderKind::Azure => "AZURE",
            ProviderKind::Gcp => "GCP",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Aws => write!(f, "aws"),
            ProviderKind::Azure => write!(f, "azure"),
            ProviderKind::Gcp => write!(f, "gcp"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(ProviderKind::Aws),
            "azure" => Ok(ProviderKind::Azure),
            "gcp" => Ok(ProviderKind::Gcp),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// Scoping key for submissions: `(provider, account, region, service)`.
///
/// Account and region are lowercased on construction so the same scope
/// produces the same label on every cycle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub provider: ProviderKind,
    pub account_id: String,
    pub region: String,
    pub service: String,
}

impl Label {
    pub const GLOBAL_REGION: &'static str = "global";

    pub fn new(provider: ProviderKind, account_id: &str, region: &str, service: &str) -> Self {
        Self {
            provider,
            account_id: account_id.trim().to_lowercase(),
            region: region.trim().to_lowercase(),
            service: service.to_string(),
        }
    }
}

/// Wire form, e.g. `AWS: RDS - 123456789012/us-east-1`.
impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} - {}/{}",
            self.provider.label(),
            self.service,
            self.account_id,
            self.region
        )
    }
}

/// Seed kind as understood by the inventory API
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SeedKind {
    #[serde(rename = "IP_ADDRESS")]
    Ip,
    #[serde(rename = "DOMAIN_NAME")]
    Domain,
}

/// A normalized seed as sent to the inventory API
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Seed {
    #[serde(rename = "type")]
    pub kind: SeedKind,
    pub value: String,
}

/// Tags attached to a cloud resource
pub type Tags = BTreeMap<String, String>;

/// Seed sighting before dedup
#[derive(Debug, Clone)]
pub struct SeedCandidate {
    pub kind: SeedKind,
    pub value: String,
    pub label: Label,
    /// Cross-label dedup key. The first label to claim it keeps the seed.
    pub uniqueness_key: Option<String>,
    pub tags: Tags,
}

/// Public storage container discovered in an account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudAssetCandidate {
    pub provider: ProviderKind,
    pub account_id: String,
    pub bucket: String,
    pub region: String,
    /// Public URL of the container, sent as the asset value.
    pub url: String,
    pub public_access: Option<String>,
    pub tags: Tags,
}

impl CloudAssetCandidate {
    pub fn dedup_key(&self) -> (ProviderKind, String, String) {
        (self.provider, self.account_id.to_lowercase(), self.bucket.clone())
    }
}

/// Cloud asset wire form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudAsset {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(rename = "cspLabel")]
    pub csp_label: String,
    /// JSON document encoded as a string.
    #[serde(rename = "scanData")]
    pub scan_data: String,
}

impl From<&CloudAssetCandidate> for CloudAsset {
    fn from(candidate: &CloudAssetCandidate) -> Self {
        let scan_data = serde_json::json!({
            "accountNumber": candidate.account_id,
            "publicAccess": candidate.public_access,
            "location": candidate.region,
        });
        Self {
            kind: "OBJECT_STORAGE".to_string(),
            value: candidate.url.clone(),
            csp_label: candidate.provider.label().to_string(),
            scan_data: scan_data.to_string(),
        }
    }
}

/// One resource returned by an enumerator, already normalized across API
/// versions. A resource may expose several addresses.
#[derive(Debug, Clone, Default)]
pub struct RawResource {
    pub id: String,
    /// Location the resource reports, if different from the listing region.
    pub region: Option<String>,
    pub ips: Vec<String>,
    pub domains: Vec<String>,
    pub buckets: Vec<CloudAssetCandidate>,
    pub tags: Tags,
    pub uniqueness_key: Option<String>,
    /// Set by the ignore-tag filter. Ignored resources are still reported so
    /// the aggregator can keep the ignore sticky.
    pub ignored: bool,
}

impl RawResource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ips.push(ip.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domains.push(domain.into());
        self
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.domains.is_empty() && self.buckets.is_empty()
    }
}
