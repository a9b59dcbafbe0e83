//! Resource tag publishing
//!
//! Opt-in through `AWS_TAGS_PLUGIN_ENABLED`. Once an AWS label is submitted,
//! the cloud tags found on its resources are attached to the matching
//! inventory assets as `Key: Value` tags. Publishing is best effort: a
//! failed tag is logged and never changes a label's status.

use futures::future::join_all;
use reqwest::header::HeaderMap;
use reqwest::Method;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::client::api_headers;
use super::report::{LabelStatus, SubmissionReport};
use crate::config::Settings;
use crate::engine::aggregator::ScanResult;
use crate::error::{ConnectorError, SubmissionError};
use crate::retry::RetryPolicy;
use crate::types::{Label, ProviderKind, SeedKind, Tags};

/// Inventory asset a tag is attached to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TagTarget {
    Host(String),
    Domain(String),
    /// Object storage keyed by bucket URL
    ObjectStorage(String),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TagSummary {
    pub published: usize,
    pub failed: usize,
}

fn format_tag(key: &str, value: &str) -> String {
    format!("{}: {}", key, value)
}

/// Every `(target, tag)` pair of the submitted AWS labels, deduplicated.
pub fn plan_tags(result: &ScanResult, report: &SubmissionReport) -> BTreeSet<(TagTarget, String)> {
    let submitted = |label: &Label| {
        label.provider == ProviderKind::Aws
            && matches!(report.status(label), Some(LabelStatus::Submitted { .. }))
    };
    let pairs = |target: TagTarget, tags: &Tags| {
        tags.iter()
            .map(move |(key, value)| (target.clone(), format_tag(key, value)))
            .collect::<Vec<_>>()
    };

    let mut planned = BTreeSet::new();
    for (_, seeds) in result.seeds.iter().filter(|(label, _)| submitted(label)) {
        for seed in seeds {
            let target = match seed.kind {
                SeedKind::Ip => TagTarget::Host(seed.value.clone()),
                SeedKind::Domain => TagTarget::Domain(seed.value.clone()),
            };
            planned.extend(pairs(target, &seed.tags));
        }
    }
    for (_, assets) in result.assets.iter().filter(|(label, _)| submitted(label)) {
        for asset in assets {
            planned.extend(pairs(TagTarget::ObjectStorage(asset.url.clone()), &asset.tags));
        }
    }
    planned
}

pub struct TagPublisher {
    http: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    enabled: bool,
}

impl TagPublisher {
    /// Disabled in dry runs and when `AWS_TAGS_PLUGIN_ENABLED` is off.
    pub fn new(http: reqwest::Client, settings: &Settings, retry: RetryPolicy) -> Result<Self, ConnectorError> {
        Ok(Self {
            http,
            base_url: settings.censys_asm_api_base_url.trim_end_matches('/').to_string(),
            headers: api_headers(settings)?,
            retry,
            permits: Arc::new(Semaphore::new(settings.submission_concurrency.max(1))),
            enabled: settings.aws_tags_plugin_enabled && !settings.dry_run,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Attach the tags of every submitted AWS label.
    pub async fn publish(&self, result: &ScanResult, report: &SubmissionReport) -> TagSummary {
        if !self.enabled {
            return TagSummary::default();
        }
        let planned = plan_tags(result, report);
        let calls = planned.iter().map(|(target, tag)| async move {
            let outcome = self.add_tag(target, tag).await;
            if let Err(e) = &outcome {
                warn!(asset = ?target, tag = %tag, error = %e, "Failed to publish tag");
            }
            outcome.is_ok()
        });

        let mut summary = TagSummary::default();
        for ok in join_all(calls).await {
            if ok {
                summary.published += 1;
            } else {
                summary.failed += 1;
            }
        }
        info!(published = summary.published, failed = summary.failed, "Resource tags published");
        summary
    }

    pub async fn add_tag(&self, target: &TagTarget, tag: &str) -> Result<(), SubmissionError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| SubmissionError::Unavailable(e.to_string()))?;

        match target {
            TagTarget::Host(ip) => self.post_tag(&format!("v1/assets/hosts/{}", ip), tag).await,
            TagTarget::Domain(domain) => {
                match self.post_tag(&format!("v1/assets/domains/{}", domain), tag).await {
                    Err(SubmissionError::Rejected { status: 404, .. }) => self.add_subdomain_tag(domain, tag).await,
                    other => other,
                }
            }
            TagTarget::ObjectStorage(url) => {
                let key = urlencoding::encode(&format!("{}/", url)).into_owned();
                self.post_tag(&format!("beta/assets/object-storages/{}", key), tag)
                    .await
            }
        }
    }

    /// Tag `domain` as a subdomain of the closest parent the inventory
    /// knows. Gives up silently once only a top-level domain is left.
    async fn add_subdomain_tag(&self, domain: &str, tag: &str) -> Result<(), SubmissionError> {
        let mut parent = domain;
        loop {
            match self
                .call(Method::GET, &format!("v1/assets/domains/{}", parent), None)
                .await
            {
                Ok(()) => break,
                Err(SubmissionError::Rejected { status: 404, .. }) => match parent.split_once('.') {
                    Some((_, rest)) if rest.contains('.') => parent = rest,
                    _ => {
                        debug!(domain, "No parent domain in inventory, skipping tag");
                        return Ok(());
                    }
                },
                Err(e) => return Err(e),
            }
        }
        self.post_tag(&format!("v1/assets/domains/{}/subdomains/{}", parent, domain), tag)
            .await
    }

    async fn post_tag(&self, asset: &str, tag: &str) -> Result<(), SubmissionError> {
        let body = serde_json::json!({ "name": tag });
        self.call(Method::POST, &format!("{}/tags", asset), Some(&body))
            .await
    }

    async fn call(&self, method: Method, path: &str, body: Option<&serde_json::Value>) -> Result<(), SubmissionError> {
        let url = format!("{}/{}", self.base_url, path);
        let operation = format!("{} {}", method, path);
        self.retry
            .execute(&operation, || self.send(&method, &url, body))
            .await
    }

    async fn send(&self, method: &Method, url: &str, body: Option<&serde_json::Value>) -> Result<(), SubmissionError> {
        let mut request = self.http.request(method.clone(), url).headers(self.headers.clone());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SubmissionError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SubmissionError::from_response(status, None, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CloudAssetCandidate, SeedCandidate};
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn label(service: &str) -> Label {
        Label::new(ProviderKind::Aws, "123456789012", "us-east-1", service)
    }

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn seed(label: &Label, kind: SeedKind, value: &str, tags: Tags) -> SeedCandidate {
        SeedCandidate {
            kind,
            value: value.into(),
            label: label.clone(),
            uniqueness_key: None,
            tags,
        }
    }

    fn submitted(labels: &[&Label]) -> SubmissionReport {
        let mut report = SubmissionReport::default();
        for label in labels {
            report.record(
                (*label).clone(),
                LabelStatus::Submitted {
                    seeds: 1,
                    assets: 0,
                    batches: 1,
                },
            );
        }
        report
    }

    fn publisher(base: &str) -> TagPublisher {
        let settings = Settings {
            censys_api_key: Some("key".into()),
            censys_asm_api_base_url: base.to_string(),
            aws_tags_plugin_enabled: true,
            ..Settings::default()
        };
        TagPublisher::new(reqwest::Client::new(), &settings, RetryPolicy::new(2, Duration::from_millis(1))).unwrap()
    }

    #[test]
    fn test_plan_covers_submitted_aws_labels_only() {
        let (eni, rds) = (label("ENI"), label("RDS"));
        let azure = Label::new(ProviderKind::Azure, "sub", "eastus", "Microsoft.Network/publicIPAddresses");
        let mut result = ScanResult::default();
        result.seeds.insert(
            eni.clone(),
            vec![
                seed(&eni, SeedKind::Ip, "3.3.3.3", tags(&[("env", "prod"), ("team", "edge")])),
                seed(&eni, SeedKind::Ip, "3.3.3.4", Tags::new()),
            ],
        );
        result.seeds.insert(
            rds.clone(),
            vec![seed(&rds, SeedKind::Domain, "db.example.com", tags(&[("env", "prod")]))],
        );
        result.seeds.insert(
            azure.clone(),
            vec![seed(&azure, SeedKind::Ip, "4.4.4.4", tags(&[("env", "prod")]))],
        );

        let mut report = submitted(&[&eni, &azure]);
        report.record(rds, LabelStatus::Failed { error: "503".into() });

        let planned: Vec<_> = plan_tags(&result, &report).into_iter().collect();
        assert_eq!(
            planned,
            vec![
                (TagTarget::Host("3.3.3.3".into()), "env: prod".to_string()),
                (TagTarget::Host("3.3.3.3".into()), "team: edge".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_publish_hosts_domains_and_buckets() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/assets/hosts/3.3.3.3/tags"))
            .and(body_json(serde_json::json!({ "name": "env: prod" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        // unknown domain falls back to the closest known parent
        Mock::given(method("POST"))
            .and(path("/v1/assets/domains/api.eu.example.com/tags"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/assets/domains/api.eu.example.com"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/assets/domains/eu.example.com"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/assets/domains/example.com"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/assets/domains/example.com/subdomains/api.eu.example.com/tags"))
            .and(body_json(serde_json::json!({ "name": "env: prod" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(
                "/beta/assets/object-storages/https%3A%2F%2Fassets.s3.amazonaws.com%2F/tags",
            ))
            .and(body_json(serde_json::json!({ "name": "owner: web" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (eni, apis, s3) = (label("ENI"), label("API Gateway"), label("S3"));
        let mut result = ScanResult::default();
        result.seeds.insert(
            eni.clone(),
            vec![seed(&eni, SeedKind::Ip, "3.3.3.3", tags(&[("env", "prod")]))],
        );
        result.seeds.insert(
            apis.clone(),
            vec![seed(&apis, SeedKind::Domain, "api.eu.example.com", tags(&[("env", "prod")]))],
        );
        result.assets.insert(
            s3.clone(),
            vec![CloudAssetCandidate {
                provider: ProviderKind::Aws,
                account_id: "123456789012".into(),
                bucket: "assets".into(),
                region: "us-east-1".into(),
                url: "https://assets.s3.amazonaws.com".into(),
                public_access: None,
                tags: tags(&[("owner", "web")]),
            }],
        );

        let summary = publisher(&server.uri())
            .publish(&result, &submitted(&[&eni, &apis, &s3]))
            .await;
        assert_eq!(summary, TagSummary { published: 3, failed: 0 });
    }

    #[tokio::test]
    async fn test_failed_tag_is_counted_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let eni = label("ENI");
        let mut result = ScanResult::default();
        result.seeds.insert(
            eni.clone(),
            vec![seed(&eni, SeedKind::Ip, "3.3.3.3", tags(&[("env", "prod")]))],
        );
        let summary = publisher(&server.uri()).publish(&result, &submitted(&[&eni])).await;
        assert_eq!(summary, TagSummary { published: 0, failed: 1 });
    }

    #[test]
    fn test_disabled_by_default_and_in_dry_run() {
        let settings = Settings {
            censys_api_key: Some("key".into()),
            ..Settings::default()
        };
        assert!(!TagPublisher::new(reqwest::Client::new(), &settings, RetryPolicy::default())
            .unwrap()
            .is_enabled());

        let settings = Settings {
            aws_tags_plugin_enabled: true,
            dry_run: true,
            ..settings
        };
        assert!(!TagPublisher::new(reqwest::Client::new(), &settings, RetryPolicy::default())
            .unwrap()
            .is_enabled());
    }
}
