//! Inventory API Submission Client
//!
//! Seeds for a label go out as one replace-by-label call followed by add
//! calls for the remaining batches, so a multi-batch label is never
//! overwritten by its own later batches. Batches are cut from value-sorted
//! candidates and a retry resends exactly the same body.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, RETRY_AFTER, USER_AGENT};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use super::report::{LabelStatus, SubmissionReport};
use crate::config::Settings;
use crate::engine::aggregator::ScanResult;
use crate::error::{ConnectorError, SubmissionError};
use crate::retry::RetryPolicy;
use crate::types::{CloudAsset, CloudAssetCandidate, Label, Seed, SeedCandidate};

const API_KEY_HEADER: &str = "censys-api-key";

/// One inventory API call. Never mixes labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionBatch {
    ReplaceSeeds {
        label: Label,
        seeds: Vec<Seed>,
        force: bool,
    },
    AddSeeds {
        label: Label,
        seeds: Vec<Seed>,
    },
    CloudAssets {
        label: Label,
        assets: Vec<CloudAsset>,
    },
}

impl SubmissionBatch {
    /// Empty replacement that removes everything under `label`.
    pub fn clear(label: Label) -> Self {
        SubmissionBatch::ReplaceSeeds {
            label,
            seeds: Vec::new(),
            force: true,
        }
    }

    pub fn label(&self) -> &Label {
        match self {
            SubmissionBatch::ReplaceSeeds { label, .. }
            | SubmissionBatch::AddSeeds { label, .. }
            | SubmissionBatch::CloudAssets { label, .. } => label,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SubmissionBatch::ReplaceSeeds { seeds, .. } | SubmissionBatch::AddSeeds { seeds, .. } => seeds.len(),
            SubmissionBatch::CloudAssets { assets, .. } => assets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split one label's candidates into size-bounded batches.
pub fn plan_batches(
    label: &Label,
    seeds: &[SeedCandidate],
    assets: &[CloudAssetCandidate],
    max_batch_size: usize,
) -> Vec<SubmissionBatch> {
    let max = max_batch_size.max(1);
    let mut sorted: Vec<Seed> = seeds
        .iter()
        .map(|c| Seed {
            kind: c.kind,
            value: c.value.clone(),
        })
        .collect();
    sorted.sort();
    sorted.dedup();

    let mut batches: Vec<SubmissionBatch> = sorted
        .chunks(max)
        .enumerate()
        .map(|(i, chunk)| {
            if i == 0 {
                SubmissionBatch::ReplaceSeeds {
                    label: label.clone(),
                    seeds: chunk.to_vec(),
                    force: false,
                }
            } else {
                SubmissionBatch::AddSeeds {
                    label: label.clone(),
                    seeds: chunk.to_vec(),
                }
            }
        })
        .collect();

    let mut wire: Vec<CloudAsset> = assets.iter().map(CloudAsset::from).collect();
    wire.sort_by(|a, b| a.value.cmp(&b.value));
    batches.extend(wire.chunks(max).map(|chunk| SubmissionBatch::CloudAssets {
        label: label.clone(),
        assets: chunk.to_vec(),
    }));
    batches
}

/// Common inventory API headers.
pub(crate) fn api_headers(settings: &Settings) -> Result<HeaderMap, ConnectorError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&settings.censys_user_agent)
            .map_err(|e| ConnectorError::configuration(format!("invalid CENSYS_USER_AGENT: {}", e)))?,
    );
    if let Some(key) = settings.censys_api_key.as_deref().filter(|k| !k.is_empty()) {
        let mut value = HeaderValue::from_str(key)
            .map_err(|_| ConnectorError::configuration("CENSYS_API_KEY contains invalid characters"))?;
        value.set_sensitive(true);
        headers.insert(HeaderName::from_static(API_KEY_HEADER), value);
    }
    Ok(headers)
}

/// Parse `Retry-After` as delta seconds or an HTTP date.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - Utc::now()).to_std().ok()
}

pub struct SubmissionClient {
    http: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    max_batch_size: usize,
    dry_run: bool,
}

impl SubmissionClient {
    pub fn new(http: reqwest::Client, settings: &Settings, retry: RetryPolicy) -> Result<Self, ConnectorError> {
        Ok(Self {
            http,
            base_url: settings.censys_asm_api_base_url.trim_end_matches('/').to_string(),
            headers: api_headers(settings)?,
            retry,
            permits: Arc::new(Semaphore::new(settings.submission_concurrency.max(1))),
            max_batch_size: settings.max_batch_size,
            dry_run: settings.dry_run,
        })
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Send one batch, retrying it whole on transient failures.
    pub async fn submit(&self, batch: &SubmissionBatch) -> Result<(), SubmissionError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| SubmissionError::Unavailable(e.to_string()))?;

        let operation = format!("submit {} items for {}", batch.len(), batch.label());
        self.retry.execute(&operation, || self.send(batch)).await
    }

    async fn send(&self, batch: &SubmissionBatch) -> Result<(), SubmissionError> {
        let request = match batch {
            SubmissionBatch::ReplaceSeeds { label, seeds, force } => self
                .http
                .put(format!("{}/v1/seeds", self.base_url))
                .query(&[("label", label.to_string()), ("force", force.to_string())])
                .json(&serde_json::json!({ "seeds": seeds })),
            SubmissionBatch::AddSeeds { label, seeds } => self
                .http
                .post(format!("{}/v1/seeds", self.base_url))
                .json(&serde_json::json!({ "label": label.to_string(), "seeds": seeds })),
            SubmissionBatch::CloudAssets { label, assets } => self
                .http
                .post(format!("{}/beta/cloudConnector/addCloudAssets", self.base_url))
                .json(&serde_json::json!({
                    "cloudConnectorUid": label.to_string(),
                    "cloudAssets": assets,
                })),
        };

        let response = request
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|e| SubmissionError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(label = %batch.label(), items = batch.len(), "Batch accepted");
            return Ok(());
        }
        let delay = retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(SubmissionError::from_response(status, delay, body))
    }

    async fn submit_label(
        &self,
        label: &Label,
        seeds: &[SeedCandidate],
        assets: &[CloudAssetCandidate],
    ) -> LabelStatus {
        let batches = plan_batches(label, seeds, assets, self.max_batch_size);
        let seed_count: usize = batches
            .iter()
            .filter(|b| !matches!(b, SubmissionBatch::CloudAssets { .. }))
            .map(SubmissionBatch::len)
            .sum();
        let asset_count = assets.len();

        if self.dry_run {
            info!(
                label = %label,
                seeds = seed_count,
                assets = asset_count,
                batches = batches.len(),
                "Dry run, skipping submission"
            );
        } else {
            for batch in &batches {
                if let Err(e) = self.submit(batch).await {
                    error!(label = %label, error = %e, "Failed to submit batch");
                    return LabelStatus::Failed { error: e.to_string() };
                }
            }
            info!(label = %label, seeds = seed_count, assets = asset_count, "Submitted label");
        }

        LabelStatus::Submitted {
            seeds: seed_count,
            assets: asset_count,
            batches: batches.len(),
        }
    }

    async fn clear_label(&self, label: &Label) -> LabelStatus {
        if self.dry_run {
            info!(label = %label, "Dry run, skipping stale label clearing");
            return LabelStatus::Cleared;
        }
        match self.submit(&SubmissionBatch::clear(label.clone())).await {
            Ok(()) => {
                info!(label = %label, "Cleared stale label");
                LabelStatus::Cleared
            }
            Err(e) => {
                error!(label = %label, error = %e, "Failed to clear stale label");
                LabelStatus::Failed { error: e.to_string() }
            }
        }
    }

    /// Submit every label of a run and summarize the outcome per label.
    pub async fn submit_all(&self, result: &ScanResult) -> SubmissionReport {
        let mut report = SubmissionReport::new(self.dry_run);

        let produced: Vec<&Label> = result
            .produced()
            .into_iter()
            .filter(|label| !result.degraded.contains_key(*label))
            .collect();
        let submissions = produced.iter().map(|label| async move {
            let seeds = result.seeds.get(*label).map(Vec::as_slice).unwrap_or_default();
            let assets = result.assets.get(*label).map(Vec::as_slice).unwrap_or_default();
            ((*label).clone(), self.submit_label(label, seeds, assets).await)
        });
        let clears = result
            .stale
            .iter()
            .map(|label| async move { (label.clone(), self.clear_label(label).await) });

        let (submitted, cleared) = futures::join!(join_all(submissions), join_all(clears));
        for (label, status) in submitted.into_iter().chain(cleared) {
            report.record(label, status);
        }

        for (label, reason) in &result.degraded {
            report.record(
                label.clone(),
                LabelStatus::Degraded {
                    reason: reason.to_string(),
                },
            );
        }
        for task in result.empty_tasks() {
            if report.status(task).is_none() {
                report.record(task.clone(), LabelStatus::Empty);
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProviderKind, SeedKind, Tags};

    fn label() -> Label {
        Label::new(ProviderKind::Aws, "123456789012", "us-east-1", "ENI")
    }

    fn candidates(n: usize) -> Vec<SeedCandidate> {
        (0..n)
            .map(|i| SeedCandidate {
                kind: SeedKind::Ip,
                value: format!("3.{}.{}.{}", i / 65536, (i / 256) % 256, i % 256),
                label: label(),
                uniqueness_key: None,
                tags: Tags::new(),
            })
            .collect()
    }

    #[test]
    fn test_batches_bounded_and_first_is_replace() {
        let batches = plan_batches(&label(), &candidates(2500), &[], 1000);
        assert_eq!(batches.len(), 3);
        assert!(matches!(batches[0], SubmissionBatch::ReplaceSeeds { force: false, .. }));
        assert!(matches!(batches[1], SubmissionBatch::AddSeeds { .. }));
        assert!(batches.iter().all(|b| b.len() <= 1000 && b.label() == &label()));
        assert_eq!(batches.iter().map(SubmissionBatch::len).sum::<usize>(), 2500);
    }

    #[test]
    fn test_batch_boundaries_are_stable() {
        let mut reversed = candidates(30);
        reversed.reverse();
        assert_eq!(
            plan_batches(&label(), &candidates(30), &[], 7),
            plan_batches(&label(), &reversed, &[], 7)
        );
    }

    #[test]
    fn test_clear_is_forced_empty_replace() {
        let batch = SubmissionBatch::clear(label());
        assert!(batch.is_empty());
        assert!(matches!(batch, SubmissionBatch::ReplaceSeeds { force: true, .. }));
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        assert_eq!(retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn test_api_key_header_is_sensitive() {
        let settings = Settings {
            censys_api_key: Some("secret-key".into()),
            ..Settings::default()
        };
        let headers = api_headers(&settings).unwrap();
        assert!(headers[API_KEY_HEADER].is_sensitive());
    }
}
