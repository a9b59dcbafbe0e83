//! Stale label tracking
//!
//! The state file maps each scan task to the seed labels it produced the
//! last time it completed. A label that a completed task no longer produces
//! is stale and gets an explicit empty replacement, if clearing is enabled
//! for its provider. Degraded tasks neither clear nor update their entry.
//! Labels that only ever held cloud assets are not tracked.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::engine::aggregator::ScanResult;
use crate::error::ConnectorError;
use crate::inventory::{LabelStatus, SubmissionReport};
use crate::types::{Label, ProviderKind};

const STATE_VERSION: u32 = 1;

/// Labels produced per task on its last completed run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelState {
    pub version: u32,
    pub tasks: BTreeMap<String, BTreeSet<Label>>,
}

impl LabelState {
    pub fn previous(&self, task: &Label) -> Option<&BTreeSet<Label>> {
        self.tasks.get(&task.to_string())
    }

    /// Labels to clear this run.
    ///
    /// A label is stale when a completed task produced it last time but not
    /// now, no other task produced it this run, and it was not the nominal
    /// label of a degraded task.
    pub fn stale_labels<F>(&self, result: &ScanResult, clearing_enabled: F) -> BTreeSet<Label>
    where
        F: Fn(ProviderKind) -> bool,
    {
        let mut stale = BTreeSet::new();
        for task in &result.completed {
            let Some(previous) = self.previous(task) else {
                continue;
            };
            for label in previous {
                if result.has_candidates(label) || result.degraded.contains_key(label) {
                    continue;
                }
                if !clearing_enabled(label.provider) {
                    debug!(label = %label, "Label went empty, clearing disabled for provider");
                    continue;
                }
                stale.insert(label.clone());
            }
        }
        stale
    }

    /// Next state after submission.
    ///
    /// Completed tasks record the seed labels they produced; a label stays
    /// tracked until it was actually cleared, so a failed or disabled clear
    /// is retried on a later run.
    pub fn advance(&self, result: &ScanResult, report: &SubmissionReport) -> LabelState {
        let mut next = self.clone();
        next.version = STATE_VERSION;

        for task in &result.completed {
            let mut labels = result.seeded_by(task);
            if let Some(previous) = self.previous(task) {
                labels.extend(
                    previous
                        .iter()
                        .filter(|label| !matches!(report.status(label), Some(LabelStatus::Cleared)))
                        .cloned(),
                );
            }
            if labels.is_empty() {
                next.tasks.remove(&task.to_string());
            } else {
                next.tasks.insert(task.to_string(), labels);
            }
        }
        next
    }
}

/// JSON file holding the [`LabelState`]
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state; a missing or unreadable file starts from scratch.
    pub async fn load(&self) -> LabelState {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No label state yet, starting fresh");
                return LabelState::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read label state");
                return LabelState::default();
            }
        };

        match serde_json::from_str::<LabelState>(&raw) {
            Ok(state) if state.version == STATE_VERSION => state,
            Ok(state) => {
                warn!(version = state.version, "Unsupported label state version, starting fresh");
                LabelState::default()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Label state is corrupt, starting fresh");
                LabelState::default()
            }
        }
    }

    /// Write atomically through a sibling temp file.
    pub async fn save(&self, state: &LabelState) -> Result<(), ConnectorError> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| ConnectorError::configuration(format!("failed to encode label state: {}", e)))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ConnectorError::configuration(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| ConnectorError::configuration(format!("failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            ConnectorError::configuration(format!("failed to replace {}: {}", self.path.display(), e))
        })?;

        debug!(path = %self.path.display(), tasks = state.tasks.len(), "Label state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::aggregator::Degradation;
    use crate::types::{CloudAssetCandidate, SeedCandidate, SeedKind, Tags};

    fn label(region: &str) -> Label {
        Label::new(ProviderKind::Aws, "123456789012", region, "ENI")
    }

    fn seed(label: &Label, value: &str) -> SeedCandidate {
        SeedCandidate {
            kind: SeedKind::Ip,
            value: value.into(),
            label: label.clone(),
            uniqueness_key: None,
            tags: Tags::new(),
        }
    }

    fn previous(labels: &[Label]) -> LabelState {
        LabelState {
            version: STATE_VERSION,
            tasks: labels
                .iter()
                .map(|l| (l.to_string(), [l.clone()].into_iter().collect()))
                .collect(),
        }
    }

    #[test]
    fn test_empty_label_previously_seen_is_stale() {
        let (a, b) = (label("us-east-1"), label("us-west-2"));
        let mut result = ScanResult::default();
        result.seeds.insert(a.clone(), vec![seed(&a, "3.3.3.3")]);
        result.completed.extend([a.clone(), b.clone()]);

        let stale = previous(&[a, b.clone()]).stale_labels(&result, |_| true);
        assert_eq!(stale.into_iter().collect::<Vec<_>>(), vec![b]);
    }

    #[test]
    fn test_clearing_gated_per_provider() {
        let b = label("us-west-2");
        let mut result = ScanResult::default();
        result.completed.insert(b.clone());

        let state = previous(&[b]);
        assert!(state.stale_labels(&result, |_| false).is_empty());
        assert!(state
            .stale_labels(&result, |p| p == ProviderKind::Azure)
            .is_empty());
    }

    #[test]
    fn test_degraded_task_never_clears() {
        let b = label("us-west-2");
        let mut result = ScanResult::default();
        result.degraded.insert(b.clone(), Degradation::Enumeration("throttled".into()));

        assert!(previous(&[b]).stale_labels(&result, |_| true).is_empty());
    }

    #[test]
    fn test_advance_keeps_uncleared_labels() {
        let (a, b) = (label("us-east-1"), label("us-west-2"));
        let mut result = ScanResult::default();
        result.seeds.insert(a.clone(), vec![seed(&a, "3.3.3.3")]);
        result.completed.extend([a.clone(), b.clone()]);

        let mut report = SubmissionReport::default();
        report.record(b.clone(), LabelStatus::Failed { error: "503".into() });
        let next = previous(&[b.clone()]).advance(&result, &report);
        assert!(next.previous(&b).unwrap().contains(&b));
        assert!(next.previous(&a).unwrap().contains(&a));

        let mut report = SubmissionReport::default();
        report.record(b.clone(), LabelStatus::Cleared);
        let next = previous(&[b.clone()]).advance(&result, &report);
        assert!(next.previous(&b).is_none());
    }

    #[test]
    fn test_asset_only_label_is_never_tracked() {
        let s3 = Label::new(ProviderKind::Aws, "123456789012", "eu-west-1", "S3");
        let task = Label::new(ProviderKind::Aws, "123456789012", Label::GLOBAL_REGION, "S3");
        let mut result = ScanResult::default();
        result.assets.insert(
            s3.clone(),
            vec![CloudAssetCandidate {
                provider: ProviderKind::Aws,
                account_id: "123456789012".into(),
                bucket: "assets".into(),
                region: "eu-west-1".into(),
                url: "https://assets.s3.eu-west-1.amazonaws.com".into(),
                public_access: None,
                tags: Tags::new(),
            }],
        );
        result.completed.insert(task.clone());

        let next = LabelState::default().advance(&result, &SubmissionReport::default());
        assert!(next.previous(&task).is_none());

        // the bucket disappearing later has nothing tracked to clear
        let mut emptied = ScanResult::default();
        emptied.completed.insert(task);
        assert!(next.stale_labels(&emptied, |_| true).is_empty());
    }

    #[tokio::test]
    async fn test_store_roundtrip_and_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state").join("labels.json"));
        assert_eq!(store.load().await, LabelState::default());

        let state = previous(&[label("us-east-1")]);
        store.save(&state).await.unwrap();
        assert_eq!(store.load().await, state);

        std::fs::write(store.path(), "{not json").unwrap();
        assert_eq!(store.load().await, LabelState::default());
    }
}
