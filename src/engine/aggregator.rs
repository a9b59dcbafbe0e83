//! Dedup & Label Aggregator
//!
//! Enumeration tasks fill a private [`TaskBuffer`] and commit it in one
//! step once their listing finished cleanly. A task that fails commits
//! nothing and is recorded as degraded, so partial listings never reach
//! the inventory and never look like genuinely empty scopes.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::debug;

use crate::seeds;
use crate::types::{CloudAssetCandidate, Label, ProviderKind, RawResource, SeedCandidate, SeedKind};

/// A value as seen from one account: `(provider, account, value)`
type AccountValue = (ProviderKind, String, String);

/// Why a scan task contributed nothing this cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Degradation {
    Enumeration(String),
    Authentication(String),
    /// Run deadline hit before the task finished
    Cancelled,
}

impl std::fmt::Display for Degradation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Degradation::Enumeration(message) => write!(f, "enumeration failed: {}", message),
            Degradation::Authentication(message) => write!(f, "authentication failed: {}", message),
            Degradation::Cancelled => write!(f, "cancelled at run deadline"),
        }
    }
}

/// Candidates gathered by one `(scope, region, enumerator)` task.
///
/// `task` is the label the task would produce for resources that do not
/// report their own location; it doubles as the task's identity in the
/// staleness state.
#[derive(Debug)]
pub struct TaskBuffer {
    task: Label,
    seeds: Vec<SeedCandidate>,
    assets: Vec<(Label, CloudAssetCandidate)>,
    ignored: Vec<AccountValue>,
    rejected: usize,
}

impl TaskBuffer {
    pub fn new(task: Label) -> Self {
        Self {
            task,
            seeds: Vec::new(),
            assets: Vec::new(),
            ignored: Vec::new(),
            rejected: 0,
        }
    }

    pub fn task(&self) -> &Label {
        &self.task
    }

    /// Normalize one listed resource into seed and asset candidates.
    pub fn push(&mut self, resource: RawResource) {
        let label = match resource.region.as_deref() {
            Some(region) if !region.is_empty() => Label::new(
                self.task.provider,
                &self.task.account_id,
                region,
                &self.task.service,
            ),
            _ => self.task.clone(),
        };

        let values = resource
            .ips
            .iter()
            .map(|raw| (SeedKind::Ip, raw))
            .chain(resource.domains.iter().map(|raw| (SeedKind::Domain, raw)));

        for (kind, raw) in values {
            let seed = match seeds::normalize(kind, raw) {
                Ok(seed) => seed,
                Err(reason) => {
                    debug!(resource = %resource.id, value = %raw, %reason, "Skipping seed value");
                    self.rejected += 1;
                    continue;
                }
            };
            if resource.ignored {
                self.ignored
                    .push((self.task.provider, self.task.account_id.clone(), seed.value));
                continue;
            }
            self.seeds.push(SeedCandidate {
                kind: seed.kind,
                uniqueness_key: resource
                    .uniqueness_key
                    .as_ref()
                    .map(|key| format!("{}:{}", key, seed.value)),
                value: seed.value,
                label: label.clone(),
                tags: resource.tags.clone(),
            });
        }

        for bucket in resource.buckets {
            if resource.ignored {
                self.ignored.push((bucket.provider, bucket.account_id, bucket.url));
                continue;
            }
            let asset_label = if bucket.region.is_empty() {
                label.clone()
            } else {
                Label::new(bucket.provider, &bucket.account_id, &bucket.region, &self.task.service)
            };
            self.assets.push((asset_label, bucket));
        }
    }

    pub fn len(&self) -> usize {
        self.seeds.len() + self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type AssetKey = (ProviderKind, String, String);

#[derive(Default)]
struct State {
    seeds: HashMap<Label, BTreeMap<String, SeedCandidate>>,
    assets: HashMap<AssetKey, (Label, CloudAssetCandidate)>,
    /// Values seen on an ignored resource, per account
    ignored: HashSet<AccountValue>,
    completed: BTreeSet<Label>,
    degraded: BTreeMap<Label, Degradation>,
}

/// Run-wide candidate store shared by all enumeration tasks
#[derive(Default)]
pub struct Aggregator {
    state: Mutex<State>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a finished task's candidates.
    pub async fn commit(&self, buffer: TaskBuffer) {
        let TaskBuffer {
            task,
            seeds,
            assets,
            ignored,
            rejected,
        } = buffer;

        let mut state = self.state.lock().await;
        let (mut added, mut duplicates) = (0usize, 0usize);

        for candidate in seeds {
            let bucket = state.seeds.entry(candidate.label.clone()).or_default();
            match bucket.get(&candidate.value) {
                // first sighting keeps its tags
                Some(_) => duplicates += 1,
                None => {
                    bucket.insert(candidate.value.clone(), candidate);
                    added += 1;
                }
            }
        }

        for (label, asset) in assets {
            let key = asset.dedup_key();
            if state.assets.contains_key(&key) {
                duplicates += 1;
                continue;
            }
            state.assets.insert(key, (label, asset));
            added += 1;
        }

        state.ignored.extend(ignored);
        state.degraded.remove(&task);
        state.completed.insert(task.clone());

        debug!(task = %task, added, duplicates, rejected, "Task results committed");
    }

    /// Record a task that failed or never ran.
    pub async fn mark_degraded(&self, task: Label, reason: Degradation) {
        let mut state = self.state.lock().await;
        if state.completed.contains(&task) {
            return;
        }
        state.degraded.entry(task).or_insert(reason);
    }

    /// Apply run-wide rules and freeze the result.
    ///
    /// Ignored values are dropped from every label of the same account, and
    /// a uniqueness key stays with the smallest label that claimed it so the
    /// outcome does not depend on task completion order.
    pub async fn finalize(&self) -> ScanResult {
        let state = std::mem::take(&mut *self.state.lock().await);

        let mut owners: HashMap<&str, &Label> = HashMap::new();
        for (label, bucket) in &state.seeds {
            for candidate in bucket.values() {
                if let Some(key) = candidate.uniqueness_key.as_deref() {
                    let owner = owners.entry(key).or_insert(label);
                    if label < *owner {
                        *owner = label;
                    }
                }
            }
        }

        let mut seeds: BTreeMap<Label, Vec<SeedCandidate>> = BTreeMap::new();
        for (label, bucket) in &state.seeds {
            let kept: Vec<SeedCandidate> = bucket
                .values()
                .filter(|c| !state.ignored.contains(&(label.provider, label.account_id.clone(), c.value.clone())))
                .filter(|c| match c.uniqueness_key.as_deref() {
                    Some(key) => owners.get(key) == Some(&label),
                    None => true,
                })
                .cloned()
                .collect();
            if !kept.is_empty() {
                seeds.insert(label.clone(), kept);
            }
        }

        let mut assets: BTreeMap<Label, Vec<CloudAssetCandidate>> = BTreeMap::new();
        for (label, asset) in state.assets.values() {
            if state
                .ignored
                .contains(&(asset.provider, asset.account_id.clone(), asset.url.clone()))
            {
                continue;
            }
            assets.entry(label.clone()).or_default().push(asset.clone());
        }
        for list in assets.values_mut() {
            list.sort_by(|a, b| a.url.cmp(&b.url));
        }

        ScanResult {
            seeds,
            assets,
            completed: state.completed,
            degraded: state.degraded,
            stale: BTreeSet::new(),
        }
    }
}

/// Aggregated output of one run, consumed once by submission
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Seeds per label, sorted by value
    pub seeds: BTreeMap<Label, Vec<SeedCandidate>>,
    pub assets: BTreeMap<Label, Vec<CloudAssetCandidate>>,
    /// Tasks whose listing finished cleanly
    pub completed: BTreeSet<Label>,
    pub degraded: BTreeMap<Label, Degradation>,
    /// Labels to clear with an empty replacement
    pub stale: BTreeSet<Label>,
}

impl ScanResult {
    /// Labels holding at least one seed or asset
    pub fn produced(&self) -> BTreeSet<&Label> {
        self.seeds.keys().chain(self.assets.keys()).collect()
    }

    pub fn has_candidates(&self, label: &Label) -> bool {
        self.seeds.contains_key(label) || self.assets.contains_key(label)
    }

    /// Labels produced by `task`: its nominal label plus any location
    /// labels derived from the same account and service.
    pub fn produced_by(&self, task: &Label) -> BTreeSet<Label> {
        self.produced()
            .into_iter()
            .filter(|label| {
                label.provider == task.provider
                    && label.account_id == task.account_id
                    && label.service == task.service
                    && (*label == task || task.region == Label::GLOBAL_REGION)
            })
            .cloned()
            .collect()
    }

    /// Seed-carrying labels produced by `task`. Asset-only labels are left
    /// out because an empty seed replacement cannot remove cloud assets.
    pub fn seeded_by(&self, task: &Label) -> BTreeSet<Label> {
        self.produced_by(task)
            .into_iter()
            .filter(|label| self.seeds.contains_key(label))
            .collect()
    }

    /// Completed tasks that yielded nothing
    pub fn empty_tasks(&self) -> impl Iterator<Item = &Label> {
        self.completed.iter().filter(|task| self.produced_by(task).is_empty())
    }

    pub fn seed_count(&self) -> usize {
        self.seeds.values().map(Vec::len).sum()
    }

    pub fn asset_count(&self) -> usize {
        self.assets.values().map(Vec::len).sum()
    }
}
