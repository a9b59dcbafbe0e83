//! Submission report: the run's label to status summary.

use std::collections::BTreeMap;

use crate::types::Label;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelStatus {
    Submitted {
        seeds: usize,
        assets: usize,
        batches: usize,
    },
    /// Empty replacement sent for a stale label
    Cleared,
    /// Scanned cleanly, nothing to send
    Empty,
    /// Enumeration or authentication failed; nothing was sent
    Degraded { reason: String },
    /// Inventory API rejected a batch or retries ran out
    Failed { error: String },
}

impl LabelStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, LabelStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubmissionReport {
    pub dry_run: bool,
    pub labels: BTreeMap<Label, LabelStatus>,
}

impl SubmissionReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            labels: BTreeMap::new(),
        }
    }

    /// A failure recorded for a label wins over any later status.
    pub fn record(&mut self, label: Label, status: LabelStatus) {
        match self.labels.get(&label) {
            Some(existing) if existing.is_failure() => {}
            _ => {
                self.labels.insert(label, status);
            }
        }
    }

    pub fn status(&self, label: &Label) -> Option<&LabelStatus> {
        self.labels.get(label)
    }

    pub fn has_permanent_failures(&self) -> bool {
        self.labels.values().any(LabelStatus::is_failure)
    }

    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary::default();
        for status in self.labels.values() {
            match status {
                LabelStatus::Submitted { seeds, assets, batches } => {
                    summary.submitted += 1;
                    summary.seeds += seeds;
                    summary.assets += assets;
                    summary.batches += batches;
                }
                LabelStatus::Cleared => summary.cleared += 1,
                LabelStatus::Empty => summary.empty += 1,
                LabelStatus::Degraded { .. } => summary.degraded += 1,
                LabelStatus::Failed { .. } => summary.failed += 1,
            }
        }
        summary
    }
}

/// Counts for the run's final log line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub submitted: usize,
    pub cleared: usize,
    pub empty: usize,
    pub degraded: usize,
    pub failed: usize,
    pub seeds: usize,
    pub assets: usize,
    pub batches: usize,
}
