//! Scan Orchestrator
//!
//! One run: plan every `(scope, region, enumerator)` task, resolve one
//! credential per scope, enumerate on a bounded worker pool, then hand the
//! aggregated result to submission. Enumerator and account failures are
//! logged and recorded against their labels; they never abort the run.

use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::aggregator::{Aggregator, Degradation, ScanResult, TaskBuffer};
use super::staleness::StateStore;
use crate::config::Settings;
use crate::connectors::{
    list_filtered, CloudConnector, CredentialCache, RegionScope, ResourceEnumerator, ScanScope,
    ScopedCredential,
};
use crate::error::ConnectorError;
use crate::inventory::{
    Healthcheck, HealthcheckErrorCode, HealthcheckRun, SubmissionClient, SubmissionReport, TagPublisher,
};
use crate::types::Label;

/// Everything a single run needs, built fresh per invocation.
pub struct RunContext {
    pub run_id: Uuid,
    pub settings: Arc<Settings>,
    pub connectors: Vec<Arc<dyn CloudConnector>>,
    pub submission: Arc<SubmissionClient>,
    pub healthcheck: Arc<Healthcheck>,
    pub tags: Arc<TagPublisher>,
    pub state: StateStore,
}

impl RunContext {
    pub fn new(
        settings: Arc<Settings>,
        http: reqwest::Client,
        connectors: Vec<Arc<dyn CloudConnector>>,
    ) -> Result<Self, ConnectorError> {
        Ok(Self {
            run_id: Uuid::new_v4(),
            submission: Arc::new(SubmissionClient::new(http.clone(), &settings, Default::default())?),
            tags: Arc::new(TagPublisher::new(http.clone(), &settings, Default::default())?),
            healthcheck: Arc::new(Healthcheck::new(http, &settings)?),
            state: StateStore::new(settings.state_file_path()),
            connectors,
            settings,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Finished, possibly with degraded or failed labels
    Completed,
    /// Nothing could be scanned
    Aborted,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub report: SubmissionReport,
    /// Set when the run deadline cut enumeration short
    pub timed_out: bool,
}

impl RunOutcome {
    /// Process exit status: only aborted runs and permanent submission
    /// failures count, enumerator failures do not.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed && !self.report.has_permanent_failures()
    }
}

/// One planned enumeration
#[derive(Clone)]
struct PlannedTask {
    label: Label,
    region: String,
    enumerator: Arc<dyn ResourceEnumerator>,
}

struct ScopePlan {
    connector: Arc<dyn CloudConnector>,
    scope: Arc<ScanScope>,
    tasks: Vec<PlannedTask>,
}

/// What a finished scope reports back for healthcheck purposes
struct ScopeOutcome {
    index: usize,
    auth_error: Option<String>,
    degraded: usize,
}

/// State shared by every task of one run
struct Shared {
    aggregator: Aggregator,
    permits: Semaphore,
}

pub async fn run(ctx: &RunContext) -> RunOutcome {
    let span = info_span!("run", run_id = %ctx.run_id);
    execute(ctx).instrument(span).await
}

async fn execute(ctx: &RunContext) -> RunOutcome {
    let settings = &ctx.settings;
    let plans = plan(ctx);

    if plans.is_empty() {
        error!("No provider accounts to scan, aborting run");
        return RunOutcome {
            run_id: ctx.run_id,
            status: RunStatus::Aborted,
            report: SubmissionReport::new(settings.dry_run),
            timed_out: false,
        };
    }

    let planned: usize = plans.iter().map(|p| p.tasks.len()).sum();
    info!(scopes = plans.len(), tasks = planned, dry_run = settings.dry_run, "Starting scan");

    let runs: Vec<Option<HealthcheckRun>> = futures::future::join_all(
        plans
            .iter()
            .map(|p| async { ctx.healthcheck.start(&p.connector.healthcheck_payload(&p.scope)).await }),
    )
    .await;

    let shared = Arc::new(Shared {
        aggregator: Aggregator::new(),
        permits: Semaphore::new(settings.scan_concurrency.max(1)),
    });

    let mut scopes = JoinSet::new();
    for (index, plan) in plans.iter().enumerate() {
        let shared = shared.clone();
        let connector = plan.connector.clone();
        let scope = plan.scope.clone();
        let tasks = plan.tasks.clone();
        scopes.spawn(scan_scope(index, connector, scope, tasks, shared).in_current_span());
    }

    let mut finished: Vec<ScopeOutcome> = Vec::new();
    let drained = tokio::time::timeout(settings.run_timeout(), async {
        while let Some(joined) = scopes.join_next().await {
            match joined {
                Ok(outcome) => finished.push(outcome),
                Err(e) => error!(error = %e, "Scope task did not complete"),
            }
        }
    })
    .await;

    let timed_out = drained.is_err();
    if timed_out {
        warn!(
            timeout_secs = settings.run_timeout_secs,
            "Run deadline reached, cancelling remaining enumerations"
        );
        scopes.abort_all();
    }
    drop(scopes);

    let done: BTreeSet<usize> = finished.iter().map(|o| o.index).collect();
    for (index, plan) in plans.iter().enumerate() {
        if done.contains(&index) {
            continue;
        }
        for task in &plan.tasks {
            shared.aggregator.mark_degraded(task.label.clone(), Degradation::Cancelled).await;
        }
    }

    let mut result = shared.aggregator.finalize().await;
    let previous = ctx.state.load().await;
    result.stale = previous.stale_labels(&result, |provider| settings.stale_clearing_enabled(provider));
    log_result(&result);

    let report = ctx.submission.submit_all(&result).await;
    if ctx.tags.is_enabled() {
        ctx.tags.publish(&result, &report).await;
    }

    if settings.dry_run {
        debug!("Dry run, label state left untouched");
    } else if let Err(e) = ctx.state.save(&previous.advance(&result, &report)).await {
        warn!(error = %e, "Failed to save label state");
    }

    report_healthchecks(ctx, &plans, runs, &finished).await;

    let summary = report.summary();
    info!(
        submitted = summary.submitted,
        cleared = summary.cleared,
        empty = summary.empty,
        degraded = summary.degraded,
        failed = summary.failed,
        seeds = summary.seeds,
        assets = summary.assets,
        batches = summary.batches,
        timed_out,
        "Scan complete"
    );
    for (label, status) in &report.labels {
        debug!(label = %label, status = ?status, "Label status");
    }

    RunOutcome {
        run_id: ctx.run_id,
        status: RunStatus::Completed,
        report,
        timed_out,
    }
}

/// Flatten connectors into scopes and applicable tasks.
fn plan(ctx: &RunContext) -> Vec<ScopePlan> {
    let global_ignore = &ctx.settings.ignore_resource_types;
    let mut plans = Vec::new();

    for connector in &ctx.connectors {
        for scope in connector.scopes() {
            let mut tasks = Vec::new();
            for enumerator in connector.enumerators(&scope) {
                if scope.is_ignored(enumerator.resource_type(), global_ignore) {
                    debug!(
                        account = %scope.account_id,
                        resource_type = enumerator.resource_type(),
                        "Resource type ignored"
                    );
                    continue;
                }
                let regions = match enumerator.region_scope() {
                    RegionScope::Regional => scope.regions.clone(),
                    RegionScope::Global => vec![Label::GLOBAL_REGION.to_string()],
                };
                for region in regions {
                    tasks.push(PlannedTask {
                        label: Label::new(scope.provider, &scope.account_id, &region, enumerator.service()),
                        region,
                        enumerator: enumerator.clone(),
                    });
                }
            }
            plans.push(ScopePlan {
                connector: connector.clone(),
                scope: Arc::new(scope),
                tasks,
            });
        }
    }
    plans
}

async fn scan_scope(
    index: usize,
    connector: Arc<dyn CloudConnector>,
    scope: Arc<ScanScope>,
    tasks: Vec<PlannedTask>,
    shared: Arc<Shared>,
) -> ScopeOutcome {
    let cache = Arc::new(CredentialCache::new());

    if let Err(e) = cache.get_or_resolve(|| connector.resolve_credential(&scope)).await {
        warn!(
            provider = %scope.provider,
            account = %scope.account_id,
            error = %e,
            "Credential resolution failed, skipping account"
        );
        for task in &tasks {
            shared
                .aggregator
                .mark_degraded(task.label.clone(), Degradation::Authentication(e.to_string()))
                .await;
        }
        return ScopeOutcome {
            index,
            auth_error: Some(e.to_string()),
            degraded: tasks.len(),
        };
    }
    info!(provider = %scope.provider, account = %scope.account_id, tasks = tasks.len(), "Scanning account");

    let mut running = JoinSet::new();
    for task in tasks {
        let shared = shared.clone();
        let connector = connector.clone();
        let scope = scope.clone();
        let cache = cache.clone();
        running.spawn(
            async move {
                let Ok(_permit) = shared.permits.acquire().await else {
                    return false;
                };
                let credential = match cache.get_or_resolve(|| connector.resolve_credential(&scope)).await {
                    Ok(credential) => credential,
                    Err(e) => {
                        warn!(task = %task.label, error = %e, "Credential refresh failed");
                        shared
                            .aggregator
                            .mark_degraded(task.label, Degradation::Authentication(e.to_string()))
                            .await;
                        return false;
                    }
                };
                enumerate(&task, &credential, &scope, &shared.aggregator).await
            }
            .in_current_span(),
        );
    }

    let mut degraded = 0;
    while let Some(joined) = running.join_next().await {
        match joined {
            Ok(true) => {}
            Ok(false) => degraded += 1,
            Err(e) => {
                error!(account = %scope.account_id, error = %e, "Enumeration task did not complete");
                degraded += 1;
            }
        }
    }

    ScopeOutcome {
        index,
        auth_error: None,
        degraded,
    }
}

/// Drain one enumerator into a buffer and commit it. Returns false when the
/// task degraded.
async fn enumerate(
    task: &PlannedTask,
    credential: &ScopedCredential,
    scope: &ScanScope,
    aggregator: &Aggregator,
) -> bool {
    let mut buffer = TaskBuffer::new(task.label.clone());
    let mut stream = list_filtered(task.enumerator.as_ref(), credential, &task.region, &scope.ignore_tags);

    while let Some(item) = stream.next().await {
        match item {
            Ok(resource) => buffer.push(resource),
            Err(e) => {
                warn!(task = %task.label, kind = ?e.kind, error = %e, "Enumeration failed");
                aggregator
                    .mark_degraded(task.label.clone(), Degradation::Enumeration(e.to_string()))
                    .await;
                return false;
            }
        }
    }

    debug!(task = %task.label, candidates = buffer.len(), "Enumeration finished");
    aggregator.commit(buffer).await;
    true
}

async fn report_healthchecks(
    ctx: &RunContext,
    plans: &[ScopePlan],
    runs: Vec<Option<HealthcheckRun>>,
    finished: &[ScopeOutcome],
) {
    let outcomes: BTreeMap<usize, &ScopeOutcome> = finished.iter().map(|o| (o.index, o)).collect();
    let outcomes = &outcomes;

    let calls = runs.into_iter().enumerate().filter_map(|(index, run)| {
        let run = run?;
        let tasks = plans[index].tasks.len();
        Some(async move {
            match outcomes.get(&index).copied() {
                Some(ScopeOutcome {
                    auth_error: Some(message),
                    ..
                }) => {
                    let metadata = serde_json::json!({ "error": message });
                    ctx.healthcheck
                        .fail(run, HealthcheckErrorCode::Permissions, Some(metadata))
                        .await
                }
                Some(outcome) => {
                    let metadata = serde_json::json!({ "tasks": tasks, "degraded": outcome.degraded });
                    ctx.healthcheck.finish(run, Some(metadata)).await
                }
                None => {
                    let metadata = serde_json::json!({ "error": "run deadline reached" });
                    ctx.healthcheck
                        .fail(run, HealthcheckErrorCode::Abandoned, Some(metadata))
                        .await
                }
            }
        })
    });
    futures::future::join_all(calls).await;
}

fn log_result(result: &ScanResult) {
    info!(
        labels = result.produced().len(),
        seeds = result.seed_count(),
        assets = result.asset_count(),
        degraded = result.degraded.len(),
        stale = result.stale.len(),
        "Aggregation complete"
    );
    for (task, reason) in &result.degraded {
        warn!(task = %task, %reason, "Label degraded");
    }
}
