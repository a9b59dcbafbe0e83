//! Scan Engine
//!
//! Ties the pieces together for one run: load the providers file, build
//! connectors, enumerate, aggregate, submit.

pub mod aggregator;
pub mod orchestrator;
pub mod scheduler;
pub mod staleness;

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{load_providers, Settings};
use crate::connectors::{build_connectors, ConnectorContext};
use crate::error::ConnectorError;
use crate::retry::RetryPolicy;
use crate::types::ProviderKind;

pub use aggregator::{Aggregator, Degradation, ScanResult, TaskBuffer};
pub use orchestrator::{run, RunContext, RunOutcome, RunStatus};
pub use scheduler::run_every;
pub use staleness::{LabelState, StateStore};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Long-lived engine state. Everything run-specific is rebuilt by
/// [`Engine::run_once`].
pub struct Engine {
    settings: Arc<Settings>,
    providers: Vec<ProviderKind>,
    http: reqwest::Client,
}

impl Engine {
    /// `providers` restricts the run to these provider kinds; empty means all.
    pub fn new(settings: Settings, providers: Vec<ProviderKind>) -> Result<Self, ConnectorError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(settings.censys_user_agent.clone())
            .build()
            .map_err(|e| ConnectorError::configuration(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            settings: Arc::new(settings),
            providers,
            http,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Load configuration and scan once.
    ///
    /// Only configuration problems surface as errors; everything else is
    /// reported through the outcome.
    pub async fn run_once(&self) -> Result<RunOutcome, ConnectorError> {
        let accounts = load_providers(&self.settings.providers_config_file)?;
        info!(
            accounts = accounts.len(),
            path = %self.settings.providers_config_file.display(),
            "Loaded provider accounts"
        );

        let ctx = ConnectorContext {
            http: self.http.clone(),
            settings: self.settings.clone(),
            retry: RetryPolicy::transient(),
        };
        let connectors = build_connectors(&accounts, &self.providers, &ctx);
        let run_ctx = RunContext::new(self.settings.clone(), self.http.clone(), connectors)?;
        Ok(run(&run_ctx).await)
    }
}
