//! Integration status reporting
//!
//! Each scanned account is bracketed by a start call and a finish or fail
//! call. Reporting is best effort: failures are logged and never change
//! the outcome of a run.

use reqwest::header::HeaderMap;
use serde::Deserialize;
use tracing::{debug, warn};

use super::client::api_headers;
use crate::config::Settings;
use crate::error::ConnectorError;

/// Failure codes understood by the status API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthcheckErrorCode {
    Permissions,
    Abandoned,
}

impl HealthcheckErrorCode {
    fn as_str(&self) -> &'static str {
        match self {
            HealthcheckErrorCode::Permissions => "PERMISSIONS",
            HealthcheckErrorCode::Abandoned => "ABANDONED",
        }
    }
}

/// Started status run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthcheckRun {
    pub run_id: String,
}

#[derive(Deserialize)]
struct StartResponse {
    #[serde(rename = "runId")]
    run_id: serde_json::Value,
}

pub struct Healthcheck {
    http: reqwest::Client,
    status_url: String,
    headers: HeaderMap,
    enabled: bool,
}

impl Healthcheck {
    /// Disabled in dry runs and when `HEALTHCHECK_ENABLED` is off.
    pub fn new(http: reqwest::Client, settings: &Settings) -> Result<Self, ConnectorError> {
        Ok(Self {
            http,
            status_url: format!(
                "{}/integrations/beta/status",
                settings.censys_asm_api_base_url.trim_end_matches('/')
            ),
            headers: api_headers(settings)?,
            enabled: settings.healthcheck_enabled && !settings.dry_run,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn start(&self, provider: &serde_json::Value) -> Option<HealthcheckRun> {
        if !self.enabled {
            return None;
        }
        let url = format!("{}/start", self.status_url);
        let body = serde_json::json!({ "provider": provider });

        let response = match self.post(&url, &body).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Failed to start healthcheck");
                return None;
            }
        };
        match response.json::<StartResponse>().await {
            Ok(StartResponse {
                run_id: serde_json::Value::String(id),
            }) => Some(HealthcheckRun { run_id: id }),
            Ok(StartResponse { run_id }) if !run_id.is_null() => Some(HealthcheckRun {
                run_id: run_id.to_string(),
            }),
            Ok(_) => {
                warn!("Healthcheck start returned no runId");
                None
            }
            Err(e) => {
                warn!(error = %e, "Invalid healthcheck start response");
                None
            }
        }
    }

    pub async fn finish(&self, run: HealthcheckRun, metadata: Option<serde_json::Value>) {
        let url = format!("{}/{}/finish", self.status_url, run.run_id);
        let mut body = serde_json::Map::new();
        if let Some(metadata) = metadata {
            body.insert("metadata".into(), metadata);
        }
        match self.post(&url, &serde_json::Value::Object(body)).await {
            Ok(_) => debug!(run_id = %run.run_id, "Healthcheck finished"),
            Err(e) => warn!(run_id = %run.run_id, error = %e, "Failed to finish healthcheck"),
        }
    }

    pub async fn fail(
        &self,
        run: HealthcheckRun,
        code: HealthcheckErrorCode,
        metadata: Option<serde_json::Value>,
    ) {
        let url = format!("{}/{}/fail", self.status_url, run.run_id);
        let mut body = serde_json::Map::new();
        body.insert("errorCode".into(), code.as_str().into());
        if let Some(metadata) = metadata {
            body.insert("metadata".into(), metadata);
        }
        match self.post(&url, &serde_json::Value::Object(body)).await {
            Ok(_) => debug!(run_id = %run.run_id, code = code.as_str(), "Healthcheck failed"),
            Err(e) => warn!(run_id = %run.run_id, error = %e, "Failed to report healthcheck failure"),
        }
    }

    async fn post(&self, url: &str, body: &serde_json::Value) -> anyhow::Result<reqwest::Response> {
        let response = self
            .http
            .post(url)
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("healthcheck call failed with {}: {}", status, text);
        }
        Ok(response)
    }
}
