//! OAuth2 token exchange shared by the Azure and GCP connectors.

use serde::Deserialize;
use std::time::Duration;

use crate::connectors::credentials::ScopedCredential;
use crate::error::{ConnectorError, TokenError};
use crate::retry::RetryPolicy;
use crate::types::ProviderKind;

const DEFAULT_EXPIRES_IN: u64 = 3600;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

impl TokenResponse {
    /// Azure returns `expires_in` as a string, Google as a number.
    fn ttl(&self) -> Duration {
        let secs = match &self.expires_in {
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        };
        Duration::from_secs(secs.unwrap_or(DEFAULT_EXPIRES_IN))
    }
}

/// POST a form to a token endpoint and wrap the access token.
///
/// 5xx and network failures are retried; any 4xx is an authentication
/// failure for `account`.
pub async fn request_token(
    http: &reqwest::Client,
    retry: &RetryPolicy,
    provider: ProviderKind,
    account: &str,
    token_url: &str,
    form: &[(&str, &str)],
) -> Result<ScopedCredential, ConnectorError> {
    let operation = format!("{} token for {}", provider, account);
    let response = retry
        .execute(&operation, || post_form(http, token_url, form))
        .await
        .map_err(|e| ConnectorError::authentication(account, e.to_string()))?;

    Ok(ScopedCredential::token(provider, response.access_token.clone(), response.ttl()))
}

async fn post_form(http: &reqwest::Client, url: &str, form: &[(&str, &str)]) -> Result<TokenResponse, TokenError> {
    let response = http
        .post(url)
        .form(form)
        .send()
        .await
        .map_err(|e| TokenError::Unavailable(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = format!("{} failed with {}: {}", url, status, body);
        return Err(if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            TokenError::Unavailable(message)
        } else {
            TokenError::Rejected(message)
        });
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| TokenError::Rejected(format!("missing access_token in response: {}", e)))
}
