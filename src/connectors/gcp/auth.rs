//! GCP access tokens
//!
//! Service account keys are exchanged through a signed JWT-bearer grant.
//! Workload identity federation goes through STS, optionally followed by
//! service account impersonation.

use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connectors::credentials::ScopedCredential;
use crate::connectors::oauth;
use crate::error::{ConnectorError, TokenError};
use crate::retry::RetryPolicy;
use crate::types::ProviderKind;

pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcpCredentialSpec {
    /// Service account key file
    ServiceAccountKey(PathBuf),
    WorkloadIdentity {
        audience: String,
        token_file: PathBuf,
        /// Impersonated after the STS exchange when set
        service_account_email: Option<String>,
    },
}

/// Endpoints and client used for token exchange
pub struct TokenContext<'a> {
    pub http: &'a reqwest::Client,
    pub retry: &'a RetryPolicy,
    pub sts_url: &'a str,
    pub iam_credentials_url: &'a str,
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

pub async fn resolve(
    ctx: &TokenContext<'_>,
    organization_id: &str,
    spec: &GcpCredentialSpec,
) -> Result<ScopedCredential, ConnectorError> {
    match spec {
        GcpCredentialSpec::ServiceAccountKey(path) => service_account_token(ctx, organization_id, path).await,
        GcpCredentialSpec::WorkloadIdentity {
            audience,
            token_file,
            service_account_email,
        } => {
            let federated = federated_token(ctx, organization_id, audience, token_file).await?;
            match service_account_email {
                Some(email) => impersonate(ctx, organization_id, &federated, email).await,
                None => Ok(federated),
            }
        }
    }
}

async fn read_file(organization_id: &str, path: &Path, what: &str) -> Result<String, ConnectorError> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        ConnectorError::authentication(
            organization_id,
            format!("failed to read {} from {}: {}", what, path.display(), e),
        )
    })
}

/// Signed RS256 assertion for the JWT-bearer grant.
fn sign_assertion(key: &ServiceAccountKey, now: DateTime<Utc>) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = AssertionClaims {
        iss: &key.client_email,
        scope: CLOUD_PLATFORM_SCOPE,
        aud: &key.token_uri,
        iat: now.timestamp(),
        exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
    };
    let mut header = Header::new(Algorithm::RS256);
    header.kid = key.private_key_id.clone();
    encode(&header, &claims, &EncodingKey::from_rsa_pem(key.private_key.as_bytes())?)
}

async fn service_account_token(
    ctx: &TokenContext<'_>,
    organization_id: &str,
    path: &Path,
) -> Result<ScopedCredential, ConnectorError> {
    let raw = read_file(organization_id, path, "service account key").await?;
    let key: ServiceAccountKey = serde_json::from_str(&raw).map_err(|e| {
        ConnectorError::authentication(organization_id, format!("invalid service account key file: {}", e))
    })?;
    let assertion = sign_assertion(&key, Utc::now()).map_err(|e| {
        ConnectorError::authentication(organization_id, format!("failed to sign service account assertion: {}", e))
    })?;

    oauth::request_token(
        ctx.http,
        ctx.retry,
        ProviderKind::Gcp,
        organization_id,
        &key.token_uri,
        &[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())],
    )
    .await
}

async fn federated_token(
    ctx: &TokenContext<'_>,
    organization_id: &str,
    audience: &str,
    token_file: &Path,
) -> Result<ScopedCredential, ConnectorError> {
    let subject_token = read_file(organization_id, token_file, "workload identity token").await?;
    oauth::request_token(
        ctx.http,
        ctx.retry,
        ProviderKind::Gcp,
        organization_id,
        ctx.sts_url,
        &[
            ("grant_type", TOKEN_EXCHANGE_GRANT),
            ("subject_token_type", "urn:ietf:params:oauth:token-type:jwt"),
            ("requested_token_type", "urn:ietf:params:oauth:token-type:access_token"),
            ("audience", audience),
            ("subject_token", subject_token.trim()),
            ("scope", CLOUD_PLATFORM_SCOPE),
        ],
    )
    .await
}

#[derive(Deserialize)]
struct GenerateAccessTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expireTime")]
    expire_time: Option<String>,
}

async fn impersonate(
    ctx: &TokenContext<'_>,
    organization_id: &str,
    federated: &ScopedCredential,
    email: &str,
) -> Result<ScopedCredential, ConnectorError> {
    let url = format!(
        "{}/v1/projects/-/serviceAccounts/{}:generateAccessToken",
        ctx.iam_credentials_url.trim_end_matches('/'),
        urlencoding::encode(email)
    );
    let bearer = federated.access_token().unwrap_or_default();
    let body = serde_json::json!({ "scope": [CLOUD_PLATFORM_SCOPE] });

    let operation = format!("gcp impersonation for {}", organization_id);
    let response = ctx
        .retry
        .execute(&operation, || async {
            let response = ctx
                .http
                .post(&url)
                .bearer_auth(bearer)
                .json(&body)
                .send()
                .await
                .map_err(|e| TokenError::Unavailable(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let message = format!("generateAccessToken failed with {}: {}", status, body);
                return Err(if status.is_server_error() {
                    TokenError::Unavailable(message)
                } else {
                    TokenError::Rejected(message)
                });
            }
            response
                .json::<GenerateAccessTokenResponse>()
                .await
                .map_err(|e| TokenError::Rejected(e.to_string()))
        })
        .await
        .map_err(|e| ConnectorError::authentication(organization_id, e.to_string()))?;

    let ttl = response
        .expire_time
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .and_then(|t| (t.with_timezone(&Utc) - Utc::now()).to_std().ok())
        .unwrap_or(Duration::from_secs(3600));
    Ok(ScopedCredential::token(ProviderKind::Gcp, response.access_token, ttl))
}
