//! AWS STS credential exchange
//!
//! AssumeRole (SigV4-signed with source keys) and
//! AssumeRoleWithWebIdentity (unsigned, token file).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use super::client::{AwsClient, AwsRequest};
use crate::connectors::credentials::{AwsKeys, ScopedCredential};
use crate::error::{ConnectorError, ProviderErrorKind};

const STS_VERSION: &str = "2011-06-15";
const SESSION_DURATION_SECS: u64 = 3600;
/// Static keys do not expire on their own
const STATIC_KEY_TTL: Duration = Duration::from_secs(365 * 24 * 3600);

/// How a scope's credential is obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwsCredentialSpec {
    Static(AwsKeys),
    AssumeRole {
        role_arn: String,
        session_name: String,
        external_id: Option<String>,
        source: AwsSource,
    },
}

/// Credentials used to call AssumeRole
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwsSource {
    Keys(AwsKeys),
    /// Exchange this token file directly for the target role
    WebIdentity(PathBuf),
    /// Environment keys, or an IRSA-style `AWS_ROLE_ARN` + token file
    Ambient,
}

impl AwsCredentialSpec {
    /// Role ARN requested, if any
    pub fn role_arn(&self) -> Option<&str> {
        match self {
            AwsCredentialSpec::AssumeRole { role_arn, .. } => Some(role_arn),
            AwsCredentialSpec::Static(_) => None,
        }
    }
}

pub fn role_arn(account_number: &str, role_name: &str) -> String {
    format!("arn:aws:iam::{}:role/{}", account_number, role_name)
}

#[derive(Debug, Deserialize)]
struct AssumeRoleResponse {
    #[serde(rename = "AssumeRoleResult")]
    result: AssumeRoleResult,
}

#[derive(Debug, Deserialize)]
struct AssumeRoleWithWebIdentityResponse {
    #[serde(rename = "AssumeRoleWithWebIdentityResult")]
    result: AssumeRoleResult,
}

#[derive(Debug, Deserialize)]
struct AssumeRoleResult {
    #[serde(rename = "Credentials")]
    credentials: StsCredentials,
}

#[derive(Debug, Deserialize)]
struct StsCredentials {
    #[serde(rename = "AccessKeyId")]
    access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    secret_access_key: String,
    #[serde(rename = "SessionToken")]
    session_token: String,
    #[serde(rename = "Expiration", default)]
    expiration: Option<String>,
}

impl StsCredentials {
    fn into_credential(self) -> ScopedCredential {
        let ttl = self
            .expiration
            .as_deref()
            .and_then(|e| chrono::DateTime::parse_from_rfc3339(e).ok())
            .and_then(|e| (e.with_timezone(&chrono::Utc) - chrono::Utc::now()).to_std().ok())
            .unwrap_or(Duration::from_secs(SESSION_DURATION_SECS));
        ScopedCredential::aws(
            AwsKeys {
                access_key_id: self.access_key_id,
                secret_access_key: self.secret_access_key,
                session_token: Some(self.session_token),
            },
            ttl,
        )
    }
}

/// Resolve a credential spec for `account`.
pub async fn resolve(
    client: &AwsClient,
    account: &str,
    spec: &AwsCredentialSpec,
) -> Result<ScopedCredential, ConnectorError> {
    match spec {
        AwsCredentialSpec::Static(keys) => {
            Ok(ScopedCredential::aws(keys.clone(), STATIC_KEY_TTL))
        }
        AwsCredentialSpec::AssumeRole {
            role_arn,
            session_name,
            external_id,
            source,
        } => {
            let credential = match source {
                AwsSource::Keys(keys) => {
                    assume_role(client, account, keys, role_arn, session_name, external_id.as_deref()).await?
                }
                AwsSource::WebIdentity(token_file) => {
                    assume_role_with_web_identity(client, account, role_arn, session_name, token_file).await?
                }
                AwsSource::Ambient => {
                    let keys = ambient_keys(client, account, session_name).await?;
                    assume_role(client, account, &keys, role_arn, session_name, external_id.as_deref()).await?
                }
            };
            info!(account = %account, role_arn = %role_arn, "Assumed AWS role");
            Ok(credential)
        }
    }
}

async fn assume_role(
    client: &AwsClient,
    account: &str,
    keys: &AwsKeys,
    role_arn: &str,
    session_name: &str,
    external_id: Option<&str>,
) -> Result<ScopedCredential, ConnectorError> {
    let mut query = vec![
        ("Action", "AssumeRole".to_string()),
        ("Version", STS_VERSION.to_string()),
        ("RoleArn", role_arn.to_string()),
        ("RoleSessionName", session_name.to_string()),
        ("DurationSeconds", SESSION_DURATION_SECS.to_string()),
    ];
    if let Some(external_id) = external_id {
        query.push(("ExternalId", external_id.to_string()));
    }

    let source = ScopedCredential::aws(keys.clone(), Duration::from_secs(SESSION_DURATION_SECS));
    let body = client
        .get(
            &source,
            &AwsRequest {
                service: "sts",
                region: "global",
                path: "/",
                query,
                resource_type: "AWS::STS",
            },
        )
        .await
        .map_err(|e| {
            let reason = match e.kind {
                ProviderErrorKind::PermissionDenied => "role assumption denied",
                _ => "role assumption failed",
            };
            ConnectorError::authentication(account, format!("{} for {}: {}", reason, role_arn, e.message))
        })?;

    let parsed: AssumeRoleResponse = quick_xml::de::from_str(&body).map_err(|e| {
        ConnectorError::authentication(account, format!("failed to parse AWS STS XML response: {}", e))
    })?;
    Ok(parsed.result.credentials.into_credential())
}

async fn assume_role_with_web_identity(
    client: &AwsClient,
    account: &str,
    role_arn: &str,
    session_name: &str,
    token_file: &Path,
) -> Result<ScopedCredential, ConnectorError> {
    let token = tokio::fs::read_to_string(token_file).await.map_err(|e| {
        ConnectorError::authentication(
            account,
            format!("failed to read web identity token from {}: {}", token_file.display(), e),
        )
    })?;

    let url = format!(
        "{}/?Action=AssumeRoleWithWebIdentity&Version={}&RoleArn={}&RoleSessionName={}&WebIdentityToken={}",
        client.endpoint("sts", "global"),
        STS_VERSION,
        urlencoding::encode(role_arn),
        urlencoding::encode(session_name),
        urlencoding::encode(token.trim())
    );

    let response = client
        .http()
        .get(&url)
        .send()
        .await
        .map_err(|e| ConnectorError::authentication(account, format!("failed to call AWS STS: {}", e)))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(ConnectorError::authentication(
            account,
            format!("AWS STS failed with {}: {}", status, body),
        ));
    }

    let body = response
        .text()
        .await
        .map_err(|e| ConnectorError::authentication(account, e.to_string()))?;
    let parsed: AssumeRoleWithWebIdentityResponse = quick_xml::de::from_str(&body).map_err(|e| {
        ConnectorError::authentication(account, format!("failed to parse AWS STS XML response: {}", e))
    })?;
    Ok(parsed.result.credentials.into_credential())
}

/// Keys from the process environment.
async fn ambient_keys(client: &AwsClient, account: &str, session_name: &str) -> Result<AwsKeys, ConnectorError> {
    let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

    if let (Some(access_key_id), Some(secret_access_key)) =
        (env("AWS_ACCESS_KEY_ID"), env("AWS_SECRET_ACCESS_KEY"))
    {
        return Ok(AwsKeys {
            access_key_id,
            secret_access_key,
            session_token: env("AWS_SESSION_TOKEN"),
        });
    }

    if let (Some(role_arn), Some(token_file)) = (env("AWS_ROLE_ARN"), env("AWS_WEB_IDENTITY_TOKEN_FILE")) {
        let credential =
            assume_role_with_web_identity(client, account, &role_arn, session_name, Path::new(&token_file)).await?;
        if let Some(keys) = credential.aws_keys() {
            return Ok(keys.clone());
        }
    }

    Err(ConnectorError::authentication(
        account,
        "no local AWS credentials found to assume the role with",
    ))
}
