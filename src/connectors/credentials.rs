//! Scoped Credentials
//!
//! Time-boxed authorization material resolved per account pass, plus the
//! cache that lets every enumerator in that pass share one resolution.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ConnectorError;
use crate::types::ProviderKind;

/// Re-resolve credentials this close to expiry.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Resolved credential for one account scope
#[derive(Clone)]
pub struct ScopedCredential {
    pub value: CredentialValue,
    pub expires_at: Instant,
    pub provider: ProviderKind,
}

#[derive(Clone)]
pub enum CredentialValue {
    Token(String),
    AwsKeys(AwsKeys),
}

#[derive(Clone, PartialEq, Eq)]
pub struct AwsKeys {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for AwsKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsKeys")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl std::fmt::Debug for ScopedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match &self.value {
            CredentialValue::Token(_) => "Token(<redacted>)".to_string(),
            CredentialValue::AwsKeys(keys) => format!("{:?}", keys),
        };
        f.debug_struct("ScopedCredential")
            .field("value", &value)
            .field("provider", &self.provider)
            .field("expires_in", &self.time_until_expiry())
            .finish()
    }
}

impl ScopedCredential {
    pub fn token(provider: ProviderKind, token: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value: CredentialValue::Token(token.into()),
            expires_at: Instant::now() + ttl,
            provider,
        }
    }

    pub fn aws(keys: AwsKeys, ttl: Duration) -> Self {
        Self {
            value: CredentialValue::AwsKeys(keys),
            expires_at: Instant::now() + ttl,
            provider: ProviderKind::Aws,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        match &self.value {
            CredentialValue::Token(t) => Some(t),
            _ => None,
        }
    }

    pub fn aws_keys(&self) -> Option<&AwsKeys> {
        match &self.value {
            CredentialValue::AwsKeys(k) => Some(k),
            _ => None,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO)
    }

    pub fn needs_refresh(&self) -> bool {
        self.time_until_expiry() <= REFRESH_MARGIN
    }
}

/// Credential cache for a single account pass.
///
/// Created fresh for every account scope; never shared across accounts or
/// cycles.
#[derive(Default)]
pub struct CredentialCache {
    slot: Mutex<Option<ScopedCredential>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: ScopedCredential) -> Self {
        Self {
            slot: Mutex::new(Some(credential)),
        }
    }

    /// Return the cached credential, resolving it when missing or about to
    /// expire. Concurrent callers wait for a single resolution.
    pub async fn get_or_resolve<F, Fut>(&self, resolve: F) -> Result<ScopedCredential, ConnectorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ScopedCredential, ConnectorError>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(credential) = slot.as_ref() {
            if !credential.needs_refresh() {
                return Ok(credential.clone());
            }
            debug!(provider = %credential.provider, "Cached credential near expiry, refreshing");
        }
        let credential = resolve().await?;
        *slot = Some(credential.clone());
        Ok(credential)
    }
}
