//! Connector Error Taxonomy
//!
//! Each variant has a fixed blast radius: configuration errors abort the
//! run, authentication errors drop one account, provider errors drop one
//! label, submission errors fail one label's upload.

use std::time::Duration;
use thiserror::Error;

use crate::retry::Retryable;

#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Invalid or missing configuration. Fatal before any scanning starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Credential resolution failed for one account.
    #[error("authentication failed for account {account}: {message}")]
    Authentication { account: String, message: String },

    /// An enumerator call failed for one (account, region, resource type).
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The inventory API rejected or could not be reached for a batch.
    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

impl ConnectorError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn authentication(account: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Authentication {
            account: account.into(),
            message: message.into(),
        }
    }
}

/// Failure kind of a cloud API call, used to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Throttling, 5xx or network failures.
    Transient,
    /// 401/403 or an explicit access-denied code. Never retried.
    PermissionDenied,
    /// Anything else the provider rejected, including malformed responses.
    Rejected,
}

#[derive(Debug, Clone, Error)]
#[error("{resource_type} in {region} failed ({kind:?}): {message}")]
pub struct ProviderError {
    pub resource_type: String,
    pub region: String,
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(
        resource_type: impl Into<String>,
        region: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            region: region.into(),
            kind,
            message: message.into(),
        }
    }

    /// Classify an HTTP status returned by a cloud API.
    pub fn from_status(
        resource_type: &str,
        region: &str,
        status: reqwest::StatusCode,
        body: &str,
    ) -> Self {
        let kind = if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
            || body.contains("AccessDenied")
            || body.contains("UnauthorizedOperation")
            || body.contains("AuthorizationFailed")
        {
            ProviderErrorKind::PermissionDenied
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
            || body.contains("Throttling")
            || body.contains("RequestLimitExceeded")
        {
            ProviderErrorKind::Transient
        } else {
            ProviderErrorKind::Rejected
        };

        Self::new(
            resource_type,
            region,
            kind,
            format!("{} returned {}: {}", resource_type, status, truncate(body, 512)),
        )
    }

    /// Network-level failure (connect, timeout, body read).
    pub fn transport(resource_type: &str, region: &str, err: &reqwest::Error) -> Self {
        Self::new(resource_type, region, ProviderErrorKind::Transient, err.to_string())
    }

    /// Response could not be decoded.
    pub fn malformed(resource_type: &str, region: &str, message: impl std::fmt::Display) -> Self {
        Self::new(
            resource_type,
            region,
            ProviderErrorKind::Rejected,
            format!("malformed response: {}", message),
        )
    }
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }
}

#[derive(Debug, Clone, Error)]
pub enum SubmissionError {
    /// 5xx or network failure. Retried.
    #[error("inventory API unavailable: {0}")]
    Unavailable(String),

    /// 429. Retried after the server-provided delay when present.
    #[error("inventory API rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Any other 4xx. Permanent for the batch.
    #[error("inventory API rejected batch with {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Retries exhausted on a retryable error.
    #[error("gave up after {attempts} attempt(s): {message}")]
    Exhausted { attempts: u32, message: String },
}

impl SubmissionError {
    pub fn from_response(status: reqwest::StatusCode, retry_after: Option<Duration>, body: String) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            SubmissionError::RateLimited { retry_after }
        } else if status.is_server_error() {
            SubmissionError::Unavailable(format!("{}: {}", status, truncate(&body, 512)))
        } else {
            SubmissionError::Rejected {
                status: status.as_u16(),
                body: truncate(&body, 512).to_string(),
            }
        }
    }
}

impl Retryable for SubmissionError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            SubmissionError::Unavailable(_) | SubmissionError::RateLimited { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            SubmissionError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    fn exhausted(attempts: u32, last: Self) -> Self {
        SubmissionError::Exhausted {
            attempts,
            message: last.to_string(),
        }
    }
}

/// Token endpoint failures while resolving a credential.
#[derive(Debug, Clone, Error)]
pub enum TokenError {
    #[error("token endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("token request rejected: {0}")]
    Rejected(String),
}

impl Retryable for TokenError {
    fn is_retryable(&self) -> bool {
        matches!(self, TokenError::Unavailable(_))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_provider_error_classification() {
        let denied = ProviderError::from_status("AWS::RDS", "us-east-1", StatusCode::FORBIDDEN, "");
        assert_eq!(denied.kind, ProviderErrorKind::PermissionDenied);
        assert!(!denied.is_retryable());

        let throttled = ProviderError::from_status(
            "AWS::RDS",
            "us-east-1",
            StatusCode::BAD_REQUEST,
            "<Code>Throttling</Code>",
        );
        assert_eq!(throttled.kind, ProviderErrorKind::Transient);

        let unavailable =
            ProviderError::from_status("AWS::RDS", "us-east-1", StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(unavailable.is_retryable());

        let bad = ProviderError::from_status("AWS::RDS", "us-east-1", StatusCode::BAD_REQUEST, "nope");
        assert_eq!(bad.kind, ProviderErrorKind::Rejected);
    }

    #[test]
    fn test_submission_error_from_response() {
        let limited = SubmissionError::from_response(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(7)),
            String::new(),
        );
        assert!(limited.is_retryable());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(7)));

        let rejected = SubmissionError::from_response(StatusCode::UNPROCESSABLE_ENTITY, None, "bad".into());
        assert!(!rejected.is_retryable());

        let server = SubmissionError::from_response(StatusCode::BAD_GATEWAY, None, String::new());
        assert!(server.is_retryable());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
