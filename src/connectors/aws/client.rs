//! Signed AWS API client
//!
//! Thin SigV4 GET client for the query (XML) and REST (JSON) APIs the
//! enumerators call. Transient failures are retried per request.

use chrono::Utc;
use reqwest::{Client, Url};
use tracing::debug;

use super::sigv4;
use crate::connectors::credentials::ScopedCredential;
use crate::error::{ProviderError, ProviderErrorKind};
use crate::retry::RetryPolicy;

/// Region used to sign requests to global services
pub const GLOBAL_SIGNING_REGION: &str = "us-east-1";

#[derive(Clone)]
pub struct AwsClient {
    http: Client,
    /// Path-style endpoint used for every service when set
    endpoint_override: Option<String>,
    retry: RetryPolicy,
}

/// Where and how to send one request
pub struct AwsRequest<'a> {
    pub service: &'a str,
    pub region: &'a str,
    pub path: &'a str,
    pub query: Vec<(&'a str, String)>,
    /// Resource type and listing region reported on failure
    pub resource_type: &'a str,
}

impl AwsClient {
    pub fn new(http: Client, endpoint_override: Option<String>, retry: RetryPolicy) -> Self {
        Self {
            http,
            endpoint_override: endpoint_override.map(|e| e.trim_end_matches('/').to_string()),
            retry,
        }
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn endpoint(&self, service: &str, region: &str) -> String {
        if let Some(base) = &self.endpoint_override {
            return base.clone();
        }
        match service {
            "route53" | "s3" | "sts" | "iam" => format!("https://{}.amazonaws.com", service),
            _ => format!("https://{}.{}.amazonaws.com", service, region),
        }
    }

    pub fn signing_region<'a>(&self, service: &str, region: &'a str) -> &'a str {
        match service {
            "route53" | "s3" | "sts" | "iam" => GLOBAL_SIGNING_REGION,
            _ => region,
        }
    }

    fn build_url(&self, request: &AwsRequest<'_>) -> Result<Url, ProviderError> {
        let base = self.endpoint(request.service, request.region);
        let mut url = Url::parse(&format!("{}{}", base, request.path)).map_err(|e| {
            ProviderError::new(
                request.resource_type,
                request.region,
                ProviderErrorKind::Rejected,
                format!("invalid endpoint: {}", e),
            )
        })?;
        if !request.query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(request.query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    /// Signed GET returning the response body.
    pub async fn get(
        &self,
        credential: &ScopedCredential,
        request: &AwsRequest<'_>,
    ) -> Result<String, ProviderError> {
        let url = self.build_url(request)?;
        let operation = format!("{} {}", request.resource_type, request.region);
        self.retry
            .execute(&operation, || self.get_once(credential, request, &url))
            .await
    }

    async fn get_once(
        &self,
        credential: &ScopedCredential,
        request: &AwsRequest<'_>,
        url: &Url,
    ) -> Result<String, ProviderError> {
        let keys = credential.aws_keys().ok_or_else(|| {
            ProviderError::new(
                request.resource_type,
                request.region,
                ProviderErrorKind::PermissionDenied,
                "credential is not an AWS key pair",
            )
        })?;

        let signing_region = self.signing_region(request.service, request.region);
        let headers = sigv4::sign("GET", url, b"", request.service, signing_region, keys, Utc::now())
            .map_err(|e| ProviderError::malformed(request.resource_type, request.region, e))?;

        let mut builder = self.http.get(url.clone());
        for (name, value) in headers {
            builder = builder.header(name, value);
        }

        debug!(service = request.service, region = request.region, path = request.path, "AWS request");

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::transport(request.resource_type, request.region, &e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::transport(request.resource_type, request.region, &e))?;

        if !status.is_success() {
            return Err(ProviderError::from_status(
                request.resource_type,
                request.region,
                status,
                &body,
            ));
        }
        Ok(body)
    }
}
