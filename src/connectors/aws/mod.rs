//! AWS Connector
//!
//! Flattens the account tree into scopes and lists ENIs, load balancers,
//! API gateways, RDS instances, Route53 zones and S3 buckets per scope.

mod client;
mod enumerators;
mod sigv4;
mod sts;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::{AwsAccountConfig, AwsConfig, Settings, DEFAULT_IGNORE_TAG, DEFAULT_ROLE_SESSION_NAME};
use crate::connectors::{
    AwsKeys, CloudConnector, ConnectorContext, CredentialSpec, ResourceEnumerator, ScanScope,
    ScopedCredential,
};
use crate::error::ConnectorError;
use crate::types::ProviderKind;

pub use client::{AwsClient, AwsRequest};
pub use enumerators::{bucket_url, API_GATEWAY, ELB, NETWORK_INTERFACE, RDS, ROUTE53, S3};
pub use sts::{role_arn, AwsCredentialSpec, AwsSource};

pub struct AwsConnector {
    config: AwsConfig,
    client: AwsClient,
    settings: Arc<Settings>,
}

/// Role and credential source handed down to sub-accounts
#[derive(Clone)]
struct Inherited {
    role_name: Option<String>,
    session_name: String,
    source: AwsSource,
    ignore_tags: Vec<String>,
}

impl AwsConnector {
    pub fn new(config: AwsConfig, ctx: &ConnectorContext) -> Self {
        let client = AwsClient::new(
            ctx.http.clone(),
            ctx.settings.endpoints.aws_endpoint_url.clone(),
            ctx.retry.clone(),
        );
        Self {
            config,
            client,
            settings: ctx.settings.clone(),
        }
    }

    fn scope(&self, account_id: &str, credential: AwsCredentialSpec, ignore_tags: Vec<String>) -> ScanScope {
        ScanScope {
            provider: ProviderKind::Aws,
            account_id: account_id.to_string(),
            regions: self.config.regions.clone(),
            ignore_types: self.config.ignore.iter().cloned().collect::<BTreeSet<_>>(),
            ignore_tags,
            credential: CredentialSpec::Aws(credential),
        }
    }

    /// Source credentials configured on the top-level entry
    fn root_source(&self) -> AwsSource {
        if self.config.has_keys() {
            AwsSource::Keys(keys(
                self.config.access_key.as_deref(),
                self.config.secret_key.as_deref(),
                self.config.session_token.as_deref(),
            ))
        } else if let Some(file) = self.config.web_identity_token_file.as_deref().filter(|f| !f.is_empty()) {
            AwsSource::WebIdentity(self.settings.secret_path(file))
        } else {
            AwsSource::Ambient
        }
    }

    fn collect_children(&self, children: &[AwsAccountConfig], parent: &Inherited, scopes: &mut Vec<ScanScope>) {
        for child in children {
            let mut ignore_tags = parent.ignore_tags.clone();
            for tag in &child.ignore_tags {
                if !ignore_tags.contains(tag) {
                    ignore_tags.push(tag.clone());
                }
            }
            let session_name = child
                .role_session_name
                .clone()
                .unwrap_or_else(|| parent.session_name.clone());

            let (credential, inherited) = if child.has_keys() {
                let child_keys = keys(child.access_key.as_deref(), child.secret_key.as_deref(), None);
                let credential = match &parent.role_name {
                    Some(role) => AwsCredentialSpec::AssumeRole {
                        role_arn: role_arn(&child.account_number, role),
                        session_name: session_name.clone(),
                        external_id: self.config.external_id.clone(),
                        source: AwsSource::Keys(child_keys.clone()),
                    },
                    None => AwsCredentialSpec::Static(child_keys.clone()),
                };
                let inherited = Inherited {
                    role_name: parent.role_name.clone(),
                    session_name,
                    source: AwsSource::Keys(child_keys),
                    ignore_tags: ignore_tags.clone(),
                };
                (Some(credential), inherited)
            } else {
                let role_name = child.role_name.clone().filter(|r| !r.is_empty()).or_else(|| parent.role_name.clone());
                let credential = role_name.as_ref().map(|role| AwsCredentialSpec::AssumeRole {
                    role_arn: role_arn(&child.account_number, role),
                    session_name: session_name.clone(),
                    external_id: self.config.external_id.clone(),
                    source: parent.source.clone(),
                });
                let inherited = Inherited {
                    role_name,
                    session_name,
                    source: parent.source.clone(),
                    ignore_tags: ignore_tags.clone(),
                };
                (credential, inherited)
            };

            match credential {
                Some(credential) => scopes.push(self.scope(&child.account_number, credential, ignore_tags)),
                None => tracing::warn!(
                    account = %child.account_number,
                    "AWS sub-account has neither keys nor an inherited role, skipping"
                ),
            }
            self.collect_children(&child.accounts, &inherited, scopes);
        }
    }
}

fn keys(access_key: Option<&str>, secret_key: Option<&str>, session_token: Option<&str>) -> AwsKeys {
    AwsKeys {
        access_key_id: access_key.unwrap_or_default().to_string(),
        secret_access_key: secret_key.unwrap_or_default().to_string(),
        session_token: session_token.filter(|t| !t.is_empty()).map(String::from),
    }
}

#[async_trait]
impl CloudConnector for AwsConnector {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Aws
    }

    fn scopes(&self) -> Vec<ScanScope> {
        let source = self.root_source();
        let role_name = self.config.role_name.clone().filter(|r| !r.is_empty());
        let session_name = self
            .config
            .role_session_name
            .clone()
            .unwrap_or_else(|| DEFAULT_ROLE_SESSION_NAME.to_string());

        let credential = match (&role_name, &source) {
            (Some(role), _) => AwsCredentialSpec::AssumeRole {
                role_arn: role_arn(&self.config.account_number, role),
                session_name: session_name.clone(),
                external_id: self.config.external_id.clone(),
                source: source.clone(),
            },
            (None, AwsSource::Keys(root_keys)) => AwsCredentialSpec::Static(root_keys.clone()),
            // validation guarantees keys or a role
            (None, _) => AwsCredentialSpec::Static(keys(None, None, None)),
        };

        // the well-known tag always applies, whatever the account lists
        let mut ignore_tags = self.config.ignore_tags.clone();
        if !ignore_tags.iter().any(|t| t == DEFAULT_IGNORE_TAG) {
            ignore_tags.push(DEFAULT_IGNORE_TAG.to_string());
        }

        let mut scopes = vec![self.scope(&self.config.account_number, credential, ignore_tags.clone())];
        let inherited = Inherited {
            role_name,
            session_name,
            source,
            ignore_tags,
        };
        self.collect_children(&self.config.accounts, &inherited, &mut scopes);
        scopes
    }

    async fn resolve_credential(&self, scope: &ScanScope) -> Result<ScopedCredential, ConnectorError> {
        match &scope.credential {
            CredentialSpec::Aws(spec) => sts::resolve(&self.client, &scope.account_id, spec).await,
            CredentialSpec::Resolved(credential) => Ok(credential.clone()),
            _ => Err(ConnectorError::authentication(
                &scope.account_id,
                "scope does not carry an AWS credential",
            )),
        }
    }

    fn enumerators(&self, scope: &ScanScope) -> Vec<Arc<dyn ResourceEnumerator>> {
        vec![
            Arc::new(enumerators::NetworkInterfaces::new(self.client.clone())),
            Arc::new(enumerators::LoadBalancers::new(self.client.clone())),
            Arc::new(enumerators::ApiGateways::new(self.client.clone())),
            Arc::new(enumerators::DbInstances::new(self.client.clone())),
            Arc::new(enumerators::HostedZones::new(self.client.clone())),
            Arc::new(enumerators::StorageBuckets::new(self.client.clone(), &scope.account_id)),
        ]
    }

    fn healthcheck_payload(&self, scope: &ScanScope) -> serde_json::Value {
        serde_json::json!({ "aws": { "account_number": scope.account_id } })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_providers, ProviderAccount};
    use crate::retry::RetryPolicy;

    const TREE: &str = r#"
- provider: aws
  account_number: "111111111111"
  access_key: AKIAPARENT
  secret_key: parent-secret
  role_name: SharedRole
  regions: [us-east-1, eu-west-1]
  ignore: ["AWS::RDS"]
  accounts:
    - account_number: "222222222222"
    - account_number: "333333333333"
      role_name: Role333
      ignore_tags: [skip-me]
      accounts:
        - account_number: "444444444444"
    - account_number: "555555555555"
      access_key: AKIACHILD
      secret_key: child-secret
"#;

    fn connector(yaml: &str) -> AwsConnector {
        let accounts = parse_providers(yaml).unwrap();
        let ProviderAccount::Aws(config) = accounts[0].clone() else {
            panic!("expected aws");
        };
        let ctx = ConnectorContext {
            http: reqwest::Client::new(),
            settings: Arc::new(Settings::default()),
            retry: RetryPolicy::transient(),
        };
        AwsConnector::new(config, &ctx)
    }

    fn arn(scope: &ScanScope) -> Option<String> {
        match &scope.credential {
            CredentialSpec::Aws(spec) => spec.role_arn().map(String::from),
            _ => None,
        }
    }

    #[test]
    fn test_scopes_inherit_effective_role() {
        let scopes = connector(TREE).scopes();
        let accounts: Vec<_> = scopes.iter().map(|s| s.account_id.as_str()).collect();
        assert_eq!(
            accounts,
            vec!["111111111111", "222222222222", "333333333333", "444444444444", "555555555555"]
        );

        assert_eq!(arn(&scopes[0]).as_deref(), Some("arn:aws:iam::111111111111:role/SharedRole"));
        assert_eq!(arn(&scopes[1]).as_deref(), Some("arn:aws:iam::222222222222:role/SharedRole"));
        assert_eq!(arn(&scopes[2]).as_deref(), Some("arn:aws:iam::333333333333:role/Role333"));
        // nested under 333, so Role333 is the effective role
        assert_eq!(arn(&scopes[3]).as_deref(), Some("arn:aws:iam::444444444444:role/Role333"));
    }

    #[test]
    fn test_child_keys_assume_inherited_role() {
        let scopes = connector(TREE).scopes();
        let CredentialSpec::Aws(AwsCredentialSpec::AssumeRole { role_arn, source, .. }) = &scopes[4].credential else {
            panic!("expected role assumption");
        };
        assert_eq!(role_arn, "arn:aws:iam::555555555555:role/SharedRole");
        let AwsSource::Keys(keys) = source else {
            panic!("expected child keys as source");
        };
        assert_eq!(keys.access_key_id, "AKIACHILD");
    }

    #[test]
    fn test_scopes_carry_ignore_lists() {
        let scopes = connector(TREE).scopes();
        assert!(scopes.iter().all(|s| s.ignore_types.contains("AWS::RDS")));
        assert!(scopes.iter().all(|s| s.regions.len() == 2));
        assert!(!scopes[1].ignore_tags.contains(&"skip-me".to_string()));
        assert!(scopes[2].ignore_tags.contains(&"skip-me".to_string()));
        assert!(scopes[3].ignore_tags.contains(&"skip-me".to_string()));
    }

    #[test]
    fn test_static_keys_without_role() {
        let yaml = r#"
- provider: aws
  account_number: "111111111111"
  access_key: AKIA
  secret_key: secret
  regions: [us-east-1]
"#;
        let scopes = connector(yaml).scopes();
        assert_eq!(scopes.len(), 1);
        assert!(matches!(
            scopes[0].credential,
            CredentialSpec::Aws(AwsCredentialSpec::Static(_))
        ));
    }

    #[test]
    fn test_healthcheck_payload_names_account() {
        let c = connector(TREE);
        let scope = &c.scopes()[0];
        assert_eq!(
            c.healthcheck_payload(scope),
            serde_json::json!({ "aws": { "account_number": "111111111111" } })
        );
        assert_eq!(c.enumerators(scope).len(), 6);
    }
}
