//! Providers file
//!
//! An ordered YAML list of provider accounts. Each entry is tagged with
//! `provider: aws | azure | gcp` (case-insensitive).

use serde::{Deserialize, Deserializer};
use std::path::Path;

use crate::error::ConnectorError;
use crate::types::ProviderKind;

/// Tag every AWS resource can carry to opt out of discovery
pub const DEFAULT_IGNORE_TAG: &str = "censys-cloud-connector-ignore";

pub const DEFAULT_ROLE_SESSION_NAME: &str = "censys-cloud-connector";

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "provider")]
pub enum ProviderAccount {
    #[serde(rename = "aws", alias = "AWS", alias = "Aws")]
    Aws(AwsConfig),
    #[serde(rename = "azure", alias = "AZURE", alias = "Azure")]
    Azure(AzureConfig),
    #[serde(rename = "gcp", alias = "GCP", alias = "Gcp")]
    Gcp(GcpConfig),
}

impl ProviderAccount {
    pub fn provider(&self) -> ProviderKind {
        match self {
            ProviderAccount::Aws(_) => ProviderKind::Aws,
            ProviderAccount::Azure(_) => ProviderKind::Azure,
            ProviderAccount::Gcp(_) => ProviderKind::Gcp,
        }
    }

    /// Identifier used in logs and healthcheck payloads
    pub fn primary_id(&self) -> String {
        match self {
            ProviderAccount::Aws(c) => c.account_number.clone(),
            ProviderAccount::Azure(c) => c.subscription_id.join(","),
            ProviderAccount::Gcp(c) => c.organization_id.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ConnectorError> {
        match self {
            ProviderAccount::Aws(c) => c.validate(),
            ProviderAccount::Azure(c) => c.validate(),
            ProviderAccount::Gcp(c) => c.validate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    pub account_number: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
    pub role_name: Option<String>,
    pub role_session_name: Option<String>,
    pub external_id: Option<String>,
    /// Assume `role_name` with a web identity token instead of keys
    pub web_identity_token_file: Option<String>,
    pub regions: Vec<String>,
    #[serde(default = "default_ignore_tags")]
    pub ignore_tags: Vec<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub accounts: Vec<AwsAccountConfig>,
}

/// Sub-account entry. Nested `accounts` inherit the effective role.
#[derive(Debug, Clone, Deserialize)]
pub struct AwsAccountConfig {
    pub account_number: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub role_name: Option<String>,
    pub role_session_name: Option<String>,
    #[serde(default)]
    pub ignore_tags: Vec<String>,
    #[serde(default)]
    pub accounts: Vec<AwsAccountConfig>,
}

fn default_ignore_tags() -> Vec<String> {
    vec![DEFAULT_IGNORE_TAG.to_string()]
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().map_or(false, |v| !v.trim().is_empty())
}

fn is_account_number(value: &str) -> bool {
    value.len() == 12 && value.chars().all(|c| c.is_ascii_digit())
}

impl AwsConfig {
    pub fn has_keys(&self) -> bool {
        non_empty(&self.access_key) && non_empty(&self.secret_key)
    }

    pub fn has_role(&self) -> bool {
        non_empty(&self.role_name)
    }

    fn validate(&self) -> Result<(), ConnectorError> {
        if !is_account_number(&self.account_number) {
            return Err(ConnectorError::configuration(format!(
                "AWS account number '{}' must be 12 digits",
                self.account_number
            )));
        }
        if !self.has_keys() && !self.has_role() {
            return Err(ConnectorError::configuration(format!(
                "AWS account {} needs an access key pair or a role name",
                self.account_number
            )));
        }
        if non_empty(&self.web_identity_token_file) && !self.has_role() {
            return Err(ConnectorError::configuration(format!(
                "AWS account {} sets web_identity_token_file without role_name",
                self.account_number
            )));
        }
        if self.regions.is_empty() {
            return Err(ConnectorError::configuration(format!(
                "AWS account {} needs at least one region",
                self.account_number
            )));
        }
        self.accounts.iter().try_for_each(AwsAccountConfig::validate)
    }
}

impl AwsAccountConfig {
    pub fn has_keys(&self) -> bool {
        non_empty(&self.access_key) && non_empty(&self.secret_key)
    }

    pub fn has_role(&self) -> bool {
        non_empty(&self.role_name)
    }

    fn validate(&self) -> Result<(), ConnectorError> {
        if !is_account_number(&self.account_number) {
            return Err(ConnectorError::configuration(format!(
                "AWS sub-account number '{}' must be 12 digits",
                self.account_number
            )));
        }
        if self.has_keys() && self.has_role() {
            return Err(ConnectorError::configuration(format!(
                "AWS sub-account {} may define keys or a role, not both",
                self.account_number
            )));
        }
        self.accounts.iter().try_for_each(AwsAccountConfig::validate)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AzureConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    /// Federated token for workload identity, used when no secret is set
    pub federated_token_file: Option<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub subscription_id: Vec<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
}

impl AzureConfig {
    fn validate(&self) -> Result<(), ConnectorError> {
        if self.subscription_id.is_empty() {
            return Err(ConnectorError::configuration(format!(
                "Azure tenant {} needs at least one subscription_id",
                self.tenant_id
            )));
        }
        if !non_empty(&self.client_secret) && !non_empty(&self.federated_token_file) {
            return Err(ConnectorError::configuration(format!(
                "Azure client {} needs client_secret or federated_token_file",
                self.client_id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GcpConfig {
    pub organization_id: String,
    /// Path relative to `SECRETS_DIR`
    pub service_account_json_file: Option<String>,
    pub service_account_email: Option<String>,
    pub workload_identity: Option<GcpWorkloadIdentity>,
    #[serde(default)]
    pub ignore: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GcpWorkloadIdentity {
    /// `//iam.googleapis.com/projects/.../providers/...`
    pub audience: String,
    pub token_file: String,
}

impl GcpConfig {
    fn validate(&self) -> Result<(), ConnectorError> {
        if self.organization_id.trim().is_empty() {
            return Err(ConnectorError::configuration("GCP organization_id is empty"));
        }
        if !non_empty(&self.service_account_json_file) && self.workload_identity.is_none() {
            return Err(ConnectorError::configuration(format!(
                "GCP organization {} needs service_account_json_file or workload_identity",
                self.organization_id
            )));
        }
        Ok(())
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// Parse and validate a providers document.
pub fn parse_providers(yaml: &str) -> Result<Vec<ProviderAccount>, ConnectorError> {
    let accounts: Option<Vec<ProviderAccount>> = serde_yaml::from_str(yaml)
        .map_err(|e| ConnectorError::configuration(format!("invalid providers file: {}", e)))?;
    let accounts = accounts.unwrap_or_default();
    for account in &accounts {
        account.validate()?;
    }
    Ok(accounts)
}

pub fn load_providers(path: &Path) -> Result<Vec<ProviderAccount>, ConnectorError> {
    let yaml = std::fs::read_to_string(path).map_err(|e| {
        ConnectorError::configuration(format!("failed to read {}: {}", path.display(), e))
    })?;
    parse_providers(&yaml)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROVIDERS: &str = r#"
- provider: AWS
  account_number: "111111111111"
  role_name: SharedRole
  regions: [us-east-1, eu-west-1]
  accounts:
    - account_number: "222222222222"
    - account_number: "333333333333"
      role_name: Role333
- provider: azure
  tenant_id: tenant
  client_id: client
  client_secret: secret
  subscription_id: sub-1
- provider: gcp
  organization_id: "123"
  service_account_json_file: sa.json
"#;

    #[test]
    fn test_parse_mixed_providers() {
        let accounts = parse_providers(PROVIDERS).unwrap();
        assert_eq!(accounts.len(), 3);
        assert_eq!(accounts[0].provider(), ProviderKind::Aws);
        assert_eq!(accounts[1].provider(), ProviderKind::Azure);
        assert_eq!(accounts[2].provider(), ProviderKind::Gcp);

        let ProviderAccount::Aws(aws) = &accounts[0] else {
            panic!("expected aws");
        };
        assert_eq!(aws.accounts.len(), 2);
        assert_eq!(aws.ignore_tags, vec![DEFAULT_IGNORE_TAG.to_string()]);

        let ProviderAccount::Azure(azure) = &accounts[1] else {
            panic!("expected azure");
        };
        assert_eq!(azure.subscription_id, vec!["sub-1".to_string()]);
    }

    #[test]
    fn test_aws_requires_key_or_role() {
        let yaml = r#"
- provider: aws
  account_number: "111111111111"
  regions: [us-east-1]
"#;
        assert!(matches!(parse_providers(yaml), Err(ConnectorError::Configuration(_))));
    }

    #[test]
    fn test_aws_sub_account_rejects_keys_and_role() {
        let yaml = r#"
- provider: aws
  account_number: "111111111111"
  role_name: SharedRole
  regions: [us-east-1]
  accounts:
    - account_number: "222222222222"
      access_key: AKIA
      secret_key: secret
      role_name: Other
"#;
        assert!(parse_providers(yaml).is_err());
    }

    #[test]
    fn test_aws_account_number_format() {
        let yaml = r#"
- provider: aws
  account_number: "1234"
  role_name: SharedRole
  regions: [us-east-1]
"#;
        assert!(parse_providers(yaml).is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let yaml = "- provider: oracle\n  tenancy: x\n";
        assert!(parse_providers(yaml).is_err());
    }

    #[test]
    fn test_empty_file_has_no_accounts() {
        assert!(parse_providers("").unwrap().is_empty());
    }

    #[test]
    fn test_load_providers_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.yml");
        std::fs::write(&path, PROVIDERS).unwrap();
        assert_eq!(load_providers(&path).unwrap().len(), 3);

        let missing = dir.path().join("missing.yml");
        assert!(matches!(load_providers(&missing), Err(ConnectorError::Configuration(_))));
    }
}
