//! Connector Configuration
//!
//! Runtime settings come from CLI flags or environment variables; provider
//! accounts come from the YAML providers file.

pub mod providers;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConnectorError;
use crate::types::ProviderKind;

pub use providers::{
    load_providers, parse_providers, AwsAccountConfig, AwsConfig, AzureConfig, GcpConfig,
    GcpWorkloadIdentity, ProviderAccount, DEFAULT_IGNORE_TAG, DEFAULT_ROLE_SESSION_NAME,
};

pub const DEFAULT_API_BASE_URL: &str = "https://app.censys.io/api";

/// Engine settings shared by every run
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Providers YAML file
    #[arg(long, env = "PROVIDERS_CONFIG_FILE", default_value = "providers.yml")]
    pub providers_config_file: PathBuf,

    /// Directory holding auxiliary credential files
    #[arg(long, env = "SECRETS_DIR", default_value = "./secrets")]
    pub secrets_dir: PathBuf,

    /// Enumerate and aggregate without submitting anything
    #[arg(long, env = "DRY_RUN", default_value = "false", action = ArgAction::Set, value_parser = BoolishValueParser::new(), num_args = 0..=1, default_missing_value = "true")]
    pub dry_run: bool,

    /// Log verbosity (DEBUG, INFO, WARNING, ERROR, CRITICAL or a tracing filter)
    #[arg(long, env = "LOGGING_LEVEL", default_value = "INFO")]
    pub logging_level: String,

    #[arg(long, env = "CENSYS_API_KEY", hide_env_values = true)]
    pub censys_api_key: Option<String>,

    #[arg(long, env = "CENSYS_ASM_API_BASE_URL", default_value = DEFAULT_API_BASE_URL)]
    pub censys_asm_api_base_url: String,

    #[arg(long, env = "CENSYS_USER_AGENT", default_value = concat!("censys-cloud-connector/", env!("CARGO_PKG_VERSION")))]
    pub censys_user_agent: String,

    /// Report run status to the integrations API
    #[arg(long, env = "HEALTHCHECK_ENABLED", default_value = "true", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub healthcheck_enabled: bool,

    /// Submit empty replacements for AWS labels that went empty
    #[arg(long, env = "AWS_STALE_SEEDS_CLEARING", default_value = "false", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub aws_stale_seeds_clearing: bool,

    #[arg(long, env = "AZURE_STALE_SEEDS_CLEARING", default_value = "false", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub azure_stale_seeds_clearing: bool,

    #[arg(long, env = "GCP_STALE_SEEDS_CLEARING", default_value = "false", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub gcp_stale_seeds_clearing: bool,

    /// Publish the tags of submitted AWS resources to the inventory
    #[arg(long, env = "AWS_TAGS_PLUGIN_ENABLED", default_value = "false", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub aws_tags_plugin_enabled: bool,

    /// Label state file (defaults to `<SECRETS_DIR>/.connector-state.json`)
    #[arg(long, env = "STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// Maximum concurrent enumeration tasks
    #[arg(long, env = "SCAN_CONCURRENCY", default_value = "8")]
    pub scan_concurrency: usize,

    /// Maximum concurrent inventory API calls
    #[arg(long, env = "SUBMISSION_CONCURRENCY", default_value = "4")]
    pub submission_concurrency: usize,

    /// Run deadline; unfinished tasks are cancelled and partial results submitted
    #[arg(long, env = "RUN_TIMEOUT_SECS", default_value = "3600")]
    pub run_timeout_secs: u64,

    /// Maximum seeds or assets per inventory API request
    #[arg(long, env = "MAX_BATCH_SIZE", default_value = "1000")]
    pub max_batch_size: usize,

    /// Resource types skipped for every account (comma separated)
    #[arg(long, env = "IGNORE_RESOURCE_TYPES", value_delimiter = ',')]
    pub ignore_resource_types: Vec<String>,

    #[command(flatten)]
    pub endpoints: Endpoints,
}

/// API endpoints, overridable for private clouds and tests
#[derive(Args, Debug, Clone)]
pub struct Endpoints {
    /// Single endpoint for every AWS service (path-style)
    #[arg(long, env = "AWS_ENDPOINT_URL", hide = true)]
    pub aws_endpoint_url: Option<String>,

    #[arg(long, env = "AZURE_AUTHORITY_HOST", default_value = "https://login.microsoftonline.com", hide = true)]
    pub azure_authority_host: String,

    #[arg(long, env = "AZURE_RESOURCE_MANAGER_URL", default_value = "https://management.azure.com", hide = true)]
    pub azure_resource_manager_url: String,

    #[arg(long, env = "GCP_STS_URL", default_value = "https://sts.googleapis.com/v1/token", hide = true)]
    pub gcp_sts_url: String,

    #[arg(long, env = "GCP_CLOUD_ASSET_URL", default_value = "https://cloudasset.googleapis.com", hide = true)]
    pub gcp_cloud_asset_url: String,

    /// Service account impersonation after a workload identity exchange
    #[arg(long, env = "GCP_IAM_CREDENTIALS_URL", default_value = "https://iamcredentials.googleapis.com", hide = true)]
    pub gcp_iam_credentials_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            aws_endpoint_url: None,
            azure_authority_host: "https://login.microsoftonline.com".to_string(),
            azure_resource_manager_url: "https://management.azure.com".to_string(),
            gcp_sts_url: "https://sts.googleapis.com/v1/token".to_string(),
            gcp_cloud_asset_url: "https://cloudasset.googleapis.com".to_string(),
            gcp_iam_credentials_url: "https://iamcredentials.googleapis.com".to_string(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            providers_config_file: PathBuf::from("providers.yml"),
            secrets_dir: PathBuf::from("./secrets"),
            dry_run: false,
            logging_level: "INFO".to_string(),
            censys_api_key: None,
            censys_asm_api_base_url: DEFAULT_API_BASE_URL.to_string(),
            censys_user_agent: concat!("censys-cloud-connector/", env!("CARGO_PKG_VERSION")).to_string(),
            healthcheck_enabled: true,
            aws_stale_seeds_clearing: false,
            azure_stale_seeds_clearing: false,
            gcp_stale_seeds_clearing: false,
            aws_tags_plugin_enabled: false,
            state_file: None,
            scan_concurrency: 8,
            submission_concurrency: 4,
            run_timeout_secs: 3600,
            max_batch_size: 1000,
            ignore_resource_types: Vec::new(),
            endpoints: Endpoints::default(),
        }
    }
}

impl Settings {
    /// Check cross-field constraints and normalize paths and URLs.
    pub fn validate(mut self) -> Result<Self, ConnectorError> {
        if !self.dry_run && self.censys_api_key.as_deref().map_or(true, str::is_empty) {
            return Err(ConnectorError::configuration(
                "CENSYS_API_KEY is required unless DRY_RUN is set",
            ));
        }
        if self.max_batch_size == 0 {
            return Err(ConnectorError::configuration("MAX_BATCH_SIZE must be at least 1"));
        }
        if self.scan_concurrency == 0 || self.submission_concurrency == 0 {
            return Err(ConnectorError::configuration("concurrency limits must be at least 1"));
        }

        self.censys_asm_api_base_url = self
            .censys_asm_api_base_url
            .trim_end_matches('/')
            .to_string();
        let secrets = self.secrets_dir.to_string_lossy();
        if secrets.len() > 1 && secrets.ends_with('/') {
            self.secrets_dir = PathBuf::from(secrets.trim_end_matches('/'));
        }
        self.ignore_resource_types.retain(|t| !t.trim().is_empty());
        Ok(self)
    }

    pub fn stale_clearing_enabled(&self, provider: ProviderKind) -> bool {
        match provider {
            ProviderKind::Aws => self.aws_stale_seeds_clearing,
            ProviderKind::Azure => self.azure_stale_seeds_clearing,
            ProviderKind::Gcp => self.gcp_stale_seeds_clearing,
        }
    }

    pub fn state_file_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.secrets_dir.join(".connector-state.json"))
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Resolve a path from the providers file against `SECRETS_DIR`.
    pub fn secret_path(&self, relative: &str) -> PathBuf {
        let path = PathBuf::from(relative);
        if path.is_absolute() {
            path
        } else {
            self.secrets_dir.join(path)
        }
    }
}
