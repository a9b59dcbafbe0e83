//! Cloud Connector Engine Library
//!
//! Discovers public IPs, domains and storage buckets across AWS, Azure and
//! GCP accounts and submits them to the asset inventory.

pub mod config;
pub mod connectors;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod retry;
pub mod seeds;
pub mod types;

pub use config::Settings;
pub use engine::{Engine, RunOutcome, RunStatus};
pub use error::ConnectorError;
pub use types::{Label, ProviderKind};
