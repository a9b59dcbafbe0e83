//! Cloud Connector
//!
//! Scans configured cloud accounts once or on an interval and submits the
//! results to the asset inventory.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cloud_connector::{Engine, ProviderKind, Settings};

#[derive(Parser, Debug)]
#[command(name = "cloud-connector", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan cloud accounts and submit seeds and cloud assets
    Scan {
        /// Only scan these providers (repeatable)
        #[arg(short, long = "provider")]
        providers: Vec<ProviderKind>,

        /// Repeat the scan every N seconds instead of running once
        #[arg(long, env = "SCAN_INTERVAL")]
        interval: Option<u64>,

        #[command(flatten)]
        settings: Settings,
    },
}

/// Map deployment level names such as `WARNING` or `CRITICAL` to a tracing filter.
fn env_filter(level: &str) -> EnvFilter {
    let directive = match level.trim().to_ascii_uppercase().as_str() {
        "DEBUG" => "debug".to_string(),
        "INFO" => "info".to_string(),
        "WARNING" | "WARN" => "warn".to_string(),
        "ERROR" | "CRITICAL" => "error".to_string(),
        _ => level.trim().to_string(),
    };
    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let Command::Scan {
        providers,
        interval,
        settings,
    } = cli.command;

    FmtSubscriber::builder()
        .with_env_filter(env_filter(&settings.logging_level))
        .with_target(false)
        .json()
        .init();

    let settings = settings.validate().context("Invalid settings")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        providers = ?providers,
        dry_run = settings.dry_run,
        interval = ?interval,
        "Starting cloud connector"
    );

    let engine = Engine::new(settings, providers).context("Failed to initialize engine")?;

    match interval {
        Some(secs) => {
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for shutdown signal");
                    std::future::pending::<()>().await;
                }
            };
            cloud_connector::engine::run_every(Duration::from_secs(secs.max(1)), || engine.run_once(), shutdown)
                .await;
            Ok(ExitCode::SUCCESS)
        }
        None => {
            let outcome = engine.run_once().await.context("Scan failed")?;
            if outcome.is_success() {
                Ok(ExitCode::SUCCESS)
            } else {
                error!(
                    run_id = %outcome.run_id,
                    status = ?outcome.status,
                    failed = outcome.report.summary().failed,
                    "Scan finished with permanent failures"
                );
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_command_parses_providers() {
        let cli = Cli::try_parse_from([
            "cloud-connector",
            "scan",
            "-p",
            "aws",
            "--provider",
            "GCP",
            "--dry-run",
        ])
        .unwrap();
        let Command::Scan {
            providers,
            interval,
            settings,
        } = cli.command;
        assert_eq!(providers, vec![ProviderKind::Aws, ProviderKind::Gcp]);
        assert_eq!(interval, None);
        assert!(settings.dry_run);
    }

    #[test]
    fn test_level_names_map_to_filters() {
        assert_eq!(env_filter("WARNING").to_string(), "warn");
        assert_eq!(env_filter("CRITICAL").to_string(), "error");
        assert_eq!(env_filter("cloud_connector=debug").to_string(), "cloud_connector=debug");
    }
}
