//! # knockd
//!
//! ```text
//! knockd run [--config knockd.toml] [--sequence 1234,5678,9012] [--dry-run] ...
//! knockd check-config [--config knockd.toml]
//! knockd teardown [--config knockd.toml]
//! knockd knock --target 10.0.0.1 [--check]
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use knockd::cli::{Cli, Command};
use knockd_telemetry::{init_logging, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let mut telemetry = TelemetryConfig::from_env();
    if let Some(level) = &cli.log_level {
        telemetry = telemetry.with_log_level(level.clone());
    }
    init_logging(&telemetry).context("failed to initialize logging")?;

    match &cli.command {
        Command::Run(args) => knockd::run_daemon(args).await,
        Command::CheckConfig(args) => {
            let rendered = knockd::check_config(args)?;
            print!("{rendered}");
            Ok(())
        }
        Command::Teardown(args) => knockd::teardown(args).await,
        Command::Knock(args) => knockd::knock(args).await,
    }
}
