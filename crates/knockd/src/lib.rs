//! # Knockd
//!
//! Executable crate for the knock daemon.
//!
//! - `cli/` - Argument parsing and config overrides
//! - `runtime/` - Startup order, dispatcher, signal handling
//! - `client/` - The `knock` subcommand

pub mod cli;
pub mod client;
pub mod runtime;

use anyhow::{Context, Result};
use cli::{DaemonArgs, KnockArgs};
use knockd_core::FirewallBackend;
use std::time::Duration;
use tracing::info;

/// `knockd run`
pub async fn run_daemon(args: &DaemonArgs) -> Result<()> {
    let config = args.resolve().context("failed to load configuration")?;
    let runtime = runtime::KnockdRuntime::from_file_config(&config)?;

    let shutdown = runtime.shutdown_handle();
    let signals = tokio::spawn(async move {
        runtime::wait_for_shutdown_signal().await;
        let _ = shutdown.send(true);
    });

    let result = runtime.run().await;
    signals.abort();
    result.map(|_| ())
}

/// `knockd check-config`: the effective configuration as TOML.
pub fn check_config(args: &DaemonArgs) -> Result<String> {
    let config = args.resolve().context("failed to load configuration")?;
    config
        .to_knock_config()
        .context("invalid knock configuration")?;
    config
        .to_toml()
        .context("failed to render configuration")
}

/// `knockd teardown`: drop the default-deny rule left by a daemon that
/// exited with the `keep` policy or crashed. Allow rules are not touched.
pub async fn teardown(args: &DaemonArgs) -> Result<()> {
    let config = args.resolve().context("failed to load configuration")?;
    let knock_config = config
        .to_knock_config()
        .context("invalid knock configuration")?;
    let port = knock_config.protected_port;

    config
        .build_firewall()
        .clear_default_deny(port)
        .await
        .with_context(|| format!("failed to remove default-deny for port {port}"))?;
    info!(port, "default-deny removed");
    Ok(())
}

/// `knockd knock`
pub async fn knock(args: &KnockArgs) -> Result<()> {
    let target = client::resolve_target(&args.target).await?;
    let delay = Duration::try_from_secs_f64(args.delay)
        .with_context(|| format!("invalid --delay {}", args.delay))?;

    let sent = client::send_sequence(target, &args.sequence, delay).await?;
    info!(target = %target, sequence = %args.sequence, sent, "knock sequence sent");

    if args.check {
        if client::check_protected_port(target, args.protected_port, client::CHECK_TIMEOUT).await
        {
            println!("Connected to protected port {}", args.protected_port);
        } else {
            println!("Could not connect to protected port {}", args.protected_port);
        }
    }
    Ok(())
}
