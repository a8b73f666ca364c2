//! Command-line interface.

use clap::{Args, Parser, Subcommand};
use knockd_core::adapters::FirewallKind;
use knockd_core::{ConfigError, KnockSequence, KnockdConfig};
use std::net::IpAddr;
use std::path::PathBuf;

/// Port-knock access control daemon
#[derive(Parser, Debug)]
#[command(name = "knockd", version)]
#[command(about = "Opens a protected TCP port to clients that knock the right UDP sequence")]
pub struct Cli {
    /// Log filter, overriding KNOCKD_LOG_LEVEL / RUST_LOG
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve knocks and manage the protected port
    Run(DaemonArgs),
    /// Validate the configuration and print the effective settings
    CheckConfig(DaemonArgs),
    /// Remove the default-deny rule for the protected port
    Teardown(DaemonArgs),
    /// Send a knock sequence to a server
    Knock(KnockArgs),
}

/// Configuration file plus per-key overrides.
#[derive(Args, Debug, Clone, Default)]
pub struct DaemonArgs {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Knock ports, comma-separated (e.g. 1234,5678,9012)
    #[arg(long)]
    pub sequence: Option<KnockSequence>,

    /// TCP port to protect
    #[arg(long)]
    pub protected_port: Option<u16>,

    /// Seconds allowed from the first knock to the last
    #[arg(long)]
    pub window: Option<f64>,

    /// Seconds a completed sequence keeps the port open
    #[arg(long)]
    pub grant_duration: Option<f64>,

    /// Address to bind the knock sockets on
    #[arg(long)]
    pub listen_host: Option<IpAddr>,

    /// Log firewall changes instead of applying them
    #[arg(long)]
    pub dry_run: bool,
}

impl DaemonArgs {
    /// Load the configuration file (or defaults) and apply the flags on top.
    ///
    /// Values are only checked for syntax here; `KnockdConfig::to_knock_config`
    /// validates them.
    pub fn resolve(&self) -> Result<KnockdConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => KnockdConfig::load(path)?,
            None => KnockdConfig::default(),
        };

        let knock = &mut config.knock;
        if let Some(sequence) = &self.sequence {
            knock.sequence = sequence.ports().to_vec();
        }
        if let Some(port) = self.protected_port {
            knock.protected_port = port;
        }
        if let Some(window) = self.window {
            knock.window_secs = window;
        }
        if let Some(grant_duration) = self.grant_duration {
            knock.grant_duration_secs = grant_duration;
        }
        if let Some(host) = self.listen_host {
            knock.listen_host = host.to_string();
        }
        if self.dry_run {
            config.firewall.backend = FirewallKind::DryRun;
        }

        Ok(config)
    }
}

/// Client options.
#[derive(Args, Debug, Clone)]
pub struct KnockArgs {
    /// Target host or IP
    #[arg(short, long)]
    pub target: String,

    /// Knock ports, comma-separated
    #[arg(long, default_value = "1234,5678,9012")]
    pub sequence: KnockSequence,

    /// Protected service port
    #[arg(long, default_value_t = 2222)]
    pub protected_port: u16,

    /// Delay after each knock, in seconds
    #[arg(long, default_value_t = 0.3)]
    pub delay: f64,

    /// Attempt a TCP connection to the protected port after knocking
    #[arg(long)]
    pub check: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_run_without_flags_uses_defaults() {
        let Command::Run(args) = parse(&["knockd", "run"]).command else {
            panic!("expected run");
        };
        let config = args.resolve().unwrap();

        assert_eq!(config, KnockdConfig::default());
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[knock]\nprotected_port = 2022\nwindow_secs = 4.0").unwrap();
        let path = file.path().to_str().unwrap();

        let cli = parse(&[
            "knockd",
            "run",
            "--config",
            path,
            "--sequence",
            "7000,8000",
            "--window",
            "2.5",
            "--listen-host",
            "127.0.0.1",
            "--dry-run",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = args.resolve().unwrap();

        assert_eq!(config.knock.sequence, vec![7000, 8000]);
        assert_eq!(config.knock.protected_port, 2022);
        assert_eq!(config.knock.window_secs, 2.5);
        assert_eq!(config.knock.listen_host, "127.0.0.1");
        assert_eq!(config.firewall.backend, FirewallKind::DryRun);
    }

    #[test]
    fn test_invalid_sequence_rejected_by_parser() {
        assert!(Cli::try_parse_from(["knockd", "run", "--sequence", "1234,1234"]).is_err());
        assert!(Cli::try_parse_from(["knockd", "run", "--sequence", "1234,abc"]).is_err());
    }

    #[test]
    fn test_knock_defaults() {
        let Command::Knock(args) = parse(&["knockd", "knock", "--target", "10.0.0.1"]).command
        else {
            panic!("expected knock");
        };

        assert_eq!(args.target, "10.0.0.1");
        assert_eq!(args.sequence.ports(), &[1234, 5678, 9012]);
        assert_eq!(args.protected_port, 2222);
        assert_eq!(args.delay, 0.3);
        assert!(!args.check);
    }

    #[test]
    fn test_knock_requires_target() {
        assert!(Cli::try_parse_from(["knockd", "knock"]).is_err());
    }

    #[test]
    fn test_global_log_level() {
        let cli = parse(&["knockd", "check-config", "--log-level", "debug"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Command::CheckConfig(_)));
    }

    #[test]
    fn test_teardown_accepts_daemon_flags() {
        let cli = parse(&["knockd", "teardown", "--protected-port", "2022"]);
        let Command::Teardown(args) = cli.command else {
            panic!("expected teardown");
        };
        assert_eq!(args.protected_port, Some(2022));
    }

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
