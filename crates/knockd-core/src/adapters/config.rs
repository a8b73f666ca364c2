//! TOML configuration file.
//!
//! Every key has a default, so an empty file (or no file) yields the stock
//! daemon: sequence `1234,5678,9012`, protected port `2222`, a 10 second
//! window and 30 second grants.
//!
//! # Config File Format
//!
//! ```toml
//! [knock]
//! sequence = [1234, 5678, 9012]
//! protected_port = 2222
//! window_secs = 10.0
//! grant_duration_secs = 30.0
//! listen_host = "0.0.0.0"
//! sweep_interval_secs = 1.0
//! repeated_first_knock = "restart"   # restart | ignore | reset
//! shutdown_policy = "revoke"         # revoke | keep
//!
//! [firewall]
//! backend = "iptables"               # iptables | dry-run
//! iptables = "iptables"
//! ip6tables = "ip6tables"
//! chain = "INPUT"
//! protocol = "tcp"
//! ipv6 = true
//! ```

use super::firewall::{build_firewall, FirewallKind, IptablesSettings};
use crate::domain::{positive_secs, ConfigError, KnockConfig, KnockSequence};
use crate::ports::FirewallBackend;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Configuration file structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KnockdConfig {
    /// `[knock]` section.
    pub knock: KnockSection,
    /// `[firewall]` section.
    pub firewall: FirewallSection,
}

/// `[knock]` section, as written in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KnockSection {
    /// Knock ports, in order.
    pub sequence: Vec<u16>,
    /// TCP port opened on a completed sequence.
    pub protected_port: u16,
    /// Seconds from the first knock to the last.
    pub window_secs: f64,
    /// Seconds a grant keeps the protected port open.
    pub grant_duration_secs: f64,
    /// Bind address for the knock sockets.
    pub listen_host: String,
    /// Seconds between sweeps of stale progress.
    pub sweep_interval_secs: f64,
    /// `restart`, `ignore` or `reset`.
    pub repeated_first_knock: String,
    /// `revoke` or `keep`.
    pub shutdown_policy: String,
}

impl Default for KnockSection {
    fn default() -> Self {
        Self {
            sequence: KnockSequence::default().ports().to_vec(),
            protected_port: 2222,
            window_secs: 10.0,
            grant_duration_secs: 30.0,
            listen_host: "0.0.0.0".to_string(),
            sweep_interval_secs: 1.0,
            repeated_first_knock: "restart".to_string(),
            shutdown_policy: "revoke".to_string(),
        }
    }
}

/// `[firewall]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FirewallSection {
    /// Backend driving the rules.
    pub backend: FirewallKind,
    /// IPv4 tool.
    pub iptables: PathBuf,
    /// IPv6 tool.
    pub ip6tables: PathBuf,
    /// Chain holding the rules.
    pub chain: String,
    /// Protocol of the protected port.
    pub protocol: String,
    /// Also install default-deny through `ip6tables`.
    pub ipv6: bool,
}

impl Default for FirewallSection {
    fn default() -> Self {
        Self::from_settings(FirewallKind::default(), IptablesSettings::default())
    }
}

impl FirewallSection {
    fn from_settings(backend: FirewallKind, settings: IptablesSettings) -> Self {
        Self {
            backend,
            iptables: settings.iptables,
            ip6tables: settings.ip6tables,
            chain: settings.chain,
            protocol: settings.protocol,
            ipv6: settings.ipv6,
        }
    }

    /// Settings for `IptablesFirewall`.
    pub fn iptables_settings(&self) -> IptablesSettings {
        IptablesSettings {
            iptables: self.iptables.clone(),
            ip6tables: self.ip6tables.clone(),
            chain: self.chain.clone(),
            protocol: self.protocol.clone(),
            ipv6: self.ipv6,
        }
    }
}

impl KnockdConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Render as TOML, e.g. to show the effective settings.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate the `[knock]` section into the daemon's domain config.
    pub fn to_knock_config(&self) -> Result<KnockConfig, ConfigError> {
        let k = &self.knock;
        let listen_host: IpAddr =
            k.listen_host
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidAddress {
                    key: "listen_host",
                    value: k.listen_host.clone(),
                })?;

        let config = KnockConfig {
            sequence: KnockSequence::new(k.sequence.clone())?,
            protected_port: k.protected_port,
            window: positive_secs("window_secs", k.window_secs)?,
            grant_duration: positive_secs("grant_duration_secs", k.grant_duration_secs)?,
            listen_host,
            sweep_interval: positive_secs("sweep_interval_secs", k.sweep_interval_secs)?,
            repeated_first_knock: k.repeated_first_knock.parse()?,
            shutdown_policy: k.shutdown_policy.parse()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Build the configured firewall backend.
    pub fn build_firewall(&self) -> Box<dyn FirewallBackend> {
        build_firewall(self.firewall.backend, self.firewall.iptables_settings())
    }
}
