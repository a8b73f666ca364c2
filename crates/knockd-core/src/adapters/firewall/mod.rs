//! # Firewall Adapters
//!
//! Implementations of the `FirewallBackend` port:
//!
//! - `IptablesFirewall` shells out to `iptables`/`ip6tables`
//! - `DryRunFirewall` only logs what it would do

mod dry_run;
mod iptables;

pub use dry_run::DryRunFirewall;
pub use iptables::{IptablesFirewall, IptablesSettings, RuleAction};

use crate::ports::FirewallBackend;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::ConfigError;

/// Which `FirewallBackend` the daemon drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FirewallKind {
    /// Real rules through `iptables`/`ip6tables`.
    #[default]
    Iptables,
    /// Log every mutation, touch nothing.
    DryRun,
}

impl FromStr for FirewallKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "iptables" => Ok(Self::Iptables),
            "dry-run" | "dryrun" => Ok(Self::DryRun),
            other => Err(ConfigError::UnknownVariant {
                key: "firewall.backend",
                value: other.to_string(),
                expected: "iptables, dry-run",
            }),
        }
    }
}

impl fmt::Display for FirewallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iptables => write!(f, "iptables"),
            Self::DryRun => write!(f, "dry-run"),
        }
    }
}

/// Build the backend selected by `kind`.
pub fn build_firewall(kind: FirewallKind, settings: IptablesSettings) -> Box<dyn FirewallBackend> {
    match kind {
        FirewallKind::Iptables => Box::new(IptablesFirewall::new(settings)),
        FirewallKind::DryRun => Box::new(DryRunFirewall::new()),
    }
}
