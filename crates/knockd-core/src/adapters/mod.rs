//! # Adapters
//!
//! Concrete implementations of the outbound ports plus the config file:
//!
//! - `listener` - UDP knock sockets (`KnockSource`)
//! - `firewall` - `iptables` and dry-run backends (`FirewallBackend`)
//! - `time` - monotonic clock (`TimeSource`)
//! - `config` - TOML configuration file

pub mod config;
pub mod firewall;
pub mod listener;
pub mod time;

pub use config::{FirewallSection, KnockSection, KnockdConfig};
pub use firewall::{
    build_firewall, DryRunFirewall, FirewallKind, IptablesFirewall, IptablesSettings, RuleAction,
};
pub use listener::{ListenerError, UdpKnockListenerSet, LISTENER_QUEUE_CAPACITY};
pub use time::MonotonicTimeSource;
