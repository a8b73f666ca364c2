//! Daemon configuration values (static after startup).

use super::{ConfigError, KnockSequence, RepeatedFirstKnock};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

/// Shortest accepted window, grant or sweep interval. Timestamps count whole
/// milliseconds, so anything shorter would collapse to zero.
pub const MIN_DURATION: Duration = Duration::from_millis(1);

/// What happens to outstanding grants when the daemon stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownPolicy {
    /// Withdraw every allow rule before exiting.
    #[default]
    Revoke,
    /// Leave allow rules in place. Nothing will remove them afterwards.
    Keep,
}

impl FromStr for ShutdownPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "revoke" => Ok(Self::Revoke),
            "keep" => Ok(Self::Keep),
            other => Err(ConfigError::UnknownVariant {
                key: "shutdown_policy",
                value: other.to_string(),
                expected: "revoke, keep",
            }),
        }
    }
}

impl fmt::Display for ShutdownPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Revoke => write!(f, "revoke"),
            Self::Keep => write!(f, "keep"),
        }
    }
}

/// Validated daemon configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct KnockConfig {
    /// Ports to knock, in order.
    pub sequence: KnockSequence,
    /// TCP port opened on a completed sequence.
    pub protected_port: u16,
    /// Time allowed from the first knock to the last.
    pub window: Duration,
    /// How long a completed sequence keeps the protected port open.
    pub grant_duration: Duration,
    /// Bind address for the knock sockets.
    pub listen_host: IpAddr,
    /// Expiry sweeper tick.
    pub sweep_interval: Duration,
    /// Handling of a first-port knock from a source already mid-sequence.
    pub repeated_first_knock: RepeatedFirstKnock,
    /// Grant handling on exit.
    pub shutdown_policy: ShutdownPolicy,
}

impl Default for KnockConfig {
    fn default() -> Self {
        Self {
            sequence: KnockSequence::default(),
            protected_port: 2222,
            window: Duration::from_secs(10),
            grant_duration: Duration::from_secs(30),
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            sweep_interval: Duration::from_secs(1),
            repeated_first_knock: RepeatedFirstKnock::default(),
            shutdown_policy: ShutdownPolicy::default(),
        }
    }
}

impl KnockConfig {
    /// Configuration for tests: default sequence, loopback bind.
    pub fn for_testing() -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Self::default()
        }
    }

    /// Check the invariants that `KnockSequence` cannot check on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protected_port == 0 {
            return Err(ConfigError::ZeroPort { role: "protected" });
        }
        for (key, value) in [
            ("window", self.window),
            ("grant_duration", self.grant_duration),
            ("sweep_interval", self.sweep_interval),
        ] {
            if value < MIN_DURATION {
                return Err(ConfigError::InvalidDuration {
                    key,
                    value: format!("{:?}", value),
                });
            }
        }
        Ok(())
    }
}

/// Convert a seconds value from a config file or flag into a positive duration.
pub fn positive_secs(key: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) if duration >= MIN_DURATION => Ok(duration),
        _ => Err(ConfigError::InvalidDuration {
            key,
            value: secs.to_string(),
        }),
    }
}
