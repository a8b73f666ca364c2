//! Domain Errors for the knock daemon
//!
//! Protocol violations (wrong-order knocks, timeouts) are deliberately absent:
//! they are expected traffic, reported as `KnockOutcome` values, not errors.

use std::net::IpAddr;
use thiserror::Error;

/// Startup configuration errors. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Sequence has fewer than two ports.
    #[error("knock sequence needs at least {min} ports, got {len}")]
    SequenceTooShort {
        /// Ports supplied
        len: usize,
        /// Minimum accepted length
        min: usize,
    },

    /// The same port appears twice in the sequence.
    #[error("knock sequence contains port {port} more than once")]
    DuplicatePort {
        /// The repeated port
        port: u16,
    },

    /// Port 0 cannot be bound as a knock port or protected.
    #[error("port 0 is not a valid {role} port")]
    ZeroPort {
        /// Which port setting was zero
        role: &'static str,
    },

    /// A port list entry is not a number in 1..=65535.
    #[error("invalid port {0:?}")]
    InvalidPort(String),

    /// A duration setting is below one millisecond, negative or not finite.
    #[error("{key} must be at least 0.001 seconds, got {value}")]
    InvalidDuration {
        /// Config key
        key: &'static str,
        /// Offending value as written
        value: String,
    },

    /// An enumerated setting has an unknown value.
    #[error("unknown {key} {value:?} (expected one of: {expected})")]
    UnknownVariant {
        /// Config key
        key: &'static str,
        /// Offending value
        value: String,
        /// Accepted values
        expected: &'static str,
    },

    /// An address setting does not parse as an IP address.
    #[error("{key} is not a valid IP address: {value:?}")]
    InvalidAddress {
        /// Config key
        key: &'static str,
        /// Offending value
        value: String,
    },

    /// Config file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path of the file that failed to load
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// Failure of a single firewall primitive.
#[derive(Debug, Error)]
pub enum FirewallError {
    /// The firewall tool could not be started at all.
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        /// Command line that was attempted
        command: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The firewall tool ran and exited unsuccessfully.
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        /// Command line that failed
        command: String,
        /// Exit status description
        status: String,
        /// Captured standard error
        stderr: String,
    },

    /// The backend refused the mutation without running anything.
    #[error("firewall rejected mutation: {0}")]
    Rejected(String),
}

/// Access Controller errors, raised after the single retry is exhausted.
#[derive(Debug, Error)]
pub enum AccessError {
    /// Default-deny could not be installed for the protected port.
    #[error("failed to install default-deny on port {port} after {attempts} attempts: {source}")]
    BaselineFailed {
        /// Protected port
        port: u16,
        /// Attempts made
        attempts: u32,
        /// Last firewall error
        #[source]
        source: FirewallError,
    },

    /// The allow rule could not be inserted; no grant was recorded.
    #[error("failed to allow {address} on port {port} after {attempts} attempts: {source}")]
    GrantFailed {
        /// Source address
        address: IpAddr,
        /// Protected port
        port: u16,
        /// Attempts made
        attempts: u32,
        /// Last firewall error
        #[source]
        source: FirewallError,
    },

    /// The allow rule could not be removed; the grant stays recorded.
    #[error("failed to revoke {address} on port {port} after {attempts} attempts: {source}")]
    RevokeFailed {
        /// Source address
        address: IpAddr,
        /// Protected port
        port: u16,
        /// Attempts made
        attempts: u32,
        /// Last firewall error
        #[source]
        source: FirewallError,
    },
}
