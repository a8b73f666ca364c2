//! # Knock Daemon Core
//!
//! Port-knock access control: a client proves knowledge of an ordered
//! sequence of UDP ports by sending one datagram to each within a time
//! window, and the daemon then opens a protected TCP port to that source
//! address for a bounded time.
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture with:
//! - **Domain Layer:** Pure logic (knock sequence, matcher state machine,
//!   grant table, expiry queue). No I/O.
//! - **Ports Layer:** Trait definitions for the firewall, the knock sockets
//!   and the clock
//! - **Service Layer:** `AccessController` (sole writer of firewall rules)
//!   and `KnockDaemon` (single dispatcher)
//! - **Adapters Layer:** UDP listeners, `iptables`, monotonic clock, TOML
//!   config
//!
//! ## Example
//!
//! ```rust
//! use knockd_core::{
//!     KnockEvent, KnockOutcome, KnockSequence, SequenceMatcher, Timestamp,
//! };
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::time::Duration;
//!
//! let sequence = KnockSequence::new(vec![1234, 5678, 9012]).unwrap();
//! let mut matcher = SequenceMatcher::new(sequence, Duration::from_secs(10));
//! let client = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
//!
//! let mut outcome = KnockOutcome::Ignored;
//! for (i, port) in [1234, 5678, 9012].into_iter().enumerate() {
//!     let event = KnockEvent::new(client, port, Timestamp::from_secs(i as u64));
//!     outcome = matcher.on_knock(&event);
//! }
//! assert_eq!(outcome, KnockOutcome::Completed);
//! ```

// =============================================================================
// CORE MODULES
// =============================================================================

pub mod domain;
pub mod ports;
pub mod service;

// =============================================================================
// ADAPTERS
// =============================================================================

/// Sockets, firewall backends, clock and config file.
pub mod adapters;

/// Test utilities (ManualClock, InMemoryFirewall, ChannelKnockSource).
/// Requires feature: `test-utils`
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// =============================================================================
// RE-EXPORTS
// =============================================================================

// Domain entities
pub use domain::{
    AccessError, ClientProgress, ConfigError, ExpiryQueue, FirewallError, GrantTable, GrantUpdate,
    GrantedAccess, KnockConfig, KnockEvent, KnockOutcome, KnockSequence, RepeatedFirstKnock,
    SequenceMatcher, ShutdownPolicy, Timestamp,
};

// Port traits
pub use ports::{AccessControl, FirewallBackend, KnockPoll, KnockSource, TimeSource};

// Service
pub use service::{AccessController, DaemonError, DaemonStats, KnockDaemon};

// Adapters
pub use adapters::{
    DryRunFirewall, FirewallKind, IptablesFirewall, KnockdConfig, ListenerError,
    MonotonicTimeSource, UdpKnockListenerSet,
};
