//! # Service Layer
//!
//! `AccessController` applies grants to the firewall; `KnockDaemon` is the
//! dispatcher that feeds knocks through the matcher and drives expiry.

mod controller;
mod daemon;

pub use controller::{AccessController, MAX_FIREWALL_ATTEMPTS, REVOKE_RETRY_DELAY};
pub use daemon::{DaemonError, DaemonStats, KnockDaemon};
