//! # Ports Layer - Hexagonal Architecture Boundaries
//!
//! - **Driving Ports (Inbound):** `AccessControl`, the grant/revoke contract
//!   the daemon loop drives.
//! - **Driven Ports (Outbound):** `FirewallBackend`, `KnockSource` and
//!   `TimeSource`, supplied by adapters or test doubles.

pub mod inbound;
pub mod outbound;

pub use inbound::AccessControl;
pub use outbound::{FirewallBackend, KnockPoll, KnockSource, TimeSource};
