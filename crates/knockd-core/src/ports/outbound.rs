//! # Driven Ports (Outbound SPI)
//!
//! Interfaces the daemon requires from its host: the platform packet filter,
//! the knock sockets, and a clock.

use crate::domain::{FirewallError, KnockEvent, Timestamp};
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

/// Platform packet-filter primitives.
///
/// Every operation must be idempotent: inserting an existing rule or
/// removing a missing one succeeds without changing the rule set. Only the
/// `AccessController` calls these.
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    /// Drop all traffic to `port` unless an allow rule matches first.
    async fn set_default_deny(&self, port: u16) -> Result<(), FirewallError>;

    /// Remove the default-deny rule for `port`.
    async fn clear_default_deny(&self, port: u16) -> Result<(), FirewallError>;

    /// Allow `address` to reach `port`.
    async fn insert_allow(&self, address: IpAddr, port: u16) -> Result<(), FirewallError>;

    /// Remove the allow rule for `address` on `port`.
    async fn remove_allow(&self, address: IpAddr, port: u16) -> Result<(), FirewallError>;
}

#[async_trait]
impl<T: FirewallBackend + ?Sized> FirewallBackend for Box<T> {
    async fn set_default_deny(&self, port: u16) -> Result<(), FirewallError> {
        (**self).set_default_deny(port).await
    }

    async fn clear_default_deny(&self, port: u16) -> Result<(), FirewallError> {
        (**self).clear_default_deny(port).await
    }

    async fn insert_allow(&self, address: IpAddr, port: u16) -> Result<(), FirewallError> {
        (**self).insert_allow(address, port).await
    }

    async fn remove_allow(&self, address: IpAddr, port: u16) -> Result<(), FirewallError> {
        (**self).remove_allow(address, port).await
    }
}

/// Result of waiting for the next knock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnockPoll {
    /// A datagram arrived.
    Knock(KnockEvent),
    /// Nothing arrived within the timeout.
    Timeout,
    /// Every listener has stopped; no further events will arrive.
    Closed,
}

/// Stream of knock events from all knock ports.
#[async_trait]
pub trait KnockSource: Send {
    /// Wait at most `timeout` for the next knock on any port.
    async fn next_event(&mut self, timeout: Duration) -> KnockPoll;
}

/// Abstract clock, so tests can drive window and grant expiry directly.
pub trait TimeSource: Send + Sync {
    /// Current time.
    fn now(&self) -> Timestamp;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedTimeSource(u64);

    impl TimeSource for FixedTimeSource {
        fn now(&self) -> Timestamp {
            Timestamp::from_millis(self.0)
        }
    }

    #[test]
    fn test_fixed_time_source_returns_configured_value() {
        let source = FixedTimeSource(1000);
        assert_eq!(source.now().as_millis(), 1000);
    }

    #[test]
    fn test_firewall_error_display() {
        let err = FirewallError::CommandFailed {
            command: "iptables -D INPUT".into(),
            status: "exit status: 1".into(),
            stderr: "Bad rule".into(),
        };
        assert_eq!(
            err.to_string(),
            "`iptables -D INPUT` exited with exit status: 1: Bad rule"
        );
    }
}
