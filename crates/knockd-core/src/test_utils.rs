//! Test utilities for the knock daemon.
//!
//! Deterministic doubles for the outbound ports. Enable with the
//! `test-utils` feature flag.
//!
//! # Example
//!
//! ```rust
//! use knockd_core::test_utils::ManualClock;
//! use knockd_core::TimeSource;
//! use std::time::Duration;
//!
//! let clock = ManualClock::new(1_000);
//! clock.advance(Duration::from_secs(2));
//! assert_eq!(clock.now().as_millis(), 3_000);
//! ```

use crate::domain::{FirewallError, KnockEvent, Timestamp};
use crate::ports::{FirewallBackend, KnockPoll, KnockSource, TimeSource};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Start the clock at `millis`.
    pub fn new(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.millis.fetch_add(by, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, at: Timestamp) {
        self.millis.store(at.as_millis(), Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

/// A recorded firewall primitive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallCall {
    /// `set_default_deny(port)`
    SetDefaultDeny(u16),
    /// `clear_default_deny(port)`
    ClearDefaultDeny(u16),
    /// `insert_allow(address, port)`
    InsertAllow(IpAddr, u16),
    /// `remove_allow(address, port)`
    RemoveAllow(IpAddr, u16),
}

#[derive(Debug, Default)]
struct FirewallState {
    deny_ports: BTreeSet<u16>,
    // Vec rather than a set so a duplicate insert would be visible
    allow_rules: Vec<(IpAddr, u16)>,
    calls: Vec<FirewallCall>,
    failures_remaining: u32,
}

/// In-memory packet filter with the same idempotence as the real backend.
///
/// Clones share state, so a test can keep a handle after moving one into
/// the controller.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFirewall {
    state: Arc<Mutex<FirewallState>>,
}

impl InMemoryFirewall {
    /// Create an empty firewall (no deny, no allow rules).
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` mutations fail.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().failures_remaining = count;
    }

    /// Would a TCP connection from `address` to `port` be let through?
    pub fn allows(&self, address: IpAddr, port: u16) -> bool {
        let state = self.state.lock();
        !state.deny_ports.contains(&port) || state.allow_rules.contains(&(address, port))
    }

    /// Is default-deny installed for `port`?
    pub fn is_default_deny(&self, port: u16) -> bool {
        self.state.lock().deny_ports.contains(&port)
    }

    /// Number of allow rules for exactly `address:port`.
    pub fn allow_rule_count(&self, address: IpAddr, port: u16) -> usize {
        self.state
            .lock()
            .allow_rules
            .iter()
            .filter(|rule| **rule == (address, port))
            .count()
    }

    /// Total number of allow rules.
    pub fn total_allow_rules(&self) -> usize {
        self.state.lock().allow_rules.len()
    }

    /// Every call made so far, failed ones included.
    pub fn calls(&self) -> Vec<FirewallCall> {
        self.state.lock().calls.clone()
    }

    fn apply(&self, call: FirewallCall) -> Result<(), FirewallError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(FirewallError::Rejected(format!("injected failure for {:?}", call)));
        }
        match call {
            FirewallCall::SetDefaultDeny(port) => {
                state.deny_ports.insert(port);
            }
            FirewallCall::ClearDefaultDeny(port) => {
                state.deny_ports.remove(&port);
            }
            FirewallCall::InsertAllow(address, port) => {
                if !state.allow_rules.contains(&(address, port)) {
                    state.allow_rules.push((address, port));
                }
            }
            FirewallCall::RemoveAllow(address, port) => {
                state.allow_rules.retain(|rule| *rule != (address, port));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FirewallBackend for InMemoryFirewall {
    async fn set_default_deny(&self, port: u16) -> Result<(), FirewallError> {
        self.apply(FirewallCall::SetDefaultDeny(port))
    }

    async fn clear_default_deny(&self, port: u16) -> Result<(), FirewallError> {
        self.apply(FirewallCall::ClearDefaultDeny(port))
    }

    async fn insert_allow(&self, address: IpAddr, port: u16) -> Result<(), FirewallError> {
        self.apply(FirewallCall::InsertAllow(address, port))
    }

    async fn remove_allow(&self, address: IpAddr, port: u16) -> Result<(), FirewallError> {
        self.apply(FirewallCall::RemoveAllow(address, port))
    }
}

/// Knock source fed through a channel instead of sockets.
#[derive(Debug)]
pub struct ChannelKnockSource {
    receiver: mpsc::UnboundedReceiver<KnockEvent>,
}

impl ChannelKnockSource {
    /// Create the source and the sender that feeds it.
    pub fn new() -> (mpsc::UnboundedSender<KnockEvent>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (sender, Self { receiver })
    }
}

#[async_trait]
impl KnockSource for ChannelKnockSource {
    async fn next_event(&mut self, timeout: Duration) -> KnockPoll {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(event)) => KnockPoll::Knock(event),
            Ok(None) => KnockPoll::Closed,
            Err(_) => KnockPoll::Timeout,
        }
    }
}
