//! Granted access records.
//!
//! At most one grant per source address. A second completed sequence from a
//! granted address refreshes the existing record instead of adding a rule.

use super::Timestamp;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

/// An address currently allowed through to the protected port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantedAccess {
    /// Admitted source address.
    pub address: IpAddr,
    /// Port the allow rule covers.
    pub protected_port: u16,
    /// Time of the first completion.
    pub granted_at: Timestamp,
    /// Duration of the latest (re)grant.
    pub duration: Duration,
    /// When the allow rule must be withdrawn.
    pub expires_at: Timestamp,
    /// Number of refreshes since the rule was inserted.
    pub refreshes: u32,
}

impl GrantedAccess {
    /// Create a fresh grant starting at `now`.
    pub fn new(address: IpAddr, protected_port: u16, now: Timestamp, duration: Duration) -> Self {
        Self {
            address,
            protected_port,
            granted_at: now,
            duration,
            expires_at: now.saturating_add(duration),
            refreshes: 0,
        }
    }

    /// Expired at or after `expires_at`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry.
    pub fn remaining(&self, now: Timestamp) -> Duration {
        self.expires_at.duration_since(now)
    }
}

/// What a grant request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantUpdate {
    /// New allow rule inserted.
    Inserted(GrantedAccess),
    /// Existing grant extended; no firewall change.
    Refreshed {
        /// Expiry before the refresh
        previous_expiry: Timestamp,
        /// The grant after the refresh
        grant: GrantedAccess,
    },
}

impl GrantUpdate {
    /// The grant after the update.
    pub fn grant(&self) -> &GrantedAccess {
        match self {
            Self::Inserted(grant) | Self::Refreshed { grant, .. } => grant,
        }
    }
}

/// All active grants, keyed by source address.
#[derive(Debug, Clone, Default)]
pub struct GrantTable {
    grants: HashMap<IpAddr, GrantedAccess>,
}

impl GrantTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly inserted grant, replacing any previous record.
    pub fn insert(&mut self, grant: GrantedAccess) {
        self.grants.insert(grant.address, grant);
    }

    /// Extend an existing grant to `now + duration`. The expiry never moves
    /// backwards.
    ///
    /// Returns `None` when `address` holds no grant.
    pub fn refresh(
        &mut self,
        address: IpAddr,
        now: Timestamp,
        duration: Duration,
    ) -> Option<GrantUpdate> {
        let grant = self.grants.get_mut(&address)?;
        let previous_expiry = grant.expires_at;
        grant.duration = duration;
        grant.expires_at = previous_expiry.max(now.saturating_add(duration));
        grant.refreshes = grant.refreshes.saturating_add(1);
        Some(GrantUpdate::Refreshed {
            previous_expiry,
            grant: *grant,
        })
    }

    /// Current grant for `address`.
    pub fn get(&self, address: &IpAddr) -> Option<&GrantedAccess> {
        self.grants.get(address)
    }

    /// Drop the record for `address`.
    pub fn remove(&mut self, address: &IpAddr) -> Option<GrantedAccess> {
        self.grants.remove(address)
    }

    /// Whether `address` holds a grant.
    pub fn contains(&self, address: &IpAddr) -> bool {
        self.grants.contains_key(address)
    }

    /// Addresses with a grant.
    pub fn addresses(&self) -> Vec<IpAddr> {
        self.grants.keys().copied().collect()
    }

    /// Iterate over grants.
    pub fn iter(&self) -> impl Iterator<Item = &GrantedAccess> {
        self.grants.values()
    }

    /// Active grant count.
    pub fn len(&self) -> usize {
        self.grants.len()
    }

    /// No grants.
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}
