//! Access Controller
//!
//! Sole writer of knock-derived firewall rules. Owns the grant table and the
//! expiry queue; revocation happens when the dispatcher calls `revoke_due`,
//! never from a detached timer.

use crate::domain::{
    AccessError, ExpiryQueue, FirewallError, GrantTable, GrantUpdate, GrantedAccess, Timestamp,
};
use crate::ports::{AccessControl, FirewallBackend, TimeSource};
use async_trait::async_trait;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One try plus at most one retry.
pub const MAX_FIREWALL_ATTEMPTS: u32 = 2;

/// Delay before a failed scheduled revocation is attempted again.
pub const REVOKE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Translates grant requests into firewall mutations.
pub struct AccessController<F> {
    firewall: F,
    protected_port: u16,
    grants: GrantTable,
    expiries: ExpiryQueue,
    time_source: Arc<dyn TimeSource>,
    baseline_established: bool,
}

impl<F: FirewallBackend> AccessController<F> {
    /// Create a controller for `protected_port`.
    pub fn new(firewall: F, protected_port: u16, time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            firewall,
            protected_port,
            grants: GrantTable::new(),
            expiries: ExpiryQueue::new(),
            time_source,
            baseline_established: false,
        }
    }

    fn now(&self) -> Timestamp {
        self.time_source.now()
    }

    /// The protected port.
    pub fn protected_port(&self) -> u16 {
        self.protected_port
    }

    /// Active grants.
    pub fn grants(&self) -> &GrantTable {
        &self.grants
    }

    /// Current grant for `address`.
    pub fn grant_of(&self, address: &IpAddr) -> Option<&GrantedAccess> {
        self.grants.get(address)
    }

    /// The firewall backend.
    pub fn firewall(&self) -> &F {
        &self.firewall
    }

    /// Earliest scheduled revocation check.
    pub fn next_expiry(&self) -> Option<Timestamp> {
        self.expiries.next_deadline()
    }

    /// Whether `establish_baseline` has succeeded.
    pub fn baseline_established(&self) -> bool {
        self.baseline_established
    }

    /// Install default-deny for the protected port.
    ///
    /// Must complete before any knock socket is bound.
    pub async fn establish_baseline(&mut self) -> Result<(), AccessError> {
        let port = self.protected_port;
        attempt("set_default_deny", || self.firewall.set_default_deny(port))
            .await
            .map_err(|(attempts, source)| {
                error!(alert = true, port, error = %source, "failed to install default-deny");
                AccessError::BaselineFailed {
                    port,
                    attempts,
                    source,
                }
            })?;
        self.baseline_established = true;
        info!(port, "default-deny installed for protected port");
        Ok(())
    }

    /// Allow `address` until `now + duration`, or extend its existing grant.
    pub async fn grant(
        &mut self,
        address: IpAddr,
        duration: Duration,
    ) -> Result<GrantUpdate, AccessError> {
        let now = self.now();
        self.grant_from(address, now, duration).await
    }

    /// Allow `address` until `anchor + duration`, where `anchor` is when the
    /// completing knock was received rather than when it was dispatched.
    pub async fn grant_from(
        &mut self,
        address: IpAddr,
        anchor: Timestamp,
        duration: Duration,
    ) -> Result<GrantUpdate, AccessError> {
        let port = self.protected_port;

        if let Some(update) = self.grants.refresh(address, anchor, duration) {
            let grant = update.grant();
            self.expiries.schedule(address, grant.expires_at);
            info!(
                source = %address,
                port,
                expires_at = %grant.expires_at,
                refreshes = grant.refreshes,
                "grant refreshed"
            );
            return Ok(update);
        }

        attempt("insert_allow", || self.firewall.insert_allow(address, port))
            .await
            .map_err(|(attempts, source)| {
                error!(alert = true, source = %address, port, error = %source, "failed to grant access");
                AccessError::GrantFailed {
                    address,
                    port,
                    attempts,
                    source,
                }
            })?;

        let grant = GrantedAccess::new(address, port, anchor, duration);
        self.grants.insert(grant);
        self.expiries.schedule(address, grant.expires_at);
        info!(
            source = %address,
            port,
            expires_at = %grant.expires_at,
            "access granted"
        );
        Ok(GrantUpdate::Inserted(grant))
    }

    /// Withdraw the allow rule for `address`.
    ///
    /// The firewall is asked to remove the rule even when no grant is
    /// recorded, so a rule left behind by an earlier failure is cleaned up.
    /// On failure the grant stays recorded.
    pub async fn revoke(&mut self, address: IpAddr) -> Result<bool, AccessError> {
        let port = self.protected_port;
        attempt("remove_allow", || self.firewall.remove_allow(address, port))
            .await
            .map_err(|(attempts, source)| AccessError::RevokeFailed {
                address,
                port,
                attempts,
                source,
            })?;

        let removed = self.grants.remove(&address);
        if let Some(grant) = removed {
            info!(
                source = %address,
                port,
                held_for = ?self.now().duration_since(grant.granted_at),
                "access revoked"
            );
        }
        Ok(removed.is_some())
    }

    /// Revoke every grant whose current expiry has passed.
    ///
    /// Queue entries left behind by refreshed grants are skipped. A failed
    /// revocation is logged as an alert and rescheduled after
    /// `REVOKE_RETRY_DELAY`. Returns the revoked addresses.
    pub async fn revoke_due(&mut self) -> Vec<IpAddr> {
        let now = self.now();
        let mut revoked = Vec::new();

        for (deadline, address) in self.expiries.pop_due(now) {
            match self.grants.get(&address) {
                Some(grant) if grant.is_expired(now) => {}
                Some(grant) => {
                    debug!(
                        source = %address,
                        stale_deadline = %deadline,
                        expires_at = %grant.expires_at,
                        "skipping stale expiry"
                    );
                    continue;
                }
                None => continue,
            }

            match self.revoke(address).await {
                Ok(_) => revoked.push(address),
                Err(e) => {
                    error!(alert = true, source = %address, error = %e, "scheduled revocation failed");
                    self.expiries
                        .schedule(address, now.saturating_add(REVOKE_RETRY_DELAY));
                }
            }
        }

        revoked
    }

    /// Revoke every outstanding grant (shutdown sweep). Returns the number
    /// of rules withdrawn; failures are logged as alerts.
    pub async fn revoke_all(&mut self) -> usize {
        let mut revoked = 0;
        for address in self.grants.addresses() {
            match self.revoke(address).await {
                Ok(_) => revoked += 1,
                Err(e) => {
                    error!(alert = true, source = %address, error = %e, "failed to revoke on shutdown")
                }
            }
        }
        self.expiries.clear();
        revoked
    }
}

#[async_trait]
impl<F: FirewallBackend> AccessControl for AccessController<F> {
    async fn grant(
        &mut self,
        address: IpAddr,
        duration: Duration,
    ) -> Result<GrantUpdate, AccessError> {
        AccessController::grant(self, address, duration).await
    }

    async fn revoke(&mut self, address: IpAddr) -> Result<bool, AccessError> {
        AccessController::revoke(self, address).await
    }
}

/// Run a firewall primitive, retrying once on failure.
async fn attempt<Op, Fut>(operation: &'static str, mut op: Op) -> Result<(), (u32, FirewallError)>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<(), FirewallError>>,
{
    let mut attempts = 1;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if attempts < MAX_FIREWALL_ATTEMPTS => {
                warn!(operation, attempt = attempts, error = %e, "firewall mutation failed, retrying");
                attempts += 1;
            }
            Err(e) => return Err((attempts, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FirewallCall, InMemoryFirewall, ManualClock};
    use std::net::Ipv4Addr;

    const PORT: u16 = 2222;
    const GRANT: Duration = Duration::from_secs(30);

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn setup() -> (AccessController<InMemoryFirewall>, InMemoryFirewall, Arc<ManualClock>) {
        let firewall = InMemoryFirewall::new();
        let clock = Arc::new(ManualClock::new(0));
        let time_source: Arc<dyn TimeSource> = clock.clone();
        let controller = AccessController::new(firewall.clone(), PORT, time_source);
        (controller, firewall, clock)
    }

    #[tokio::test]
    async fn test_baseline_installs_default_deny() {
        let (mut controller, firewall, _) = setup();
        assert!(!controller.baseline_established());

        controller.establish_baseline().await.unwrap();

        assert!(controller.baseline_established());
        assert!(firewall.is_default_deny(PORT));
        assert!(!firewall.allows(addr(5), PORT));
    }

    #[tokio::test]
    async fn test_grant_inserts_exactly_one_rule() {
        let (mut controller, firewall, _) = setup();
        controller.establish_baseline().await.unwrap();

        let update = controller.grant(addr(5), GRANT).await.unwrap();

        assert!(matches!(update, GrantUpdate::Inserted(_)));
        assert_eq!(update.grant().expires_at, Timestamp::from_secs(30));
        assert_eq!(firewall.allow_rule_count(addr(5), PORT), 1);
        assert!(firewall.allows(addr(5), PORT));
        assert!(!firewall.allows(addr(6), PORT));
    }

    #[tokio::test]
    async fn test_regrant_refreshes_without_duplicate_rule() {
        let (mut controller, firewall, clock) = setup();
        controller.establish_baseline().await.unwrap();
        controller.grant(addr(5), GRANT).await.unwrap();

        clock.advance(Duration::from_secs(20));
        let update = controller.grant(addr(5), GRANT).await.unwrap();

        match update {
            GrantUpdate::Refreshed {
                previous_expiry,
                grant,
            } => {
                assert_eq!(previous_expiry, Timestamp::from_secs(30));
                assert_eq!(grant.expires_at, Timestamp::from_secs(50));
            }
            GrantUpdate::Inserted(_) => panic!("expected refresh"),
        }
        assert_eq!(firewall.allow_rule_count(addr(5), PORT), 1);
        let inserts = firewall
            .calls()
            .into_iter()
            .filter(|c| matches!(c, FirewallCall::InsertAllow(..)))
            .count();
        assert_eq!(inserts, 1, "Refresh does not touch the firewall");
    }

    #[tokio::test]
    async fn test_grant_from_anchors_expiry_at_receive_time() {
        let (mut controller, firewall, clock) = setup();
        controller.establish_baseline().await.unwrap();
        clock.set(Timestamp::from_secs(5));

        let update = controller
            .grant_from(addr(5), Timestamp::from_secs(2), GRANT)
            .await
            .unwrap();

        assert_eq!(update.grant().granted_at, Timestamp::from_secs(2));
        assert_eq!(update.grant().expires_at, Timestamp::from_secs(32));
        assert_eq!(controller.next_expiry(), Some(Timestamp::from_secs(32)));

        clock.set(Timestamp::from_secs(32));
        assert_eq!(controller.revoke_due().await, vec![addr(5)]);
        assert!(!firewall.allows(addr(5), PORT));
    }

    #[tokio::test]
    async fn test_stale_expiry_does_not_cut_refreshed_grant() {
        let (mut controller, firewall, clock) = setup();
        controller.establish_baseline().await.unwrap();
        controller.grant(addr(5), GRANT).await.unwrap();

        clock.advance(Duration::from_secs(20));
        controller.grant(addr(5), GRANT).await.unwrap();

        // Original deadline (t=30) passes
        clock.set(Timestamp::from_secs(31));
        assert!(controller.revoke_due().await.is_empty());
        assert!(firewall.allows(addr(5), PORT));

        // Refreshed deadline (t=50) passes
        clock.set(Timestamp::from_secs(50));
        assert_eq!(controller.revoke_due().await, vec![addr(5)]);
        assert!(!firewall.allows(addr(5), PORT));
        assert!(controller.grants().is_empty());
    }

    #[tokio::test]
    async fn test_grant_expires_without_refresh() {
        let (mut controller, firewall, clock) = setup();
        controller.establish_baseline().await.unwrap();
        controller.grant(addr(5), GRANT).await.unwrap();

        clock.set(Timestamp::from_millis(29_999));
        assert!(controller.revoke_due().await.is_empty());

        clock.set(Timestamp::from_secs(30));
        assert_eq!(controller.revoke_due().await, vec![addr(5)]);
        assert_eq!(firewall.total_allow_rules(), 0);
        assert!(firewall.is_default_deny(PORT));
        assert!(controller.next_expiry().is_none());
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let (mut controller, firewall, _) = setup();
        controller.grant(addr(5), GRANT).await.unwrap();

        assert!(controller.revoke(addr(5)).await.unwrap());
        assert!(!controller.revoke(addr(5)).await.unwrap());
        assert!(!controller.revoke(addr(9)).await.unwrap());
        assert_eq!(firewall.total_allow_rules(), 0);
    }

    #[tokio::test]
    async fn test_grant_retries_once_then_succeeds() {
        let (mut controller, firewall, _) = setup();
        firewall.fail_next(1);

        controller.grant(addr(5), GRANT).await.unwrap();

        assert_eq!(firewall.allow_rule_count(addr(5), PORT), 1);
        assert_eq!(firewall.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_persistent_grant_failure_is_not_recorded() {
        let (mut controller, firewall, _) = setup();
        firewall.fail_next(2);

        let err = controller.grant(addr(5), GRANT).await.unwrap_err();

        assert!(matches!(
            err,
            AccessError::GrantFailed {
                attempts: 2,
                port: PORT,
                ..
            }
        ));
        assert!(controller.grant_of(&addr(5)).is_none());
        assert!(controller.next_expiry().is_none());
        assert_eq!(firewall.calls().len(), 2, "No third attempt");
    }

    #[tokio::test]
    async fn test_failed_scheduled_revocation_is_rescheduled() {
        let (mut controller, firewall, clock) = setup();
        controller.grant(addr(5), GRANT).await.unwrap();

        clock.set(Timestamp::from_secs(30));
        firewall.fail_next(2);
        assert!(controller.revoke_due().await.is_empty());
        assert!(controller.grant_of(&addr(5)).is_some());
        assert_eq!(
            controller.next_expiry(),
            Some(Timestamp::from_secs(30).saturating_add(REVOKE_RETRY_DELAY))
        );

        clock.advance(REVOKE_RETRY_DELAY);
        assert_eq!(controller.revoke_due().await, vec![addr(5)]);
        assert_eq!(firewall.total_allow_rules(), 0);
    }

    #[tokio::test]
    async fn test_baseline_failure_reported() {
        let (mut controller, firewall, _) = setup();
        firewall.fail_next(2);
        assert!(matches!(
            controller.establish_baseline().await,
            Err(AccessError::BaselineFailed { port: PORT, .. })
        ));
        assert!(!controller.baseline_established());
    }

    #[tokio::test]
    async fn test_revoke_all_restores_default_deny() {
        let (mut controller, firewall, _) = setup();
        controller.establish_baseline().await.unwrap();
        controller.grant(addr(5), GRANT).await.unwrap();
        controller.grant(addr(6), GRANT).await.unwrap();

        assert_eq!(controller.revoke_all().await, 2);

        assert!(controller.grants().is_empty());
        assert!(controller.next_expiry().is_none());
        assert!(!firewall.allows(addr(5), PORT));
        assert!(!firewall.allows(addr(6), PORT));
        assert!(firewall.is_default_deny(PORT));
    }

    #[tokio::test]
    async fn test_access_control_trait_object() {
        let (controller, firewall, _) = setup();
        let mut api: Box<dyn AccessControl> = Box::new(controller);

        api.grant(addr(7), GRANT).await.unwrap();
        assert_eq!(firewall.allow_rule_count(addr(7), PORT), 1);
        assert!(api.revoke(addr(7)).await.unwrap());
    }
}
