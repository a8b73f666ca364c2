use crate::domain::FirewallError;
use crate::ports::FirewallBackend;
use async_trait::async_trait;
use std::net::IpAddr;
use tracing::info;

/// Firewall that logs each mutation instead of applying it.
///
/// Lets the whole daemon run unprivileged, e.g. to try a sequence.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunFirewall;

impl DryRunFirewall {
    /// Create a dry-run firewall.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FirewallBackend for DryRunFirewall {
    async fn set_default_deny(&self, port: u16) -> Result<(), FirewallError> {
        info!(dry_run = true, port, "would drop all traffic to protected port");
        Ok(())
    }

    async fn clear_default_deny(&self, port: u16) -> Result<(), FirewallError> {
        info!(dry_run = true, port, "would remove default-deny");
        Ok(())
    }

    async fn insert_allow(&self, address: IpAddr, port: u16) -> Result<(), FirewallError> {
        info!(dry_run = true, source = %address, port, "would allow");
        Ok(())
    }

    async fn remove_allow(&self, address: IpAddr, port: u16) -> Result<(), FirewallError> {
        info!(dry_run = true, source = %address, port, "would remove allow");
        Ok(())
    }
}
