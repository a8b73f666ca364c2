//! # Driving Ports (Inbound API)

use crate::domain::{AccessError, GrantUpdate};
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

/// Open/close access to the protected port for one source address.
///
/// Both operations are idempotent. `grant` on an already-granted address
/// extends the expiry instead of adding a second rule; `revoke` on an
/// address with no rule succeeds.
#[async_trait]
pub trait AccessControl: Send {
    /// Allow `address` for `duration` from now.
    async fn grant(&mut self, address: IpAddr, duration: Duration)
        -> Result<GrantUpdate, AccessError>;

    /// Withdraw access for `address`.
    ///
    /// Returns `true` if a recorded grant was removed.
    async fn revoke(&mut self, address: IpAddr) -> Result<bool, AccessError>;
}
