//! Knock client.
//!
//! Sends one datagram per sequence port, fire-and-forget: the daemon never
//! answers, so the only way to know whether the knock worked is to try the
//! protected port afterwards.

use knockd_core::KnockSequence;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tracing::{debug, warn};

/// Knock payload; its content is ignored by the daemon.
pub const KNOCK_PAYLOAD: &[u8] = b"x";

/// How long the protected-port check waits for a connection.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Client failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The target name could not be resolved.
    #[error("failed to resolve {target}: {source}")]
    Resolve {
        /// Target as given
        target: String,
        /// Resolver error
        #[source]
        source: io::Error,
    },

    /// The target resolved to no address.
    #[error("{0} resolved to no address")]
    NoAddress(String),

    /// No local socket could be opened for sending.
    #[error("failed to open knock socket: {0}")]
    Socket(#[source] io::Error),
}

/// Resolve `target` (host name or IP literal) to one address.
pub async fn resolve_target(target: &str) -> Result<IpAddr, ClientError> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = lookup_host((target, 0))
        .await
        .map_err(|source| ClientError::Resolve {
            target: target.to_string(),
            source,
        })?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| ClientError::NoAddress(target.to_string()))
}

/// Knock every port of `sequence` on `target`, sleeping `delay` after each.
///
/// A failed send is logged and skipped. Returns the number of knocks sent.
pub async fn send_sequence(
    target: IpAddr,
    sequence: &KnockSequence,
    delay: Duration,
) -> Result<usize, ClientError> {
    let local: IpAddr = match target {
        IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let socket = UdpSocket::bind((local, 0))
        .await
        .map_err(ClientError::Socket)?;

    let mut sent = 0;
    for &port in sequence.ports() {
        match socket.send_to(KNOCK_PAYLOAD, (target, port)).await {
            Ok(_) => {
                sent += 1;
                debug!(target = %target, port, "knock sent");
            }
            Err(e) => warn!(target = %target, port, error = %e, "knock not sent"),
        }
        tokio::time::sleep(delay).await;
    }
    Ok(sent)
}

/// Whether a TCP connection to `target:port` succeeds within `timeout`.
pub async fn check_protected_port(target: IpAddr, port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::new(target, port);
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "protected port refused");
            false
        }
        Err(_) => {
            debug!(%addr, "protected port timed out");
            false
        }
    }
}
