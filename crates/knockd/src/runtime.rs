//! Daemon wiring.
//!
//! ## Startup Sequence
//!
//! 1. Validate configuration
//! 2. Install default-deny for the protected port
//! 3. Bind the knock sockets
//! 4. Run the dispatcher until the shutdown signal
//! 5. Apply the shutdown policy and close the sockets

use anyhow::{Context, Result};
use knockd_core::{
    DaemonStats, FirewallBackend, KnockConfig, KnockDaemon, KnockdConfig, MonotonicTimeSource,
    TimeSource, UdpKnockListenerSet,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// The knock daemon with its listeners and shutdown channel.
pub struct KnockdRuntime<F> {
    config: KnockConfig,
    daemon: KnockDaemon<F>,
    time_source: Arc<dyn TimeSource>,
    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,
    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
}

impl KnockdRuntime<Box<dyn FirewallBackend>> {
    /// Build a runtime from a configuration file, using the backend it names.
    pub fn from_file_config(config: &KnockdConfig) -> Result<Self> {
        let knock_config = config
            .to_knock_config()
            .context("invalid knock configuration")?;
        Ok(Self::new(knock_config, config.build_firewall()))
    }
}

impl<F: FirewallBackend> KnockdRuntime<F> {
    /// Create a runtime around `firewall`.
    pub fn new(config: KnockConfig, firewall: F) -> Self {
        let time_source: Arc<dyn TimeSource> = Arc::new(MonotonicTimeSource::new());
        let daemon = KnockDaemon::new(config.clone(), firewall, time_source.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            daemon,
            time_source,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Sender that stops the daemon when `true` is sent.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Run until shutdown. Returns the dispatcher's counters.
    pub async fn run(mut self) -> Result<DaemonStats> {
        info!(
            sequence = %self.config.sequence,
            protected_port = self.config.protected_port,
            listen_host = %self.config.listen_host,
            "starting knockd"
        );

        self.daemon
            .establish_baseline()
            .await
            .context("failed to install default-deny for the protected port")?;

        let mut listeners = UdpKnockListenerSet::bind(
            self.config.listen_host,
            &self.config.sequence,
            self.time_source.clone(),
        )
        .await
        .context("failed to bind knock ports")?;

        let result = self.daemon.run(&mut listeners, self.shutdown_rx).await;
        listeners.close();

        let stats = result.context("knock dispatcher stopped")?;
        info!(
            knocks = stats.knocks,
            grants = stats.grants,
            refreshes = stats.refreshes,
            grant_failures = stats.grant_failures,
            "knockd stopped"
        );
        Ok(stats)
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::send_sequence;
    use knockd_core::test_utils::{FirewallCall, InMemoryFirewall};
    use knockd_core::KnockSequence;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    const PROTECTED_PORT: u16 = 2222;
    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    /// Ports that were free a moment ago.
    fn free_ports(count: usize) -> Vec<u16> {
        let sockets: Vec<std::net::UdpSocket> = (0..count)
            .map(|_| std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap())
            .collect();
        sockets
            .iter()
            .map(|s| s.local_addr().unwrap().port())
            .collect()
    }

    fn config(ports: Vec<u16>) -> KnockConfig {
        KnockConfig {
            sequence: KnockSequence::new(ports).unwrap(),
            protected_port: PROTECTED_PORT,
            ..KnockConfig::for_testing()
        }
    }

    #[tokio::test]
    async fn test_client_knock_opens_port_until_shutdown() {
        let config = config(free_ports(3));
        let sequence = config.sequence.clone();
        let firewall = InMemoryFirewall::new();
        let runtime = KnockdRuntime::new(config, firewall.clone());
        let shutdown = runtime.shutdown_handle();
        let handle = tokio::spawn(runtime.run());

        // Wait for the listeners: the baseline is installed just before binding
        for _ in 0..100 {
            if firewall.is_default_deny(PROTECTED_PORT) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        send_sequence(LOCALHOST, &sequence, Duration::from_millis(10))
            .await
            .unwrap();
        for _ in 0..200 {
            if firewall.allows(LOCALHOST, PROTECTED_PORT) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(firewall.allows(LOCALHOST, PROTECTED_PORT));

        shutdown.send(true).unwrap();
        let stats = handle.await.unwrap().unwrap();

        assert_eq!(stats.grants, 1);
        assert!(!firewall.allows(LOCALHOST, PROTECTED_PORT));
    }

    #[tokio::test]
    async fn test_baseline_precedes_bind_and_survives_bind_failure() {
        let taken = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let mut ports = free_ports(1);
        ports.push(taken.local_addr().unwrap().port());
        let firewall = InMemoryFirewall::new();

        let result = KnockdRuntime::new(config(ports), firewall.clone()).run().await;

        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("failed to bind knock ports"));
        assert_eq!(
            firewall.calls(),
            vec![FirewallCall::SetDefaultDeny(PROTECTED_PORT)]
        );
        assert!(firewall.is_default_deny(PROTECTED_PORT));
    }

    #[tokio::test]
    async fn test_baseline_failure_aborts_before_bind() {
        let ports = free_ports(2);
        let firewall = InMemoryFirewall::new();
        firewall.fail_next(2);

        let result = KnockdRuntime::new(config(ports.clone()), firewall).run().await;

        assert!(result.is_err());
        // Knock ports were never bound
        for port in ports {
            assert!(std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, port)).is_ok());
        }
    }

    #[test]
    fn test_invalid_file_config_rejected() {
        let mut config = KnockdConfig::default();
        config.knock.window_secs = -1.0;

        assert!(KnockdRuntime::from_file_config(&config).is_err());
    }
}
