//! Knock Daemon
//!
//! Single dispatcher that exclusively owns the `SequenceMatcher` and the
//! `AccessController`. Each iteration processes due revocations, sweeps
//! timed-out progress on its tick, then waits for the next knock bounded by
//! the nearest deadline.

use super::AccessController;
use crate::domain::{
    AccessError, GrantUpdate, KnockConfig, KnockEvent, KnockOutcome, SequenceMatcher,
    ShutdownPolicy, Timestamp,
};
use crate::ports::{FirewallBackend, KnockPoll, KnockSource, TimeSource};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Dispatcher failures.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// `run` was called before default-deny was installed.
    #[error("default-deny baseline must be established before serving knocks")]
    BaselineMissing,

    /// Installing default-deny failed.
    #[error(transparent)]
    Baseline(#[from] AccessError),

    /// Every knock listener stopped.
    #[error("all knock listeners closed")]
    ListenersClosed,
}

/// Counters kept by the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaemonStats {
    /// Knock datagrams dispatched.
    pub knocks: u64,
    /// Sequences started.
    pub sequences_started: u64,
    /// Progress dropped on a wrong port.
    pub resets: u64,
    /// Progress dropped on a late knock or by the sweeper.
    pub timeouts: u64,
    /// New grants.
    pub grants: u64,
    /// Existing grants extended.
    pub refreshes: u64,
    /// Grant requests the firewall refused.
    pub grant_failures: u64,
    /// Grants withdrawn on expiry.
    pub expirations: u64,
}

/// The knock dispatcher.
pub struct KnockDaemon<F> {
    config: KnockConfig,
    matcher: SequenceMatcher,
    controller: AccessController<F>,
    time_source: Arc<dyn TimeSource>,
    next_sweep: Timestamp,
    stats: DaemonStats,
}

impl<F: FirewallBackend> KnockDaemon<F> {
    /// Create a daemon around `firewall`. The configuration must already be
    /// validated.
    pub fn new(config: KnockConfig, firewall: F, time_source: Arc<dyn TimeSource>) -> Self {
        let matcher = SequenceMatcher::new(config.sequence.clone(), config.window)
            .with_repeated_first_knock(config.repeated_first_knock);
        let controller = AccessController::new(firewall, config.protected_port, time_source.clone());
        let next_sweep = time_source.now().saturating_add(config.sweep_interval);
        Self {
            config,
            matcher,
            controller,
            time_source,
            next_sweep,
            stats: DaemonStats::default(),
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> &KnockConfig {
        &self.config
    }

    /// The sequence matcher.
    pub fn matcher(&self) -> &SequenceMatcher {
        &self.matcher
    }

    /// The access controller.
    pub fn controller(&self) -> &AccessController<F> {
        &self.controller
    }

    /// Counters so far.
    pub fn stats(&self) -> DaemonStats {
        self.stats
    }

    /// Install default-deny. Call before binding any knock socket.
    pub async fn establish_baseline(&mut self) -> Result<(), DaemonError> {
        self.controller.establish_baseline().await?;
        Ok(())
    }

    /// Dispatch one knock to the matcher and act on the outcome.
    pub async fn handle_knock(&mut self, event: KnockEvent) -> KnockOutcome {
        self.stats.knocks += 1;
        let outcome = self.matcher.on_knock(&event);
        let source = event.source;
        let port = event.port;

        match outcome {
            KnockOutcome::Ignored => {
                debug!(source = %source, port, "knock ignored");
            }
            KnockOutcome::Started => {
                self.stats.sequences_started += 1;
                info!(source = %source, port, "knock sequence started");
            }
            KnockOutcome::Advanced { next_index } => {
                info!(
                    source = %source,
                    port,
                    step = next_index,
                    of = self.matcher.sequence().len(),
                    "knock accepted"
                );
            }
            KnockOutcome::Restarted => {
                self.stats.sequences_started += 1;
                info!(source = %source, port, "first knock repeated, sequence restarted");
            }
            KnockOutcome::Repeated => {
                debug!(source = %source, port, "repeated first knock ignored");
            }
            KnockOutcome::Reset {
                expected,
                received,
                reached,
            } => {
                self.stats.resets += 1;
                info!(source = %source, expected, received, reached, "wrong knock, sequence reset");
            }
            KnockOutcome::TimedOut { reached, elapsed } => {
                self.stats.timeouts += 1;
                info!(source = %source, port, reached, ?elapsed, "knock window exceeded, sequence reset");
            }
            KnockOutcome::Completed => {
                info!(source = %source, "knock sequence completed");
                let granted = self
                    .controller
                    .grant_from(source, event.received_at, self.config.grant_duration)
                    .await;
                match granted {
                    Ok(GrantUpdate::Inserted(_)) => self.stats.grants += 1,
                    Ok(GrantUpdate::Refreshed { .. }) => self.stats.refreshes += 1,
                    // Already logged as an alert by the controller
                    Err(_) => self.stats.grant_failures += 1,
                }
            }
        }

        outcome
    }

    /// Evict timed-out progress records. Returns the number evicted.
    pub fn sweep(&mut self) -> usize {
        let now = self.time_source.now();
        let evicted = self.matcher.sweep(now);
        for progress in &evicted {
            info!(
                source = %progress.address(),
                reached = progress.next_index(),
                started_at = %progress.started_at(),
                "knock progress expired"
            );
        }
        self.stats.timeouts += evicted.len() as u64;
        evicted.len()
    }

    /// Run due revocations and, when the tick has passed, the sweeper.
    pub async fn maintain(&mut self) {
        let expired = self.controller.revoke_due().await;
        self.stats.expirations += expired.len() as u64;

        let now = self.time_source.now();
        if now >= self.next_sweep {
            self.sweep();
            self.next_sweep = now.saturating_add(self.config.sweep_interval);
        }
    }

    /// How long the next listener wait may block: until the sweep tick or
    /// the earliest grant expiry, whichever is first.
    pub fn poll_timeout(&self) -> Duration {
        let now = self.time_source.now();
        let until_sweep = self.next_sweep.duration_since(now);
        match self.controller.next_expiry() {
            Some(deadline) => until_sweep.min(deadline.duration_since(now)),
            None => until_sweep,
        }
    }

    /// Serve knocks from `source` until `shutdown` flips to `true` (or its
    /// sender is dropped), then apply the shutdown policy.
    pub async fn run<S: KnockSource>(
        &mut self,
        source: &mut S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<DaemonStats, DaemonError> {
        if !self.controller.baseline_established() {
            return Err(DaemonError::BaselineMissing);
        }

        info!(
            sequence = %self.config.sequence,
            protected_port = self.config.protected_port,
            window = ?self.config.window,
            grant_duration = ?self.config.grant_duration,
            "knock daemon running"
        );

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            self.maintain().await;
            let timeout = self.poll_timeout();

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown signal received");
                        break Ok(());
                    }
                }
                poll = source.next_event(timeout) => match poll {
                    KnockPoll::Knock(event) => {
                        self.handle_knock(event).await;
                    }
                    KnockPoll::Timeout => {}
                    KnockPoll::Closed => {
                        warn!("knock listeners closed");
                        break Err(DaemonError::ListenersClosed);
                    }
                },
            }
        };

        self.shutdown().await;
        result.map(|()| self.stats)
    }

    /// Drop all progress and apply the shutdown policy. Returns the number of
    /// grants revoked.
    pub async fn shutdown(&mut self) -> usize {
        self.matcher.clear();
        match self.config.shutdown_policy {
            ShutdownPolicy::Revoke => {
                let revoked = self.controller.revoke_all().await;
                info!(revoked, "outstanding grants revoked");
                revoked
            }
            ShutdownPolicy::Keep => {
                let kept = self.controller.grants().len();
                if kept > 0 {
                    warn!(kept, "leaving grants in place; they will not be revoked by this process");
                }
                0
            }
        }
    }
}
