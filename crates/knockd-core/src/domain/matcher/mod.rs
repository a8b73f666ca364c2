//! Sequence Matcher
//!
//! Per-source state machine tracking progress through the knock sequence:
//!
//! ```text
//! NONE ──knock seq[0]──→ IN_PROGRESS(1) ──knock seq[k]──→ IN_PROGRESS(k+1)
//!   ↑                          │                                │
//!   └── wrong port / timeout ──┴────── k+1 == len ──→ GRANTED ──┘ (record dropped)
//! ```
//!
//! Events must be fed one at a time from a single dispatcher; the matcher
//! holds no locks.

use super::{ConfigError, KnockEvent, KnockSequence, Timestamp};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

/// Handling of a knock on `sequence[0]` from a source already mid-sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepeatedFirstKnock {
    /// Start over at index 1 with a fresh window. Tolerates retransmitted
    /// first knocks.
    #[default]
    Restart,
    /// Drop the knock and keep the current progress.
    Ignore,
    /// Treat it as any other wrong knock.
    Reset,
}

impl FromStr for RepeatedFirstKnock {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "restart" => Ok(Self::Restart),
            "ignore" => Ok(Self::Ignore),
            "reset" => Ok(Self::Reset),
            other => Err(ConfigError::UnknownVariant {
                key: "repeated_first_knock",
                value: other.to_string(),
                expected: "restart, ignore, reset",
            }),
        }
    }
}

impl fmt::Display for RepeatedFirstKnock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Restart => write!(f, "restart"),
            Self::Ignore => write!(f, "ignore"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

/// Progress of one source address through the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientProgress {
    address: IpAddr,
    next_index: usize,
    started_at: Timestamp,
}

impl ClientProgress {
    fn new(address: IpAddr, started_at: Timestamp) -> Self {
        Self {
            address,
            next_index: 1,
            started_at,
        }
    }

    /// Source address.
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Index of the next expected port, in `1..len`.
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    /// Time of the first correct knock.
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// Strictly older than `window` at `now`.
    pub fn is_expired(&self, now: Timestamp, window: Duration) -> bool {
        now.duration_since(self.started_at) > window
    }
}

/// Result of feeding one knock to the matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnockOutcome {
    /// Unknown source knocked a port other than `sequence[0]`.
    Ignored,
    /// Correct first knock; progress created at index 1.
    Started,
    /// Correct knock; `next_index` is now expected.
    Advanced {
        /// Index of the next expected port
        next_index: usize,
    },
    /// Repeated first knock under `RepeatedFirstKnock::Restart`.
    Restarted,
    /// Repeated first knock under `RepeatedFirstKnock::Ignore`.
    Repeated,
    /// Full sequence knocked in time: grant request for the source.
    Completed,
    /// Wrong port; progress dropped.
    Reset {
        /// Port that was expected
        expected: u16,
        /// Port that was knocked
        received: u16,
        /// Correct knocks made before the violation
        reached: usize,
    },
    /// Window exceeded; progress dropped and this knock discarded.
    TimedOut {
        /// Correct knocks made before the timeout
        reached: usize,
        /// Time since the first knock
        elapsed: Duration,
    },
}

impl KnockOutcome {
    /// Whether the access controller must be invoked.
    pub fn is_grant_request(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Owns every in-progress sequence.
#[derive(Debug, Clone)]
pub struct SequenceMatcher {
    sequence: KnockSequence,
    window: Duration,
    repeated_first_knock: RepeatedFirstKnock,
    progress: HashMap<IpAddr, ClientProgress>,
}

impl SequenceMatcher {
    /// Create a matcher with the default repeated-first-knock policy.
    pub fn new(sequence: KnockSequence, window: Duration) -> Self {
        Self {
            sequence,
            window,
            repeated_first_knock: RepeatedFirstKnock::default(),
            progress: HashMap::new(),
        }
    }

    /// Override the repeated-first-knock policy.
    #[must_use]
    pub fn with_repeated_first_knock(mut self, policy: RepeatedFirstKnock) -> Self {
        self.repeated_first_knock = policy;
        self
    }

    /// The configured sequence.
    pub fn sequence(&self) -> &KnockSequence {
        &self.sequence
    }

    /// The configured window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Apply one knock.
    ///
    /// The timeout check precedes the order check, so a correct but late
    /// knock is a failure.
    pub fn on_knock(&mut self, event: &KnockEvent) -> KnockOutcome {
        let Some(current) = self.progress.get(&event.source).copied() else {
            if event.port == self.sequence.first() {
                self.progress.insert(
                    event.source,
                    ClientProgress::new(event.source, event.received_at),
                );
                return KnockOutcome::Started;
            }
            return KnockOutcome::Ignored;
        };

        if current.is_expired(event.received_at, self.window) {
            self.progress.remove(&event.source);
            return KnockOutcome::TimedOut {
                reached: current.next_index,
                elapsed: event.received_at.duration_since(current.started_at),
            };
        }

        // next_index < len holds for every stored record
        let expected = self.sequence.ports()[current.next_index];

        if event.port == expected {
            let next_index = current.next_index + 1;
            if next_index == self.sequence.len() {
                self.progress.remove(&event.source);
                return KnockOutcome::Completed;
            }
            self.progress.insert(
                event.source,
                ClientProgress {
                    next_index,
                    ..current
                },
            );
            return KnockOutcome::Advanced { next_index };
        }

        if event.port == self.sequence.first() {
            match self.repeated_first_knock {
                RepeatedFirstKnock::Restart => {
                    self.progress.insert(
                        event.source,
                        ClientProgress::new(event.source, event.received_at),
                    );
                    return KnockOutcome::Restarted;
                }
                RepeatedFirstKnock::Ignore => return KnockOutcome::Repeated,
                RepeatedFirstKnock::Reset => {}
            }
        }

        self.progress.remove(&event.source);
        KnockOutcome::Reset {
            expected,
            received: event.port,
            reached: current.next_index,
        }
    }

    /// Evict every record older than the window. Returns the evicted records.
    pub fn sweep(&mut self, now: Timestamp) -> Vec<ClientProgress> {
        let window = self.window;
        let expired: Vec<ClientProgress> = self
            .progress
            .values()
            .filter(|p| p.is_expired(now, window))
            .copied()
            .collect();
        for record in &expired {
            self.progress.remove(&record.address);
        }
        expired
    }

    /// Progress of one source, if mid-sequence.
    pub fn progress_of(&self, address: &IpAddr) -> Option<&ClientProgress> {
        self.progress.get(address)
    }

    /// Number of sources mid-sequence.
    pub fn in_progress(&self) -> usize {
        self.progress.len()
    }

    /// Forget all progress.
    pub fn clear(&mut self) {
        self.progress.clear();
    }
}
