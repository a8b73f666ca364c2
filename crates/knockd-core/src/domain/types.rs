//! Core value types shared by every layer.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// A point on the daemon's monotonic clock, in milliseconds.
///
/// Only differences between timestamps are meaningful; the origin is
/// whatever the active `TimeSource` chose (daemon start in production).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a timestamp from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Create a timestamp from whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000))
    }

    /// Milliseconds since the clock origin.
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// The timestamp `duration` later, saturating at the end of time.
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_millis(duration)))
    }

    /// Time elapsed from `earlier` to `self` (zero if `earlier` is later).
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}s", self.0 / 1_000, self.0 % 1_000)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// One datagram received on a knock port.
///
/// Payload content is never inspected: only the source address and the
/// destination port carry meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnockEvent {
    /// Source IP of the datagram.
    pub source: IpAddr,
    /// Knock port the datagram arrived on.
    pub port: u16,
    /// When the listener received it.
    pub received_at: Timestamp,
}

impl KnockEvent {
    /// Create a new knock event.
    pub fn new(source: IpAddr, port: u16, received_at: Timestamp) -> Self {
        Self {
            source,
            port,
            received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_since_saturates() {
        let early = Timestamp::from_secs(5);
        let late = Timestamp::from_secs(7);
        assert_eq!(late.duration_since(early), Duration::from_secs(2));
        assert_eq!(early.duration_since(late), Duration::ZERO);
    }

    #[test]
    fn test_saturating_add() {
        let t = Timestamp::from_millis(1_500);
        assert_eq!(t.saturating_add(Duration::from_secs(30)).as_millis(), 31_500);
        assert_eq!(
            Timestamp::from_millis(u64::MAX).saturating_add(Duration::from_secs(1)),
            Timestamp::from_millis(u64::MAX)
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Timestamp::from_millis(12_034).to_string(), "12.034s");
    }
}
