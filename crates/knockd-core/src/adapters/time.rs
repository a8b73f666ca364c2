use crate::domain::Timestamp;
use crate::ports::TimeSource;
use std::time::Instant;

// ============================================================================
// MonotonicTimeSource - Production Time Source
// ============================================================================

/// Production time source on the monotonic clock.
///
/// Timestamps count milliseconds from construction, so wall-clock jumps
/// cannot stretch or cut a knock window or a grant. For tests, use
/// `ManualClock` from the test utilities.
///
/// # Example
///
/// ```rust
/// use knockd_core::adapters::MonotonicTimeSource;
/// use knockd_core::TimeSource;
///
/// let clock = MonotonicTimeSource::new();
/// let a = clock.now();
/// let b = clock.now();
/// assert!(b >= a);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct MonotonicTimeSource {
    origin: Instant,
}

impl MonotonicTimeSource {
    /// Start a clock at zero now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTimeSource {
    fn now(&self) -> Timestamp {
        let elapsed = self.origin.elapsed().as_millis();
        Timestamp::from_millis(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }
}
