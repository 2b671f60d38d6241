//! Audio clocks driving the playback timeline.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic time source for a playback timeline.
///
/// Times are offsets from an arbitrary per-clock origin.
pub trait AudioClock: Send + Sync {
    /// Current position of the clock.
    fn now(&self) -> Duration;
}

/// Clock backed by [`tokio::time::Instant`].
///
/// Under `#[tokio::test(start_paused = true)]` this clock follows the paused
/// runtime, so timeline tests advance it with `tokio::time::advance`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioClock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jump to an absolute position. Moving backwards is ignored.
    pub fn set(&self, at: Duration) {
        let mut now = self.now.lock();
        if at > *now {
            *now = at;
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl AudioClock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_is_monotonic() {
        let clock = ManualClock::new();
        clock.advance(Duration::from_millis(20));
        clock.set(Duration::from_millis(5));
        assert_eq!(clock.now(), Duration::from_millis(20));

        let shared = clock.clone();
        shared.set(Duration::from_millis(50));
        assert_eq!(clock.now(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monotonic_clock_follows_paused_runtime() {
        let clock = MonotonicClock::new();
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(clock.now(), Duration::from_millis(250));
    }
}
