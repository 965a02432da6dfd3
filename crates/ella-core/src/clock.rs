//! Wall-clock timestamps derived from the tokio clock.
//!
//! Connection states carry `OffsetDateTime` values so they can be shown and
//! serialized, but retry decisions must follow the runtime's monotonic
//! clock (which tests pause and advance). [`Clock`] anchors one wall-clock
//! reading to one tokio `Instant` and derives every later timestamp from the
//! monotonic offset.

use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::Instant;

/// Monotonic wall clock.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    wall: OffsetDateTime,
    mono: Instant,
}

impl Clock {
    /// Anchor a clock at the current time.
    pub fn new() -> Self {
        Self {
            wall: OffsetDateTime::now_utc(),
            mono: Instant::now(),
        }
    }

    /// Current wall-clock time.
    pub fn now(&self) -> OffsetDateTime {
        self.wall + self.mono.elapsed()
    }

    /// Time remaining until `at`, or zero if it has passed.
    pub fn until(&self, at: OffsetDateTime) -> Duration {
        Duration::try_from(at - self.now()).unwrap_or(Duration::ZERO)
    }

    /// Whether `at` has been reached.
    pub fn has_passed(&self, at: OffsetDateTime) -> bool {
        self.now() >= at
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_paused_time() {
        let clock = Clock::new();
        let start = clock.now();

        tokio::time::advance(Duration::from_secs(30)).await;

        let elapsed = clock.now() - start;
        assert_eq!(elapsed.whole_seconds(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_until_and_has_passed() {
        let clock = Clock::new();
        let due = clock.now() + Duration::from_secs(10);

        assert_eq!(clock.until(due), Duration::from_secs(10));
        assert!(!clock.has_passed(due));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(clock.until(due), Duration::ZERO);
        assert!(clock.has_passed(due));
    }
}
