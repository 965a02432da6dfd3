//! Reconnection backoff policy.
//!
//! The scheduler polls on a fixed cadence (`base_interval`) and, after a
//! failed attempt, waits `min(max_backoff, base_interval * multiplier^attempt)`
//! before the next one. The cap bounds worst-case reconnection latency while
//! keeping a flaky BLE stack from being hammered.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{Error, Result};

/// Backoff configuration for reconnection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Scheduler tick cadence and the unit of backoff growth.
    pub base_interval: Duration,
    /// Upper bound on any single backoff delay.
    pub max_backoff: Duration,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
    /// Add up to 10% random jitter before capping.
    ///
    /// Jitter spreads retries from many devices apart but makes consecutive
    /// delays non-monotonic below the cap.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(15),
            max_backoff: Duration::from_secs(120),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with defaults (15s cadence, 2 minute cap).
    pub fn new() -> Self {
        Self::default()
    }

    /// Short cadence for foreground use, where the user is waiting.
    pub fn aggressive() -> Self {
        Self {
            base_interval: Duration::from_secs(5),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Long cadence for background use, where battery matters more.
    pub fn conservative() -> Self {
        Self {
            base_interval: Duration::from_secs(30),
            max_backoff: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set the base interval.
    #[must_use]
    pub fn base_interval(mut self, interval: Duration) -> Self {
        self.base_interval = interval;
        self
    }

    /// Set the backoff cap.
    #[must_use]
    pub fn max_backoff(mut self, cap: Duration) -> Self {
        self.max_backoff = cap;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Delay to wait after failed attempt number `attempt`.
    ///
    /// Never exceeds `max_backoff`, even for very large attempt counts.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut secs = self.base_interval.as_secs_f64() * self.multiplier.powi(exponent);

        if self.jitter {
            let jitter_factor = 1.0 + (rand::rng().random::<f64>() * 0.1);
            secs *= jitter_factor;
        }

        let cap = self.max_backoff.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// When the next attempt is due, given a failure at `now`.
    pub fn next_retry_at(&self, now: OffsetDateTime, attempt: u32) -> OffsetDateTime {
        now + self.delay_for_attempt(attempt)
    }

    /// Validate the policy and return an error if invalid.
    ///
    /// Checks that:
    /// - `multiplier` is >= 1.0
    /// - `base_interval` is > 0
    /// - `max_backoff` >= `base_interval`
    pub fn validate(&self) -> Result<()> {
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(Error::invalid_config("backoff multiplier must be >= 1.0"));
        }
        if self.base_interval.is_zero() {
            return Err(Error::invalid_config("base_interval must be > 0"));
        }
        if self.max_backoff < self.base_interval {
            return Err(Error::invalid_config(
                "max_backoff must be >= base_interval",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_default_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_interval, Duration::from_secs(15));
        assert_eq!(policy.max_backoff, Duration::from_secs(120));
        assert!(!policy.jitter);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_delay_calculation() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(15));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(120));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(50), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(120));
    }

    #[test]
    fn test_constant_multiplier() {
        let policy = BackoffPolicy::default().multiplier(1.0);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(15));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(15));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::default().jitter(true);
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_secs(30));
            assert!(delay <= Duration::from_secs(33));
        }
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(120));
    }

    #[test]
    fn test_next_retry_at() {
        let policy = BackoffPolicy::default();
        let now = datetime!(2026-03-01 12:00 UTC);
        assert_eq!(
            policy.next_retry_at(now, 1),
            datetime!(2026-03-01 12:00:30 UTC)
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(BackoffPolicy::default().multiplier(0.5).validate().is_err());
        assert!(
            BackoffPolicy::default()
                .multiplier(f64::NAN)
                .validate()
                .is_err()
        );
        assert!(
            BackoffPolicy::default()
                .base_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            BackoffPolicy::default()
                .max_backoff(Duration::from_secs(1))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_presets_validate() {
        assert!(BackoffPolicy::aggressive().validate().is_ok());
        assert!(BackoffPolicy::conservative().validate().is_ok());
    }
}
