//! Connection attempt metrics.
//!
//! Counters are updated lock-free by the session and read as a serializable
//! snapshot, e.g. for the `simulate` summary or a diagnostics screen.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Thread-safe counters for one session.
#[derive(Debug)]
pub struct ConnectionMetrics {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    busy_rejections: AtomicU64,
    mutex_timeouts: AtomicU64,
    links_lost: AtomicU64,
    total_connect_ms: AtomicU64,
    min_connect_ms: AtomicU64,
    max_connect_ms: AtomicU64,
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self {
            attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            busy_rejections: AtomicU64::new(0),
            mutex_timeouts: AtomicU64::new(0),
            links_lost: AtomicU64::new(0),
            total_connect_ms: AtomicU64::new(0),
            min_connect_ms: AtomicU64::new(u64::MAX),
            max_connect_ms: AtomicU64::new(0),
        }
    }

    /// A transport connect was started.
    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// A transport connect succeeded after `latency`.
    pub fn record_success(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.total_connect_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_connect_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_connect_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// A transport connect failed or timed out.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A request was turned away because another attempt was running.
    pub fn record_busy(&self) {
        self.busy_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Waiting for the connection mutex timed out.
    pub fn record_mutex_timeout(&self) {
        self.mutex_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// An established link dropped.
    pub fn record_link_lost(&self) {
        self.links_lost.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> ConnectionMetricsSnapshot {
        let successes = self.successes.load(Ordering::Relaxed);
        let total_connect_ms = self.total_connect_ms.load(Ordering::Relaxed);
        let min = self.min_connect_ms.load(Ordering::Relaxed);

        ConnectionMetricsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes,
            failures: self.failures.load(Ordering::Relaxed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
            mutex_timeouts: self.mutex_timeouts.load(Ordering::Relaxed),
            links_lost: self.links_lost.load(Ordering::Relaxed),
            total_connect_ms,
            min_connect_ms: (min != u64::MAX).then_some(min),
            max_connect_ms: (successes > 0).then(|| self.max_connect_ms.load(Ordering::Relaxed)),
            avg_connect_ms: (successes > 0).then(|| total_connect_ms as f64 / successes as f64),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in [
            &self.attempts,
            &self.successes,
            &self.failures,
            &self.busy_rejections,
            &self.mutex_timeouts,
            &self.links_lost,
            &self.total_connect_ms,
            &self.max_connect_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.min_connect_ms.store(u64::MAX, Ordering::Relaxed);
    }
}

/// Serializable copy of [`ConnectionMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetricsSnapshot {
    /// Transport connects started.
    pub attempts: u64,
    /// Transport connects that produced a link.
    pub successes: u64,
    /// Transport connects that failed or timed out.
    pub failures: u64,
    /// Requests rejected because another attempt held the mutex.
    pub busy_rejections: u64,
    /// Mutex waits that hit their timeout.
    pub mutex_timeouts: u64,
    /// Established links that dropped.
    pub links_lost: u64,
    /// Cumulative latency of successful connects.
    pub total_connect_ms: u64,
    /// Fastest successful connect.
    pub min_connect_ms: Option<u64>,
    /// Slowest successful connect.
    pub max_connect_ms: Option<u64>,
    /// Mean successful connect latency.
    pub avg_connect_ms: Option<f64>,
}

impl ConnectionMetricsSnapshot {
    /// Fraction of finished attempts that succeeded, or `None` before any.
    pub fn success_rate(&self) -> Option<f64> {
        let finished = self.successes + self.failures;
        (finished > 0).then(|| self.successes as f64 / finished as f64)
    }
}
