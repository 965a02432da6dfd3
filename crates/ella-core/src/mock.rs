//! Mock transport for testing.
//!
//! [`MockTransport`] implements [`Transport`] without any radio, so session
//! and scheduler behavior can be exercised deterministically (ideally on
//! tokio's paused clock).
//!
//! # Features
//!
//! - **Failure injection**: fail the next N connects, or every connect
//! - **Latency simulation**: delay each connect
//! - **Hang mode**: connects that never complete, for timeout tests
//! - **Link loss**: drop live links with a chosen [`DisconnectReason`]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use ella_types::{DeviceIdentity, DisconnectReason};

use crate::error::TransportError;
use crate::transport::{LinkEventSender, Transport, TransportEvent, TransportLink};

/// A scriptable in-memory transport.
///
/// # Example
///
/// ```ignore
/// use ella_core::MockTransport;
///
/// let transport = MockTransport::new();
/// // First 3 connects fail, the 4th succeeds
/// transport.fail_next(3);
/// ```
#[derive(Debug)]
pub struct MockTransport {
    connect_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    remaining_failures: AtomicU32,
    should_fail: AtomicBool,
    hang: AtomicBool,
    connect_latency_ms: AtomicU64,
    failure: Mutex<TransportError>,
    next_link_id: AtomicU64,
    links: Mutex<HashMap<u64, (String, LinkEventSender)>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a transport whose connects succeed immediately.
    pub fn new() -> Self {
        Self {
            connect_calls: AtomicU32::new(0),
            disconnect_calls: AtomicU32::new(0),
            remaining_failures: AtomicU32::new(0),
            should_fail: AtomicBool::new(false),
            hang: AtomicBool::new(false),
            connect_latency_ms: AtomicU64::new(0),
            failure: Mutex::new(TransportError::OutOfRange),
            next_link_id: AtomicU64::new(1),
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `count` connects, then succeed.
    pub fn fail_next(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::Relaxed);
    }

    /// Number of scripted failures still pending.
    pub fn remaining_failures(&self) -> u32 {
        self.remaining_failures.load(Ordering::Relaxed)
    }

    /// Fail every connect until cleared.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// Error returned by failing connects (default: out of range).
    pub fn set_failure(&self, error: TransportError) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Make connects wait forever.
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::Relaxed);
    }

    /// Delay every connect by `latency`.
    ///
    /// Set to `Duration::ZERO` to disable latency simulation.
    pub fn set_connect_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.connect_latency_ms.store(ms, Ordering::Relaxed);
    }

    /// Number of `connect` calls so far, including failed and hung ones.
    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::Relaxed)
    }

    /// Number of `disconnect` calls so far.
    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::Relaxed)
    }

    /// Number of links currently up.
    pub fn live_links(&self) -> usize {
        self.links().len()
    }

    /// Drop every live link, reporting `reason` on each.
    ///
    /// Returns how many links were dropped.
    pub fn drop_link(&self, reason: DisconnectReason) -> usize {
        let dropped: Vec<_> = self.links().drain().collect();
        for (link_id, (device_id, tx)) in &dropped {
            debug!("Mock link {} to {} dropped: {}", link_id, device_id, reason);
            let _ = tx.send(TransportEvent::Disconnected(reason.clone()));
        }
        dropped.len()
    }

    fn links(&self) -> MutexGuard<'_, HashMap<u64, (String, LinkEventSender)>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self) -> Option<TransportError> {
        let scripted = self
            .remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();

        (scripted || self.should_fail.load(Ordering::Relaxed)).then(|| {
            self.failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, device: &DeviceIdentity) -> Result<TransportLink, TransportError> {
        self.connect_calls.fetch_add(1, Ordering::Relaxed);

        let latency = self.connect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.hang.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }

        if let Some(error) = self.take_failure() {
            debug!("Mock connect to {} failed: {}", device.id, error);
            return Err(error);
        }

        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let (link, tx) = TransportLink::channel(&device.id, link_id);
        self.links().insert(link_id, (device.id.clone(), tx));
        debug!("Mock link {} to {} up", link_id, device.id);
        Ok(link)
    }

    async fn disconnect(&self, link: &TransportLink) -> Result<(), TransportError> {
        self.disconnect_calls.fetch_add(1, Ordering::Relaxed);
        self.links().remove(&link.link_id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceIdentity {
        DeviceIdentity::new("AA:01", "Pendant")
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let transport = MockTransport::new();
        let link = transport.connect(&device()).await.unwrap();
        assert_eq!(link.device_id(), "AA:01");
        assert_eq!(transport.live_links(), 1);
        assert_eq!(transport.connect_calls(), 1);

        transport.disconnect(&link).await.unwrap();
        transport.disconnect(&link).await.unwrap();
        assert_eq!(transport.live_links(), 0);
        assert_eq!(transport.disconnect_calls(), 2);
    }

    #[tokio::test]
    async fn test_fail_next() {
        let transport = MockTransport::new();
        transport.fail_next(2);

        assert_eq!(
            transport.connect(&device()).await.unwrap_err(),
            TransportError::OutOfRange
        );
        transport.set_failure(TransportError::Rejected);
        assert_eq!(
            transport.connect(&device()).await.unwrap_err(),
            TransportError::Rejected
        );
        assert!(transport.connect(&device()).await.is_ok());
        assert_eq!(transport.remaining_failures(), 0);
        assert_eq!(transport.connect_calls(), 3);
    }

    #[tokio::test]
    async fn test_should_fail() {
        let transport = MockTransport::new();
        transport.set_should_fail(true);
        assert!(transport.connect(&device()).await.is_err());
        assert!(transport.connect(&device()).await.is_err());
        transport.set_should_fail(false);
        assert!(transport.connect(&device()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_never_completes() {
        let transport = MockTransport::new();
        transport.set_hang(true);

        let result =
            tokio::time::timeout(Duration::from_secs(60), transport.connect(&device())).await;
        assert!(result.is_err());
        assert_eq!(transport.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_latency() {
        let transport = MockTransport::new();
        transport.set_connect_latency(Duration::from_secs(2));

        let start = tokio::time::Instant::now();
        transport.connect(&device()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_drop_link_reports_reason() {
        let transport = MockTransport::new();
        let mut link = transport.connect(&device()).await.unwrap();
        let mut events = link.take_events().unwrap();

        assert_eq!(transport.drop_link(DisconnectReason::Timeout), 1);
        assert_eq!(transport.live_links(), 0);
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Disconnected(DisconnectReason::Timeout))
        );
        assert_eq!(transport.drop_link(DisconnectReason::Timeout), 0);
    }
}
