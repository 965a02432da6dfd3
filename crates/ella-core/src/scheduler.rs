//! Periodic reconnection driver.
//!
//! The scheduler wakes every `base_interval` and asks the session to
//! connect when the session is down and its backoff has elapsed. It never
//! changes state itself; everything goes through
//! [`ConnectionSession::request_connect`] so the connection mutex arbitrates
//! between the scheduler, manual retries and foreground events.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use ella_types::ConnectionState;

use crate::session::{ConnectOutcome, ConnectionSession};

/// Why a tick did not attempt a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No device is bound.
    NotBound,
    /// The link is up.
    Connected,
    /// An attempt is already running.
    InFlight,
    /// The session is reconnecting but `next_retry_at` is in the future.
    BackoffPending,
    /// The session has been disposed.
    Disposed,
}

/// Result of one scheduler evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    /// Nothing to do this tick.
    Skipped(SkipReason),
    /// A connect was requested.
    Attempted(ConnectOutcome),
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Drives reconnection for one session.
///
/// # Example
///
/// ```ignore
/// let scheduler = ReconnectionScheduler::new(session.clone());
/// scheduler.start();
/// // ...
/// scheduler.stop();
/// ```
pub struct ReconnectionScheduler {
    session: Arc<ConnectionSession>,
    running: Mutex<Option<Running>>,
}

impl ReconnectionScheduler {
    /// Create a stopped scheduler using the session's backoff policy.
    pub fn new(session: Arc<ConnectionSession>) -> Self {
        Self {
            session,
            running: Mutex::new(None),
        }
    }

    /// The driven session.
    pub fn session(&self) -> &Arc<ConnectionSession> {
        &self.session
    }

    /// Start ticking. The first tick runs immediately.
    ///
    /// Calling `start` while running is a no-op.
    pub fn start(&self) {
        let mut running = self.lock_running();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            debug!("Reconnection scheduler already running");
            return;
        }

        let cancel = CancellationToken::new();
        let period = self.session.config().backoff.base_interval;
        let session = Arc::clone(&self.session);
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let outcome = tokio::select! {
                            _ = token.cancelled() => break,
                            outcome = evaluate(&session) => outcome,
                        };
                        debug!(?outcome, "Scheduler tick");
                        if outcome == TickOutcome::Skipped(SkipReason::Disposed) {
                            break;
                        }
                    }
                }
            }
            debug!("Reconnection scheduler loop exited");
        });

        info!("Reconnection scheduler started (every {:?})", period);
        *running = Some(Running { cancel, task });
    }

    /// Run one evaluation now, independent of the tick loop.
    pub async fn tick(&self) -> TickOutcome {
        evaluate(&self.session).await
    }

    /// Stop ticking and abandon any connect attempt in flight.
    ///
    /// Idempotent, and a no-op before [`ReconnectionScheduler::start`]. An
    /// established link is left up.
    pub fn stop(&self) {
        let Some(running) = self.lock_running().take() else {
            return;
        };
        running.cancel.cancel();
        running.task.abort();
        if self.session.cancel_attempt() {
            debug!("Cancelled in-flight connect attempt");
        }
        info!("Reconnection scheduler stopped");
    }

    /// Whether the tick loop is active.
    pub fn is_running(&self) -> bool {
        self.lock_running()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ReconnectionScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ReconnectionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectionScheduler")
            .field("running", &self.is_running())
            .finish()
    }
}

async fn evaluate(session: &ConnectionSession) -> TickOutcome {
    if session.is_disposed() {
        return TickOutcome::Skipped(SkipReason::Disposed);
    }

    if session.registry().bound_device().is_none() {
        if !session.state().is_disconnected() {
            debug!("No bound device; driving session to disconnected");
            session.disconnect().await;
        }
        return TickOutcome::Skipped(SkipReason::NotBound);
    }

    match session.state() {
        ConnectionState::Connected { .. } => TickOutcome::Skipped(SkipReason::Connected),
        ConnectionState::Connecting { .. } => TickOutcome::Skipped(SkipReason::InFlight),
        ConnectionState::Reconnecting { next_retry_at, .. }
            if !session.clock().has_passed(next_retry_at) =>
        {
            TickOutcome::Skipped(SkipReason::BackoffPending)
        }
        _ => TickOutcome::Attempted(session.request_connect().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::mock::MockTransport;
    use crate::preferences::MemoryPreferences;
    use ella_types::{DeviceIdentity, DisconnectReason};
    use std::time::Duration;

    async fn setup() -> (ReconnectionScheduler, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let session = ConnectionSession::with_preferences(
            transport.clone(),
            Arc::new(MemoryPreferences::new()),
            SessionConfig::default(),
        )
        .unwrap();
        session
            .bind(DeviceIdentity::new("AA:01", "Pendant"), false)
            .await
            .unwrap();
        (ReconnectionScheduler::new(session), transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_connects_when_disconnected() {
        let (scheduler, _transport) = setup().await;
        assert_eq!(
            scheduler.tick().await,
            TickOutcome::Attempted(ConnectOutcome::Connected)
        );
        assert_eq!(
            scheduler.tick().await,
            TickOutcome::Skipped(SkipReason::Connected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_respects_backoff() {
        let (scheduler, transport) = setup().await;
        transport.fail_next(1);

        assert!(matches!(
            scheduler.tick().await,
            TickOutcome::Attempted(ConnectOutcome::Failed { attempt: 1, .. })
        ));
        assert_eq!(
            scheduler.tick().await,
            TickOutcome::Skipped(SkipReason::BackoffPending)
        );

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(
            scheduler.tick().await,
            TickOutcome::Skipped(SkipReason::BackoffPending)
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            scheduler.tick().await,
            TickOutcome::Attempted(ConnectOutcome::Connected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_without_binding_reconciles() {
        let (scheduler, transport) = setup().await;
        transport.fail_next(1);
        scheduler.tick().await;
        assert!(scheduler.session().state().is_reconnecting());

        scheduler.session().registry().unbind().await.unwrap();
        assert_eq!(
            scheduler.tick().await,
            TickOutcome::Skipped(SkipReason::NotBound)
        );
        assert!(scheduler.session().state().is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reconnects_after_link_loss() {
        let (scheduler, transport) = setup().await;
        scheduler.start();
        scheduler.start();
        assert!(scheduler.is_running());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(scheduler.session().state().is_connected());

        transport.drop_link(DisconnectReason::OutOfRange);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(scheduler.session().state().is_reconnecting());

        // attempt 1 backs off 30s; ticks land every 15s, so the 45s tick retries
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(scheduler.session().state().is_reconnecting());
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(scheduler.session().state().is_connected());
        assert_eq!(transport.connect_calls(), 2);

        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_safe_before_start() {
        let (scheduler, _transport) = setup().await;
        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_running());

        scheduler.start();
        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_in_flight_attempt() {
        let (scheduler, transport) = setup().await;
        transport.set_hang(true);

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(scheduler.session().state().is_connecting());

        scheduler.stop();
        assert!(scheduler.session().state().is_disconnected());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_exits_after_dispose() {
        let (scheduler, _transport) = setup().await;
        scheduler.session().dispose().await;
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!scheduler.is_running());
        assert_eq!(
            scheduler.tick().await,
            TickOutcome::Skipped(SkipReason::Disposed)
        );
    }

    #[test]
    fn test_outcome_serializes() {
        let json = serde_json::to_string(&TickOutcome::Skipped(SkipReason::BackoffPending)).unwrap();
        assert_eq!(json, r#"{"skipped":"backoff_pending"}"#);
    }
}
