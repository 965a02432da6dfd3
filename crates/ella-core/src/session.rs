//! Connection lifecycle state machine for the bound device.
//!
//! [`ConnectionSession`] owns the [`ConnectionState`]. Every change flows
//! through one private transition function that checks the transition table,
//! logs, publishes to observers and broadcasts a [`SessionEvent`]. Nothing
//! outside this module can write the state.
//!
//! ```text
//!                  request_connect (mutex held)
//!   Disconnected ───────────────────────────────► Connecting
//!        ▲                                         │      │
//!        │ disconnect / unbind            success  │      │ failure / timeout
//!        │ (from any state)                        ▼      ▼
//!        │                                 Connected    Reconnecting { attempt + 1 }
//!        │                                     │           │
//!        │                          link lost  │           │ backoff elapsed
//!        │                                     ▼           ▼
//!        └──────────────────────────── Reconnecting ──► Connecting
//! ```
//!
//! Connect failures are never returned as errors. They become
//! `Reconnecting` states that the [`crate::ReconnectionScheduler`] retries
//! with backoff until the device is unbound.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use ella_types::{BoundDevice, ConnectionState, DeviceIdentity, DisconnectReason};

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::error::{Error, Result, TransportError};
use crate::events::{EventDispatcher, SessionEvent};
use crate::metrics::{ConnectionMetrics, ConnectionMetricsSnapshot};
use crate::mutex::ConnectionMutex;
use crate::observable::ObservableConnectionState;
use crate::preferences::PreferencesStore;
use crate::registry::{BindingObserver, DeviceRegistry};
use crate::transport::{LinkEventReceiver, Transport, TransportEvent, TransportLink};

/// Result of one [`ConnectionSession::request_connect`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConnectOutcome {
    /// This call established the link.
    Connected,
    /// The link was already up; nothing was done.
    AlreadyConnected,
    /// Another attempt is in flight; nothing was done.
    Busy,
    /// No device is bound; nothing was done.
    NotBound,
    /// The attempt failed and the session is now `Reconnecting`.
    Failed {
        /// Failed attempts in the current outage.
        attempt: u32,
        /// When the scheduler will try again.
        #[serde(with = "time::serde::rfc3339")]
        next_retry_at: OffsetDateTime,
    },
    /// The attempt was abandoned by a disconnect, unbind or stop.
    Cancelled,
}

impl ConnectOutcome {
    /// Whether the link is up after this call.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::AlreadyConnected)
    }
}

/// Mutable bookkeeping guarded together with state transitions.
#[derive(Debug, Default)]
struct Inner {
    /// Bumped by every teardown; attempts and link monitors compare it to
    /// detect that they have been superseded.
    generation: u64,
    /// Cancels the in-flight attempt, replaced after each teardown.
    cancel: CancellationToken,
    /// Failed attempts in the current outage episode.
    attempt: u32,
    link: Option<TransportLink>,
    monitor: Option<JoinHandle<()>>,
}

impl Inner {
    /// Invalidate the current attempt and link monitor.
    fn supersede(&mut self) {
        self.generation += 1;
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
    }
}

/// The lifecycle owner for one bound wearable.
pub struct ConnectionSession {
    transport: Arc<dyn Transport>,
    registry: Arc<DeviceRegistry>,
    config: SessionConfig,
    mutex: ConnectionMutex,
    observable: ObservableConnectionState,
    events: EventDispatcher,
    metrics: ConnectionMetrics,
    clock: Clock,
    inner: Mutex<Inner>,
    disposed: AtomicBool,
    weak_self: Weak<ConnectionSession>,
}

impl ConnectionSession {
    /// Create a session over an existing registry.
    ///
    /// The session broadcasts on the registry's event dispatcher so binding
    /// and connection events share one feed, and follows binding changes made
    /// through the registry directly.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] if `config` fails [`SessionConfig::validate`].
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<DeviceRegistry>,
        config: SessionConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let events = registry.events().clone();
        let session = Arc::new_cyclic(|weak_self| Self {
            transport,
            registry,
            config,
            mutex: ConnectionMutex::new(),
            observable: ObservableConnectionState::new(ConnectionState::Disconnected),
            events,
            metrics: ConnectionMetrics::new(),
            clock: Clock::new(),
            inner: Mutex::new(Inner::default()),
            disposed: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        });

        let observer: Weak<dyn BindingObserver> = session.weak_self.clone();
        session.registry.attach(observer);
        Ok(session)
    }

    /// Create a session and its registry from a preferences store.
    ///
    /// The registry is not loaded; call `registry().load()` to restore a
    /// previous binding.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] if `config` fails [`SessionConfig::validate`].
    pub fn with_preferences(
        transport: Arc<dyn Transport>,
        preferences: Arc<dyn PreferencesStore>,
        config: SessionConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let registry = DeviceRegistry::new(
            preferences,
            EventDispatcher::new(config.event_capacity),
        )
        .with_persist_timeout(config.persist_timeout);
        Self::new(transport, Arc::new(registry), config)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.observable.current()
    }

    /// Read-only observable handle for UI and pipeline observers.
    pub fn observe(&self) -> ObservableConnectionState {
        self.observable.clone()
    }

    /// Coarse-grained event feed.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Attempt counters.
    pub fn metrics(&self) -> ConnectionMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Configuration the session runs with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Device catalog and binding.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Clock used for retry timestamps.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Whether [`ConnectionSession::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Try to connect to the bound device.
    ///
    /// At most one attempt runs at a time; concurrent callers get
    /// [`ConnectOutcome::Busy`]. Failures move the session to
    /// `Reconnecting` and are reported as [`ConnectOutcome::Failed`].
    #[instrument(level = "debug", skip(self), fields(state = %self.state().kind()))]
    pub async fn request_connect(&self) -> ConnectOutcome {
        if self.is_disposed() {
            return ConnectOutcome::Cancelled;
        }
        match self.state() {
            ConnectionState::Connected { .. } => return ConnectOutcome::AlreadyConnected,
            ConnectionState::Connecting { .. } => {
                debug!("Connect attempt already in flight");
                self.metrics.record_busy();
                return ConnectOutcome::Busy;
            }
            _ => {}
        }

        let _guard = match self.mutex.acquire(self.config.mutex_timeout).await {
            Ok(guard) => guard,
            Err(e) => {
                debug!("Connection mutex busy: {}", e);
                self.metrics.record_mutex_timeout();
                self.metrics.record_busy();
                return ConnectOutcome::Busy;
            }
        };

        let (device, generation, cancel) = {
            let mut inner = self.lock_inner();
            if self.is_disposed() {
                return ConnectOutcome::Cancelled;
            }

            let state = self.state();
            match &state {
                ConnectionState::Connected { .. } => return ConnectOutcome::AlreadyConnected,
                ConnectionState::Connecting { .. } => {
                    self.metrics.record_busy();
                    return ConnectOutcome::Busy;
                }
                _ => {}
            }

            let Some(bound) = self.registry.bound_device() else {
                debug!("No bound device to connect to");
                return ConnectOutcome::NotBound;
            };
            let device = bound.device;

            if state.device().is_some_and(|d| !d.same_device(&device)) {
                inner.attempt = 0;
            }

            self.transition(ConnectionState::Connecting {
                device: device.clone(),
                attempt_started_at: self.clock.now(),
            });
            (device, inner.generation, inner.cancel.clone())
        };

        let mut attempt_guard = AttemptGuard {
            session: self,
            generation,
            armed: true,
        };

        self.metrics.record_attempt();
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = timeout(self.config.connect_timeout, self.transport.connect(&device)) => Some(result),
        };
        attempt_guard.armed = false;

        let result = match result {
            None => {
                debug!("Connect attempt to {} cancelled", device);
                return ConnectOutcome::Cancelled;
            }
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(TransportError::Timeout),
        };

        match result {
            Ok(link) => self.complete_connect(device, generation, link, started).await,
            Err(error) => self.fail_connect(device, generation, error),
        }
    }

    async fn complete_connect(
        &self,
        device: DeviceIdentity,
        generation: u64,
        mut link: TransportLink,
        started: Instant,
    ) -> ConnectOutcome {
        {
            let mut inner = self.lock_inner();
            if inner.generation == generation && !self.is_disposed() {
                self.metrics.record_success(started.elapsed());
                inner.attempt = 0;
                if let Some(events) = link.take_events() {
                    inner.monitor = Some(self.spawn_link_monitor(generation, events));
                }
                inner.link = Some(link);
                self.transition(ConnectionState::Connected {
                    device,
                    connected_at: self.clock.now(),
                });
                return ConnectOutcome::Connected;
            }
        }

        debug!("Link to {} arrived after cancellation; tearing down", device);
        if let Err(e) = self.transport.disconnect(&link).await {
            warn!("Failed to tear down stale link to {}: {}", device, e);
        }
        ConnectOutcome::Cancelled
    }

    fn fail_connect(
        &self,
        device: DeviceIdentity,
        generation: u64,
        error: TransportError,
    ) -> ConnectOutcome {
        let mut inner = self.lock_inner();
        if inner.generation != generation || self.is_disposed() {
            return ConnectOutcome::Cancelled;
        }

        self.metrics.record_failure();
        inner.attempt = inner.attempt.saturating_add(1);
        let attempt = inner.attempt;
        let next_retry_at = self
            .config
            .backoff
            .next_retry_at(self.clock.now(), attempt);

        warn!(
            device = %device.id,
            attempt,
            "Connect attempt failed: {}; retrying in {:?}",
            error,
            self.clock.until(next_retry_at)
        );
        self.events.send(SessionEvent::AttemptFailed {
            device: device.clone(),
            attempt,
            error: error.to_string(),
        });
        self.transition(ConnectionState::Reconnecting {
            device,
            attempt,
            next_retry_at,
        });

        ConnectOutcome::Failed {
            attempt,
            next_retry_at,
        }
    }

    fn spawn_link_monitor(&self, generation: u64, mut events: LinkEventReceiver) -> JoinHandle<()> {
        let session = self.weak_self.clone();
        tokio::spawn(async move {
            loop {
                let event = events.recv().await;
                let Some(session) = session.upgrade() else {
                    break;
                };
                match event {
                    Some(TransportEvent::Connected) => {
                        trace!("Transport confirmed link");
                    }
                    Some(TransportEvent::Disconnected(reason)) => {
                        session.link_lost(generation, reason);
                        break;
                    }
                    None => {
                        session.link_lost(
                            generation,
                            DisconnectReason::LinkLost("event stream closed".to_string()),
                        );
                        break;
                    }
                }
            }
        })
    }

    /// Apply a link event pushed directly by a transport.
    ///
    /// Equivalent to the event arriving on the link's own stream.
    pub fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => trace!("Transport confirmed link"),
            TransportEvent::Disconnected(reason) => {
                let generation = self.lock_inner().generation;
                self.link_lost(generation, reason);
            }
        }
    }

    fn link_lost(&self, generation: u64, reason: DisconnectReason) {
        let mut inner = self.lock_inner();
        if inner.generation != generation {
            return;
        }
        let ConnectionState::Connected { device, .. } = self.state() else {
            return;
        };

        inner.supersede();
        inner.link = None;
        if let Some(monitor) = inner.monitor.take() {
            monitor.abort();
        }
        inner.attempt = 1;
        self.metrics.record_link_lost();

        let next_retry_at = self.config.backoff.next_retry_at(self.clock.now(), 1);
        warn!(device = %device.id, "Link lost: {}", reason);
        self.events.send(SessionEvent::LinkLost {
            device: device.clone(),
            reason,
        });
        self.transition(ConnectionState::Reconnecting {
            device,
            attempt: 1,
            next_retry_at,
        });
    }

    /// Go to `Disconnected` from any state.
    ///
    /// Cancels the in-flight attempt, stops link monitoring and tears down
    /// the link. Calling it while already disconnected is a no-op.
    pub async fn disconnect(&self) {
        let link = self.teardown();
        if let Some(link) = link {
            match timeout(self.config.connect_timeout, self.transport.disconnect(&link)).await {
                Ok(Ok(())) => debug!("Link {} closed", link.link_id()),
                Ok(Err(e)) => warn!("Transport disconnect failed: {}", e),
                Err(_) => warn!("Transport disconnect timed out"),
            }
        }
    }

    fn teardown(&self) -> Option<TransportLink> {
        let mut inner = self.lock_inner();
        inner.supersede();
        inner.attempt = 0;
        if let Some(monitor) = inner.monitor.take() {
            monitor.abort();
        }
        let link = inner.link.take();
        self.transition(ConnectionState::Disconnected);
        link
    }

    /// Abandon a `Connecting` attempt without touching an established link.
    ///
    /// Returns whether an attempt was cancelled.
    pub(crate) fn cancel_attempt(&self) -> bool {
        let mut inner = self.lock_inner();
        if !self.state().is_connecting() {
            return false;
        }
        inner.supersede();
        self.transition(ConnectionState::Disconnected);
        true
    }

    /// Bind a device, dropping the link to a previously bound one.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyBound`] when another device is bound and `rebind` is
    /// false, or a persistence error; the binding is unchanged in both cases.
    #[instrument(level = "info", skip_all, fields(device = %identity.id, rebind = rebind))]
    pub async fn bind(&self, identity: DeviceIdentity, rebind: bool) -> Result<BoundDevice> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        self.registry.bind(identity, rebind).await
    }

    /// Forget the bound device and disconnect.
    ///
    /// This is the only way to stop reconnection permanently. Unbinding with
    /// nothing bound returns `Ok(None)`.
    #[instrument(level = "info", skip_all)]
    pub async fn unbind(&self) -> Result<Option<BoundDevice>> {
        let previous = self.registry.unbind().await?;
        self.disconnect().await;
        Ok(previous)
    }

    /// Disconnect and close the observable.
    ///
    /// Subscriptions become inert; cancelling them afterwards is still safe.
    /// Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Disposing connection session");
        self.disconnect().await;
        self.observable.close();
    }

    /// Apply a transition. Callers hold the inner lock.
    fn transition(&self, next: ConnectionState) -> bool {
        let from = self.observable.current();
        if from == next {
            return false;
        }
        if !from.can_transition_to(&next) {
            warn!(from = %from.kind(), to = %next.kind(), "Ignoring illegal state transition");
            return false;
        }

        info!(
            from = %from.kind(),
            to = %next.kind(),
            device = next.device().or(from.device()).map(|d| d.id.as_str()).unwrap_or("-"),
            "Connection state changed"
        );
        self.observable.publish(next.clone());
        self.events.send(SessionEvent::StateChanged { from, to: next });
        true
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BindingObserver for ConnectionSession {
    async fn binding_changed(&self, bound: Option<&BoundDevice>) {
        let stale = self
            .state()
            .device()
            .is_some_and(|device| !bound.is_some_and(|b| b.device.same_device(device)));
        if stale {
            debug!("Binding changed; dropping session for previous device");
            self.disconnect().await;
        }
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        let transport = Arc::clone(&self.transport);
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        inner.cancel.cancel();
        if let Some(monitor) = inner.monitor.take() {
            monitor.abort();
        }

        // Sessions should be disposed; release a link left behind anyway.
        let Some(link) = inner.link.take() else {
            return;
        };
        warn!(
            "Connection session dropped without dispose(); releasing link to {}",
            link.device_id()
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = transport.disconnect(&link).await {
                        warn!("Failed to release link {}: {}", link.link_id(), e);
                    }
                });
            }
            Err(_) => warn!("No runtime to release link {}", link.link_id()),
        }
    }
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("state", &self.state())
            .field("registry", &self.registry)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Reverts a `Connecting` state if the attempt future is dropped mid-flight.
struct AttemptGuard<'a> {
    session: &'a ConnectionSession,
    generation: u64,
    armed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.session.lock_inner();
        if inner.generation == self.generation && self.session.state().is_connecting() {
            debug!("Connect attempt dropped mid-flight");
            inner.supersede();
            self.session.transition(ConnectionState::Disconnected);
        }
    }
}
