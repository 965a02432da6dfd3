//! Read-only, selector-filtered view of the session's connection state.
//!
//! Observers register a selector that projects the state onto the value they
//! care about (for example `ConnectionState::is_connected`) and are called
//! only when that projection changes. A status badge bound to `is_connected`
//! therefore ignores the attempt counter ticking up while reconnecting.
//!
//! Callbacks run synchronously on the publishing task, in transition order.
//! They may read [`ObservableConnectionState::current`], subscribe, or cancel
//! subscriptions (including their own). They must not issue session commands
//! directly; spawn a task for that.
//!
//! # Example
//!
//! ```ignore
//! let observable = session.observe();
//! let badge = observable.subscribe(ConnectionState::is_connected, |connected| {
//!     println!("connected: {connected}");
//! });
//! // ...
//! badge.cancel();
//! ```

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use futures::StreamExt;
use futures::channel::mpsc;
use tracing::trace;

use ella_types::ConnectionState;

type Callback = Box<dyn FnMut(&ConnectionState) + Send>;

struct Subscriber {
    id: u64,
    active: AtomicBool,
    callback: Mutex<Callback>,
}

impl Subscriber {
    fn deliver(&self, state: &ConnectionState) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let mut callback = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        (&mut **callback)(state);
    }
}

struct Shared {
    current: RwLock<ConnectionState>,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    /// Serializes publishers so callbacks see transitions in order.
    dispatch: Mutex<()>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn subscribers(&self) -> MutexGuard<'_, Vec<Arc<Subscriber>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: u64) {
        self.subscribers().retain(|s| s.id != id);
    }
}

/// Shared handle to the current connection state.
///
/// Cloning is cheap; all clones observe the same session.
#[derive(Clone)]
pub struct ObservableConnectionState {
    shared: Arc<Shared>,
}

impl ObservableConnectionState {
    /// Create an observable starting at `initial`.
    pub(crate) fn new(initial: ConnectionState) -> Self {
        Self {
            shared: Arc::new(Shared {
                current: RwLock::new(initial),
                subscribers: Mutex::new(Vec::new()),
                dispatch: Mutex::new(()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Snapshot of the most recently published state.
    pub fn current(&self) -> ConnectionState {
        self.shared
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Call `on_change` whenever `selector`'s projection of the state changes.
    ///
    /// The projection of the state at subscription time is the baseline; it
    /// is not delivered. Subscribing to a closed observable returns an inert
    /// subscription.
    pub fn subscribe<T, S, F>(&self, selector: S, mut on_change: F) -> Subscription
    where
        T: PartialEq + Clone + Send + 'static,
        S: Fn(&ConnectionState) -> T + Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        if self.is_closed() {
            return Subscription::inert();
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.shared.subscribers();

        // Baseline and registration happen under the list lock so a
        // concurrent publish is either fully seen or fully missed.
        let mut last = selector(&self.current());
        let callback: Callback = Box::new(move |state| {
            let next = selector(state);
            if next != last {
                last = next.clone();
                on_change(next);
            }
        });

        let subscriber = Arc::new(Subscriber {
            id,
            active: AtomicBool::new(true),
            callback: Mutex::new(callback),
        });
        subscribers.push(Arc::clone(&subscriber));
        trace!(subscription = id, "Subscribed to connection state");

        Subscription {
            shared: Arc::downgrade(&self.shared),
            subscriber: Some(subscriber),
        }
    }

    /// Call `on_change` with every new state.
    pub fn subscribe_all<F>(&self, on_change: F) -> Subscription
    where
        F: FnMut(ConnectionState) + Send + 'static,
    {
        self.subscribe(ConnectionState::clone, on_change)
    }

    /// Projected changes as an async stream.
    ///
    /// The stream ends when the observable is closed.
    pub fn stream<T, S>(&self, selector: S) -> StateStream<T>
    where
        T: PartialEq + Clone + Send + 'static,
        S: Fn(&ConnectionState) -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded();
        let subscription = self.subscribe(selector, move |value| {
            let _ = tx.unbounded_send(value);
        });
        StateStream {
            rx,
            _subscription: subscription,
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers().len()
    }

    /// Whether the owning session has been disposed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Replace the current state and notify subscribers.
    pub(crate) fn publish(&self, next: ConnectionState) {
        if self.is_closed() {
            return;
        }

        let _dispatch = self
            .shared
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let snapshot: Vec<Arc<Subscriber>> = {
            let subscribers = self.shared.subscribers();
            *self
                .shared
                .current
                .write()
                .unwrap_or_else(PoisonError::into_inner) = next.clone();
            subscribers.clone()
        };

        for subscriber in snapshot {
            subscriber.deliver(&next);
        }
    }

    /// Drop every subscriber and refuse new ones.
    pub(crate) fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<_> = self.shared.subscribers().drain(..).collect();
        for subscriber in &drained {
            subscriber.active.store(false, Ordering::Release);
            // Release captured state (stream senders in particular) even if
            // a handle to the subscriber outlives the observable.
            *subscriber
                .callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Box::new(|_: &ConnectionState| {});
        }
        trace!(dropped = drained.len(), "Closed connection state observable");
    }
}

impl fmt::Debug for ObservableConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableConnectionState")
            .field("current", &self.current())
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handle to one registered observer.
///
/// Dropping the handle cancels the subscription; use
/// [`Subscription::detach`] to keep the callback for the observable's
/// lifetime.
#[must_use = "dropping a Subscription cancels it"]
pub struct Subscription {
    shared: Weak<Shared>,
    subscriber: Option<Arc<Subscriber>>,
}

impl Subscription {
    fn inert() -> Self {
        Self {
            shared: Weak::new(),
            subscriber: None,
        }
    }

    /// Stop receiving changes.
    ///
    /// Safe to call repeatedly and after the session has been disposed.
    pub fn cancel(&self) {
        let Some(subscriber) = &self.subscriber else {
            return;
        };
        if !subscriber.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(subscriber.id);
        }
        trace!(subscription = subscriber.id, "Cancelled subscription");
    }

    /// Keep the callback registered after this handle is dropped.
    pub fn detach(mut self) {
        self.subscriber = None;
    }

    /// Whether the callback can still fire.
    pub fn is_active(&self) -> bool {
        let Some(subscriber) = &self.subscriber else {
            return false;
        };
        subscriber.active.load(Ordering::Acquire)
            && self
                .shared
                .upgrade()
                .is_some_and(|s| !s.closed.load(Ordering::Acquire))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.subscriber.as_ref().map(|s| s.id))
            .field("active", &self.is_active())
            .finish()
    }
}

/// Stream of projected state changes, see [`ObservableConnectionState::stream`].
pub struct StateStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
    _subscription: Subscription,
}

impl<T> Stream for StateStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ella_types::DeviceIdentity;
    use time::macros::datetime;

    fn device() -> DeviceIdentity {
        DeviceIdentity::seen_at("AA:01", "Pendant", datetime!(2026-03-01 12:00 UTC))
    }

    fn connected() -> ConnectionState {
        ConnectionState::Connected {
            device: device(),
            connected_at: datetime!(2026-03-01 12:00 UTC),
        }
    }

    fn reconnecting(attempt: u32) -> ConnectionState {
        ConnectionState::Reconnecting {
            device: device(),
            attempt,
            next_retry_at: datetime!(2026-03-01 12:05 UTC),
        }
    }

    fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl FnMut(T) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |value| sink.lock().unwrap().push(value))
    }

    #[test]
    fn test_current_reflects_publish() {
        let observable = ObservableConnectionState::new(ConnectionState::Disconnected);
        assert!(observable.current().is_disconnected());

        observable.publish(connected());
        assert!(observable.current().is_connected());
    }

    #[test]
    fn test_selector_filters_unchanged_projection() {
        let observable = ObservableConnectionState::new(connected());
        let (seen, on_change) = recorder();
        let _sub = observable.subscribe(ConnectionState::is_connected, on_change);

        observable.publish(reconnecting(1));
        observable.publish(reconnecting(2));
        observable.publish(reconnecting(3));
        observable.publish(connected());

        assert_eq!(*seen.lock().unwrap(), vec![false, true]);
    }

    #[test]
    fn test_subscribe_all_sees_every_transition_in_order() {
        let observable = ObservableConnectionState::new(ConnectionState::Disconnected);
        let (seen, on_change) = recorder();
        let _sub = observable.subscribe_all(on_change);

        observable.publish(connected());
        observable.publish(reconnecting(1));
        observable.publish(reconnecting(2));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen[0].is_connected());
        assert_eq!(seen[1].attempt(), 1);
        assert_eq!(seen[2].attempt(), 2);
    }

    #[test]
    fn test_cancel_is_idempotent_and_stops_delivery() {
        let observable = ObservableConnectionState::new(ConnectionState::Disconnected);
        let (seen, on_change) = recorder();
        let sub = observable.subscribe_all(on_change);
        assert!(sub.is_active());
        assert_eq!(observable.subscriber_count(), 1);

        sub.cancel();
        sub.cancel();
        assert!(!sub.is_active());
        assert_eq!(observable.subscriber_count(), 0);

        observable.publish(connected());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_drop_cancels_and_detach_keeps() {
        let observable = ObservableConnectionState::new(ConnectionState::Disconnected);

        drop(observable.subscribe_all(|_| {}));
        assert_eq!(observable.subscriber_count(), 0);

        let (seen, on_change) = recorder();
        observable.subscribe_all(on_change).detach();
        assert_eq!(observable.subscriber_count(), 1);

        observable.publish(connected());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_cancel_after_close_is_safe() {
        let observable = ObservableConnectionState::new(ConnectionState::Disconnected);
        let sub = observable.subscribe_all(|_| {});

        observable.close();
        assert!(observable.is_closed());
        assert!(!sub.is_active());
        sub.cancel();
        sub.cancel();
        drop(sub);

        let late = observable.subscribe_all(|_| {});
        assert!(!late.is_active());
        assert_eq!(observable.subscriber_count(), 0);
    }

    #[test]
    fn test_cancel_after_observable_dropped_is_safe() {
        let observable = ObservableConnectionState::new(ConnectionState::Disconnected);
        let sub = observable.subscribe_all(|_| {});
        drop(observable);
        sub.cancel();
        assert!(!sub.is_active());
    }

    #[test]
    fn test_callback_can_read_current_and_cancel_others() {
        let observable = ObservableConnectionState::new(ConnectionState::Disconnected);

        let (seen_other, on_other) = recorder();
        let other = Arc::new(Mutex::new(Some(observable.subscribe_all(on_other))));

        let reader = observable.clone();
        let victim = Arc::clone(&other);
        let (seen_current, mut on_current) = recorder();
        let _first = observable.subscribe_all(move |_state| {
            on_current(reader.current().kind());
            if let Some(sub) = victim.lock().unwrap().take() {
                sub.cancel();
            }
        });

        observable.publish(connected());
        observable.publish(reconnecting(1));

        assert_eq!(seen_current.lock().unwrap().len(), 2);
        assert_eq!(seen_current.lock().unwrap()[0], ella_types::StateKind::Connected);
        assert_eq!(seen_other.lock().unwrap().len(), 1);
        assert_eq!(observable.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_stream_yields_projected_changes() {
        let observable = ObservableConnectionState::new(ConnectionState::Disconnected);
        let mut kinds = observable.stream(ConnectionState::kind);

        observable.publish(connected());
        observable.publish(reconnecting(1));
        observable.publish(reconnecting(2));
        observable.close();

        let collected: Vec<_> = (&mut kinds).collect().await;
        assert_eq!(
            collected,
            vec![
                ella_types::StateKind::Connected,
                ella_types::StateKind::Reconnecting
            ]
        );
    }
}
