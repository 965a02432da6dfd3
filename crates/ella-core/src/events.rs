//! Session event system for discovery, binding and connection notifications.
//!
//! Selector-based observation lives in [`crate::observable`]; this module is
//! the coarse-grained broadcast feed that logging, persistence and
//! background consumers (such as an audio-capture pipeline) can tail.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use ella_types::{ConnectionState, DeviceIdentity, DisconnectReason};

/// Events emitted by the registry and the session.
///
/// All events are serializable for logging, persistence, and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SessionEvent {
    /// A device was seen by a scan.
    Discovered { device: DeviceIdentity },
    /// A device was bound as the user's device.
    Bound { device: DeviceIdentity, rebind: bool },
    /// The bound device was cleared.
    Unbound { device: DeviceIdentity },
    /// The session moved between states.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A connect attempt failed and will be retried.
    AttemptFailed {
        device: DeviceIdentity,
        attempt: u32,
        error: String,
    },
    /// A live link dropped without being asked to.
    LinkLost {
        device: DeviceIdentity,
        reason: DisconnectReason,
    },
}

/// Sender for session events.
pub type EventSender = broadcast::Sender<SessionEvent>;

/// Receiver for session events.
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: SessionEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the sender for direct use.
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatcher_fans_out() {
        let events = EventDispatcher::new(8);
        let mut a = events.subscribe();
        let mut b = events.subscribe();
        assert_eq!(events.receiver_count(), 2);

        let device = DeviceIdentity::new("AA:BB", "Ella");
        events.send(SessionEvent::Discovered {
            device: device.clone(),
        });

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                SessionEvent::Discovered { device: seen } => assert_eq!(seen, device),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_send_without_receivers_is_silent() {
        let events = EventDispatcher::default();
        events.send(SessionEvent::Unbound {
            device: DeviceIdentity::new("AA:BB", "Ella"),
        });
        assert_eq!(events.receiver_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::AttemptFailed {
            device: DeviceIdentity::new("AA:BB", "Ella"),
            attempt: 3,
            error: "device out of range".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"attempt_failed\""));
        assert!(json.contains("\"attempt\":3"));
    }
}
