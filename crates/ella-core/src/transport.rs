//! Transport abstraction for device links.
//!
//! The session depends only on this narrow contract: dial a device, get back
//! a link with an event stream, hang up. Service discovery, MTU negotiation
//! and characteristic I/O stay behind the implementation.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use ella_types::{DeviceIdentity, DisconnectReason};

use crate::error::TransportError;

/// Link-level notifications from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The link reported itself up (some stacks confirm asynchronously).
    Connected,
    /// The link went down.
    Disconnected(DisconnectReason),
}

/// Sender half of a link's event stream, held by the transport.
pub type LinkEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiver half of a link's event stream, drained by the session.
pub type LinkEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// A live link to one device.
pub struct TransportLink {
    device_id: String,
    link_id: u64,
    events: Option<LinkEventReceiver>,
}

impl TransportLink {
    /// Create a link with its event stream.
    pub fn new(device_id: impl Into<String>, link_id: u64, events: LinkEventReceiver) -> Self {
        Self {
            device_id: device_id.into(),
            link_id,
            events: Some(events),
        }
    }

    /// Create a link and the sender the transport keeps for it.
    pub fn channel(device_id: impl Into<String>, link_id: u64) -> (Self, LinkEventSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(device_id, link_id, rx), tx)
    }

    /// Identifier of the linked device.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Transport-assigned link number, unique per transport.
    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Take the event stream. Returns `None` once taken.
    pub fn take_events(&mut self) -> Option<LinkEventReceiver> {
        self.events.take()
    }
}

impl fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLink")
            .field("device_id", &self.device_id)
            .field("link_id", &self.link_id)
            .field("events_taken", &self.events.is_none())
            .finish()
    }
}

/// Trait abstracting the link layer to a wearable.
///
/// Implementations must be safe to call from several tasks; the session
/// guarantees that at most one `connect` runs at a time per bound device.
///
/// # Example
///
/// ```ignore
/// use ella_core::{Transport, TransportLink, TransportError};
///
/// struct Loopback;
///
/// #[async_trait::async_trait]
/// impl Transport for Loopback {
///     async fn connect(&self, device: &DeviceIdentity) -> Result<TransportLink, TransportError> {
///         let (link, _tx) = TransportLink::channel(&device.id, 1);
///         Ok(link)
///     }
///
///     async fn disconnect(&self, _link: &TransportLink) -> Result<(), TransportError> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a link to `device`.
    async fn connect(&self, device: &DeviceIdentity) -> Result<TransportLink, TransportError>;

    /// Tear down `link`. Tearing down an already-dead link is not an error.
    async fn disconnect(&self, link: &TransportLink) -> Result<(), TransportError>;
}
