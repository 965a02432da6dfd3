//! Core types for wearable identity and connection state.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{ParseError, ParseResult};

/// Maximum length of a device identifier.
///
/// MAC addresses are 17 characters and CoreBluetooth UUIDs are 36, so this
/// leaves room for transport-specific prefixes.
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// One physical wearable as seen by the transport.
///
/// Identities are immutable. A re-discovery produces a new value with a
/// fresh `last_seen_at` rather than mutating the old one.
///
/// # Examples
///
/// ```
/// use ella_types::DeviceIdentity;
///
/// let device = DeviceIdentity::new("AA:BB:CC:DD:EE:FF", "Ella Pendant");
/// assert_eq!(device.id, "AA:BB:CC:DD:EE:FF");
/// assert_eq!(device.name, "Ella Pendant");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceIdentity {
    /// Stable hardware identifier (MAC address or platform UUID).
    pub id: String,
    /// Display name advertised by the device.
    pub name: String,
    /// When the device was last seen by a scan.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub last_seen_at: OffsetDateTime,
}

impl DeviceIdentity {
    /// Create an identity seen right now.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::seen_at(id, name, OffsetDateTime::now_utc())
    }

    /// Create an identity with an explicit sighting time.
    pub fn seen_at(id: impl Into<String>, name: impl Into<String>, at: OffsetDateTime) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            last_seen_at: at,
        }
    }

    /// Validate and create an identity.
    ///
    /// Unlike [`DeviceIdentity::new`], this rejects identifiers that could
    /// never be dialled (empty, too long, containing whitespace).
    pub fn parse(id: &str, name: impl Into<String>) -> ParseResult<Self> {
        let id = Self::parse_id(id)?;
        Ok(Self::new(id, name))
    }

    /// Validate a raw device identifier, returning the trimmed form.
    ///
    /// # Examples
    ///
    /// ```
    /// use ella_types::DeviceIdentity;
    ///
    /// assert_eq!(DeviceIdentity::parse_id(" AA:BB ").unwrap(), "AA:BB");
    /// assert!(DeviceIdentity::parse_id("   ").is_err());
    /// assert!(DeviceIdentity::parse_id("AA BB").is_err());
    /// ```
    pub fn parse_id(raw: &str) -> ParseResult<String> {
        let id = raw.trim();
        if id.is_empty() {
            return Err(ParseError::EmptyIdentifier);
        }
        let len = id.chars().count();
        if len > MAX_IDENTIFIER_LEN {
            return Err(ParseError::IdentifierTooLong {
                max: MAX_IDENTIFIER_LEN,
                actual: len,
            });
        }
        if let Some(c) = id.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(ParseError::InvalidCharacter(c));
        }
        Ok(id.to_string())
    }

    /// Whether two identities refer to the same physical device.
    ///
    /// Only the hardware identifier is compared; names and sighting times
    /// may differ between discoveries.
    #[must_use]
    pub fn same_device(&self, other: &DeviceIdentity) -> bool {
        self.id == other.id
    }

    /// A copy of this identity re-sighted at `at`.
    #[must_use]
    pub fn resighted(&self, at: OffsetDateTime) -> Self {
        Self {
            last_seen_at: at,
            ..self.clone()
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{} ({})", self.name, self.id)
        }
    }
}

/// The user's persisted choice of "my device".
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BoundDevice {
    /// The bound wearable.
    pub device: DeviceIdentity,
    /// When the user paired it.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub bound_at: OffsetDateTime,
}

impl BoundDevice {
    /// Bind a device now.
    pub fn new(device: DeviceIdentity) -> Self {
        Self::bound_at(device, OffsetDateTime::now_utc())
    }

    /// Bind a device with an explicit timestamp.
    pub fn bound_at(device: DeviceIdentity, at: OffsetDateTime) -> Self {
        Self {
            device,
            bound_at: at,
        }
    }

    /// Hardware identifier of the bound device.
    pub fn id(&self) -> &str {
        &self.device.id
    }
}

/// Reason reported by the transport when a link goes down.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Disconnection requested locally.
    UserRequested,
    /// Device went out of range.
    OutOfRange,
    /// Supervision timeout on the link.
    Timeout,
    /// Device was powered off.
    DevicePoweredOff,
    /// Link dropped with a transport-specific description.
    LinkLost(String),
    /// Unknown reason.
    Unknown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserRequested => write!(f, "user requested"),
            Self::OutOfRange => write!(f, "out of range"),
            Self::Timeout => write!(f, "timeout"),
            Self::DevicePoweredOff => write!(f, "device powered off"),
            Self::LinkLost(msg) => write!(f, "link lost: {}", msg),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Lifecycle state of a device session.
///
/// Exactly one value is current per session. New values are produced only
/// by the session's transition functions; observers receive clones.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "state", rename_all = "snake_case"))]
pub enum ConnectionState {
    /// No link and no attempt in flight. Stable rest state.
    #[default]
    Disconnected,
    /// A connect attempt is in flight.
    Connecting {
        /// Device being dialled.
        device: DeviceIdentity,
        /// When the attempt began.
        #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
        attempt_started_at: OffsetDateTime,
    },
    /// The transport link is live.
    Connected {
        /// Connected device.
        device: DeviceIdentity,
        /// When the link came up.
        #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
        connected_at: OffsetDateTime,
    },
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting {
        /// Device being recovered.
        device: DeviceIdentity,
        /// Attempt number within the current outage (1-based).
        attempt: u32,
        /// Earliest time the next attempt may start.
        #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
        next_retry_at: OffsetDateTime,
    },
}

/// Fieldless discriminant of [`ConnectionState`].
///
/// Handy as a selector projection when observers only care about which
/// state the session is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StateKind {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

impl ConnectionState {
    /// The fieldless kind of this state.
    #[must_use]
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Disconnected => StateKind::Disconnected,
            Self::Connecting { .. } => StateKind::Connecting,
            Self::Connected { .. } => StateKind::Connected,
            Self::Reconnecting { .. } => StateKind::Reconnecting,
        }
    }

    /// Whether the link is live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Whether an attempt is in flight.
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. })
    }

    /// Whether the session is waiting to retry.
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        matches!(self, Self::Reconnecting { .. })
    }

    /// Whether the session is at rest.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// The device this state refers to, if any.
    #[must_use]
    pub fn device(&self) -> Option<&DeviceIdentity> {
        match self {
            Self::Disconnected => None,
            Self::Connecting { device, .. }
            | Self::Connected { device, .. }
            | Self::Reconnecting { device, .. } => Some(device),
        }
    }

    /// Outage attempt counter; zero outside `Reconnecting`.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        match self {
            Self::Reconnecting { attempt, .. } => *attempt,
            _ => 0,
        }
    }

    /// When the next retry is due, for `Reconnecting` states.
    #[must_use]
    pub fn next_retry_at(&self) -> Option<OffsetDateTime> {
        match self {
            Self::Reconnecting { next_retry_at, .. } => Some(*next_retry_at),
            _ => None,
        }
    }

    /// Whether `next` is a legal successor of this state.
    ///
    /// | From | To |
    /// |------|----|
    /// | `Disconnected` | `Connecting` |
    /// | `Connecting` | `Connected`, `Reconnecting` |
    /// | `Connected` | `Reconnecting` |
    /// | `Reconnecting` | `Connecting` |
    /// | any | `Disconnected` |
    #[must_use]
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting { .. })
                | (Reconnecting { .. }, Connecting { .. })
                | (Connecting { .. }, Connected { .. })
                | (Connecting { .. }, Reconnecting { .. })
                | (Connected { .. }, Reconnecting { .. })
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting { device, .. } => write!(f, "connecting to {}", device),
            Self::Connected { device, .. } => write!(f, "connected to {}", device),
            Self::Reconnecting {
                device, attempt, ..
            } => write!(f, "reconnecting to {} (attempt {})", device, attempt),
        }
    }
}
