//! Shared types for the Ella wearable session controller.
//!
//! This crate holds the plain data that crosses component boundaries: who a
//! device is, which device the user has bound, and which lifecycle state a
//! session is in. It has no async runtime or transport dependencies so UI
//! layers can depend on it alone.
//!
//! # Example
//!
//! ```
//! use ella_types::{ConnectionState, DeviceIdentity, StateKind};
//!
//! let device = DeviceIdentity::new("AA:BB:CC:DD:EE:FF", "Ella Pendant");
//! let state = ConnectionState::Connected {
//!     device: device.clone(),
//!     connected_at: device.last_seen_at,
//! };
//! assert_eq!(state.kind(), StateKind::Connected);
//! assert!(state.can_transition_to(&ConnectionState::Disconnected));
//! ```

pub mod error;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use types::{
    BoundDevice, ConnectionState, DeviceIdentity, DisconnectReason, MAX_IDENTIFIER_LEN, StateKind,
};
