//! Error types for ella-core.
//!
//! Most failures inside a device session never reach the caller: transport
//! rejections and timeouts are absorbed by [`crate::ConnectionSession`] and
//! turned into `Reconnecting` states. The errors below are what remains
//! visible at the API boundary, plus the building blocks the session uses
//! internally.
//!
//! # Error Recovery Strategies
//!
//! | Error Type | Who handles it | Strategy |
//! |------------|----------------|----------|
//! | [`Error::Timeout`] | Session / scheduler | Back off and retry on a later tick |
//! | [`Error::Transport`] | Session / scheduler | Back off and retry on a later tick |
//! | [`Error::AlreadyBound`] | Caller | Ask the user, then bind with `rebind = true` |
//! | [`Error::Preferences`] | Caller | Surface; the binding was not changed |
//! | [`Error::InvalidConfig`] | Caller | Fix configuration and restart |
//! | [`Error::Cancelled`] | Nobody | Intentional; stop quietly |
//! | [`Error::Disposed`] | Caller | Session was shut down; create a new one |
//!
//! ## Recommended Timeouts
//!
//! | Operation | Default | Notes |
//! |-----------|---------|-------|
//! | Mutex acquire | 10 seconds | A timeout means another attempt is running |
//! | Transport connect | 10 seconds | Includes link establishment on the BLE stack |
//! | Preferences write | 5 seconds | Local storage; should complete in milliseconds |

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while managing a device session.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// The transport rejected or failed a connection attempt.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A different device is already bound and no rebind was requested.
    #[error("Device '{bound}' is already bound; rebind required to bind '{requested}'")]
    AlreadyBound {
        /// Identifier of the currently bound device.
        bound: String,
        /// Identifier the caller tried to bind.
        requested: String,
    },

    /// The preferences store failed to save, load or clear the binding.
    #[error("Preferences store error: {0}")]
    Preferences(String),

    /// Invalid device identifier.
    #[error("Invalid device identity: {0}")]
    InvalidIdentity(#[from] ella_types::ParseError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// The session has been disposed.
    #[error("Session disposed")]
    Disposed,
}

/// Failures reported by a transport when dialling a device.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// Bluetooth adapter not available or powered off.
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,
    /// Device is out of range.
    #[error("device out of range")]
    OutOfRange,
    /// Device rejected the connection.
    #[error("connection rejected by device")]
    Rejected,
    /// Link establishment timed out inside the transport.
    #[error("connection timed out")]
    Timeout,
    /// The device could not be found by the transport.
    #[error("device '{0}' not found")]
    NotFound(String),
    /// Generic BLE stack error.
    #[error("BLE error: {0}")]
    Ble(String),
    /// Other/unknown error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a preferences error.
    pub fn preferences(message: impl Into<String>) -> Self {
        Self::Preferences(message.into())
    }

    /// Whether the failure is transient and worth another attempt later.
    ///
    /// Timeouts and transport failures are retryable; binding conflicts,
    /// configuration problems and cancellation are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Io(_) => true,
            Self::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl TransportError {
    /// Whether the transport failure may clear up on its own.
    ///
    /// Everything except a missing adapter is treated as transient: the
    /// wearable may come back into range or finish rebooting.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AdapterUnavailable)
    }
}

/// Result type alias using ella-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::timeout("acquire connection mutex", Duration::from_secs(10));
        assert!(err.to_string().contains("acquire connection mutex"));
        assert!(err.to_string().contains("10s"));

        let err = Error::AlreadyBound {
            bound: "AA:BB".to_string(),
            requested: "CC:DD".to_string(),
        };
        assert!(err.to_string().contains("AA:BB"));
        assert!(err.to_string().contains("CC:DD"));

        let err = Error::Transport(TransportError::OutOfRange);
        assert_eq!(err.to_string(), "Transport error: device out of range");

        assert_eq!(Error::Cancelled.to_string(), "Operation cancelled");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::timeout("connect", Duration::from_secs(1)).is_retryable());
        assert!(Error::Transport(TransportError::Rejected).is_retryable());
        assert!(!Error::Transport(TransportError::AdapterUnavailable).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::invalid_config("bad").is_retryable());
        assert!(
            !Error::AlreadyBound {
                bound: "a".into(),
                requested: "b".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_parse_error_conversion() {
        let parse = ella_types::DeviceIdentity::parse_id("").unwrap_err();
        let err: Error = parse.into();
        assert!(matches!(err, Error::InvalidIdentity(_)));
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }
}
