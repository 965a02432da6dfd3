//! Error types for identity parsing in ella-types.

use thiserror::Error;

/// Errors that can occur when validating device identity data.
///
/// This error type is transport-agnostic and does not include
/// connection errors (those belong in ella-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// The device identifier was empty or only whitespace.
    #[error("Device identifier is empty")]
    EmptyIdentifier,

    /// The device identifier exceeded the maximum length.
    #[error("Device identifier is {actual} characters long (maximum {max})")]
    IdentifierTooLong {
        /// Maximum permitted length.
        max: usize,
        /// Length of the rejected identifier.
        actual: usize,
    },

    /// The device identifier contained a character that is not permitted.
    #[error("Device identifier contains invalid character {0:?}")]
    InvalidCharacter(char),
}

/// Result type alias using ella-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
