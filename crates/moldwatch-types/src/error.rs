//! Error types for value parsing in moldwatch-types.

use thiserror::Error;

/// Errors that can occur when parsing identifiers, ranges and codes.
///
/// This error type is transport-agnostic; connection and query failures
/// belong in moldwatch-core.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// A device identifier was empty or whitespace-only.
    #[error("Invalid device identifier: {0:?}")]
    InvalidDeviceId(String),

    /// A relative range expression could not be parsed.
    #[error("Invalid range '{input}': {reason}")]
    InvalidRange {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Generic invalid value.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

impl ParseError {
    /// Create an invalid range error.
    pub fn invalid_range(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRange {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias using moldwatch-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
