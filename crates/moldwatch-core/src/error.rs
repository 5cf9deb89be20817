//! Error types for moldwatch-core.
//!
//! # Error Recovery Strategies
//!
//! | Error Type | Strategy | Surfaced to |
//! |------------|----------|-------------|
//! | [`Error::Connection`] | Automatic reconnect with backoff | Connection status only |
//! | [`Error::NotConnected`] | Wait for reconnect, registry re-subscribes | Caller of `send` |
//! | [`Error::Subscription`] | None, consumer decides | The acquiring consumer |
//! | [`Error::Normalization`] | Frame dropped and logged | Never reaches consumers |
//! | [`Error::Endpoint`] | Retried by the query facade | Folded into [`Error::Query`] |
//! | [`Error::Timeout`] | Retried like [`Error::Endpoint`] | Folded into [`Error::Query`] |
//! | [`Error::Query`] | Consumer may re-trigger | Caller of `fetch_range` |
//! | [`Error::Cancelled`] | Do not retry | Caller of a cancelled fetch |
//! | [`Error::InvalidConfig`] | Fix configuration | Constructor caller |
//! | [`Error::Parse`] | Fix the identifier or range | Caller of the parsing API |
//!
//! Range errors, including spans that overflow, arrive as [`Error::Parse`]
//! wrapping `ParseError::InvalidRange`.
//!
//! The enum is `Clone` so that a single coalesced history request can hand
//! the same outcome to every waiting consumer.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the telemetry core.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// The telemetry channel could not be opened or was lost.
    #[error("Connection failed: {reason}")]
    Connection {
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },

    /// A control message was sent while the channel is down.
    #[error("Not connected to telemetry channel")]
    NotConnected,

    /// A subscribe control message was rejected.
    #[error("Subscription for '{device_id}' rejected: {reason}")]
    Subscription {
        /// The device whose subscription failed.
        device_id: String,
        /// Why the subscription failed.
        reason: String,
    },

    /// An inbound frame or row could not be normalized.
    #[error("Normalization failed: {0}")]
    Normalization(#[from] NormalizationError),

    /// A single history endpoint call failed.
    #[error("History endpoint error: {0}")]
    Endpoint(String),

    /// A history fetch failed after all retry attempts.
    #[error("History query for '{device_id}' failed after {attempts} attempt(s): {reason}")]
    Query {
        /// The device whose history was requested.
        device_id: String,
        /// Number of attempts made.
        attempts: u32,
        /// The last underlying failure.
        reason: String,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An identifier or range could not be parsed.
    #[error(transparent)]
    Parse(#[from] moldwatch_types::ParseError),
}

/// Structured reasons for channel connection failures.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// The remote end refused the connection.
    Refused,
    /// The connection attempt timed out.
    Timeout,
    /// The link was closed by the remote end.
    Closed,
    /// The authentication handshake failed.
    Handshake(String),
    /// Transport-level error.
    Transport(String),
    /// Other/unknown error.
    Other(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Refused => write!(f, "connection refused"),
            Self::Timeout => write!(f, "connection timed out"),
            Self::Closed => write!(f, "connection closed by peer"),
            Self::Handshake(msg) => write!(f, "handshake failed: {}", msg),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Why an inbound frame or history row was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum NormalizationError {
    /// The payload was not valid JSON or not an object.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The message kind tag is missing or unknown.
    #[error("unknown message kind {0:?}")]
    UnknownKind(String),

    /// The device identifier is missing or blank.
    #[error("missing or invalid device identifier")]
    InvalidDeviceId,

    /// A required field is absent.
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    /// A field is present but cannot be interpreted.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// Name of the offending field.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
}

impl NormalizationError {
    /// Create an invalid field error.
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl Error {
    /// Create a connection failure with structured reason.
    pub fn connection(reason: ConnectionFailureReason) -> Self {
        Self::Connection { reason }
    }

    /// Create a transport connection failure from any displayable error.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Connection {
            reason: ConnectionFailureReason::Transport(err.to_string()),
        }
    }

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

    /// Create a subscription error.
    pub fn subscription(device_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Subscription {
            device_id: device_id.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias using moldwatch-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NotConnected;
        assert_eq!(err.to_string(), "Not connected to telemetry channel");

        let err = Error::connection(ConnectionFailureReason::Refused);
        assert_eq!(err.to_string(), "Connection failed: connection refused");

        let err = Error::Query {
            device_id: "m-1".to_string(),
            attempts: 3,
            reason: "HTTP 503".to_string(),
        };
        assert!(err.to_string().contains("m-1"));
        assert!(err.to_string().contains("3 attempt(s)"));

        let err = Error::timeout("connect", Duration::from_secs(10));
        assert!(err.to_string().contains("connect"));
        assert!(err.to_string().contains("10s"));
    }

    #[test]
    fn test_normalization_error_conversion() {
        let err: Error = NormalizationError::MissingField("timestamp").into();
        assert!(matches!(err, Error::Normalization(_)));
        assert!(err.to_string().contains("timestamp"));
    }

    #[test]
    fn test_parse_error_conversion() {
        let parse = "-1y".parse::<moldwatch_types::RelativeRange>().unwrap_err();
        let err: Error = parse.into();
        assert!(matches!(err, Error::Parse(_)));
        assert!(err.to_string().contains("-1y"));
    }

    #[test]
    fn test_error_is_clone() {
        let err = Error::subscription("m-2", "queue full");
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }
}
