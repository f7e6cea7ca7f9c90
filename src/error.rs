//! Error types for the MQTT link.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use mqtt_link::{Client, QoS, Result};
//!
//! async fn example(client: &Client) -> Result<()> {
//!     client.subscribe("sensors/#", QoS::AtLeastOnce).await?;
//!     client.publish("sensors/t1", "21.5", QoS::AtLeastOnce, false).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::InvalidArgument`], [`Error::InvalidState`] |
//! | Connection | [`Error::ConnectionLost`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`], [`Error::NotConnected`], [`Error::ConnectRefused`] |
//! | Protocol | [`Error::Decode`], [`Error::Encode`], [`Error::UnexpectedAck`], [`Error::Protocol`] |
//! | Request | [`Error::RequestFailed`], [`Error::RequestTimeout`], [`Error::TokenInUse`], [`Error::TooManyInflight`], [`Error::PacketIdsExhausted`], [`Error::SubscribeRejected`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::Url`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::identifiers::TokenKey;
use crate::protocol::{ConnectReturnCode, PacketType};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when client or connect options are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Invalid argument to a command.
    ///
    /// Returned for malformed topics, client identifiers and the like.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// Operation not allowed in the current state.
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Description of the state conflict.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// The connection failed or was lost.
    ///
    /// Carries the underlying I/O error when one exists.
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// Description of what failed.
        reason: String,
        /// Underlying I/O failure.
        #[source]
        source: Option<IoError>,
    },

    /// Connection timeout waiting for the broker.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection closed while a request was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No open connection to queue against.
    #[error("Not connected")]
    NotConnected,

    /// Broker refused the CONNECT.
    #[error("Connection refused: {code}")]
    ConnectRefused {
        /// Return code from CONNACK.
        code: ConnectReturnCode,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Inbound bytes are not a valid packet.
    ///
    /// Fatal to the connection: the byte stream has diverged.
    #[error("Decode error: {message}")]
    Decode {
        /// Description of the malformed input.
        message: String,
    },

    /// An outbound packet could not be encoded.
    #[error("Encode error: {message}")]
    Encode {
        /// Description of the malformed packet.
        message: String,
    },

    /// An acknowledgement arrived with no request to match.
    ///
    /// Fatal for every acknowledgement type except PUBACK, PUBREC and
    /// PUBCOMP, which are tolerated as redeliveries.
    #[error("Unexpected {packet_type:?} for {key}")]
    UnexpectedAck {
        /// Type of the orphaned acknowledgement.
        packet_type: PacketType,
        /// Correlation key it carried.
        key: TokenKey,
    },

    /// Protocol violation by the broker.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Request Errors
    // ========================================================================
    /// Request was failed before its acknowledgement arrived.
    #[error("Request {key} failed: {reason}")]
    RequestFailed {
        /// Correlation key of the failed request.
        key: TokenKey,
        /// Why the request was failed.
        reason: String,
    },

    /// Waiting for an acknowledgement timed out.
    #[error("Request {key} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Correlation key of the request.
        key: TokenKey,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// A request with the same correlation key is already outstanding.
    #[error("Token already in use: {key}")]
    TokenInUse {
        /// The conflicting key.
        key: TokenKey,
    },

    /// Too many unacknowledged publishes.
    #[error("Too many in-flight messages: {inflight}/{max}")]
    TooManyInflight {
        /// Currently outstanding requests.
        inflight: usize,
        /// Configured limit.
        max: usize,
    },

    /// All 65535 packet identifiers are in use.
    #[error("No packet identifier available")]
    PacketIdsExhausted,

    /// Broker rejected a subscription.
    #[error("Subscription rejected: {topic}")]
    SubscribeRejected {
        /// The rejected topic filter.
        topic: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server URI parse error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    #[inline]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a connection lost error without an I/O cause.
    #[inline]
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
            source: None,
        }
    }

    /// Creates a connection lost error caused by an I/O failure.
    #[inline]
    pub fn connection_lost_io(reason: impl Into<String>, source: IoError) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a connect refused error.
    #[inline]
    pub fn connect_refused(code: ConnectReturnCode) -> Self {
        Self::ConnectRefused { code }
    }

    /// Creates a decode error.
    #[inline]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates an encode error.
    #[inline]
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }

    /// Creates an unexpected acknowledgement error.
    #[inline]
    pub fn unexpected_ack(packet_type: PacketType, key: TokenKey) -> Self {
        Self::UnexpectedAck { packet_type, key }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a request failed error.
    #[inline]
    pub fn request_failed(key: TokenKey, reason: impl Into<String>) -> Self {
        Self::RequestFailed {
            key,
            reason: reason.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(key: TokenKey, timeout_ms: u64) -> Self {
        Self::RequestTimeout { key, timeout_ms }
    }

    /// Creates a subscribe rejected error.
    #[inline]
    pub fn subscribe_rejected(topic: impl Into<String>) -> Self {
        Self::SubscribeRejected {
            topic: topic.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::RequestTimeout { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::NotConnected
                | Self::ConnectRefused { .. }
                | Self::Io(_)
        )
    }

    /// Returns `true` if this error tears the connection down when raised
    /// by the event loop.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Decode { .. }
                | Self::Encode { .. }
                | Self::UnexpectedAck { .. }
                | Self::Protocol { .. }
                | Self::ConnectionLost { .. }
                | Self::ConnectRefused { .. }
                | Self::Io(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::error::Error as _;
    use std::io::ErrorKind;

    use crate::identifiers::PacketId;

    #[test]
    fn test_error_display() {
        let err = Error::connection_lost("keep-alive timeout");
        assert_eq!(err.to_string(), "Connection lost: keep-alive timeout");
    }

    #[test]
    fn test_unexpected_ack_display() {
        let err = Error::unexpected_ack(PacketType::SubAck, TokenKey::Packet(PacketId::MIN));
        assert_eq!(err.to_string(), "Unexpected SubAck for #1");
    }

    #[test]
    fn test_connection_lost_keeps_source() {
        let io_err = IoError::new(ErrorKind::ConnectionReset, "reset by peer");
        let err = Error::connection_lost_io("read failed", io_err);
        assert!(err.source().is_some());
        assert!(Error::connection_lost("eof").source().is_none());
    }

    #[test]
    fn test_is_timeout() {
        assert!(Error::connection_timeout(1000).is_timeout());
        assert!(Error::request_timeout(TokenKey::Ping, 10).is_timeout());
        assert!(!Error::ConnectionClosed.is_timeout());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::connection_lost("x").is_connection_error());
        assert!(Error::NotConnected.is_connection_error());
        assert!(Error::connect_refused(ConnectReturnCode::NotAuthorized).is_connection_error());
        assert!(!Error::decode("x").is_connection_error());
    }

    #[test]
    fn test_is_fatal() {
        assert!(Error::decode("bad header").is_fatal());
        assert!(Error::unexpected_ack(PacketType::ConnAck, TokenKey::Connect).is_fatal());
        assert!(!Error::request_timeout(TokenKey::Connect, 5).is_fatal());
        assert!(!Error::TooManyInflight { inflight: 10, max: 10 }.is_fatal());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
