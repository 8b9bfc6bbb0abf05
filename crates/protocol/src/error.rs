//! Error types for the protocol crate.

use thiserror::Error;

use crate::connection::ConnectionId;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    // Framing errors
    /// Malformed length prefix on the wire (negative or above the configured maximum).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An outbound message cannot be represented in a signed 32-bit length prefix.
    #[error("message too large: {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge {
        /// Encoded payload size.
        size: usize,
        /// Maximum representable size.
        max: usize,
    },

    /// A well-framed payload failed to decompress or decode.
    #[error("corrupt payload: {0}")]
    CorruptPayload(String),

    // Dispatch errors
    /// Classification token does not name a registered client type.
    #[error("unknown client type: {0}")]
    UnknownClientType(String),

    /// Operation needs a bound handler but the connection is still anonymous.
    #[error("connection {0} has not announced its client type")]
    NotClassified(ConnectionId),

    /// Send target is no longer registered.
    #[error("peer unavailable: {0}")]
    PeerUnavailable(ConnectionId),

    /// The peer's outbound channel is full; the frame was dropped.
    #[error("outbound channel full for {0}")]
    OutboundFull(ConnectionId),

    // Client errors
    /// The client's pending queue is at capacity; the new message was dropped.
    #[error("pending queue full: capacity {capacity} reached")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// Operation requires a live connection.
    #[error("not connected")]
    NotConnected,

    // Transport errors
    /// Failure reported by the underlying transport.
    #[error("transport failure: {0}")]
    TransportFailure(String),
}

impl ProtocolError {
    /// Returns `true` if the error must tear down the connection it occurred on.
    ///
    /// Everything else is scoped to a single message or a single send target.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::ProtocolViolation(_) | ProtocolError::TransportFailure(_)
        )
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::TransportFailure(err.to_string())
    }
}

impl From<lz4_flex::block::DecompressError> for ProtocolError {
    fn from(err: lz4_flex::block::DecompressError) -> Self {
        ProtocolError::CorruptPayload(format!("failed to decompress payload: {}", err))
    }
}

impl From<std::string::FromUtf8Error> for ProtocolError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        ProtocolError::CorruptPayload(format!("message is not valid UTF-8: {}", err))
    }
}
