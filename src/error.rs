//! Error types for pipeproxy.

use thiserror::Error;

use crate::protocol::RemoteError;

/// Main error type for all proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error on one of the pipes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error while encoding an envelope.
    #[error("envelope encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error while decoding an envelope body.
    #[error("envelope decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Value (de)serialization error for call arguments or results.
    #[error("value error: {0}")]
    Value(#[from] serde_json::Error),

    /// Protocol violation: malformed envelope, unknown correlation id,
    /// reply with neither result nor exception. Distinct from clean
    /// stream closure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote invocation failed; carries the structured error the
    /// server side captured.
    #[error("remote error [{}]: {}", .0.kind, .0.message)]
    Remote(RemoteError),

    /// The other side closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Timed out waiting for the reply to a call.
    #[error("call timed out")]
    Timeout,

    /// Backpressure timeout - outbound queue stayed full.
    #[error("backpressure timeout")]
    BackpressureTimeout,
}

/// Result type alias using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;
