//! Client error types.

use std::time::Duration;
use thiserror::Error;

/// Client errors.
///
/// Every failure of an individual call is delivered through that call's
/// [`CallHandle`](crate::CallHandle); none of them tears down the connection
/// except where noted on the variant.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server sent bytes that do not decode; the connection is closed.
    #[error("protocol error: {0}")]
    Protocol(#[from] caferpc_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connect timed out after {}ms", .0.as_millis())]
    ConnectTimeout(Duration),

    #[error("call {correlation_id} timed out after {}ms", after.as_millis())]
    Timeout {
        correlation_id: u64,
        after: Duration,
    },

    /// A newer call was registered under the same correlation id.
    #[error("call {0} superseded by a newer call with the same correlation id")]
    Superseded(u64),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("correlation id 0 is reserved for heartbeats")]
    ReservedId,

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::ConnectTimeout(_)
                | ClientError::Timeout { .. }
                | ClientError::ConnectionClosed
                | ClientError::SendFailed(_)
        )
    }
}
