//! Server error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] caferpc_protocol::ProtocolError),

    #[error("server shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ServerError {
    /// Returns whether the error came from bytes the peer sent.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, ServerError::Protocol(e) if e.is_fatal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caferpc_protocol::ProtocolError;

    #[test]
    fn test_protocol_violation() {
        let err = ServerError::from(ProtocolError::InvalidMagic(0xBEEF));
        assert!(err.is_protocol_violation());
        assert_eq!(
            err.to_string(),
            "protocol error: invalid magic: expected 0xcafe, got 0xbeef"
        );

        let err = ServerError::from(ProtocolError::PayloadTooLarge { size: 2, max: 1 });
        assert!(!err.is_protocol_violation());
        assert!(!ServerError::ShuttingDown.is_protocol_violation());
    }
}
