//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing or message decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic: expected 0xcafe, got {0:#06x}")]
    InvalidMagic(u16),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("invalid payload length: {0}")]
    InvalidPayloadLength(i32),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("payload length mismatch: declared {declared}, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether the byte stream can no longer be trusted.
    ///
    /// Every decode failure is fatal: there is no resynchronization point in
    /// a length-prefixed stream once a frame has been misread. Only
    /// `PayloadTooLarge`, raised while encoding, leaves the connection usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::PayloadTooLarge { .. })
    }
}
