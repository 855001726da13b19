//! # caferpc-protocol
//!
//! Wire protocol implementation for caferpc.
//!
//! This crate provides:
//! - The [`Message`] model and its four kinds
//! - Length-prefixed framing over a byte stream
//! - Fixed big-endian message body layout with magic/version validation
//! - A buffering [`Decoder`] that tolerates arbitrary fragmentation

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use error::ProtocolError;
pub use frame::{BODY_HEADER_SIZE, LENGTH_PREFIX_SIZE, MAGIC, MAX_FRAME_SIZE};
pub use message::{Message, MessageKind};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default port for the caferpc server.
pub const DEFAULT_PORT: u16 = 18080;

/// Maximum message payload size (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Correlation id carried by PING and PONG. Never assigned to a call.
pub const RESERVED_CORRELATION_ID: u64 = 0;
