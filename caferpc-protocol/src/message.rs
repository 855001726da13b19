//! Message model.

use crate::error::ProtocolError;
use crate::RESERVED_CORRELATION_ID;
use bytes::Bytes;
use std::fmt;

/// The four message kinds carried by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Keep-alive probe sent by the client.
    Ping,
    /// Answer to a PING.
    Pong,
    /// Call issued by the client.
    Request,
    /// Answer to a REQUEST, matched by correlation id.
    Response,
}

impl MessageKind {
    /// Returns the on-wire code for this kind.
    pub fn code(self) -> u8 {
        match self {
            MessageKind::Ping => 1,
            MessageKind::Pong => 2,
            MessageKind::Request => 3,
            MessageKind::Response => 4,
        }
    }

    /// Parses an on-wire kind code.
    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            1 => Ok(MessageKind::Ping),
            2 => Ok(MessageKind::Pong),
            3 => Ok(MessageKind::Request),
            4 => Ok(MessageKind::Response),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Ping => write!(f, "PING"),
            MessageKind::Pong => write!(f, "PONG"),
            MessageKind::Request => write!(f, "REQUEST"),
            MessageKind::Response => write!(f, "RESPONSE"),
        }
    }
}

/// One logical unit exchanged over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    correlation_id: u64,
    payload: Bytes,
}

impl Message {
    /// Creates a message from raw parts.
    ///
    /// Prefer the kind-specific constructors; this one is used by the decoder
    /// and does not enforce the PING/PONG conventions.
    pub fn new(kind: MessageKind, correlation_id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            correlation_id,
            payload: payload.into(),
        }
    }

    pub fn ping() -> Self {
        Self::new(MessageKind::Ping, RESERVED_CORRELATION_ID, Bytes::new())
    }

    pub fn pong() -> Self {
        Self::new(MessageKind::Pong, RESERVED_CORRELATION_ID, Bytes::new())
    }

    pub fn request(correlation_id: u64, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Request, correlation_id, payload)
    }

    pub fn response(correlation_id: u64, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Response, correlation_id, payload)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the message, returning its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
