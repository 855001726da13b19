//! Binary frame format.
//!
//! Every frame is a 4-byte big-endian length prefix followed by a message
//! body of exactly that many bytes (16 bytes header + payload):
//!
//! ```text
//! +----------+--------+---------+--------+----------------+-------------+
//! | length   | magic  | version | kind   | correlation_id | payload_len |
//! | 4 bytes  | 2 bytes| 1 byte  | 1 byte |    8 bytes     |   4 bytes   |
//! +----------+--------+---------+--------+----------------+-------------+
//! | payload                                                             |
//! | payload_len bytes                                                   |
//! +---------------------------------------------------------------------+
//! ```
//!
//! `payload_len` is a signed 32-bit integer and must lie in
//! `0..=MAX_PAYLOAD_SIZE`.

use crate::error::ProtocolError;
use crate::message::{Message, MessageKind};
use crate::{MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic number opening every message body.
pub const MAGIC: u16 = 0xCAFE;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the fixed message body header in bytes (2+1+1+8+4 = 16).
pub const BODY_HEADER_SIZE: usize = 16;

/// Largest body a length prefix may announce.
pub const MAX_FRAME_SIZE: usize = BODY_HEADER_SIZE + MAX_PAYLOAD_SIZE;

impl Message {
    /// Returns the number of bytes this message occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        LENGTH_PREFIX_SIZE + BODY_HEADER_SIZE + self.payload().len()
    }

    /// Encodes the message as a complete frame, length prefix included.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Appends the encoded frame to `dst`.
    ///
    /// Fails only when the payload exceeds [`MAX_PAYLOAD_SIZE`]; nothing is
    /// written in that case.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload = self.payload();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        dst.reserve(self.encoded_len());

        // Length prefix covers the body only
        dst.put_u32((BODY_HEADER_SIZE + payload.len()) as u32);

        dst.put_u16(MAGIC);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(self.kind().code());
        dst.put_u64(self.correlation_id());
        dst.put_i32(payload.len() as i32);
        dst.put_slice(payload);

        Ok(())
    }

    /// Decodes the next frame from `buf`.
    ///
    /// Returns `Ok(Some(message))` if a complete frame was decoded and
    /// consumed, `Ok(None)` if more data is needed, or `Err` on a protocol
    /// violation. Length bounds are checked as soon as the prefix is readable,
    /// so a hostile prefix never causes a large reservation.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if body_len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: body_len,
                max: MAX_FRAME_SIZE,
            });
        }
        if body_len < BODY_HEADER_SIZE {
            return Err(ProtocolError::FrameTooShort(body_len));
        }

        let total_len = LENGTH_PREFIX_SIZE + body_len;
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let body = buf.split_to(body_len).freeze();

        Self::decode_body(body).map(Some)
    }

    /// Decodes a message body (the bytes following the length prefix).
    pub fn decode_body(body: Bytes) -> Result<Self, ProtocolError> {
        if body.len() < BODY_HEADER_SIZE {
            return Err(ProtocolError::FrameTooShort(body.len()));
        }

        let mut header = &body[..BODY_HEADER_SIZE];

        let magic = header.get_u16();
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = header.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let kind = MessageKind::from_code(header.get_u8())?;
        let correlation_id = header.get_u64();

        let payload_len = header.get_i32();
        if payload_len < 0 || payload_len as usize > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::InvalidPayloadLength(payload_len));
        }

        let actual = body.len() - BODY_HEADER_SIZE;
        if payload_len as usize != actual {
            return Err(ProtocolError::LengthMismatch {
                declared: payload_len as usize,
                actual,
            });
        }

        Ok(Message::new(
            kind,
            correlation_id,
            body.slice(BODY_HEADER_SIZE..),
        ))
    }
}
