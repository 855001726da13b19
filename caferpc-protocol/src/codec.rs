//! Encoder and decoder for caferpc frames.

use crate::error::ProtocolError;
use crate::message::Message;
use bytes::{Bytes, BytesMut};

/// Encodes messages into length-prefixed frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a message into a new frame buffer.
    pub fn encode(message: &Message) -> Result<BytesMut, ProtocolError> {
        message.encode()
    }

    /// Encodes several messages back to back into `dst`.
    ///
    /// Stops at the first message that cannot be encoded; frames already
    /// appended stay in `dst`.
    pub fn encode_batch<'a>(
        messages: impl IntoIterator<Item = &'a Message>,
        dst: &mut BytesMut,
    ) -> Result<usize, ProtocolError> {
        let mut count = 0;
        for message in messages {
            message.encode_into(dst)?;
            count += 1;
        }
        Ok(count)
    }
}

/// Default initial buffer capacity (8 KiB).
const DEFAULT_BUFFER_CAPACITY: usize = 8 * 1024;

/// Accumulates raw bytes from a stream and yields complete messages.
///
/// Feed it whatever the transport delivered with [`Decoder::extend`], then
/// call [`Decoder::decode_message`] until it returns `Ok(None)`. A frame may
/// be split across any number of deliveries and several frames may arrive in
/// one delivery.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next message from the buffer.
    ///
    /// An error means the stream is corrupt; the caller must drop the
    /// connection rather than keep decoding.
    pub fn decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        Message::decode(&mut self.buffer)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
