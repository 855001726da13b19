//! Message dispatch.
//!
//! Maps each inbound message to at most one reply: PING is answered with
//! PONG and REQUEST with an echoing RESPONSE under the same correlation id.

use bytes::{BufMut, Bytes, BytesMut};
use caferpc_protocol::{Message, MessageKind, MAX_PAYLOAD_SIZE};
use std::net::SocketAddr;

const ECHO_PREFIX: &[u8] = b"echo(";
const ECHO_SUFFIX: &[u8] = b") from ";

/// Per-connection dispatcher.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    /// Rendered local address of the connection, appended to every echo.
    local_addr: String,
}

impl Dispatcher {
    pub fn new(local_addr: SocketAddr) -> Self {
        Self {
            local_addr: local_addr.to_string(),
        }
    }

    /// Returns the reply for `message`, if it warrants one.
    pub fn dispatch(&self, message: Message) -> Option<Message> {
        match message.kind() {
            MessageKind::Ping => Some(Message::pong()),
            MessageKind::Request => {
                let correlation_id = message.correlation_id();
                let payload = self.echo(message.payload());
                Some(Message::response(correlation_id, payload))
            }
            MessageKind::Pong | MessageKind::Response => {
                tracing::debug!(
                    kind = %message.kind(),
                    correlation_id = message.correlation_id(),
                    "Ignoring message with no reply"
                );
                None
            }
        }
    }

    /// Builds `echo(<payload>) from <local addr>`.
    ///
    /// The echoed bytes are cut short when the whole reply would not fit in
    /// [`MAX_PAYLOAD_SIZE`].
    fn echo(&self, payload: &Bytes) -> Bytes {
        let overhead = ECHO_PREFIX.len() + ECHO_SUFFIX.len() + self.local_addr.len();
        let room = MAX_PAYLOAD_SIZE.saturating_sub(overhead);
        let echoed = if payload.len() > room {
            tracing::warn!(
                original = payload.len(),
                echoed = room,
                "Echo truncated to fit the payload limit"
            );
            &payload[..room]
        } else {
            &payload[..]
        };

        let mut out = BytesMut::with_capacity(overhead + echoed.len());
        out.put_slice(ECHO_PREFIX);
        out.put_slice(echoed);
        out.put_slice(ECHO_SUFFIX);
        out.put_slice(self.local_addr.as_bytes());
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new("127.0.0.1:18080".parse().unwrap())
    }

    #[test]
    fn test_ping_gets_pong() {
        let reply = dispatcher().dispatch(Message::ping()).unwrap();
        assert_eq!(reply.kind(), MessageKind::Pong);
        assert_eq!(reply.correlation_id(), 0);
        assert!(reply.payload().is_empty());
    }

    #[test]
    fn test_request_gets_echo() {
        let reply = dispatcher()
            .dispatch(Message::request(42, "ping-test"))
            .unwrap();
        assert_eq!(reply.kind(), MessageKind::Response);
        assert_eq!(reply.correlation_id(), 42);
        assert_eq!(
            reply.payload().as_ref(),
            b"echo(ping-test) from 127.0.0.1:18080"
        );
    }

    #[test]
    fn test_empty_request() {
        let reply = dispatcher().dispatch(Message::request(5, "")).unwrap();
        assert_eq!(reply.payload().as_ref(), b"echo() from 127.0.0.1:18080");
    }

    #[test]
    fn test_binary_payload_echoed_verbatim() {
        let reply = dispatcher()
            .dispatch(Message::request(9, vec![0xFFu8, 0x00, 0x80]))
            .unwrap();
        assert_eq!(&reply.payload()[..8], b"echo(\xFF\x00\x80");
    }

    #[test]
    fn test_pong_and_response_ignored() {
        let d = dispatcher();
        assert!(d.dispatch(Message::pong()).is_none());
        assert!(d.dispatch(Message::response(3, "late")).is_none());
    }

    #[test]
    fn test_oversized_echo_truncated() {
        let d = dispatcher();
        let reply = d
            .dispatch(Message::request(1, vec![b'a'; MAX_PAYLOAD_SIZE]))
            .unwrap();

        assert_eq!(reply.payload().len(), MAX_PAYLOAD_SIZE);
        assert!(reply.payload().starts_with(b"echo(aaa"));
        assert!(reply.payload().ends_with(b"aaa) from 127.0.0.1:18080"));
        reply.encode().unwrap();
    }

    #[test]
    fn test_ipv6_address_rendering() {
        let d = Dispatcher::new("[::1]:18080".parse().unwrap());
        let reply = d.dispatch(Message::request(2, "x")).unwrap();
        assert_eq!(reply.payload().as_ref(), b"echo(x) from [::1]:18080");
    }
}
