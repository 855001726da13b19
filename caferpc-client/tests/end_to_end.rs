use bytes::Bytes;
use caferpc_client::{CallHandle, Client, ClientError, Connection, ConnectionConfig, HeartbeatConfig};
use caferpc_protocol::{Decoder, Message, MessageKind, MAX_PAYLOAD_SIZE};
use caferpc_server::{Server, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_test::assert_ok;

async fn start_server() -> (Arc<Server>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(Server::new(ServerConfig::new(addr)));
    let runner = server.clone();
    tokio::spawn(async move { runner.serve(listener).await });
    (server, addr)
}

/// A peer that accepts connections and hands the raw streams to the test.
async fn start_raw_peer() -> (SocketAddr, mpsc::UnboundedReceiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if tx.send(stream).is_err() {
                break;
            }
        }
    });
    (addr, rx)
}

fn config(addr: SocketAddr) -> ConnectionConfig {
    ConnectionConfig::new(addr.to_string()).without_heartbeat()
}

async fn read_frame(stream: &mut TcpStream, decoder: &mut Decoder) -> Option<Message> {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(msg) = decoder.decode_message().unwrap() {
            return Some(msg);
        }
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            return None;
        }
        decoder.extend(&buf[..n]);
    }
}

#[tokio::test]
async fn test_request_is_echoed() {
    let (server, addr) = start_server().await;
    let conn = Connection::connect(config(addr)).await.unwrap();

    let payload = conn
        .call(42, "ping-test", Duration::from_secs(3))
        .await
        .unwrap();
    assert_eq!(payload, format!("echo(ping-test) from {}", addr).as_bytes());
    assert_eq!(conn.pending_count(), 0);

    assert_ok!(conn.close().await);
    server.shutdown();
}

#[tokio::test]
async fn test_concurrent_calls_resolve_with_own_payload() {
    let (server, addr) = start_server().await;
    let client = Arc::new(Client::new(config(addr)));
    client.connect().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let body = format!("call-{}", i);
            let reply = client.call(body.clone()).await.unwrap();
            assert_eq!(reply, format!("echo({}) from {}", body, addr).as_bytes());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(client.pending_count().await, 0);
    assert_ok!(client.close().await);
    assert!(!client.is_connected());
    server.shutdown();
}

#[tokio::test]
async fn test_submit_then_poll() {
    let (server, addr) = start_server().await;
    let client = Client::new(config(addr));
    client.connect().await.unwrap();

    let mut handle = client.submit("later").await.unwrap();
    assert_ne!(handle.correlation_id(), 0);

    let reply = loop {
        if let Some(result) = handle.try_result() {
            break result.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert!(reply.starts_with(b"echo(later)"));

    assert_ok!(client.close().await);
    server.shutdown();
}

#[tokio::test]
async fn test_timeout_without_response() {
    let (addr, mut peers) = start_raw_peer().await;
    let conn = Connection::connect(config(addr)).await.unwrap();
    let _peer = peers.recv().await.unwrap();

    let err = conn
        .call(7, "anyone?", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Timeout {
            correlation_id: 7,
            ..
        }
    ));
    assert!(!conn.is_pending(7));
    assert!(conn.is_connected());
}

#[tokio::test]
async fn test_late_response_dropped() {
    let (addr, mut peers) = start_raw_peer().await;
    let conn = Connection::connect(config(addr)).await.unwrap();
    let mut peer = peers.recv().await.unwrap();

    let late = conn.call(7, "slow", Duration::from_millis(50));
    let other = conn.call(8, "fast", Duration::from_secs(5));
    assert!(matches!(late.await, Err(ClientError::Timeout { .. })));

    // Answer both; the timed-out one must not disturb the live call
    let mut frames = Message::response(7, "too late").encode().unwrap();
    frames.extend_from_slice(&Message::response(8, "on time").encode().unwrap());
    peer.write_all(&frames).await.unwrap();

    assert_eq!(other.await.unwrap(), Bytes::from_static(b"on time"));
    assert_eq!(conn.pending_count(), 0);
}

#[tokio::test]
async fn test_responses_out_of_order() {
    let (addr, mut peers) = start_raw_peer().await;
    let conn = Connection::connect(config(addr)).await.unwrap();
    let mut peer = peers.recv().await.unwrap();

    let handles: Vec<CallHandle> = (1..=10u64)
        .map(|id| conn.call(id, format!("req-{}", id), Duration::from_secs(5)))
        .collect();

    let mut decoder = Decoder::new();
    let mut ids = Vec::new();
    for _ in 0..10 {
        let msg = read_frame(&mut peer, &mut decoder).await.unwrap();
        assert_eq!(msg.kind(), MessageKind::Request);
        ids.push(msg.correlation_id());
    }

    for id in ids.iter().rev() {
        let reply = Message::response(*id, format!("resp-{}", id));
        peer.write_all(&reply.encode().unwrap()).await.unwrap();
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let expected = format!("resp-{}", i + 1);
        assert_eq!(handle.await.unwrap(), expected.as_bytes());
    }
}

#[tokio::test]
async fn test_duplicate_id_supersedes_first_call() {
    let (server, addr) = start_server().await;
    let conn = Connection::connect(config(addr)).await.unwrap();

    let first = conn.call(99, "first", Duration::from_secs(3));
    let second = conn.call(99, "second", Duration::from_secs(3));

    assert!(matches!(first.await, Err(ClientError::Superseded(99))));
    // The first RESPONSE on id 99 answers "first" and completes the newer call
    let reply = second.await.unwrap();
    assert_eq!(reply, format!("echo(first) from {}", addr).as_bytes());
    assert_eq!(conn.pending_count(), 0);

    assert_ok!(conn.close().await);
    server.shutdown();
}

#[tokio::test]
async fn test_close_fails_all_pending() {
    let (addr, mut peers) = start_raw_peer().await;
    let conn = Connection::connect(config(addr)).await.unwrap();
    let _peer = peers.recv().await.unwrap();

    let handles: Vec<CallHandle> = (1..=16u64)
        .map(|id| conn.call(id, "waiting", Duration::from_secs(30)))
        .collect();
    assert_eq!(conn.pending_count(), 16);

    assert_ok!(conn.close().await);
    assert!(!conn.is_connected());
    assert_eq!(conn.pending_count(), 0);

    for handle in handles {
        assert!(matches!(handle.await, Err(ClientError::ConnectionClosed)));
    }

    // Calls after close are rejected without touching the socket
    let late = conn.call(100, "too late", Duration::from_secs(1));
    assert!(matches!(late.await, Err(ClientError::ConnectionClosed)));
}

#[tokio::test]
async fn test_peer_disconnect_fails_pending() {
    let (addr, mut peers) = start_raw_peer().await;
    let conn = Connection::connect(config(addr)).await.unwrap();
    let peer = peers.recv().await.unwrap();

    let pending = conn.call(5, "orphan", Duration::from_secs(30));
    drop(peer);

    assert!(matches!(pending.await, Err(ClientError::ConnectionClosed)));
    conn.closed().await;
    assert!(!conn.is_connected());
}

#[tokio::test]
async fn test_server_shutdown_fails_pending() {
    let (server, addr) = start_server().await;
    let conn = Connection::connect(config(addr)).await.unwrap();

    // Make sure the server is serving this connection before shutting down
    conn.call(1, "warmup", Duration::from_secs(3)).await.unwrap();

    server.shutdown();
    tokio::time::timeout(Duration::from_secs(5), conn.closed())
        .await
        .unwrap();

    let after = conn.call(2, "gone", Duration::from_secs(1));
    assert!(matches!(after.await, Err(ClientError::ConnectionClosed)));
}

#[tokio::test]
async fn test_corrupt_frame_closes_connection() {
    let (addr, mut peers) = start_raw_peer().await;
    let conn = Connection::connect(config(addr)).await.unwrap();
    let mut peer = peers.recv().await.unwrap();

    let pending = conn.call(3, "doomed", Duration::from_secs(30));

    // Length prefix 16, wrong magic
    peer.write_all(&[0, 0, 0, 16, 0xBE, 0xEF, 1, 4, 0, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0, 0])
        .await
        .unwrap();

    assert!(matches!(pending.await, Err(ClientError::ConnectionClosed)));
    assert!(!conn.is_connected());
}

#[tokio::test]
async fn test_heartbeat_pings_reach_peer() {
    let (addr, mut peers) = start_raw_peer().await;
    let heartbeat = HeartbeatConfig::new(Duration::from_millis(20), Duration::from_millis(20));
    let conn = Connection::connect(ConnectionConfig::new(addr.to_string()).with_heartbeat(heartbeat))
        .await
        .unwrap();
    let mut peer = peers.recv().await.unwrap();

    let mut decoder = Decoder::new();
    for _ in 0..3 {
        let msg = read_frame(&mut peer, &mut decoder).await.unwrap();
        assert_eq!(msg.kind(), MessageKind::Ping);
        assert_eq!(msg.correlation_id(), 0);
    }

    // A PONG is not a response and leaves pending calls alone
    let pending = conn.call(11, "waiting", Duration::from_secs(5));
    peer.write_all(&Message::pong().encode().unwrap()).await.unwrap();
    peer.write_all(&Message::response(11, "done").encode().unwrap())
        .await
        .unwrap();
    assert_eq!(pending.await.unwrap(), Bytes::from_static(b"done"));

    assert_ok!(conn.close().await);
}

#[tokio::test]
async fn test_rejected_calls() {
    let (server, addr) = start_server().await;
    let conn = Connection::connect(config(addr)).await.unwrap();

    assert!(matches!(
        conn.call(0, "reserved", Duration::from_secs(1)).await,
        Err(ClientError::ReservedId)
    ));
    assert!(matches!(
        conn.call(1, vec![0u8; MAX_PAYLOAD_SIZE + 1], Duration::from_secs(1))
            .await,
        Err(ClientError::PayloadTooLarge { .. })
    ));
    assert_eq!(conn.pending_count(), 0);
    assert!(conn.is_connected());

    assert_ok!(conn.close().await);
    server.shutdown();
}

#[tokio::test]
async fn test_large_payload_roundtrip() {
    let (server, addr) = start_server().await;
    let conn = Connection::connect(config(addr)).await.unwrap();

    let body = vec![b'z'; 256 * 1024];
    let reply = conn
        .call(5, body.clone(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(&reply[5..5 + body.len()], &body[..]);

    assert_ok!(conn.close().await);
    server.shutdown();
}
