//! Connection management.
//!
//! A [`Connection`] owns one TCP stream and three background tasks:
//!
//! - the reader decodes frames in arrival order and resolves pending calls,
//! - the writer drains the outbound queue, batching frames into one write,
//! - the heartbeat queues a PING on a fixed schedule.
//!
//! Callers never touch the socket. [`Connection::call`] registers a pending
//! call, queues the REQUEST and returns immediately with a [`CallHandle`].

use crate::error::ClientError;
use crate::heartbeat::{self, HeartbeatConfig};
use crate::pending::{CallHandle, CallKey, PendingCalls};
use bytes::{Bytes, BytesMut};
use caferpc_protocol::{
    Decoder, Message, MessageKind, ProtocolError, MAX_PAYLOAD_SIZE, RESERVED_CORRELATION_ID,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Maximum frames coalesced into a single socket write.
const MAX_WRITE_BATCH: usize = 64;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address (`host:port`).
    pub addr: String,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Default per-call timeout.
    pub request_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Heartbeat schedule; `None` disables PINGs.
    pub heartbeat: Option<HeartbeatConfig>,
}

impl ConnectionConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(3),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            heartbeat: Some(HeartbeatConfig::default()),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat = None;
        self
    }
}

/// A frame queued for the writer task.
struct Outbound {
    message: Message,
    /// Set for REQUESTs so a failed write can fail the right call.
    call: Option<CallKey>,
}

/// State shared between the connection handle and its tasks.
struct Shared {
    pending: Arc<PendingCalls>,
    active: AtomicBool,
    closed: watch::Sender<bool>,
    peer_addr: SocketAddr,
}

impl Shared {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Marks the connection closed and fails every pending call.
    ///
    /// Only the first caller does anything; returns whether it was this one.
    fn shutdown(&self, reason: &str) -> bool {
        if self
            .active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.closed.send_replace(true);
        let failed = self.pending.fail_all(|| ClientError::ConnectionClosed);
        tracing::info!(
            peer = %self.peer_addr,
            failed_calls = failed,
            "Connection closed: {}",
            reason
        );
        true
    }

    fn handle_inbound(&self, message: Message) {
        match message.kind() {
            MessageKind::Response => {
                let correlation_id = message.correlation_id();
                self.pending.complete(correlation_id, message.into_payload());
            }
            MessageKind::Pong => {
                tracing::trace!(peer = %self.peer_addr, "PONG received");
            }
            MessageKind::Ping | MessageKind::Request => {
                tracing::debug!(
                    peer = %self.peer_addr,
                    kind = %message.kind(),
                    "Ignoring unexpected message from server"
                );
            }
        }
    }
}

/// A connection to a caferpc server.
pub struct Connection {
    config: ConnectionConfig,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Outbound>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Connects to the server and starts the connection's tasks.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        tracing::debug!("Connecting to {}...", config.addr);

        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(config.addr.as_str()),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::ConnectTimeout(config.connect_timeout)
        })?
        .map_err(|e| {
            tracing::debug!("Connection failed: {}", e);
            ClientError::Io(e)
        })?;

        stream.set_nodelay(true).ok();
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        tracing::debug!("TCP connected {} -> {}", local_addr, peer_addr);

        let (read_half, write_half) = stream.into_split();
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            pending: Arc::new(PendingCalls::new()),
            active: AtomicBool::new(true),
            closed,
            peer_addr,
        });
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(
            read_half,
            shared.clone(),
            config.read_buffer_size,
        ));
        let writer_task = tokio::spawn(write_loop(write_half, outbound_rx, shared.clone()));

        if let Some(schedule) = config.heartbeat {
            let link = shared.clone();
            let queue = outbound_tx.clone();
            heartbeat::spawn(schedule, shared.closed.subscribe(), move || {
                link.is_active()
                    && queue
                        .send(Outbound {
                            message: Message::ping(),
                            call: None,
                        })
                        .is_ok()
            });
        }

        Ok(Self {
            config,
            local_addr,
            shared,
            outbound: outbound_tx,
            writer_task: Mutex::new(Some(writer_task)),
        })
    }

    /// Issues a call and returns its result handle without waiting.
    ///
    /// The handle resolves with the RESPONSE payload, or with the first of
    /// [`ClientError::Timeout`], [`ClientError::SendFailed`],
    /// [`ClientError::Superseded`] or [`ClientError::ConnectionClosed`].
    /// Calls on a closed connection, with the reserved id 0, or with an
    /// oversized payload resolve immediately with an error.
    pub fn call(
        &self,
        correlation_id: u64,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> CallHandle {
        let payload = payload.into();

        if !self.shared.is_active() {
            return CallHandle::ready(correlation_id, Err(ClientError::ConnectionClosed));
        }
        if correlation_id == RESERVED_CORRELATION_ID {
            return CallHandle::ready(correlation_id, Err(ClientError::ReservedId));
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return CallHandle::ready(
                correlation_id,
                Err(ClientError::PayloadTooLarge {
                    size: payload.len(),
                    max: MAX_PAYLOAD_SIZE,
                }),
            );
        }

        let (key, handle) = self.shared.pending.register(correlation_id, timeout);

        // A shutdown racing with registration may have drained the table
        // before the insert landed
        if !self.shared.is_active() {
            self.shared.pending.fail(key, ClientError::ConnectionClosed);
            return handle;
        }

        tracing::debug!(correlation_id, bytes = payload.len(), "Queueing request");
        let queued = self.outbound.send(Outbound {
            message: Message::request(correlation_id, payload),
            call: Some(key),
        });
        if queued.is_err() {
            self.shared.pending.fail(
                key,
                ClientError::SendFailed("writer task has stopped".to_string()),
            );
        }

        handle
    }

    /// Returns whether the connection is open.
    pub fn is_connected(&self) -> bool {
        self.shared.is_active()
    }

    /// Returns whether `correlation_id` has a call in flight.
    pub fn is_pending(&self, correlation_id: u64) -> bool {
        self.shared.pending.contains(correlation_id)
    }

    /// Returns the number of calls in flight.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    /// Waits until the connection is closed, by either side.
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.subscribe();
        let _ = closed.wait_for(|is_closed| *is_closed).await;
    }

    /// Closes the connection.
    ///
    /// Every pending call fails with [`ClientError::ConnectionClosed`] and
    /// the write half is shut down once the writer task observes the close.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection...");
        self.shared.shutdown("closed by client");

        if let Some(task) = self.writer_task.lock().await.take() {
            let _ = task.await;
        }

        tracing::debug!("Connection closed");
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown("connection dropped");
    }
}

/// Reads and dispatches inbound frames until the connection ends.
async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>, buffer_size: usize) {
    let mut closed = shared.closed.subscribe();
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; buffer_size];

    let reason = loop {
        let read = tokio::select! {
            biased;
            _ = closed.wait_for(|is_closed| *is_closed) => return,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => break "closed by server".to_string(),
            Ok(n) => {
                tracing::trace!("read_loop: received {} bytes", n);
                decoder.extend(&buf[..n]);
            }
            Err(e) => break format!("read error: {}", e),
        }

        if let Err(e) = dispatch_frames(&mut decoder, &shared) {
            tracing::warn!(peer = %shared.peer_addr, "Protocol error from server: {}", e);
            break format!("protocol error: {}", e);
        }
    };

    shared.shutdown(&reason);
}

fn dispatch_frames(decoder: &mut Decoder, shared: &Shared) -> Result<(), ProtocolError> {
    while let Some(message) = decoder.decode_message()? {
        shared.handle_inbound(message);
    }
    Ok(())
}

/// Drains the outbound queue onto the socket.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
) {
    let mut closed = shared.closed.subscribe();
    let mut buf = BytesMut::with_capacity(DEFAULT_READ_BUFFER_SIZE);
    let mut batch_calls: Vec<CallKey> = Vec::with_capacity(MAX_WRITE_BATCH);

    loop {
        let first = tokio::select! {
            biased;
            _ = closed.wait_for(|is_closed| *is_closed) => break,
            next = outbound.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
        };

        buf.clear();
        batch_calls.clear();
        encode_outbound(first, &mut buf, &mut batch_calls, &shared);
        while batch_calls.len() < MAX_WRITE_BATCH {
            match outbound.try_recv() {
                Ok(frame) => encode_outbound(frame, &mut buf, &mut batch_calls, &shared),
                Err(_) => break,
            }
        }

        if buf.is_empty() {
            continue;
        }

        if let Err(e) = writer.write_all(&buf).await {
            tracing::debug!(peer = %shared.peer_addr, "Write failed: {}", e);
            let reason = e.to_string();
            for key in batch_calls.drain(..) {
                shared
                    .pending
                    .fail(key, ClientError::SendFailed(reason.clone()));
            }
        }
    }

    let _ = writer.shutdown().await;
    tracing::debug!(peer = %shared.peer_addr, "Writer stopped");
}

fn encode_outbound(
    frame: Outbound,
    buf: &mut BytesMut,
    batch_calls: &mut Vec<CallKey>,
    shared: &Shared,
) {
    match frame.message.encode_into(buf) {
        Ok(()) => {
            if let Some(key) = frame.call {
                batch_calls.push(key);
            }
        }
        Err(e) => {
            if let Some(key) = frame.call {
                shared.pending.fail(key, ClientError::Protocol(e));
            }
        }
    }
}
