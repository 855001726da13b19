//! TCP server implementation.

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::metrics::Metrics;
use bytes::BytesMut;
use caferpc_protocol::{Decoder, ProtocolError};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Read buffer size per connection.
const READ_BUFFER_SIZE: usize = 8192;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout; `None` keeps idle connections open.
    pub idle_timeout: Option<Duration>,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, caferpc_protocol::DEFAULT_PORT)),
            idle_timeout: None,
            max_connections: 1000,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds the runtime configuration from a loaded [`Config`].
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            idle_timeout: config.network.idle_timeout(),
            max_connections: config.network.max_connections,
            metrics: None,
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub frames_received: AtomicU64,
    pub replies_sent: AtomicU64,
    pub protocol_errors: AtomicU64,
}

/// TCP server for caferpc.
pub struct Server {
    config: ServerConfig,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the server on an already-bound listener until [`Server::shutdown`].
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept(stream, addr),
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        if self.stats.connections_active.load(Ordering::Relaxed)
            >= self.config.max_connections as u64
        {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            self.stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            if let Some(ref metrics) = self.config.metrics {
                metrics.connections_rejected_total.inc();
            }
            return;
        }

        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.config.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }

        let stats = self.stats.clone();
        let config = self.config.clone();
        let mut conn_shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let result =
                Self::handle_connection(stream, addr, &config, &stats, &mut conn_shutdown).await;

            match result {
                Ok(()) | Err(ServerError::ShuttingDown) => {}
                Err(e) => tracing::debug!("Connection {} error: {}", addr, e),
            }

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            if let Some(ref metrics) = config.metrics {
                metrics.connections_active.dec();
            }

            tracing::info!("Client disconnected: {}", addr);
        });
    }

    /// Serves one connection: read, decode in arrival order, dispatch, reply.
    async fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        config: &ServerConfig,
        stats: &ServerStats,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        stream.set_nodelay(true).ok();
        let dispatcher = Dispatcher::new(stream.local_addr()?);
        tracing::info!("Client connected: {}", addr);

        let mut decoder = Decoder::new();
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut out = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    return Err(ServerError::ShuttingDown);
                }

                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", addr);
                            return Ok(());
                        }
                        Ok(n) => {
                            tracing::trace!("[{}] Received {} bytes", addr, n);
                            decoder.extend(&buf[..n]);
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", addr, e);
                            return Err(ServerError::Io(e));
                        }
                    }
                }

                _ = tokio::time::sleep(config.idle_timeout.unwrap_or_default()),
                    if config.idle_timeout.is_some() =>
                {
                    tracing::debug!("[{}] Idle timeout", addr);
                    return Ok(());
                }
            }

            out.clear();
            let decoded = Self::dispatch_buffered(&mut decoder, &dispatcher, &mut out, config, stats);

            if !out.is_empty() {
                tracing::trace!("[{}] Writing {} bytes", addr, out.len());
                stream.write_all(&out).await?;
            }

            if let Err(e) = decoded {
                stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                if let Some(ref metrics) = config.metrics {
                    metrics
                        .protocol_errors_total
                        .with_label_values(&[error_label(&e)])
                        .inc();
                }
                tracing::warn!("[{}] Protocol error, closing connection: {}", addr, e);
                return Err(e.into());
            }
        }
    }

    /// Decodes every complete frame, appending replies to `out` in order.
    ///
    /// Replies for frames decoded before an error stay in `out`.
    fn dispatch_buffered(
        decoder: &mut Decoder,
        dispatcher: &Dispatcher,
        out: &mut BytesMut,
        config: &ServerConfig,
        stats: &ServerStats,
    ) -> Result<(), ProtocolError> {
        while let Some(message) = decoder.decode_message()? {
            let started = Instant::now();
            let kind = message.kind();
            tracing::debug!(
                kind = %kind,
                correlation_id = message.correlation_id(),
                bytes = message.payload().len(),
                "Frame received"
            );
            stats.frames_received.fetch_add(1, Ordering::Relaxed);

            let reply = dispatcher.dispatch(message);
            if let Some(ref reply) = reply {
                reply.encode_into(out)?;
                stats.replies_sent.fetch_add(1, Ordering::Relaxed);
            }

            if let Some(ref metrics) = config.metrics {
                let label = kind.to_string();
                metrics
                    .frames_received_total
                    .with_label_values(&[label.as_str()])
                    .inc();
                if let Some(reply) = reply {
                    metrics
                        .replies_sent_total
                        .with_label_values(&[reply.kind().to_string().as_str()])
                        .inc();
                }
                metrics
                    .dispatch_duration
                    .with_label_values(&[label.as_str()])
                    .observe(started.elapsed().as_secs_f64());
            }
        }
        Ok(())
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns a receiver that fires when [`Server::shutdown`] is called.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

fn error_label(error: &ProtocolError) -> &'static str {
    match error {
        ProtocolError::InvalidMagic(_) => "invalid_magic",
        ProtocolError::UnsupportedVersion(_) => "unsupported_version",
        ProtocolError::UnknownKind(_) => "unknown_kind",
        ProtocolError::InvalidPayloadLength(_) => "invalid_payload_length",
        ProtocolError::FrameTooLarge { .. } => "frame_too_large",
        ProtocolError::FrameTooShort(_) => "frame_too_short",
        ProtocolError::LengthMismatch { .. } => "length_mismatch",
        ProtocolError::PayloadTooLarge { .. } => "payload_too_large",
        ProtocolError::Io(_) => "io",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caferpc_protocol::{Message, MessageKind};

    async fn start_server(config: ServerConfig) -> (Arc<Server>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(config));
        let runner = server.clone();
        tokio::spawn(async move { runner.serve(listener).await });
        (server, addr)
    }

    async fn read_message(stream: &mut TcpStream, decoder: &mut Decoder) -> Option<Message> {
        let mut buf = [0u8; 1024];
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
    async fn test_server_basic() {
        let server = Server::new(ServerConfig::new("127.0.0.1:0".parse().unwrap()));
        assert!(!server.is_running());
        assert!(!server.config().metrics_enabled());
    }

    #[tokio::test]
    async fn test_ping_and_request_in_one_write() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let mut frames = BytesMut::new();
        Message::ping().encode_into(&mut frames).unwrap();
        Message::request(42, "ping-test")
            .encode_into(&mut frames)
            .unwrap();
        stream.write_all(&frames).await.unwrap();

        let mut decoder = Decoder::new();
        let pong = read_message(&mut stream, &mut decoder).await.unwrap();
        assert_eq!(pong.kind(), MessageKind::Pong);

        let response = read_message(&mut stream, &mut decoder).await.unwrap();
        assert_eq!(response.kind(), MessageKind::Response);
        assert_eq!(response.correlation_id(), 42);
        assert_eq!(
            response.payload().as_ref(),
            format!("echo(ping-test) from {}", addr).as_bytes()
        );

        assert_eq!(server.stats().frames_received.load(Ordering::Relaxed), 2);
        assert_eq!(server.stats().replies_sent.load(Ordering::Relaxed), 2);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_decode_error_closes_only_that_connection() {
        let (server, addr) = start_server(ServerConfig::default()).await;

        let mut healthy = TcpStream::connect(addr).await.unwrap();
        let mut broken = TcpStream::connect(addr).await.unwrap();

        // Valid PING followed by a body with bad magic
        let mut frames = Message::ping().encode().unwrap();
        frames.extend_from_slice(&[0, 0, 0, 16, 0xBE, 0xEF, 1, 3, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0]);
        broken.write_all(&frames).await.unwrap();

        let mut decoder = Decoder::new();
        let pong = read_message(&mut broken, &mut decoder).await.unwrap();
        assert_eq!(pong.kind(), MessageKind::Pong);
        assert!(read_message(&mut broken, &mut decoder).await.is_none());

        healthy
            .write_all(&Message::request(7, "still here").encode().unwrap())
            .await
            .unwrap();
        let mut decoder = Decoder::new();
        let reply = read_message(&mut healthy, &mut decoder).await.unwrap();
        assert_eq!(reply.correlation_id(), 7);

        assert_eq!(server.stats().protocol_errors.load(Ordering::Relaxed), 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_closes_connection() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let mut decoder = Decoder::new();
        assert!(read_message(&mut stream, &mut decoder).await.is_none());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_connection() {
        let config = ServerConfig::default().with_idle_timeout(Duration::from_millis(50));
        let (server, addr) = start_server(config).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let mut decoder = Decoder::new();
        let closed = tokio::time::timeout(
            Duration::from_secs(5),
            read_message(&mut stream, &mut decoder),
        )
        .await
        .unwrap();
        assert!(closed.is_none());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Arc::new(Server::new(ServerConfig::default()));
        let runner = server.clone();
        let task = tokio::spawn(async move { runner.serve(listener).await });

        while !server.is_running() {
            tokio::task::yield_now().await;
        }
        server.shutdown();
        task.await.unwrap().unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_metrics_track_frames() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (server, addr) = start_server(ServerConfig::default().with_metrics(metrics.clone())).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream
            .write_all(&Message::request(1, "m").encode().unwrap())
            .await
            .unwrap();
        let mut decoder = Decoder::new();
        read_message(&mut stream, &mut decoder).await.unwrap();

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(encoded.contains("caferpc_frames_received_total{kind=\"REQUEST\"} 1"));
        assert!(encoded.contains("caferpc_replies_sent_total{kind=\"RESPONSE\"} 1"));
        server.shutdown();
    }
}
