//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use crate::pending::CallHandle;
use bytes::Bytes;
use caferpc_protocol::RESERVED_CORRELATION_ID;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// High-level client for caferpc.
///
/// Wraps a single [`Connection`] and picks correlation ids for callers that
/// don't care which id a call travels under.
pub struct Client {
    config: ConnectionConfig,
    conn: RwLock<Option<Arc<Connection>>>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            conn: RwLock::new(None),
        }
    }

    /// Connects to the server, replacing any previous connection.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let conn = Connection::connect(self.config.clone()).await?;
        let previous = self.conn.write().await.replace(Arc::new(conn));
        if let Some(previous) = previous {
            previous.close().await?;
        }
        Ok(())
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        match self.conn.try_read() {
            Ok(guard) => guard.as_ref().is_some_and(|c| c.is_connected()),
            Err(_) => false,
        }
    }

    /// Closes the connection. Pending calls fail with `ConnectionClosed`.
    pub async fn close(&self) -> Result<(), ClientError> {
        let conn = self.conn.write().await.take();
        match conn {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }

    /// Returns the underlying connection.
    pub async fn connection(&self) -> Result<Arc<Connection>, ClientError> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    /// Returns the number of calls in flight.
    pub async fn pending_count(&self) -> usize {
        match self.conn.read().await.as_ref() {
            Some(conn) => conn.pending_count(),
            None => 0,
        }
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Sends `payload` as a REQUEST and waits for the RESPONSE payload.
    pub async fn call(&self, payload: impl Into<Bytes>) -> Result<Bytes, ClientError> {
        self.call_with_timeout(payload, self.config.request_timeout)
            .await
    }

    /// Like [`Client::call`] with an explicit timeout.
    pub async fn call_with_timeout(
        &self,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes, ClientError> {
        let conn = self.connection().await?;
        let id = unused_correlation_id(&conn);
        conn.call(id, payload, timeout).await
    }

    /// Issues a call under a random correlation id without waiting for it.
    pub async fn submit(&self, payload: impl Into<Bytes>) -> Result<CallHandle, ClientError> {
        let conn = self.connection().await?;
        let id = unused_correlation_id(&conn);
        Ok(conn.call(id, payload, self.config.request_timeout))
    }

    /// Issues a call under a caller-chosen correlation id.
    ///
    /// Reusing an id that is still in flight supersedes the earlier call.
    pub async fn call_with_id(
        &self,
        correlation_id: u64,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<CallHandle, ClientError> {
        let conn = self.connection().await?;
        Ok(conn.call(correlation_id, payload, timeout))
    }
}

/// Picks a random non-zero id that has no call in flight.
fn unused_correlation_id(conn: &Connection) -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let id = rng.gen_range(RESERVED_CORRELATION_ID + 1..=u64::MAX);
        if !conn.is_pending(id) {
            return id;
        }
    }
}
