//! # caferpc-client
//!
//! Client library for caferpc.
//!
//! This crate provides:
//! - Async TCP connection with a background reader and batching writer
//! - Call multiplexing over one stream, matched by correlation id
//! - Per-call timeouts, duplicate-id supersession and fail-all on close
//! - Periodic PING heartbeats

pub mod client;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod pending;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
pub use heartbeat::HeartbeatConfig;
pub use pending::{CallHandle, CallResult, PendingCalls};
