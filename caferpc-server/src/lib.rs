//! # caferpc-server
//!
//! TCP server for caferpc.
//!
//! This crate provides:
//! - Connection handling with async I/O and ordered per-connection dispatch
//! - PING/PONG liveness replies and echoing REQUEST/RESPONSE handling
//! - YAML and environment configuration
//! - Optional Prometheus metrics endpoint

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod server;

pub use config::{Config, ConfigError, MetricsConfig, NetworkConfig};
pub use dispatcher::Dispatcher;
pub use error::ServerError;
pub use metrics::{run_metrics_server, Metrics};
pub use server::{Server, ServerConfig, ServerStats};
