//! caferpc - length-framed binary RPC server
//!
//! Answers PING with PONG and echoes every REQUEST back to its caller.

use caferpc_server::{run_metrics_server, Config, Metrics, Server, ServerConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if CAFERPC_CONFIG is set, then env overrides)
    let config_path = std::env::var("CAFERPC_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // An explicitly named config file must load
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::warn!("{}; using default configuration", e);
            Config::default()
        }
    };

    tracing::info!("Starting caferpc server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    match config.network.idle_timeout() {
        Some(timeout) => tracing::info!("  Idle timeout: {}s", timeout.as_secs()),
        None => tracing::info!("  Idle timeout: disabled"),
    }
    tracing::info!("  Max connections: {}", config.network.max_connections);

    let mut server_config = ServerConfig::from_config(&config);
    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        Some(metrics)
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::new(server_config));

    let metrics_handle = match metrics {
        Some(metrics) => {
            let listener = TcpListener::bind(config.metrics.bind_addr).await?;
            let shutdown = server.shutdown_signal();
            Some(tokio::spawn(async move {
                if let Err(e) = run_metrics_server(listener, metrics, shutdown).await {
                    tracing::error!("Metrics server failed: {}", e);
                }
            }))
        }
        None => None,
    };

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}
