//! caferpc-cli - Command-line interface for caferpc
//!
//! Provides both a REPL and one-shot calls.

mod commands;
mod repl;

use caferpc_client::{Client, ConnectionConfig};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "caferpc-cli")]
#[command(about = "Command-line interface for the caferpc echo service")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:18080", env = "CAFERPC_SERVER")]
    server: String,

    /// Per-call timeout in milliseconds
    #[arg(short, long, default_value_t = 3000)]
    timeout_ms: u64,

    /// Disable keep-alive PINGs
    #[arg(long)]
    no_heartbeat: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start interactive REPL
    Repl,

    /// Send one request and print the response
    Call {
        /// Request payload
        payload: String,

        /// Correlation id (random if omitted)
        #[arg(long)]
        id: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let timeout = Duration::from_millis(cli.timeout_ms);
    let mut config = ConnectionConfig::new(cli.server.clone()).with_request_timeout(timeout);
    if cli.no_heartbeat {
        config = config.without_heartbeat();
    }
    let client = Client::new(config);

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(client, &cli.server).await?;
        }
        Some(cmd) => {
            client.connect().await.map_err(|e| {
                eprintln!("{}: {}", "Connection failed".red(), e);
                e
            })?;

            let result = commands::execute(&client, cmd, timeout).await;
            client.close().await?;

            match result {
                Ok(output) => println!("{}", output),
                Err(e) => {
                    eprintln!("{}", commands::format_error(&e));
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
