//! Command execution and result formatting.

use crate::Commands;
use bytes::Bytes;
use caferpc_client::{Client, ClientError};
use colored::Colorize;
use std::time::Duration;

/// Executes a one-shot command and returns the formatted output.
pub async fn execute(
    client: &Client,
    cmd: Commands,
    timeout: Duration,
) -> Result<String, ClientError> {
    match cmd {
        Commands::Repl => unreachable!(),

        Commands::Call { payload, id } => {
            let reply = match id {
                Some(id) => client.call_with_id(id, payload, timeout).await?.await?,
                None => client.call_with_timeout(payload, timeout).await?,
            };
            Ok(format_reply(&reply))
        }
    }
}

/// Formats a successful call as `OK : <payload>`.
pub fn format_reply(payload: &Bytes) -> String {
    format!("{} {}", "OK :".green(), String::from_utf8_lossy(payload))
}

/// Formats a failed call as `ERR: <error>`.
pub fn format_error(error: &ClientError) -> String {
    format!("{} {}", "ERR:".red(), error)
}

/// Formats either outcome of a call.
pub fn format_outcome(result: &Result<Bytes, ClientError>) -> String {
    match result {
        Ok(payload) => format_reply(payload),
        Err(e) => format_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_formatting() {
        colored::control::set_override(false);

        let ok = format_outcome(&Ok(Bytes::from_static(b"echo(hi) from 127.0.0.1:18080")));
        assert_eq!(ok, "OK : echo(hi) from 127.0.0.1:18080");

        let err = format_outcome(&Err(ClientError::Superseded(99)));
        assert!(err.starts_with("ERR: "));
        assert!(err.contains("99"));
    }

    #[test]
    fn test_non_utf8_reply_is_lossy() {
        colored::control::set_override(false);
        let out = format_reply(&Bytes::from_static(b"\xFFok"));
        assert_eq!(out, "OK : \u{FFFD}ok");
    }
}
