//! Interactive REPL.
//!
//! Every non-command line is sent as a REQUEST without waiting for the
//! previous one; results are printed as they arrive.

use crate::commands::format_outcome;
use caferpc_client::Client;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use std::sync::Arc;

const HELP_TEXT: &str = r#"
Type any text to send it as a request. Replies print as they arrive:
  OK : <response payload>
  ERR: <why the call failed>

Commands:
  help                          Show this help
  pending                       Show the number of calls in flight
  quit, exit                    Close the connection and exit
"#;

/// What the REPL should do with one input line.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Empty,
    Help,
    Pending,
    Quit,
    Send(&'a str),
}

fn parse_line(line: &str) -> Input<'_> {
    let line = line.trim();
    match line {
        "" => Input::Empty,
        "help" | "?" => Input::Help,
        "pending" => Input::Pending,
        "quit" | "exit" => Input::Quit,
        payload => Input::Send(payload),
    }
}

pub async fn run(client: Client, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "caferpc CLI".bold().cyan());
    println!("Connecting to {}...", addr);

    client.connect().await?;
    println!("{}", "Connected!".green());
    let client = Arc::new(client);

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".caferpc_history"))
        .unwrap_or_else(|_| ".caferpc_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        if !client.is_connected() {
            println!("{}", "Connection lost.".red());
            break;
        }

        let prompt = format!("{} ", "caferpc>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => match parse_line(&line) {
                Input::Empty => continue,
                Input::Help => println!("{}", HELP_TEXT),
                Input::Pending => println!("{} call(s) in flight", client.pending_count().await),
                Input::Quit => break,
                Input::Send(payload) => submit(&client, payload.to_string()),
            },
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);

    let _ = client.close().await;
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

/// Sends `payload` in the background and prints the outcome when it resolves.
fn submit(client: &Arc<Client>, payload: String) {
    let client = client.clone();
    tokio::spawn(async move {
        let outcome = match client.submit(payload).await {
            Ok(handle) => {
                tracing::debug!(correlation_id = handle.correlation_id(), "Call submitted");
                handle.await
            }
            Err(e) => Err(e),
        };
        println!("{}", format_outcome(&outcome));
    });
}
