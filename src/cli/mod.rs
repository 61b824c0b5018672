//! Command-line entry point and the console chat adapter.
//!
//! The chat platform itself is an external collaborator; this adapter stands
//! in for it by reading inbound events from stdin (plain text, or JSON lines
//! shaped like `{"channel": "...", "user": "...", "text": "..."}`) and
//! printing each reply to stdout.

use clap::Parser;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::core::config::load_config;
use crate::oracle::HttpOracle;
use crate::orchestrator::{InboundEvent, Orchestrator};

#[derive(Parser)]
#[command(name = "concierge")]
#[command(about = "Route natural-language requests to MCP tool servers")]
#[command(
    long_about = "Concierge connects a conversational front end to MCP tool servers. \
For each request it asks a language-model oracle whether to run a tool, ask a \
clarifying question, or refuse.\n\n\
Configuration is read from concierge.toml (or --config). Logging is controlled \
with RUST_LOG, e.g. RUST_LOG=concierge=debug."
)]
pub struct Args {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Process a single utterance and exit
    #[arg(long, value_name = "TEXT")]
    pub ask: Option<String>,
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref())?;
    let oracle = Arc::new(HttpOracle::new(&config.oracle)?);
    let orchestrator = Arc::new(Orchestrator::from_config(&config, oracle));

    info!(servers = config.servers.len(), "starting tool servers");
    orchestrator.start_all().await;

    if let Some(text) = args.ask {
        let reply = orchestrator
            .handle_event(&console_event(&text))
            .await;
        println!("{reply}");
        orchestrator.shutdown().await;
        return Ok(());
    }

    run_console_loop(&orchestrator).await;
    orchestrator.shutdown().await;
    Ok(())
}

async fn run_console_loop(orchestrator: &Arc<Orchestrator>) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" || line == "/exit" {
            break;
        }

        let event = parse_console_line(&line);
        let orchestrator = orchestrator.clone();
        // Each utterance gets its own task; per-conversation state stays
        // consistent because the store serializes turns per key.
        let handle = tokio::spawn(async move { orchestrator.handle_event(&event).await });
        match handle.await {
            Ok(reply) => println!("{reply}"),
            Err(err) => {
                tracing::error!(error = %err, "utterance handler aborted");
                println!("Sorry, something went wrong while handling that request.");
            }
        }
    }
}

/// Accepts either a raw utterance or a JSON-encoded inbound event.
fn parse_console_line(line: &str) -> InboundEvent {
    if line.starts_with('{') {
        if let Ok(event) = serde_json::from_str::<InboundEvent>(line) {
            return event;
        }
    }
    console_event(line)
}

fn console_event(text: &str) -> InboundEvent {
    InboundEvent {
        channel: "console".to_string(),
        user: "local".to_string(),
        text: text.to_string(),
        message_id: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_lines_parse_into_events() {
        let event =
            parse_console_line(r#"{"channel": "C9", "user": "alice", "text": "hi there"}"#);
        assert_eq!(event.channel, "C9");
        assert_eq!(event.user, "alice");
        assert_eq!(event.text, "hi there");
    }

    #[test]
    fn plain_text_becomes_a_console_event() {
        let event = parse_console_line("what's the BTC price?");
        assert_eq!(event.channel, "console");
        assert_eq!(event.user, "local");
        assert_eq!(event.text, "what's the BTC price?");
    }

    #[test]
    fn malformed_json_falls_back_to_plain_text() {
        let event = parse_console_line("{not json");
        assert_eq!(event.channel, "console");
        assert_eq!(event.text, "{not json");
    }
}
