//! Chat relay binary.
//!
//! Forwards chat messages to the Anthropic Messages API, aggregates the
//! streamed reply and answers with a single JSON document.

mod config;
#[cfg(test)]
mod fake_backend;
mod relay;
mod routes;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chat-relay", version, about = "Streaming chat relay for the Anthropic API")]
struct Cli {
    /// Path to a TOML config file. Defaults to $CHAT_RELAY_CONFIG, then ./chat-relay.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP server (default).
    Serve,
    /// Validate config and report whether the upstream credential is set.
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is normal.
    let dotenv_path = dotenvy::dotenv().ok();
    init_tracing()?;
    install_panic_hook();
    if let Some(path) = dotenv_path {
        tracing::debug!(path = %path.display(), "loaded .env");
    }

    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(cli.config).await,
        Command::Doctor => server::doctor(cli.config).await,
    }
}

/// `CHAT_RELAY_LOG_FORMAT` picks json (default), pretty or compact output.
fn init_tracing() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chat_relay=debug,relay_llm=debug"));
    let log_format = std::env::var("CHAT_RELAY_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    match log_format.as_str() {
        "json" => builder.json().flatten_event(true).init(),
        "pretty" => builder.pretty().init(),
        "compact" => builder.compact().init(),
        other => {
            return Err(anyhow::anyhow!(
                "unsupported CHAT_RELAY_LOG_FORMAT={other:?}; expected json, pretty or compact"
            ));
        }
    }

    tracing::debug!(log_format = %log_format, "tracing initialized");
    Ok(())
}

/// Panics inside request tasks are logged as structured events before the
/// default hook prints them.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(
            location = ?info.location(),
            payload = %panic_payload_to_string(info.payload()),
            "chat relay panicked"
        );
        default_hook(info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command, panic_payload_to_string};
    use clap::Parser;

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["chat-relay"]).expect("parse");
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn config_flag_is_accepted_after_subcommand() {
        let cli = Cli::try_parse_from(["chat-relay", "doctor", "--config", "relay.toml"])
            .expect("parse");
        assert!(matches!(cli.command, Some(Command::Doctor)));
        assert_eq!(
            cli.config.as_deref(),
            Some(std::path::Path::new("relay.toml"))
        );
    }

    #[test]
    fn panic_payloads_render_as_strings() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_payload_to_string(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_payload_to_string(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(
            panic_payload_to_string(payload.as_ref()),
            "non-string panic payload"
        );
    }
}
