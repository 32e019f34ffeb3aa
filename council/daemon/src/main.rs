//! Council Daemon - Multi-Model Streaming Chat Server
//!
//! Entry point for the LLM Council daemon. `serve` runs the duplex
//! WebSocket server that fans each prompt out to several models; `ask`
//! connects to a running server, submits one prompt and prints every
//! model's reconciled response.
//!
//! # Usage
//!
//! ```bash
//! # Serve with defaults (127.0.0.1:8000)
//! council-daemon serve
//!
//! # Offline demo models, no API keys needed
//! council-daemon --offline serve
//!
//! # Custom config and bind address
//! council-daemon --config ./council.toml serve --bind 0.0.0.0:9000
//!
//! # Ask a running server
//! council-daemon ask "Explain borrowing" --models gpt-4o,claude-3-5-sonnet-20241022
//!
//! # Verbose logging
//! RUST_LOG=debug council-daemon serve
//! ```
//!
//! # Signals
//!
//! - `SIGINT` (Ctrl+C): Graceful shutdown

mod server;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use council_core::{
    load_config_from_path, AssistantResponse, ChatClient, ClientUpdate, ConfigOverrides, ModelId,
    ResponseStatus,
};

use server::{DaemonServer, UpstreamMode};

/// How long `ask` waits for the channel to open
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Council Daemon - one prompt, many models, one duplex channel
#[derive(Parser, Debug)]
#[command(name = "council-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "COUNCIL_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "COUNCIL_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Use canned offline models instead of real providers
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the duplex WebSocket server
    Serve {
        /// Listen address
        #[arg(short = 'b', long, value_name = "ADDR")]
        bind: Option<String>,

        /// Per-model upstream deadline in seconds
        #[arg(long, value_name = "SECS")]
        upstream_timeout_secs: Option<u64>,
    },

    /// Submit one prompt to a running server and print the responses
    Ask {
        /// The prompt
        prompt: String,

        /// Comma-separated model ids
        #[arg(short = 'm', long, value_delimiter = ',', required = true)]
        models: Vec<String>,

        /// Server endpoint
        #[arg(short = 'u', long, value_name = "URL")]
        url: Option<String>,
    },

    /// List configured models and whether they are usable
    Models,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("council_daemon={level},council_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Council daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if let Some(ref config_path) = args.config {
        info!(config_path = ?config_path, "Config file");
    }

    let mut overrides = ConfigOverrides::new();
    match &args.command {
        Command::Serve {
            bind,
            upstream_timeout_secs,
        } => {
            if let Some(bind) = bind {
                overrides = overrides.with_bind_address(bind.clone());
            }
            if let Some(secs) = upstream_timeout_secs {
                overrides = overrides.with_upstream_timeout_secs(*secs);
            }
        }
        Command::Ask { url: Some(url), .. } => overrides = overrides.with_url(url.clone()),
        Command::Ask { .. } | Command::Models => {}
    }

    let mut config = load_config_from_path(args.config.clone()).context("Failed to load configuration")?;
    overrides.apply(&mut config).context("Invalid configuration override")?;
    info!(source = %config.source(), "Configuration loaded");

    let mode = if args.offline {
        UpstreamMode::Offline
    } else {
        UpstreamMode::Live
    };

    match args.command {
        Command::Serve { .. } => serve(DaemonServer::new(config, mode)?).await,
        Command::Ask { prompt, models, .. } => {
            let models = models.into_iter().map(ModelId::new).collect();
            ask(&config.client, &prompt, models).await
        }
        Command::Models => list_models(&DaemonServer::new(config, mode)?).await,
    }
}

async fn serve(daemon: DaemonServer) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));

    let shutdown_clone = Arc::clone(&shutdown);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt, initiating shutdown");
                shutdown_clone.store(true, Ordering::SeqCst);
            }
            Err(e) => warn!(error = %e, "Failed to install interrupt handler"),
        }
    });

    let result = daemon.run(shutdown).await;

    match result {
        Ok(()) => {
            info!("Council daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

async fn ask(config: &council_core::ClientConfig, prompt: &str, models: Vec<ModelId>) -> Result<()> {
    let mut client = ChatClient::connect(config);

    match tokio::time::timeout(CONNECT_TIMEOUT, client.wait_open()).await {
        Ok(true) => {}
        Ok(false) => bail!("Channel closed before opening"),
        Err(_) => bail!("Could not connect to {} within {}s", config.url, CONNECT_TIMEOUT.as_secs()),
    }

    client.submit(prompt, models).await.context("Failed to send prompt")?;

    match client.finish_turn().await {
        Some(ClientUpdate::Applied(council_core::Applied::TurnCompleted)) => {}
        Some(ClientUpdate::Applied(council_core::Applied::TurnRejected(reason))) => {
            bail!("Request rejected: {reason}")
        }
        Some(ClientUpdate::State(_)) | None => {
            if let Some(turn) = client.reconciler().unresolved().last() {
                for response in &turn.responses {
                    print_response(response);
                }
            }
            bail!("Connection lost before the turn completed")
        }
        Some(other) => bail!("Unexpected update: {other:?}"),
    }

    if let Some(turn) = client.reconciler().turns().last() {
        for response in &turn.responses {
            print_response(response);
        }
    }
    Ok(())
}

fn print_response(response: &AssistantResponse) {
    println!("── {} ({}) ──", response.model_name, response.model_id);
    if !response.content.is_empty() {
        println!("{}", response.content);
    }
    match response.status {
        ResponseStatus::Success => {
            if let Some(latency) = response.latency_ms {
                println!("[{latency} ms]");
            }
        }
        ResponseStatus::Error => {
            println!("[error: {}]", response.error.as_deref().unwrap_or("unknown"));
        }
        ResponseStatus::Streaming => println!("[incomplete]"),
    }
    println!();
}

async fn list_models(daemon: &DaemonServer) -> Result<()> {
    let models = daemon.provider().list_models().await.context("Failed to list models")?;
    let json = serde_json::to_string_pretty(&models).context("Failed to encode model list")?;
    println!("{json}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_serve_flags() {
        let args = Args::parse_from(["council-daemon", "--offline", "serve", "--bind", "0.0.0.0:9000"]);
        assert!(args.offline);
        assert_eq!(args.log_level, "info");
        match args.command {
            Command::Serve { bind, .. } => assert_eq!(bind.as_deref(), Some("0.0.0.0:9000")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_ask_models_list() {
        let args = Args::parse_from(["council-daemon", "ask", "hello", "--models", "a,b"]);
        match args.command {
            Command::Ask { prompt, models, url } => {
                assert_eq!(prompt, "hello");
                assert_eq!(models, vec!["a".to_string(), "b".to_string()]);
                assert!(url.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_config_file_feeds_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nbind_address = \"127.0.0.1:7000\"").unwrap();

        let mut config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:7000");

        ConfigOverrides::new()
            .with_bind_address("127.0.0.1:7100")
            .apply(&mut config)
            .unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:7100");
    }
}
