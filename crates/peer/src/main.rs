//! p2p-chat
//!
//! Peer-to-peer text chat over WebRTC data channels, negotiated through
//! encrypted copy-paste envelopes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use peer::config::{Config, LoggingConfig};
use peer::network::direct::{self, DirectListener};
use peer::network::{ChannelRegistry, NegotiationEngine, RelayServer, SessionNegotiator, WebRtcEngine};
use peer::sink::StdoutSink;
use peer::Dispatcher;
use protocol::{EnvelopeCodec, KeySource};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// p2p-chat - serverless peer-to-peer chat.
#[derive(Parser, Debug)]
#[command(name = "p2p-chat")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute (defaults to chat)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Negotiate WebRTC data channels interactively
    Chat,

    /// Wait for direct TCP connections
    Listen {
        /// Address to bind (overrides direct.bind_address)
        #[arg(long, short, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Open a direct TCP connection to a listening peer
    Connect {
        /// Peer address as host:port
        addr: String,
    },

    /// Run the WebSocket echo relay
    Relay {
        /// Address to bind (overrides relay.bind_address)
        #[arg(long, short, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Encode or decode an envelope read from stdin
    #[command(subcommand)]
    Envelope(EnvelopeCommands),
}

/// Envelope diagnostics.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeCommands {
    /// Read JSON from stdin and print its envelope
    Encode,
    /// Read an envelope from stdin and print its JSON
    Decode,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    let _log_guard = init_tracing(cli.verbose, &config.logging)?;
    if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
    }

    let (key, source) = config
        .resolve_key()
        .context("Failed to resolve the envelope key")?;
    if source == KeySource::Fallback {
        tracing::warn!(
            "Using the built-in fallback key; set {} or security.secret_key to keep envelopes private",
            peer::config::ENV_SECRET_KEY
        );
    }
    let codec = EnvelopeCodec::new(key);

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => run_chat(&config, codec).await?,
        Commands::Listen { bind } => {
            let address = bind.unwrap_or_else(|| config.direct.bind_address.clone());
            let listener = DirectListener::bind(&address).await?;
            tracing::info!("Listening for direct connections on {}", listener.local_addr()?);

            let mut input = BufReader::new(tokio::io::stdin()).lines();
            let sink = Arc::new(StdoutSink::raw());
            tokio::select! {
                reports = listener.serve(&mut input, sink, config.direct.read_buffer_size) => {
                    tracing::info!("Served {} session(s)", reports.len());
                }
                _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
            }
        }
        Commands::Connect { addr } => {
            let stream = direct::connect(&addr).await?;
            let mut input = BufReader::new(tokio::io::stdin()).lines();
            let sink = Arc::new(StdoutSink::raw());
            tokio::select! {
                report = direct::run_session(stream, &addr, &mut input, sink, config.direct.read_buffer_size) => {
                    tracing::debug!("Session report: {:?}", report);
                }
                _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
            }
        }
        Commands::Relay { bind } => {
            let address = bind.unwrap_or_else(|| config.relay.bind_address.clone());
            let relay = RelayServer::bind(&address).await?;
            tokio::select! {
                result = relay.serve() => result?,
                _ = tokio::signal::ctrl_c() => tracing::info!("Relay stopped"),
            }
        }
        Commands::Envelope(cmd) => {
            let mut text = String::new();
            tokio::io::stdin()
                .read_to_string(&mut text)
                .await
                .context("Failed to read stdin")?;

            match cmd {
                EnvelopeCommands::Encode => println!("{}", codec.encode(text.trim())?),
                EnvelopeCommands::Decode => println!("{}", codec.decode(&text)?),
            }
        }
    }

    Ok(())
}

/// Installs the tracing subscriber.
///
/// Logs go to stderr, or to a daily rolling file when `logging.directory` is
/// set. The returned guard must stay alive for file logs to be flushed.
fn init_tracing(verbose: bool, logging: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_new(level.to_lowercase())
        .with_context(|| format!("Invalid log level: {}", level))?;

    match &logging.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "p2p-chat.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// Runs the interactive negotiation loop on stdin and stdout.
async fn run_chat(config: &Config, codec: EnvelopeCodec) -> anyhow::Result<()> {
    let engine = Arc::new(WebRtcEngine::new(config.webrtc_config()).await?);
    let registry = Arc::new(ChannelRegistry::new(Arc::new(StdoutSink::channels())));
    let negotiator = SessionNegotiator::new(
        engine.clone(),
        codec,
        registry,
        config.negotiator_options(),
    );
    let mut dispatcher = Dispatcher::new(negotiator);

    println!("Type 'offer' to start a session, paste an envelope to answer one, 'help' for more.");

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut output = tokio::io::stdout();
    tokio::select! {
        result = dispatcher.run(&mut input, &mut output) => result.context("Chat loop failed")?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
    }

    if let Err(e) = engine.close().await {
        tracing::debug!("Failed to close peer connection: {}", e);
    }
    Ok(())
}
