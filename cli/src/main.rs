//! IDE Agent CLI
//!
//! Starts the headless editor-host agent over stdio or WebSocket.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ide_agent_lib::config::Framing;
use ide_agent_lib::{AgentConfig, AgentServer, NoopExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;

/// IDE Agent - headless editor host driven over JSON-RPC
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Log at debug level and relay log messages to the client
    #[arg(long)]
    debug: bool,

    /// Configuration file (.toml, .yaml, .yml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Record every JSON-RPC message to this JSONL file
    #[arg(long)]
    record_to: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum FramingArg {
    ContentLength,
    Newline,
}

impl From<FramingArg> for Framing {
    fn from(framing: FramingArg) -> Self {
        match framing {
            FramingArg::ContentLength => Framing::ContentLength,
            FramingArg::Newline => Framing::Newline,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Serve JSON-RPC on stdin/stdout
    Jsonrpc {
        /// Message framing; defaults to the configured framing
        #[arg(long, value_enum)]
        framing: Option<FramingArg>,
    },
    /// Serve JSON-RPC over WebSocket, one session per connection
    Ws {
        #[arg(long, default_value_t = 7000)]
        port: u16,
    },
}

fn load_config(path: &Path) -> Result<AgentConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    let config = match extension {
        "toml" => toml::from_str(&text)?,
        "yaml" | "yml" => serde_yaml::from_str(&text)?,
        "json" => serde_json::from_str(&text)?,
        other => bail!("Unsupported config file extension '{}'", other),
    };
    Ok(config)
}

fn init_tracing(filter: &str, format: LogFormat) {
    // Stdout carries the protocol, so logs go to stderr
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { cli.log_level.as_str() };
    init_tracing(log_level, cli.log_format);

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => AgentConfig::default(),
    };
    config.server.log_level = log_level.to_string();
    if cli.debug {
        config.server.verbose_debug = true;
    }
    if let Some(path) = cli.record_to {
        config.record_path = Some(path);
    }
    if let Command::Jsonrpc {
        framing: Some(framing),
    } = cli.command
    {
        config.server.framing = framing.into();
    }

    let server = AgentServer::new(config, Arc::new(NoopExtension))?;
    match cli.command {
        Command::Jsonrpc { .. } => {
            let reason = server.start_with_shutdown().await?;
            tracing::info!("Exiting: {:?}", reason);
            std::process::exit(reason.exit_code());
        }
        Command::Ws { port } => {
            let listener = TcpListener::bind(("127.0.0.1", port))
                .await
                .with_context(|| format!("Failed to bind port {}", port))?;
            server.serve_websocket(listener).await?;
        }
    }

    Ok(())
}
