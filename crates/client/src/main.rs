//! Framewire Client
//!
//! Connects to a Framewire server, announces its client type and sends a
//! message on a fixed interval, logging everything the server sends back.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use client::config::{Config, LoggingConfig};
use client::{ClientHandle, ClientOptions, ClientRuntime, SendOutcome};
use protocol::MessageHandler;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Framewire Client - sends messages to a Framewire server.
#[derive(Parser, Debug)]
#[command(name = "framewire-client")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Server address (overrides the config file)
    #[arg(long, value_name = "ADDR")]
    pub server: Option<String>,

    /// Client type announced on connect (overrides the config file)
    #[arg(long = "client-type", value_name = "NAME")]
    pub client_type: Option<String>,

    /// Send interval in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    pub interval: u64,

    /// Message to send
    #[arg(long, default_value = "Hello server!")]
    pub message: String,
}

/// Logs everything the server sends.
struct LoggingHandler;

impl MessageHandler<ClientHandle> for LoggingHandler {
    fn handle_message(&self, _sender: &ClientHandle, message: &str) {
        tracing::info!("Received: {}", message);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    config.apply_env_overrides();
    if let Some(server) = &cli.server {
        config.client.server_address = server.clone();
    }
    if let Some(client_type) = &cli.client_type {
        config.client.client_type = Some(client_type.clone());
    }

    config.validate()?;

    let _log_guard = init_logging(&config.logging, cli.verbose);
    tracing::info!(server_address = %config.client.server_address, "Framewire client starting...");

    let runtime = ClientRuntime::with_handler(
        ClientOptions::from_config(&config),
        Arc::new(LoggingHandler),
    );
    runtime.start();

    let mut ticker = tokio::time::interval(Duration::from_millis(cli.interval.max(1)));
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Received shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                match runtime.send(&cli.message).await {
                    Ok(SendOutcome::Sent) => tracing::debug!("Sent: {}", cli.message),
                    Ok(SendOutcome::Queued) => tracing::debug!(
                        pending = runtime.pending_len().await,
                        "Not connected, message queued"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Send failed"),
                }
            }
        }
    }

    runtime.close().await;
    tracing::info!("Framewire client stopped");
    Ok(())
}

/// Install the tracing subscriber.
///
/// Same layering as the server: `RUST_LOG` first, then `-v`, then the config.
fn init_logging(logging: &LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer());

    match &logging.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "framewire-client.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            subscriber
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            subscriber.init();
            None
        }
    }
}
