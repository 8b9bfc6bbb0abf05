//! Framewire Server
//!
//! Accepts TCP clients, classifies them by the client type they announce and
//! logs what each one sends. Optionally broadcasts a greeting to every
//! classified client on a fixed interval.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use protocol::{HandlerFactories, MessageHandler};
use server::config::{Config, LoggingConfig};
use server::{BroadcastScope, ConnectionRegistry, ListenerOptions, PeerHandle, TcpServer};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Client type registered when none is given on the command line.
const DEFAULT_CLIENT_TYPE: &str = "UserClient";

/// Message broadcast by `--broadcast-interval`.
const BROADCAST_MESSAGE: &str = "Hello clients!";

/// Framewire Server - classifies TCP clients and dispatches their messages.
#[derive(Parser, Debug)]
#[command(name = "framewire-server")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Address to listen on (overrides the config file)
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// Broadcast a greeting to classified clients every N milliseconds
    #[arg(long, value_name = "MS")]
    pub broadcast_interval: Option<u64>,

    /// Client type to accept; repeat for several (default: UserClient)
    #[arg(long = "client-type", value_name = "NAME")]
    pub client_types: Vec<String>,
}

/// Logs everything a classified client sends.
struct LoggingHandler {
    client_type: String,
}

impl MessageHandler<PeerHandle> for LoggingHandler {
    fn handle_message(&self, sender: &PeerHandle, message: &str) {
        tracing::info!(
            connection_id = %sender.id(),
            client_type = %self.client_type,
            "Received: {}",
            message
        );
    }

    fn handle_custom_header(&self, sender: &PeerHandle, message: &str, header: &str) {
        tracing::info!(
            connection_id = %sender.id(),
            client_type = %self.client_type,
            header = %header,
            "Received: {}",
            message
        );
    }

    fn handle_file(&self, sender: &PeerHandle, path: &std::path::Path) {
        tracing::info!(
            connection_id = %sender.id(),
            client_type = %self.client_type,
            path = %path.display(),
            "File received"
        );
    }
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
    if let Some(bind) = &cli.bind {
        config.server.bind_address = bind.clone();
    }

    // Validate configuration
    config.validate()?;

    let _log_guard = init_logging(&config.logging, cli.verbose);
    tracing::info!("Framewire server starting...");

    let client_types = if cli.client_types.is_empty() {
        vec![DEFAULT_CLIENT_TYPE.to_string()]
    } else {
        cli.client_types.clone()
    };

    let mut factories = HandlerFactories::new();
    for client_type in &client_types {
        let name = client_type.clone();
        factories.insert(client_type.clone(), move |peer: &PeerHandle| {
            tracing::info!(
                connection_id = %peer.id(),
                remote_addr = %peer.remote_addr(),
                client_type = %name,
                "Client connected"
            );
            Arc::new(LoggingHandler {
                client_type: name.clone(),
            }) as Arc<dyn MessageHandler<PeerHandle>>
        });
    }
    tracing::info!(client_types = ?client_types, "Registered client types");

    let registry = Arc::new(ConnectionRegistry::new(
        factories,
        config.protocol.codec(),
        config.protocol.max_message_size,
    ));

    let server = TcpServer::bind(
        config.bind_address()?,
        registry.clone(),
        ListenerOptions {
            read_buffer_size: config.server.read_buffer_size,
            outbound_capacity: config.server.outbound_capacity,
        },
    )
    .await?;
    let shutdown = server.shutdown_token();
    let server_task = tokio::spawn(server.run());

    if let Some(interval_ms) = cli.broadcast_interval {
        tokio::spawn(run_broadcast(
            registry.clone(),
            Duration::from_millis(interval_ms.max(1)),
            shutdown.clone(),
        ));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    shutdown.cancel();
    server_task.await?;

    tracing::info!(
        connections = registry.connection_count(),
        "Framewire server stopped"
    );
    Ok(())
}

/// Periodically greet every classified client.
async fn run_broadcast(
    registry: Arc<ConnectionRegistry>,
    period: Duration,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match registry.broadcast(BROADCAST_MESSAGE, BroadcastScope::Classified) {
                    Ok(report) => {
                        for (id, err) in &report.failed {
                            tracing::warn!(connection_id = %id, error = %err, "Broadcast delivery failed");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Broadcast failed"),
                }
            }
        }
    }
}

/// Install the tracing subscriber.
///
/// `RUST_LOG` wins over the configured level; `-v` forces debug otherwise.
/// With a log directory configured, output is also written to a daily-rolling
/// file. The returned guard must live until exit so buffered lines are flushed.
fn init_logging(logging: &LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer());

    match &logging.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "framewire-server.log");
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
