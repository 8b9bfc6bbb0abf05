//! TCP transport for the connection registry.
//!
//! Each accepted socket gets two tasks:
//! - a reader that feeds [`ConnectionRegistry::on_bytes_received`]
//! - a writer that drains the connection's outbound channel into the socket
//!
//! Either task ending tears the connection down, and the registry entry is
//! removed exactly once when the reader exits.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use protocol::ConnectionId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::registry::ConnectionRegistry;

/// Per-connection transport settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Size of the socket read buffer.
    pub read_buffer_size: usize,
    /// Capacity of each connection's outbound channel.
    pub outbound_capacity: usize,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: 8192,
            outbound_capacity: 256,
        }
    }
}

/// Accepts TCP connections and drives them through a [`ConnectionRegistry`].
pub struct TcpServer {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    options: ListenerOptions,
    shutdown: CancellationToken,
}

impl TcpServer {
    /// Binds `addr`. Use port 0 to let the OS pick one.
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<ConnectionRegistry>,
        options: ListenerOptions,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(address = %listener.local_addr()?, "Listening for connections");

        Ok(Self {
            listener,
            registry,
            options,
            shutdown: CancellationToken::new(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The registry connections are dispatched to.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Token that stops the accept loop and every connection when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accepts connections until the shutdown token is cancelled.
    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Listener shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        let registry = self.registry.clone();
                        let token = self.shutdown.child_token();
                        let options = self.options;
                        tokio::spawn(async move {
                            serve_connection(stream, remote_addr, registry, options, token).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }
    }
}

/// Runs one connection until EOF, I/O error, protocol violation or shutdown.
async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    options: ListenerOptions,
    token: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(remote_addr = %remote_addr, error = %e, "Failed to set TCP_NODELAY");
    }

    let (mut reader, writer) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(options.outbound_capacity);

    let id = registry.next_connection_id();
    let writer_task = tokio::spawn(write_loop(id, writer, outbound_rx, token.clone()));
    registry.on_connected(id, remote_addr, outbound_tx);

    let mut buf = vec![0u8; options.read_buffer_size];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!(connection_id = %id, "Peer closed connection");
                    break;
                }
                Ok(n) => {
                    if let Err(e) = registry.on_bytes_received(id, &buf[..n]).await {
                        tracing::debug!(connection_id = %id, error = %e, "Closing connection");
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(connection_id = %id, error = %e, "Read failed");
                    break;
                }
            }
        }
    }

    token.cancel();
    registry.on_disconnected(id);
    if let Err(e) = writer_task.await {
        tracing::warn!(connection_id = %id, error = %e, "Writer task failed");
    }
}

async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // A client that stops reading must not pin this task past cancellation
        let written = tokio::select! {
            _ = token.cancelled() => break,
            written = writer.write_all(&frame) => written,
        };
        if let Err(e) = written {
            tracing::warn!(connection_id = %id, error = %e, "Write failed");
            token.cancel();
            break;
        }
    }

    drop(outbound);
    let _ = writer.shutdown().await;
}
