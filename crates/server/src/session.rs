//! Per-connection state held by the registry.
//!
//! A [`PeerSession`] pairs one [`FrameReassembler`] with one live connection
//! and records whether the peer has announced its client type yet. Handlers
//! never see the session itself; they get a [`PeerHandle`], a cheap clone that
//! can send back to the peer and starts failing once the connection is gone.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use bytes::Bytes;
use protocol::{
    ConnectionId, FrameCodec, FrameReassembler, MessageHandler, ProtocolError, Result,
};
use tokio::sync::{mpsc, Mutex};

/// Handler type bound to classified server connections.
pub type PeerHandler = Arc<dyn MessageHandler<PeerHandle>>;

/// Sending side of one connection, handed to handlers.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    remote_addr: SocketAddr,
    codec: FrameCodec,
    outbound: mpsc::Sender<Bytes>,
    open: Arc<AtomicBool>,
}

impl PeerHandle {
    pub(crate) fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        codec: FrameCodec,
        outbound: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            id,
            remote_addr,
            codec,
            outbound,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Connection this handle sends on.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Address of the remote peer.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Whether the connection is still registered.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    /// Encode `message` and wait until the writer has accepted it.
    pub async fn send(&self, message: &str) -> Result<()> {
        let frame = Bytes::from(self.codec.encode_str(message)?);
        self.send_frame(frame).await
    }

    /// Encode `message` and queue it without waiting.
    ///
    /// Usable from inside [`MessageHandler`] callbacks, which are synchronous.
    /// Fails with [`ProtocolError::OutboundFull`] instead of blocking.
    pub fn try_send(&self, message: &str) -> Result<()> {
        let frame = Bytes::from(self.codec.encode_str(message)?);
        self.try_send_frame(frame)
    }

    /// Send a zero-length keepalive frame.
    pub async fn send_keepalive(&self) -> Result<()> {
        self.send_frame(Bytes::copy_from_slice(&FrameCodec::keepalive_frame()))
            .await
    }

    /// Hand an already encoded frame to the writer.
    pub async fn send_frame(&self, frame: Bytes) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(ProtocolError::PeerUnavailable(self.id));
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ProtocolError::PeerUnavailable(self.id))
    }

    /// Queue an already encoded frame without waiting.
    pub fn try_send_frame(&self, frame: Bytes) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(ProtocolError::PeerUnavailable(self.id));
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(connection_id = %self.id, "Outbound channel full, dropping frame");
                Err(ProtocolError::OutboundFull(self.id))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(ProtocolError::PeerUnavailable(self.id))
            }
        }
    }

    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// The handler a connection was bound to when it announced its type.
pub(crate) struct Classification {
    pub(crate) client_type: String,
    pub(crate) handler: PeerHandler,
}

/// Lifecycle state of a registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, client type not yet announced.
    Anonymous,
    /// Bound to the handler for the named client type.
    Classified(String),
}

/// Snapshot of a session for diagnostics.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Address of the remote peer.
    pub remote_addr: SocketAddr,
    /// Current lifecycle state.
    pub state: SessionState,
    /// When the connection was registered.
    pub connected_at: Instant,
    /// Messages dispatched to the bound handler.
    pub messages_received: u64,
    /// Raw bytes fed to the reassembler.
    pub bytes_received: u64,
}

/// One live connection as seen by the registry.
pub struct PeerSession {
    handle: PeerHandle,
    /// Only the connection's reader feeds it.
    reassembler: Mutex<FrameReassembler>,
    /// Set once, on the first message matching a registered type.
    classification: OnceLock<Classification>,
    connected_at: Instant,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
}

impl PeerSession {
    pub(crate) fn new(handle: PeerHandle, reassembler: FrameReassembler) -> Self {
        Self {
            handle,
            reassembler: Mutex::new(reassembler),
            classification: OnceLock::new(),
            connected_at: Instant::now(),
            messages_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }

    /// Handle for sending to this peer.
    pub fn handle(&self) -> &PeerHandle {
        &self.handle
    }

    /// The announced client type, once classified.
    pub fn client_type(&self) -> Option<&str> {
        self.classification.get().map(|c| c.client_type.as_str())
    }

    /// Whether the peer has announced a registered client type.
    pub fn is_classified(&self) -> bool {
        self.classification.get().is_some()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        match self.client_type() {
            Some(client_type) => SessionState::Classified(client_type.to_string()),
            None => SessionState::Anonymous,
        }
    }

    /// Diagnostic snapshot.
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.handle.id,
            remote_addr: self.handle.remote_addr,
            state: self.state(),
            connected_at: self.connected_at,
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reassembler(&self) -> &Mutex<FrameReassembler> {
        &self.reassembler
    }

    pub(crate) fn handler(&self) -> Option<PeerHandler> {
        self.classification.get().map(|c| c.handler.clone())
    }

    /// Binds the handler. Returns `false` if the session was already classified.
    pub(crate) fn classify(&self, client_type: String, handler: PeerHandler) -> bool {
        self.classification
            .set(Classification {
                client_type,
                handler,
            })
            .is_ok()
    }

    pub(crate) fn record_bytes(&self, count: usize) {
        self.bytes_received
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.handle.id)
            .field("remote_addr", &self.handle.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}
