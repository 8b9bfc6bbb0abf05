//! Connection registry and client-type dispatch.
//!
//! The registry is the server's table of live connections. It never touches a
//! socket: a transport calls [`on_connected`](ConnectionRegistry::on_connected),
//! [`on_bytes_received`](ConnectionRegistry::on_bytes_received) and
//! [`on_disconnected`](ConnectionRegistry::on_disconnected), and the registry
//! writes outbound frames into the channel it was handed on connect.
//!
//! # Classification
//!
//! A new connection starts out anonymous. The first decoded message is looked
//! up in the [`HandlerFactories`] table:
//!
//! - **match**: a handler is built for the connection and bound to it. The
//!   classification message itself is not forwarded.
//! - **no match**: the message is dropped, a
//!   [`RegistryEvent::UnknownClientType`] is published and the connection
//!   stays anonymous, so the peer may try again.
//!
//! Every later message goes to the bound handler on the caller's task.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use protocol::{
    ConnectionId, FrameCodec, FrameEvent, FrameReassembler, HandlerFactories, ProtocolError,
    Result,
};
use tokio::sync::{broadcast, mpsc};

use crate::session::{PeerHandle, PeerInfo, PeerSession};

/// Capacity of the registry event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A connection was registered as anonymous.
    Connected {
        id: ConnectionId,
        remote_addr: SocketAddr,
    },
    /// A connection announced a registered client type.
    Classified {
        id: ConnectionId,
        client_type: String,
    },
    /// An anonymous connection sent a token that matches no client type.
    UnknownClientType { id: ConnectionId, token: String },
    /// A frame arrived intact but its payload could not be decoded.
    CorruptPayload { id: ConnectionId, reason: String },
    /// The peer broke framing; its session was removed.
    ProtocolViolation { id: ConnectionId, reason: String },
    /// A connection was removed.
    Disconnected { id: ConnectionId },
}

/// Which registered connections a broadcast reaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastScope {
    /// Every registered connection, anonymous ones included.
    All,
    /// Every connection bound to a handler.
    Classified,
    /// Connections classified as the named client type.
    ClientType(String),
}

impl BroadcastScope {
    fn includes(&self, session: &PeerSession) -> bool {
        match self {
            BroadcastScope::All => true,
            BroadcastScope::Classified => session.is_classified(),
            BroadcastScope::ClientType(name) => session.client_type() == Some(name.as_str()),
        }
    }
}

/// Per-peer outcome of a broadcast or multicast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Peers whose writer accepted the frame.
    pub delivered: Vec<ConnectionId>,
    /// Peers the frame could not be handed to, with the reason.
    pub failed: Vec<(ConnectionId, ProtocolError)>,
}

impl DeliveryReport {
    /// Number of peers reached.
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }

    /// Number of peers that failed.
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// `true` when no target failed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Concurrent table of live connections with type-based dispatch.
pub struct ConnectionRegistry {
    /// Map of connection ID to session.
    sessions: DashMap<ConnectionId, Arc<PeerSession>>,
    factories: HandlerFactories<PeerHandle>,
    codec: FrameCodec,
    max_message_size: usize,
    next_id: AtomicU64,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl ConnectionRegistry {
    /// Creates a registry dispatching to `factories`.
    ///
    /// `codec` must match the peers' compression setting. `max_message_size`
    /// bounds inbound frames (0 = unlimited).
    pub fn new(
        factories: HandlerFactories<PeerHandle>,
        codec: FrameCodec,
        max_message_size: usize,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            sessions: DashMap::new(),
            factories,
            codec: codec.with_max_message_size(max_message_size),
            max_message_size,
            next_id: AtomicU64::new(1),
            event_tx,
        }
    }

    /// Allocates a connection ID that has never been handed out before.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Subscribe to registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Registered client type names.
    pub fn client_types(&self) -> Vec<&str> {
        self.factories.client_types()
    }

    /// Registers a new anonymous connection.
    ///
    /// `outbound` receives every encoded frame destined for the peer. A
    /// previous session under the same ID is replaced and closed.
    pub fn on_connected(
        &self,
        id: ConnectionId,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<Bytes>,
    ) -> PeerHandle {
        let handle = PeerHandle::new(id, remote_addr, self.codec, outbound);
        let session = Arc::new(PeerSession::new(
            handle.clone(),
            FrameReassembler::new(self.codec, self.max_message_size),
        ));

        if let Some(previous) = self.sessions.insert(id, session) {
            tracing::warn!(connection_id = %id, "Replaced existing session with same ID");
            previous.handle().close();
        }

        tracing::info!(connection_id = %id, remote_addr = %remote_addr, "Connection registered");
        self.emit(RegistryEvent::Connected { id, remote_addr });

        handle
    }

    /// Feeds bytes read from connection `id`.
    ///
    /// Completed messages are classified or dispatched in wire order before
    /// this returns. A protocol violation removes the session and is returned
    /// so the transport can close the connection. Undecodable payloads and
    /// unknown client types are published as events and do not fail the call.
    pub async fn on_bytes_received(&self, id: ConnectionId, bytes: &[u8]) -> Result<()> {
        let session = self.session(id)?;
        session.record_bytes(bytes.len());

        let mut events = Vec::new();
        let result = {
            let mut reassembler = session.reassembler().lock().await;
            reassembler.feed(bytes, |event| events.push(event))
        };

        for event in events {
            match event {
                FrameEvent::Message(payload) => self.handle_payload(&session, payload),
                FrameEvent::Corrupt(err) => self.report_corrupt(id, &err),
            }
        }

        if let Err(err) = result {
            tracing::warn!(connection_id = %id, error = %err, "Protocol violation, dropping connection");
            self.emit(RegistryEvent::ProtocolViolation {
                id,
                reason: err.to_string(),
            });
            self.remove(id);
            return Err(err);
        }

        Ok(())
    }

    /// Removes connection `id`.
    ///
    /// Buffered partial frames are discarded and handles held by handlers
    /// start failing with [`ProtocolError::PeerUnavailable`]. Returns the
    /// handle of the removed session, or `None` if it was already gone.
    pub fn on_disconnected(&self, id: ConnectionId) -> Option<PeerHandle> {
        self.remove(id)
    }

    /// Sends `message` to one peer.
    pub async fn send(&self, id: ConnectionId, message: &str) -> Result<()> {
        let handle = self.handle(id).ok_or(ProtocolError::PeerUnavailable(id))?;
        handle.send(message).await
    }

    /// Sends a keepalive frame to one peer.
    pub async fn send_keepalive(&self, id: ConnectionId) -> Result<()> {
        let handle = self.handle(id).ok_or(ProtocolError::PeerUnavailable(id))?;
        handle.send_keepalive().await
    }

    /// Sends `message` to every connection in `scope`.
    ///
    /// The target set is a snapshot taken at call time. The message is
    /// encoded once and queued on each peer without waiting, so one slow or
    /// vanished peer never holds up the others; its failure is recorded in
    /// the report.
    pub fn broadcast(&self, message: &str, scope: BroadcastScope) -> Result<DeliveryReport> {
        let targets: Vec<PeerHandle> = self
            .sessions
            .iter()
            .filter(|entry| scope.includes(entry.value()))
            .map(|entry| entry.value().handle().clone())
            .collect();

        let frame = Bytes::from(self.codec.encode_str(message)?);
        let report = deliver(&frame, targets.into_iter().map(|h| (h.id(), Some(h))));

        tracing::debug!(
            scope = ?scope,
            delivered = report.delivered_count(),
            failed = report.failed_count(),
            "Broadcast complete"
        );
        Ok(report)
    }

    /// Sends `message` to the listed connections.
    ///
    /// IDs that are not registered are reported as
    /// [`ProtocolError::PeerUnavailable`].
    pub fn multicast(&self, message: &str, ids: &[ConnectionId]) -> Result<DeliveryReport> {
        let targets: Vec<(ConnectionId, Option<PeerHandle>)> =
            ids.iter().map(|&id| (id, self.handle(id))).collect();

        let frame = Bytes::from(self.codec.encode_str(message)?);
        Ok(deliver(&frame, targets))
    }

    /// Routes a message with a custom header to the handler bound to `id`.
    pub fn dispatch_custom_header(
        &self,
        id: ConnectionId,
        message: &str,
        header: &str,
    ) -> Result<()> {
        let session = self.session(id)?;
        let handler = session.handler().ok_or(ProtocolError::NotClassified(id))?;
        handler.handle_custom_header(session.handle(), message, header);
        Ok(())
    }

    /// Routes a received file to the handler bound to `id`.
    pub fn dispatch_file(&self, id: ConnectionId, path: &Path) -> Result<()> {
        let session = self.session(id)?;
        let handler = session.handler().ok_or(ProtocolError::NotClassified(id))?;
        handler.handle_file(session.handle(), path);
        Ok(())
    }

    /// Diagnostic snapshot of one connection.
    pub fn get(&self, id: ConnectionId) -> Option<PeerInfo> {
        self.sessions.get(&id).map(|entry| entry.value().info())
    }

    /// Sending handle for one connection.
    pub fn handle(&self, id: ConnectionId) -> Option<PeerHandle> {
        self.sessions
            .get(&id)
            .map(|entry| entry.value().handle().clone())
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of connections bound to a handler.
    pub fn classified_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().is_classified())
            .count()
    }

    /// IDs of all registered connections, sorted.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Clone the session out so the map entry is released before dispatch.
    fn session(&self, id: ConnectionId) -> Result<Arc<PeerSession>> {
        self.sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ProtocolError::PeerUnavailable(id))
    }

    fn handle_payload(&self, session: &Arc<PeerSession>, payload: Bytes) {
        let id = session.id();
        let text = match String::from_utf8(payload.to_vec()) {
            Ok(text) => text,
            Err(err) => {
                self.report_corrupt(id, &ProtocolError::from(err));
                return;
            }
        };

        match session.handler() {
            Some(handler) => {
                session.record_message();
                handler.handle_message(session.handle(), &text);
            }
            None => self.classify(session, text),
        }
    }

    fn classify(&self, session: &Arc<PeerSession>, token: String) {
        let id = session.id();

        let Some(factory) = self.factories.get(&token) else {
            tracing::warn!(
                connection_id = %id,
                remote_addr = %session.handle().remote_addr(),
                client_type = %token,
                "Unknown client type, connection stays anonymous"
            );
            self.emit(RegistryEvent::UnknownClientType { id, token });
            return;
        };

        let handler = factory(session.handle());
        if session.classify(token.clone(), handler) {
            tracing::info!(connection_id = %id, client_type = %token, "Connection classified");
            self.emit(RegistryEvent::Classified {
                id,
                client_type: token,
            });
        }
    }

    fn report_corrupt(&self, id: ConnectionId, err: &ProtocolError) {
        tracing::warn!(connection_id = %id, error = %err, "Dropping undecodable message");
        self.emit(RegistryEvent::CorruptPayload {
            id,
            reason: err.to_string(),
        });
    }

    fn remove(&self, id: ConnectionId) -> Option<PeerHandle> {
        let (_, session) = self.sessions.remove(&id)?;
        let handle = session.handle().clone();
        handle.close();

        let stats = session.info();
        tracing::info!(
            connection_id = %id,
            client_type = session.client_type().unwrap_or("-"),
            messages = stats.messages_received,
            bytes = stats.bytes_received,
            "Connection removed"
        );
        self.emit(RegistryEvent::Disconnected { id });

        Some(handle)
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.sessions.len())
            .field("client_types", &self.factories.client_types())
            .finish()
    }
}

fn deliver<I>(frame: &Bytes, targets: I) -> DeliveryReport
where
    I: IntoIterator<Item = (ConnectionId, Option<PeerHandle>)>,
{
    let mut report = DeliveryReport::default();

    for (id, handle) in targets {
        let result = match handle {
            Some(handle) => handle.try_send_frame(frame.clone()),
            None => Err(ProtocolError::PeerUnavailable(id)),
        };
        match result {
            Ok(()) => report.delivered.push(id),
            Err(err) => {
                tracing::debug!(connection_id = %id, error = %err, "Delivery failed");
                report.failed.push((id, err));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use protocol::MessageHandler;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Records everything its connections deliver.
    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<(ConnectionId, String)>>,
        headers: Mutex<Vec<(String, String)>>,
        files: Mutex<Vec<PathBuf>>,
    }

    impl MessageHandler<PeerHandle> for Recorder {
        fn handle_message(&self, sender: &PeerHandle, message: &str) {
            self.messages
                .lock()
                .unwrap()
                .push((sender.id(), message.to_string()));
        }

        fn handle_custom_header(&self, _sender: &PeerHandle, message: &str, header: &str) {
            self.headers
                .lock()
                .unwrap()
                .push((message.to_string(), header.to_string()));
        }

        fn handle_file(&self, _sender: &PeerHandle, path: &Path) {
            self.files.lock().unwrap().push(path.to_path_buf());
        }
    }

    /// Replies to every message on the sender's handle.
    struct Echo;

    impl MessageHandler<PeerHandle> for Echo {
        fn handle_message(&self, sender: &PeerHandle, message: &str) {
            let _ = sender.try_send(&format!("echo: {}", message));
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn registry_with(recorder: Arc<Recorder>, codec: FrameCodec) -> ConnectionRegistry {
        let factories = HandlerFactories::new()
            .register_shared("Worker", recorder)
            .register("Echo", |_| Arc::new(Echo) as Arc<dyn MessageHandler<PeerHandle>>);
        ConnectionRegistry::new(factories, codec, 0)
    }

    fn connect(registry: &ConnectionRegistry, capacity: usize) -> (ConnectionId, mpsc::Receiver<Bytes>) {
        let id = registry.next_connection_id();
        let (tx, rx) = mpsc::channel(capacity);
        registry.on_connected(id, addr(40000 + id.get() as u16), tx);
        (id, rx)
    }

    fn frame(codec: FrameCodec, message: &str) -> Vec<u8> {
        codec.encode_str(message).unwrap()
    }

    fn decode(codec: FrameCodec, frame: &[u8]) -> String {
        let payload = codec.decode_payload(&frame[4..]).unwrap();
        String::from_utf8(payload).unwrap()
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let registry = registry_with(Arc::default(), FrameCodec::uncompressed());
        let a = registry.next_connection_id();
        let b = registry.next_connection_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_new_connection_is_anonymous() {
        let registry = registry_with(Arc::default(), FrameCodec::uncompressed());
        let (id, _rx) = connect(&registry, 8);

        let info = registry.get(id).unwrap();
        assert_eq!(info.state, SessionState::Anonymous);
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.classified_count(), 0);
    }

    #[tokio::test]
    async fn test_classification_message_is_consumed() {
        let recorder = Arc::new(Recorder::default());
        let codec = FrameCodec::compressed();
        let registry = registry_with(recorder.clone(), codec);
        let (id, _rx) = connect(&registry, 8);

        registry
            .on_bytes_received(id, &frame(codec, "Worker"))
            .await
            .unwrap();

        assert!(recorder.messages.lock().unwrap().is_empty());
        assert_eq!(
            registry.get(id).unwrap().state,
            SessionState::Classified("Worker".into())
        );

        let mut wire = frame(codec, "job 1");
        wire.extend(frame(codec, "job 2"));
        for chunk in wire.chunks(5) {
            registry.on_bytes_received(id, chunk).await.unwrap();
        }

        assert_eq!(
            *recorder.messages.lock().unwrap(),
            vec![(id, "job 1".to_string()), (id, "job 2".to_string())]
        );
        assert_eq!(registry.get(id).unwrap().messages_received, 2);
    }

    #[tokio::test]
    async fn test_unknown_client_type_stays_anonymous_and_can_retry() {
        let recorder = Arc::new(Recorder::default());
        let codec = FrameCodec::uncompressed();
        let registry = registry_with(recorder.clone(), codec);
        let mut events = registry.subscribe();
        let (id, _rx) = connect(&registry, 8);

        registry
            .on_bytes_received(id, &frame(codec, "Nope"))
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Connected {
                id,
                remote_addr: registry.get(id).unwrap().remote_addr
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::UnknownClientType {
                id,
                token: "Nope".to_string()
            }
        );
        assert_eq!(
            registry.get(id).unwrap().state,
            SessionState::Anonymous
        );

        registry
            .on_bytes_received(id, &frame(codec, "Worker"))
            .await
            .unwrap();
        registry
            .on_bytes_received(id, &frame(codec, "after retry"))
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Classified {
                id,
                client_type: "Worker".to_string()
            }
        );
        assert_eq!(
            *recorder.messages.lock().unwrap(),
            vec![(id, "after retry".to_string())]
        );
    }

    #[tokio::test]
    async fn test_each_connection_gets_its_own_handler() {
        let codec = FrameCodec::uncompressed();
        let registry = registry_with(Arc::default(), codec);
        let (a, mut rx_a) = connect(&registry, 8);
        let (b, mut rx_b) = connect(&registry, 8);

        for id in [a, b] {
            registry
                .on_bytes_received(id, &frame(codec, "Echo"))
                .await
                .unwrap();
        }
        registry
            .on_bytes_received(a, &frame(codec, "from a"))
            .await
            .unwrap();
        registry
            .on_bytes_received(b, &frame(codec, "from b"))
            .await
            .unwrap();

        assert_eq!(decode(codec, &rx_a.recv().await.unwrap()), "echo: from a");
        assert_eq!(decode(codec, &rx_b.recv().await.unwrap()), "echo: from b");
    }

    #[tokio::test]
    async fn test_protocol_violation_removes_session() {
        let registry = registry_with(Arc::default(), FrameCodec::uncompressed());
        let mut events = registry.subscribe();
        let (id, _rx) = connect(&registry, 8);
        let handle = registry.handle(id).unwrap();

        let err = registry
            .on_bytes_received(id, &(-1i32).to_le_bytes())
            .await
            .unwrap_err();

        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));
        assert!(registry.get(id).is_none());
        assert!(!handle.is_open());
        assert!(registry.on_disconnected(id).is_none());

        let _connected = events.recv().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::ProtocolViolation { .. }
        ));
        assert_eq!(events.recv().await.unwrap(), RegistryEvent::Disconnected { id });
    }

    #[tokio::test]
    async fn test_oversized_frame_is_violation() {
        let codec = FrameCodec::uncompressed();
        let registry = ConnectionRegistry::new(HandlerFactories::new(), codec, 100);
        let (id, _rx) = connect(&registry, 8);

        let err = registry
            .on_bytes_received(id, &101i32.to_le_bytes())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("message too large"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_corrupt_payload() {
        let recorder = Arc::new(Recorder::default());
        let codec = FrameCodec::uncompressed();
        let registry = registry_with(recorder.clone(), codec);
        let mut events = registry.subscribe();
        let (id, _rx) = connect(&registry, 8);

        registry
            .on_bytes_received(id, &frame(codec, "Worker"))
            .await
            .unwrap();
        let mut wire = codec.encode(&[0xFF, 0xFE]).unwrap();
        wire.extend(frame(codec, "valid"));
        registry.on_bytes_received(id, &wire).await.unwrap();

        let _connected = events.recv().await.unwrap();
        let _classified = events.recv().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::CorruptPayload { .. }
        ));
        assert_eq!(
            *recorder.messages.lock().unwrap(),
            vec![(id, "valid".to_string())]
        );
    }

    #[tokio::test]
    async fn test_keepalive_is_not_a_classification() {
        let recorder = Arc::new(Recorder::default());
        let codec = FrameCodec::uncompressed();
        let registry = registry_with(recorder.clone(), codec);
        let (id, _rx) = connect(&registry, 8);

        registry
            .on_bytes_received(id, &FrameCodec::keepalive_frame())
            .await
            .unwrap();
        assert_eq!(
            registry.get(id).unwrap().state,
            SessionState::Anonymous
        );
    }

    #[tokio::test]
    async fn test_send_to_removed_peer_fails_cleanly() {
        let registry = registry_with(Arc::default(), FrameCodec::uncompressed());
        let (id, _rx) = connect(&registry, 8);

        let removed = registry.on_disconnected(id).unwrap();
        assert_eq!(removed.id(), id);

        assert_eq!(
            registry.send(id, "hello").await,
            Err(ProtocolError::PeerUnavailable(id))
        );
        assert_eq!(
            registry.send_keepalive(id).await,
            Err(ProtocolError::PeerUnavailable(id))
        );
        assert_eq!(
            registry.on_bytes_received(id, b"x").await,
            Err(ProtocolError::PeerUnavailable(id))
        );
    }

    #[tokio::test]
    async fn test_send_and_keepalive() {
        let codec = FrameCodec::compressed();
        let registry = registry_with(Arc::default(), codec);
        let (id, mut rx) = connect(&registry, 8);

        registry.send(id, "Hello clients!").await.unwrap();
        registry.send_keepalive(id).await.unwrap();

        assert_eq!(decode(codec, &rx.recv().await.unwrap()), "Hello clients!");
        assert_eq!(&rx.recv().await.unwrap()[..], &[0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_broadcast_reports_failure_per_peer() {
        let codec = FrameCodec::uncompressed();
        let registry = registry_with(Arc::default(), codec);
        let (a, mut rx_a) = connect(&registry, 8);
        let (b, rx_b) = connect(&registry, 8);
        let (c, mut rx_c) = connect(&registry, 8);

        // b's writer is gone
        drop(rx_b);

        let report = registry.broadcast("Hello clients!", BroadcastScope::All).unwrap();

        assert_eq!(report.delivered_count(), 2);
        assert!(report.delivered.contains(&a));
        assert!(report.delivered.contains(&c));
        assert_eq!(report.failed, vec![(b, ProtocolError::PeerUnavailable(b))]);
        assert!(!report.is_complete());

        assert_eq!(decode(codec, &rx_a.recv().await.unwrap()), "Hello clients!");
        assert_eq!(decode(codec, &rx_c.recv().await.unwrap()), "Hello clients!");
    }

    #[tokio::test]
    async fn test_broadcast_full_channel_does_not_block() {
        let codec = FrameCodec::uncompressed();
        let registry = registry_with(Arc::default(), codec);
        let (slow, _rx_slow) = connect(&registry, 1);
        let (_fast, _rx_fast) = connect(&registry, 8);

        registry.broadcast("one", BroadcastScope::All).unwrap();
        let report = registry.broadcast("two", BroadcastScope::All).unwrap();

        assert_eq!(report.delivered_count(), 1);
        assert_eq!(report.failed, vec![(slow, ProtocolError::OutboundFull(slow))]);
    }

    #[tokio::test]
    async fn test_broadcast_scopes() {
        let codec = FrameCodec::uncompressed();
        let registry = registry_with(Arc::default(), codec);
        let (anon, _rx1) = connect(&registry, 8);
        let (worker, _rx2) = connect(&registry, 8);
        let (echo, _rx3) = connect(&registry, 8);

        registry
            .on_bytes_received(worker, &frame(codec, "Worker"))
            .await
            .unwrap();
        registry
            .on_bytes_received(echo, &frame(codec, "Echo"))
            .await
            .unwrap();

        let all = registry.broadcast("x", BroadcastScope::All).unwrap();
        assert_eq!(all.delivered_count(), 3);

        let classified = registry.broadcast("x", BroadcastScope::Classified).unwrap();
        assert_eq!(classified.delivered_count(), 2);
        assert!(!classified.delivered.contains(&anon));

        let workers = registry
            .broadcast("x", BroadcastScope::ClientType("Worker".into()))
            .unwrap();
        assert_eq!(workers.delivered, vec![worker]);
        assert_eq!(registry.classified_count(), 2);
    }

    #[tokio::test]
    async fn test_multicast_reports_unknown_ids() {
        let codec = FrameCodec::uncompressed();
        let registry = registry_with(Arc::default(), codec);
        let (a, mut rx_a) = connect(&registry, 8);
        let ghost = ConnectionId::new(999);

        let report = registry.multicast("direct", &[a, ghost]).unwrap();

        assert_eq!(report.delivered, vec![a]);
        assert_eq!(report.failed, vec![(ghost, ProtocolError::PeerUnavailable(ghost))]);
        assert_eq!(decode(codec, &rx_a.recv().await.unwrap()), "direct");
    }

    #[tokio::test]
    async fn test_dispatch_custom_header_and_file() {
        let recorder = Arc::new(Recorder::default());
        let codec = FrameCodec::uncompressed();
        let registry = registry_with(recorder.clone(), codec);
        let (id, _rx) = connect(&registry, 8);

        assert_eq!(
            registry.dispatch_custom_header(id, "body", "X-Kind"),
            Err(ProtocolError::NotClassified(id))
        );
        assert_eq!(
            registry.dispatch_file(id, Path::new("/tmp/upload.bin")),
            Err(ProtocolError::NotClassified(id))
        );

        registry
            .on_bytes_received(id, &frame(codec, "Worker"))
            .await
            .unwrap();
        registry.dispatch_custom_header(id, "body", "X-Kind").unwrap();
        registry
            .dispatch_file(id, Path::new("/tmp/upload.bin"))
            .unwrap();

        assert_eq!(
            *recorder.headers.lock().unwrap(),
            vec![("body".to_string(), "X-Kind".to_string())]
        );
        assert_eq!(
            *recorder.files.lock().unwrap(),
            vec![PathBuf::from("/tmp/upload.bin")]
        );

        registry.on_disconnected(id);
        assert_eq!(
            registry.dispatch_file(id, Path::new("/tmp/upload.bin")),
            Err(ProtocolError::PeerUnavailable(id))
        );
    }

    #[tokio::test]
    async fn test_connection_ids_sorted() {
        let registry = registry_with(Arc::default(), FrameCodec::uncompressed());
        let (a, _rx_a) = connect(&registry, 8);
        let (b, _rx_b) = connect(&registry, 8);
        let (c, _rx_c) = connect(&registry, 8);

        registry.on_disconnected(b);

        assert_eq!(registry.connection_ids(), vec![a, c]);
        assert_eq!(registry.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_disconnect_and_broadcast() {
        let registry = Arc::new(registry_with(Arc::default(), FrameCodec::uncompressed()));
        let mut receivers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..50 {
            let (id, rx) = connect(&registry, 64);
            ids.push(id);
            receivers.push(rx);
        }

        let remover = {
            let registry = registry.clone();
            let ids = ids.clone();
            tokio::spawn(async move {
                for id in ids {
                    registry.on_disconnected(id);
                    tokio::task::yield_now().await;
                }
            })
        };

        for _ in 0..20 {
            let report = registry.broadcast("tick", BroadcastScope::All).unwrap();
            assert!(report.delivered_count() + report.failed_count() <= 50);
            tokio::task::yield_now().await;
        }

        remover.await.unwrap();
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(
            registry.broadcast("after", BroadcastScope::All).unwrap(),
            DeliveryReport::default()
        );
    }
}
