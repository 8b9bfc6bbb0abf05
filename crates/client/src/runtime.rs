//! Client connection runtime.
//!
//! [`ClientRuntime`] owns at most one TCP connection to the server and keeps
//! it alive according to its [`ClientOptions`]:
//!
//! - Messages sent while disconnected wait in a bounded pending queue and are
//!   flushed in order the moment a connection is established.
//! - On every (re)connect the configured client type is sent first, so the
//!   server can classify the connection before any queued traffic arrives.
//! - When the connection drops and `always_reconnect` is set, the runtime
//!   reconnects with exponential backoff. Otherwise it stays disconnected
//!   until [`reconnect`](ClientRuntime::reconnect) is called.
//!
//! Inbound frames are reassembled per connection and handed to the
//! [`MessageHandler`] given at construction.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use protocol::{
    FrameCodec, FrameEvent, FrameReassembler, MessageHandler, ProtocolConfig, ProtocolError,
    Result,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Default reconnection settings.
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 30_000;
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default bound of the pending queue.
const DEFAULT_PENDING_CAPACITY: usize = 1024;

/// Handler type for inbound client traffic.
pub type ClientHandler = Arc<dyn MessageHandler<ClientHandle>>;

/// Connection state of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Waiting out the backoff before the next attempt.
    Reconnecting,
}

/// What [`ClientRuntime::send`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the live connection's writer.
    Sent,
    /// Held in the pending queue until the next connection.
    Queued,
}

/// Runtime settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// `host:port` of the server.
    pub server_address: String,
    /// Classification token sent first on every connection.
    pub client_type: Option<String>,
    /// Whether to reconnect automatically after a disconnect.
    pub always_reconnect: bool,
    /// Bound of the pending queue.
    pub pending_capacity: usize,
    /// Initial backoff duration for reconnection.
    pub initial_backoff: Duration,
    /// Maximum backoff duration for reconnection.
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Wire settings.
    pub protocol: ProtocolConfig,
    /// Size of the socket read buffer.
    pub read_buffer_size: usize,
    /// Capacity of the writer channel.
    pub outbound_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server_address: crate::config::DEFAULT_SERVER_ADDRESS.to_string(),
            client_type: None,
            always_reconnect: true,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            backoff_multiplier: BACKOFF_MULTIPLIER,
            protocol: ProtocolConfig::default(),
            read_buffer_size: 8192,
            outbound_capacity: 256,
        }
    }
}

impl ClientOptions {
    /// Creates options targeting `server_address`.
    pub fn new(server_address: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            ..Default::default()
        }
    }

    /// Builds options from a loaded configuration file.
    pub fn from_config(config: &Config) -> Self {
        Self {
            server_address: config.client.server_address.clone(),
            client_type: config.client.client_type.clone(),
            always_reconnect: config.client.always_reconnect,
            pending_capacity: config.client.pending_capacity,
            initial_backoff: config.client.initial_backoff(),
            max_backoff: config.client.max_backoff(),
            backoff_multiplier: config.client.backoff_multiplier,
            protocol: config.protocol,
            read_buffer_size: config.client.read_buffer_size,
            outbound_capacity: config.client.outbound_capacity,
        }
    }

    /// Sets the classification token.
    pub fn with_client_type(mut self, client_type: impl Into<String>) -> Self {
        self.client_type = Some(client_type.into());
        self
    }

    /// Sets whether to automatically reconnect on disconnect.
    pub fn with_always_reconnect(mut self, always_reconnect: bool) -> Self {
        self.always_reconnect = always_reconnect;
        self
    }

    /// Sets the pending queue bound.
    pub fn with_pending_capacity(mut self, capacity: usize) -> Self {
        self.pending_capacity = capacity;
        self
    }

    /// Sets the initial and maximum backoff durations.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Sets the wire settings.
    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets the writer channel capacity.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }
}

/// Mutable connection state, guarded by one lock so that publishing a writer
/// and flushing the pending queue happen together.
///
/// The lock is never held across a wait on the socket except while flushing,
/// and the flush gives up as soon as the connection is cancelled.
struct Link {
    /// Sender for frames on the live connection.
    writer: Option<mpsc::Sender<Bytes>>,
    /// Frames waiting for a connection, oldest first.
    pending: VecDeque<Bytes>,
    /// Current backoff duration for reconnection.
    current_backoff: Duration,
}

struct Shared {
    options: ClientOptions,
    codec: FrameCodec,
    handler: Option<ClientHandler>,
    link: Mutex<Link>,
    /// Cancels the live connection. Kept outside `link` so a disconnect
    /// never waits behind a stalled flush.
    connection: std::sync::Mutex<Option<CancellationToken>>,
    /// Set by `disconnect`, cleared by `reconnect`.
    shutdown_requested: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
    /// Wakes the connection loop out of a backoff or an idle wait.
    wake: Notify,
    /// Ends the connection loop for good.
    closed: CancellationToken,
    started: AtomicBool,
}

/// TCP client runtime with a pending queue and reconnect policy.
///
/// Cloning is cheap; all clones drive the same connection.
#[derive(Clone)]
pub struct ClientRuntime {
    shared: Arc<Shared>,
}

/// Reference to the runtime given to handlers.
///
/// Does not keep the runtime alive; sends fail with
/// [`ProtocolError::NotConnected`] once it is gone.
#[derive(Clone)]
pub struct ClientHandle {
    shared: Weak<Shared>,
}

impl ClientRuntime {
    /// Creates a runtime without an inbound handler. Received messages are
    /// logged at debug level.
    pub fn new(options: ClientOptions) -> Self {
        Self::build(options, None)
    }

    /// Creates a runtime dispatching inbound messages to `handler`.
    pub fn with_handler(options: ClientOptions, handler: ClientHandler) -> Self {
        Self::build(options, Some(handler))
    }

    fn build(options: ClientOptions, handler: Option<ClientHandler>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let codec = options.protocol.codec();
        let current_backoff = options.initial_backoff;

        Self {
            shared: Arc::new(Shared {
                options,
                codec,
                handler,
                link: Mutex::new(Link {
                    writer: None,
                    pending: VecDeque::new(),
                    current_backoff,
                }),
                connection: std::sync::Mutex::new(None),
                shutdown_requested: AtomicBool::new(false),
                state_tx,
                wake: Notify::new(),
                closed: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Starts the connection loop in the background.
    ///
    /// Calling it again has no effect.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            shared.run_connection_loop().await;
        });
    }

    /// Sends `message`, or queues it while disconnected.
    ///
    /// Returns [`ProtocolError::QueueFull`] and drops the message when the
    /// pending queue is at capacity.
    pub async fn send(&self, message: &str) -> Result<SendOutcome> {
        let frame = Bytes::from(self.shared.codec.encode_str(message)?);
        self.shared.send_frame(frame).await
    }

    /// Sends a zero-length keepalive frame on the live connection.
    pub async fn send_keepalive(&self) -> Result<()> {
        self.shared.send_keepalive().await
    }

    /// Drops the live connection and stays disconnected until
    /// [`reconnect`](Self::reconnect).
    pub async fn disconnect(&self) {
        self.shared.shutdown_requested.store(true, Ordering::Release);
        self.shared.cancel_connection();
        self.shared.link.lock().await.writer = None;
        self.shared.wake.notify_one();
        tracing::info!(server_address = %self.shared.options.server_address, "Disconnect requested");
    }

    /// Connects again immediately, replacing any live connection.
    pub async fn reconnect(&self) {
        self.shared.shutdown_requested.store(false, Ordering::Release);
        self.shared.cancel_connection();
        {
            let mut link = self.shared.link.lock().await;
            link.current_backoff = self.shared.options.initial_backoff;
            link.writer = None;
        }
        self.shared.wake.notify_one();
        self.start();
    }

    /// Stops the connection loop for good. Queued messages are discarded.
    pub async fn close(&self) {
        self.shared.closed.cancel();
        self.shared.cancel_connection();
        let mut link = self.shared.link.lock().await;
        link.writer = None;
        link.pending.clear();
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Number of messages waiting for a connection.
    pub async fn pending_len(&self) -> usize {
        self.shared.link.lock().await.pending.len()
    }

    /// Handle to give to code that should not keep the runtime alive.
    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Runtime settings.
    pub fn options(&self) -> &ClientOptions {
        &self.shared.options
    }
}

impl fmt::Debug for ClientRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRuntime")
            .field("server_address", &self.shared.options.server_address)
            .field("state", &self.state())
            .finish()
    }
}

impl ClientHandle {
    /// Sends `message`, or queues it while disconnected.
    pub async fn send(&self, message: &str) -> Result<SendOutcome> {
        let shared = self.shared.upgrade().ok_or(ProtocolError::NotConnected)?;
        let frame = Bytes::from(shared.codec.encode_str(message)?);
        shared.send_frame(frame).await
    }

    /// Sends a keepalive frame on the live connection.
    pub async fn send_keepalive(&self) -> Result<()> {
        let shared = self.shared.upgrade().ok_or(ProtocolError::NotConnected)?;
        shared.send_keepalive().await
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared
            .upgrade()
            .map(|shared| *shared.state_tx.borrow())
            .unwrap_or(ConnectionState::Disconnected)
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("state", &self.state())
            .finish()
    }
}

impl Shared {
    /// Updates the connection state. Unchanged states are not republished.
    fn set_state(&self, new_state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == new_state {
                return false;
            }
            *state = new_state;
            true
        });

        if changed {
            tracing::debug!(state = ?new_state, "Connection state changed");
        }
    }

    /// Registers the token of a new connection, or clears it with `None`.
    fn set_connection(&self, token: Option<CancellationToken>) {
        *self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Cancels the live connection, if any.
    fn cancel_connection(&self) {
        let token = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    async fn send_frame(&self, mut frame: Bytes) -> Result<SendOutcome> {
        loop {
            let mut link = self.link.lock().await;
            let Some(writer) = link.writer.clone() else {
                let capacity = self.options.pending_capacity;
                if link.pending.len() >= capacity {
                    tracing::warn!(capacity, "Pending queue full, dropping message");
                    return Err(ProtocolError::QueueFull { capacity });
                }

                link.pending.push_back(frame);
                return Ok(SendOutcome::Queued);
            };
            drop(link);

            // Waits for writer capacity without holding the lock. A cancelled
            // connection drops its receiver, which hands the frame back.
            match writer.send(frame).await {
                Ok(()) => return Ok(SendOutcome::Sent),
                Err(mpsc::error::SendError(returned)) => {
                    frame = returned;
                    let mut link = self.link.lock().await;
                    if link
                        .writer
                        .as_ref()
                        .is_some_and(|current| current.same_channel(&writer))
                    {
                        link.writer = None;
                    }
                }
            }
        }
    }

    async fn send_keepalive(&self) -> Result<()> {
        let writer = self
            .link
            .lock()
            .await
            .writer
            .clone()
            .ok_or(ProtocolError::NotConnected)?;

        writer
            .send(Bytes::copy_from_slice(&FrameCodec::keepalive_frame()))
            .await
            .map_err(|_| ProtocolError::NotConnected)
    }

    /// Runs the connection loop with reconnection support.
    async fn run_connection_loop(self: Arc<Self>) {
        loop {
            if self.closed.is_cancelled() {
                break;
            }

            if self.shutdown_requested.load(Ordering::Acquire) {
                self.set_state(ConnectionState::Disconnected);
                if !self.wait_for_wake().await {
                    break;
                }
                continue;
            }

            self.set_state(ConnectionState::Connecting);
            let address = self.options.server_address.clone();

            let connect = tokio::select! {
                _ = self.closed.cancelled() => break,
                result = TcpStream::connect(&address) => result,
            };
            match connect {
                Ok(stream) => self.run_connection(stream).await,
                Err(e) => {
                    tracing::warn!(server_address = %address, error = %e, "Connection attempt failed");
                }
            }

            if self.closed.is_cancelled() {
                break;
            }

            // Check if we should reconnect
            let backoff = {
                let mut link = self.link.lock().await;
                let backoff = link.current_backoff;
                link.current_backoff = next_backoff(
                    backoff,
                    self.options.backoff_multiplier,
                    self.options.max_backoff,
                );
                backoff
            };
            let should_reconnect = self.options.always_reconnect
                && !self.shutdown_requested.load(Ordering::Acquire);

            if !should_reconnect {
                self.set_state(ConnectionState::Disconnected);
                if !self.wait_for_wake().await {
                    break;
                }
                continue;
            }

            self.set_state(ConnectionState::Reconnecting);
            tracing::info!(server_address = %address, "Reconnecting in {:?}", backoff);
            tokio::select! {
                _ = self.closed.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
                _ = self.wake.notified() => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::debug!("Connection loop stopped");
    }

    /// Parks until `reconnect` or `close`. Returns `false` when closed.
    async fn wait_for_wake(&self) -> bool {
        tokio::select! {
            _ = self.closed.cancelled() => false,
            _ = self.wake.notified() => true,
        }
    }

    /// Drives one established connection until it ends.
    async fn run_connection(self: &Arc<Self>, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let (mut reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(self.options.outbound_capacity);
        let token = self.closed.child_token();
        self.set_connection(Some(token.clone()));
        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, token.clone()));

        if !self.publish_connection(outbound_tx, &token).await {
            token.cancel();
            self.set_connection(None);
            let _ = writer_task.await;
            return;
        }

        let handle = ClientHandle {
            shared: Arc::downgrade(self),
        };
        let mut reassembler =
            FrameReassembler::new(self.codec, self.options.protocol.max_message_size);
        let mut buf = vec![0u8; self.options.read_buffer_size];

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        tracing::info!(server_address = %self.options.server_address, "Server closed connection");
                        break;
                    }
                    Ok(n) => {
                        let result = reassembler.feed(&buf[..n], |event| self.dispatch(&handle, event));
                        if let Err(e) = result {
                            tracing::warn!(
                                server_address = %self.options.server_address,
                                error = %e,
                                "Protocol violation from server, dropping connection"
                            );
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(server_address = %self.options.server_address, error = %e, "Read failed");
                        break;
                    }
                }
            }
        }

        token.cancel();
        self.set_connection(None);
        self.link.lock().await.writer = None;
        if let Err(e) = writer_task.await {
            tracing::warn!(error = %e, "Writer task failed");
        }
    }

    /// Sends the classification token, flushes the pending queue and makes
    /// the writer visible to `send`, all under the link lock.
    ///
    /// Returns `false` if the connection was cancelled first. Frames not yet
    /// handed to the writer stay queued.
    async fn publish_connection(
        &self,
        outbound: mpsc::Sender<Bytes>,
        token: &CancellationToken,
    ) -> bool {
        let mut link = self.link.lock().await;
        if self.shutdown_requested.load(Ordering::Acquire) || token.is_cancelled() {
            return false;
        }

        if let Some(client_type) = &self.options.client_type {
            let frame = match self.codec.encode_str(client_type) {
                Ok(frame) => Bytes::from(frame),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode client type");
                    return false;
                }
            };
            match reserve(&outbound, token).await {
                Some(permit) => permit.send(frame),
                None => return false,
            }
        }

        let queued = link.pending.len();
        while !link.pending.is_empty() {
            let Some(permit) = reserve(&outbound, token).await else {
                return false;
            };
            if let Some(frame) = link.pending.pop_front() {
                permit.send(frame);
            }
        }

        link.writer = Some(outbound);
        link.current_backoff = self.options.initial_backoff;
        self.set_state(ConnectionState::Connected);

        tracing::info!(
            server_address = %self.options.server_address,
            client_type = ?self.options.client_type,
            flushed = queued,
            "Connected"
        );
        true
    }

    fn dispatch(&self, handle: &ClientHandle, event: FrameEvent) {
        match event {
            FrameEvent::Message(payload) => match String::from_utf8(payload.to_vec()) {
                Ok(text) => match &self.handler {
                    Some(handler) => handler.handle_message(handle, &text),
                    None => tracing::debug!(
                        server_address = %self.options.server_address,
                        "Received: {}",
                        text
                    ),
                },
                Err(e) => {
                    let err = ProtocolError::from(e);
                    tracing::warn!(
                        server_address = %self.options.server_address,
                        error = %err,
                        "Dropping undecodable message"
                    );
                }
            },
            FrameEvent::Corrupt(err) => {
                tracing::warn!(
                    server_address = %self.options.server_address,
                    error = %err,
                    "Dropping undecodable message"
                );
            }
        }
    }
}

/// Next reconnect delay, capped at `max`.
///
/// Products that do not fit a `Duration` (non-finite, negative or too large)
/// saturate at the cap.
fn next_backoff(current: Duration, multiplier: f64, max: Duration) -> Duration {
    Duration::try_from_secs_f64(current.as_secs_f64() * multiplier)
        .map_or(max, |next| next.min(max))
}

/// Waits for room in the writer channel unless the connection is cancelled.
async fn reserve<'a>(
    outbound: &'a mpsc::Sender<Bytes>,
    token: &CancellationToken,
) -> Option<mpsc::Permit<'a, Bytes>> {
    tokio::select! {
        _ = token.cancelled() => None,
        permit = outbound.reserve() => permit.ok(),
    }
}

async fn write_loop(
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

        // A peer that stops reading must not pin this task past cancellation
        let written = tokio::select! {
            _ = token.cancelled() => break,
            written = writer.write_all(&frame) => written,
        };
        if let Err(e) = written {
            tracing::warn!(error = %e, "Write failed");
            token.cancel();
            break;
        }
    }

    drop(outbound);
    let _ = writer.shutdown().await;
}
