//! Connection manager
//!
//! `SocketClient` owns the TCP socket. One background task reads frames and
//! hands decoded messages to the `DispatchRegistry`; any number of tasks may
//! write concurrently through an async lock around the write half, so frames
//! are never interleaved on the wire.
//!
//! A frame that fails to decode is logged and skipped. A transport fault
//! (EOF, reset, I/O error, unrecoverable framing) closes the connection; the
//! reason is kept and returned by the next operation. Nothing reconnects
//! automatically: calling `start_listening` again opens a fresh socket.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, trace, warn};

use socketchat_core::{
    ChatError, ClientSendMessage, ConnectionEvent, ConnectionState, FrameBuffer, Message,
    MonotonicTimeSource, Result, SystemTimeSource, TimeSource, TransportError, WireFormat,
};

use crate::config::ClientConfig;
use crate::dispatch::{DispatchRegistry, MessageListener, Subscription};

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Traffic counters for one client, cumulative across reconnects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Frames decoded and dispatched
    pub messages_received: u64,
    /// Frames discarded as undecodable
    pub frames_rejected: u64,
    /// Frames written to the server
    pub messages_sent: u64,
    /// Decoded messages that found no listener or subscriber
    pub messages_undelivered: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    rejected: AtomicU64,
    sent: AtomicU64,
}

// ----------------------------------------------------------------------------
// Dispatch Gate
// ----------------------------------------------------------------------------

thread_local! {
    /// Gate whose callback is running on this thread, as an address
    static DISPATCHING: Cell<usize> = const { Cell::new(0) };
}

/// Serializes callbacks against `close` for one session
///
/// A callback runs only while the gate is open and its lock is held, so once
/// `close` returns no callback of that session can start.
struct DispatchGate {
    open: AtomicBool,
    running: Mutex<()>,
}

impl DispatchGate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            running: Mutex::new(()),
        })
    }

    fn address(&self) -> usize {
        self as *const Self as usize
    }

    /// Deliver one message; false once the gate has been closed
    fn dispatch(&self, shared: &Shared, message: &Message) -> bool {
        let _running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }

        shared.counters.received.fetch_add(1, Ordering::Relaxed);
        let _marker = DispatchMarker::enter(self.address());
        shared.registry.dispatch(message);
        true
    }

    /// Close the gate and wait out a callback running on another thread
    ///
    /// Called from inside this gate's own callback it returns at once; the
    /// receive loop sees the closed gate before the next message.
    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if DISPATCHING.with(Cell::get) == self.address() {
            return;
        }
        drop(self.running.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Marks the current thread as running a gate's callback until dropped
struct DispatchMarker {
    previous: usize,
}

impl DispatchMarker {
    fn enter(address: usize) -> Self {
        Self {
            previous: DISPATCHING.with(|current| current.replace(address)),
        }
    }
}

impl Drop for DispatchMarker {
    fn drop(&mut self) {
        DISPATCHING.with(|current| current.set(self.previous));
    }
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// Resources of one open socket
struct Session {
    id: u64,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    shutdown: watch::Sender<bool>,
    gate: Arc<DispatchGate>,
    runtime: Handle,
}

impl Session {
    /// Stop callbacks and the receive loop, then shut the socket down
    ///
    /// Waits only for a callback already running on another thread; the
    /// socket shutdown itself is spawned.
    fn close(self) {
        self.gate.close();
        let _ = self.shutdown.send(true);
        let writer = self.writer;
        self.runtime.spawn(async move {
            if let Err(e) = writer.lock().await.shutdown().await {
                debug!("Socket shutdown: {}", e);
            }
        });
    }
}

/// State shared between the client handle and its receive task
struct Shared {
    session: Mutex<Option<Session>>,
    state: watch::Sender<ConnectionState>,
    registry: Arc<DispatchRegistry>,
    counters: Counters,
}

impl Shared {
    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Apply a state machine event; callers hold the session lock
    fn transition(&self, event: ConnectionEvent) -> Result<()> {
        let current = self.current_state();
        let from = current.state_name();
        let next = current.transition(event)?;
        debug!("Connection state {} -> {}", from, next);
        self.state.send_replace(next);
        Ok(())
    }

    /// Close the connection after a transport fault
    ///
    /// Ignored when `session_id` no longer names the open session, so a late
    /// fault from an old socket cannot close a newer one.
    fn fail(&self, session_id: u64, reason: String) {
        let session = {
            let mut session = self.lock_session();
            if session.as_ref().map(|s| s.id) != Some(session_id) {
                return;
            }
            if let Err(e) = self.transition(ConnectionEvent::TransportFault {
                reason: reason.clone(),
            }) {
                warn!("Fault on inactive connection: {}", e);
            }
            session.take()
        };

        error!("Connection lost: {}", reason);
        if let Some(session) = session {
            session.close();
        }
    }
}

// ----------------------------------------------------------------------------
// Socket Client
// ----------------------------------------------------------------------------

/// Client side of one socketchat connection
pub struct SocketClient {
    config: ClientConfig,
    wire: WireFormat,
    shared: Arc<Shared>,
    connect_lock: AsyncMutex<()>,
    next_session_id: AtomicU64,
    clock: MonotonicTimeSource<Arc<dyn TimeSource>>,
}

impl std::fmt::Debug for SocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketClient")
            .field("server_addr", &self.config.server_addr)
            .field("username", &self.config.username)
            .field("state", &self.state())
            .finish()
    }
}

impl SocketClient {
    /// Create a disconnected client
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_config(config))
    }

    pub(crate) fn from_config(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            session: Mutex::new(None),
            state,
            registry: Arc::new(DispatchRegistry::new(
                config.max_subscribers,
                config.subscriber_queue_capacity,
            )),
            counters: Counters::default(),
        });

        Self {
            wire: WireFormat::new(config.max_frame_size),
            config,
            shared,
            connect_lock: AsyncMutex::new(()),
            next_session_id: AtomicU64::new(1),
            clock: MonotonicTimeSource::new(Arc::new(SystemTimeSource)),
        }
    }

    /// Replace the clock used to stamp composed messages
    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.clock = MonotonicTimeSource::new(time_source);
        self
    }

    /// Compose a message from this client
    ///
    /// Timestamps of messages composed through one client never decrease,
    /// even when the wall clock steps backwards.
    pub fn compose(&self, text: impl Into<String>) -> ClientSendMessage {
        ClientSendMessage::with_time_source(text, &self.clock)
    }

    /// Process-wide client, created on first access
    pub fn get_client() -> Arc<SocketClient> {
        crate::facade::get_client()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Identity used to attribute outgoing messages
    pub fn username(&self) -> &str {
        &self.config.username
    }

    // ------------------------------------------------------------------------
    // Listener registration
    // ------------------------------------------------------------------------

    /// Replace the primary listener, returning the previous one
    pub fn set_message_listener(
        &self,
        listener: Arc<dyn MessageListener>,
    ) -> Option<Arc<dyn MessageListener>> {
        self.shared.registry.set_message_listener(listener)
    }

    pub fn clear_message_listener(&self) -> Option<Arc<dyn MessageListener>> {
        self.shared.registry.clear_message_listener()
    }

    /// Register a channel subscriber for inbound messages
    pub fn subscribe(&self) -> Result<Subscription> {
        Ok(self.shared.registry.subscribe()?)
    }

    pub fn registry(&self) -> &Arc<DispatchRegistry> {
        &self.shared.registry
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.shared.current_state()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Reason of the fault that closed the connection, if one did
    pub fn last_error(&self) -> Option<String> {
        self.state().close_reason().map(str::to_string)
    }

    /// Watch channel yielding every state change
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn stats(&self) -> ConnectionStats {
        let counters = &self.shared.counters;
        ConnectionStats {
            messages_received: counters.received.load(Ordering::Relaxed),
            frames_rejected: counters.rejected.load(Ordering::Relaxed),
            messages_sent: counters.sent.load(Ordering::Relaxed),
            messages_undelivered: self.shared.registry.undelivered(),
        }
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Open the socket and start the receive loop
    ///
    /// No-op when already active. Concurrent callers wait for the first one,
    /// so at most one socket is opened.
    pub async fn start_listening(&self) -> Result<()> {
        let _connecting = self.connect_lock.lock().await;

        let session_id = {
            let _session = self.shared.lock_session();
            if self.shared.current_state().is_active() {
                debug!("Already listening");
                return Ok(());
            }
            self.shared.transition(ConnectionEvent::Connect)?;
            self.next_session_id.fetch_add(1, Ordering::Relaxed)
        };

        let addr = self.config.server_addr.clone();
        info!("Connecting to {} as {}", addr, self.config.username);

        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(source) => {
                let _session = self.shared.lock_session();
                if self.shared.current_state() == ConnectionState::Connecting {
                    self.shared.transition(ConnectionEvent::ConnectFailed {
                        reason: source.to_string(),
                    })?;
                }
                return Err(TransportError::ConnectFailed { addr, source }.into());
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to disable Nagle's algorithm: {}", e);
        }

        let (reader, writer) = stream.into_split();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let runtime = Handle::current();

        let mut session = self.shared.lock_session();
        let state = self.shared.current_state();
        if state != ConnectionState::Connecting {
            // disconnect() won the race against the connect
            return Err(ChatError::connection_closed(
                state.close_reason().map(str::to_string),
            ));
        }
        self.shared.transition(ConnectionEvent::Established)?;

        let gate = DispatchGate::new();
        runtime.spawn(receive_loop(
            self.shared.clone(),
            session_id,
            reader,
            shutdown_rx,
            gate.clone(),
            self.wire,
            self.config.read_buffer_size,
        ));

        *session = Some(Session {
            id: session_id,
            writer: Arc::new(AsyncMutex::new(writer)),
            shutdown,
            gate,
            runtime,
        });

        info!("Connected to {}", addr);
        Ok(())
    }

    /// Encode and write one message as a single frame
    pub async fn write_to_server(&self, message: &ClientSendMessage) -> Result<()> {
        let frame = self.wire.encode(&Message::ClientSend(message.clone()))?;

        let (session_id, writer) = {
            let session = self.shared.lock_session();
            match session.as_ref() {
                Some(session) => (session.id, session.writer.clone()),
                None => return Err(self.unavailable()),
            }
        };

        let result = {
            let mut writer = writer.lock().await;
            match writer.write_all(&frame).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => {
                self.shared.counters.sent.fetch_add(1, Ordering::Relaxed);
                trace!("Sent message {} ({} bytes)", message.id(), frame.len());
                Ok(())
            }
            Err(e) => {
                self.shared.fail(session_id, format!("write failed: {}", e));
                if self.state().is_closed() {
                    Err(self.unavailable())
                } else {
                    Err(TransportError::Io(e).into())
                }
            }
        }
    }

    /// Close the socket and stop the receive loop
    ///
    /// Idempotent. Once it returns, no callback of this connection starts and
    /// none is still running on another thread. It never waits for the receive
    /// task itself, so calling it from inside a listener callback returns
    /// immediately.
    pub fn disconnect(&self) {
        let session = {
            let mut session = self.shared.lock_session();
            if self.shared.current_state().is_closed() {
                return;
            }
            if let Err(e) = self.shared.transition(ConnectionEvent::Disconnect) {
                warn!("Disconnect: {}", e);
            }
            session.take()
        };

        match session {
            Some(session) => {
                info!("Disconnecting from {}", self.config.server_addr);
                session.close();
            }
            None => debug!("Disconnect without an open socket"),
        }
    }

    fn unavailable(&self) -> ChatError {
        match self.state() {
            ConnectionState::Closed { reason } => ChatError::connection_closed(reason),
            _ => ChatError::not_connected(),
        }
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ----------------------------------------------------------------------------
// Receive Loop
// ----------------------------------------------------------------------------

async fn receive_loop(
    shared: Arc<Shared>,
    session_id: u64,
    mut reader: OwnedReadHalf,
    mut shutdown: watch::Receiver<bool>,
    gate: Arc<DispatchGate>,
    wire: WireFormat,
    read_buffer_size: usize,
) {
    let mut frames = FrameBuffer::new(wire);
    let mut chunk = vec![0u8; read_buffer_size];

    let fault = loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break None,

            read = reader.read(&mut chunk) => match read {
                Ok(0) => break Some("connection closed by server".to_string()),
                Ok(n) => {
                    frames.extend(&chunk[..n]);
                    match drain_frames(&shared, &mut frames, &gate) {
                        Ok(true) => {}
                        Ok(false) => break None,
                        Err(reason) => break Some(reason),
                    }
                }
                Err(e) => break Some(e.to_string()),
            },
        }
    };

    match fault {
        Some(reason) => shared.fail(session_id, reason),
        None => debug!("Receive loop for session {} stopped", session_id),
    }
}

/// Dispatch every complete frame in the buffer, in arrival order
///
/// Returns false once the gate is closed.
fn drain_frames(
    shared: &Shared,
    frames: &mut FrameBuffer,
    gate: &DispatchGate,
) -> core::result::Result<bool, String> {
    loop {
        match frames.next_message() {
            Ok(Some(message)) => {
                if !gate.dispatch(shared, &message) {
                    return Ok(false);
                }
            }
            Ok(None) => return Ok(true),
            Err(e) if e.is_recoverable() => {
                shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Discarding undecodable frame: {}", e);
            }
            Err(e) => return Err(format!("unrecoverable framing error: {}", e)),
        }
    }
}
