//! Local development relay
//!
//! A minimal server speaking the socketchat wire format, for trying the
//! client without a deployed backend. Each connected peer is labelled
//! `peer-<port>`. A `ClientSendMessage` is turned into a `ServerSendMessage`
//! with the same id, timestamp and text and broadcast to every peer, the
//! sender included. Any other variant is answered with an `ErrorMessage`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use socketchat_core::{ErrorMessage, FrameBuffer, Message, ServerSendMessage, WireFormat};

use crate::config::RelayConfig;
use crate::error::{CliError, Result};

type Frame = Arc<Vec<u8>>;

struct Peer {
    label: String,
    outbox: mpsc::UnboundedSender<Frame>,
}

#[derive(Default)]
struct PeerTable {
    peers: Mutex<HashMap<u64, Peer>>,
}

impl PeerTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast(&self, frame: Frame) -> usize {
        let peers = self.lock();
        peers
            .values()
            .filter(|peer| peer.outbox.send(frame.clone()).is_ok())
            .count()
    }
}

// ----------------------------------------------------------------------------
// Relay
// ----------------------------------------------------------------------------

/// Development relay bound to a local address
pub struct Relay {
    listener: TcpListener,
    wire: WireFormat,
    peers: Arc<PeerTable>,
}

impl Relay {
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await.map_err(|e| {
            CliError::Relay(format!("Failed to bind {}: {}", config.bind_addr, e))
        })?;

        Ok(Self {
            listener,
            wire: WireFormat::new(config.max_frame_size),
            peers: Arc::new(PeerTable::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept peers until the task is cancelled
    ///
    /// Peer tasks belong to the relay; cancelling `run` cancels them and
    /// closes every peer connection.
    pub async fn run(self) -> Result<()> {
        info!("Relay listening on {}", self.local_addr()?);

        let mut tasks = JoinSet::new();
        let mut next_peer_id = 0u64;
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    next_peer_id += 1;
                    tasks.spawn(serve_peer(
                        next_peer_id,
                        stream,
                        addr,
                        self.peers.clone(),
                        self.wire,
                    ));
                }
                Some(finished) = tasks.join_next() => {
                    if let Err(e) = finished {
                        error!("Peer task failed: {}", e);
                    }
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Peer Handling
// ----------------------------------------------------------------------------

async fn serve_peer(
    id: u64,
    stream: TcpStream,
    addr: SocketAddr,
    peers: Arc<PeerTable>,
    wire: WireFormat,
) {
    let label = format!("peer-{}", addr.port());
    let (reader, writer) = stream.into_split();
    let (outbox, inbox) = mpsc::unbounded_channel::<Frame>();

    let connected = {
        let mut table = peers.lock();
        table.insert(
            id,
            Peer {
                label: label.clone(),
                outbox: outbox.clone(),
            },
        );
        table.len()
    };
    info!("{} joined from {} ({} connected)", label, addr, connected);

    let reading = {
        let label = &label;
        let peers = &peers;
        async move {
            if let Err(reason) = read_peer(reader, label, &outbox, peers, wire).await {
                warn!("Dropping {}: {}", label, reason);
            }
            let mut table = peers.lock();
            table.remove(&id);
            // Last sender gone; the writer drains and shuts down
            drop(outbox);
            table.len()
        }
    };

    let (remaining, ()) = tokio::join!(reading, write_peer(writer, inbox));
    info!("{} left ({} connected)", label, remaining);
}

/// Forward queued frames to one peer until every sender is dropped
async fn write_peer(mut writer: OwnedWriteHalf, mut inbox: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = inbox.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!("Write to peer failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Relay frames from one peer until it disconnects
async fn read_peer(
    mut reader: OwnedReadHalf,
    label: &str,
    outbox: &mpsc::UnboundedSender<Frame>,
    peers: &PeerTable,
    wire: WireFormat,
) -> std::result::Result<(), String> {
    let mut frames = FrameBuffer::new(wire);
    let mut chunk = vec![0u8; 8 * 1024];

    loop {
        let n = reader.read(&mut chunk).await.map_err(|e| e.to_string())?;
        if n == 0 {
            return Ok(());
        }
        frames.extend(&chunk[..n]);

        loop {
            match frames.next_message() {
                Ok(Some(Message::ClientSend(message))) => {
                    let echo = ServerSendMessage::echo_of(&message, label);
                    match wire.encode(&echo.into()) {
                        Ok(frame) => {
                            let reached = peers.broadcast(Arc::new(frame));
                            debug!("{} -> {} peers: {}", label, reached, message.id());
                        }
                        Err(e) => warn!("Failed to encode echo: {}", e),
                    }
                }
                Ok(Some(other)) => {
                    let reply = ErrorMessage::new(format!(
                        "unexpected {:?} message from client",
                        other.message_type()
                    ));
                    send_error(outbox, wire, reply);
                }
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    warn!("Undecodable frame from {}: {}", label, e);
                    send_error(outbox, wire, ErrorMessage::new(e.to_string()));
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }
}

fn send_error(outbox: &mpsc::UnboundedSender<Frame>, wire: WireFormat, reply: ErrorMessage) {
    match wire.encode(&reply.into()) {
        Ok(frame) => {
            let _ = outbox.send(Arc::new(frame));
        }
        Err(e) => warn!("Failed to encode error reply: {}", e),
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let labels: Vec<String> = self.peers.lock().values().map(|p| p.label.clone()).collect();
        f.debug_struct("Relay")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("peers", &labels)
            .finish()
    }
}
