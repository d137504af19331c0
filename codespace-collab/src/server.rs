//! Signaling relay: the WebSocket server every room transport dials.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── RelayRoom (room id) ── Yrs Doc ── BroadcastGroup
//! Client B ──┘          │
//!                       └── last awareness State per peer (replayed to newcomers)
//!                                     │
//!                          ┌──────────┼───────────┐
//!                          ▼          ▼           ▼
//!                       Client A   Client B    Client C
//! ```
//!
//! The relay keeps an authoritative document per room so a late joiner can
//! catch up from it, and fans every update out to the other peers. A room
//! lives as long as it has peers; its state is not persisted.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Envelope};
use crate::config::{load_prefixed, ConfigError};
use crate::doc::{DocError, ReplicatedDoc};
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, RoomId, SyncMessage};

pub const SERVER_ENV_PREFIX: &str = "CODESPACE_SIGNAL_";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Doc(#[from] DocError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Room {0} is full")]
    RoomFull(RoomId),
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_max_peers_per_room")]
    pub max_peers_per_room: usize,
    /// Frames buffered per peer before a slow peer loses some
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl ServerConfig {
    /// `CODESPACE_SIGNAL_BIND_ADDR` etc.
    pub fn from_env() -> Result<Self, ConfigError> {
        load_prefixed(SERVER_ENV_PREFIX)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_peers_per_room: default_max_peers_per_room(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_max_peers_per_room() -> usize {
    100
}

fn default_broadcast_capacity() -> usize {
    256
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

struct RelayRoom {
    doc: ReplicatedDoc,
    broadcast: BroadcastGroup,
    awareness: Mutex<HashMap<Uuid, Arc<Vec<u8>>>>,
}

impl RelayRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            doc: ReplicatedDoc::new(),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            awareness: Mutex::new(HashMap::new()),
        }
    }

    fn awareness(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<Vec<u8>>>> {
        self.awareness.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Joined {
    peer: PeerInfo,
    room_id: RoomId,
    room: Arc<RelayRoom>,
}

/// Per-socket state. `id` is assigned by the relay and never reused, so a
/// peer that reconnects before its old socket is reaped gets two sessions.
struct PeerSession {
    id: Uuid,
    joined: Option<Joined>,
    rx: Option<broadcast::Receiver<Envelope>>,
}

impl PeerSession {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            joined: None,
            rx: None,
        }
    }

    fn peer_id(&self) -> Option<Uuid> {
        self.joined.as_ref().map(|j| j.peer.peer_id)
    }
}

struct RelayState {
    config: ServerConfig,
    rooms: RwLock<HashMap<RoomId, Arc<RelayRoom>>>,
    stats: RwLock<ServerStats>,
}

/// The signaling relay server.
pub struct SignalServer {
    state: Arc<RelayState>,
}

impl SignalServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: Arc::new(RelayState {
                config,
                rooms: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.state.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        self.state.stats.read().await.clone()
    }

    pub async fn room_count(&self) -> usize {
        self.state.rooms.read().await.len()
    }

    /// Current text of `field` in a room's authoritative document.
    pub async fn room_text(&self, room_id: &RoomId, field: &str) -> Option<String> {
        let rooms = self.state.rooms.read().await;
        rooms.get(room_id).map(|room| room.doc.text(field))
    }

    /// Serve until the process is killed.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then close every socket.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        log::info!("Signal server listening on {}", self.state.config.bind_addr);
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let state = self.state.clone();
                    let stop = stop_rx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = state.handle_connection(stream, addr, stop).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }

        let _ = stop_tx.send(true);
        log::info!("Signal server stopped");
        Ok(())
    }
}

async fn next_envelope(rx: &mut Option<broadcast::Receiver<Envelope>>) -> Result<Envelope, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        // Not joined yet: nothing to forward
        None => std::future::pending().await,
    }
}

impl RelayState {
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        stop: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session = PeerSession::new();
        let outcome = self.pump(ws_stream, addr, &mut session, stop).await;
        self.leave(&mut session).await;
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        outcome
    }

    async fn pump(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        session: &mut PeerSession,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    return Ok(());
                }

                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = self.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                continue;
                            }
                        };
                        match self.handle(session, sync_msg).await {
                            Ok(replies) => {
                                for reply in replies {
                                    ws_sender.send(Message::Binary(reply.into())).await?;
                                }
                            }
                            Err(ServerError::RoomFull(room_id)) => {
                                log::warn!("Rejecting {addr}: room {room_id} is full");
                                let _ = ws_sender.send(Message::Close(None)).await;
                                return Err(ServerError::RoomFull(room_id));
                            }
                            Err(e) => log::warn!("Dropping frame from {addr}: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                },

                envelope = next_envelope(&mut session.rx) => match envelope {
                    Ok(envelope) => {
                        if envelope.is_from(&session.id) {
                            continue;
                        }
                        ws_sender.send(Message::Binary(envelope.bytes.to_vec().into())).await?;
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Peer {:?} lagged by {n} messages", session.peer_id());
                        if let Some(joined) = &session.joined {
                            joined.room.broadcast.record_dropped(n);
                        }
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    /// Process one frame; returns frames to send back to this socket only.
    async fn handle(&self, session: &mut PeerSession, msg: SyncMessage) -> Result<Vec<Vec<u8>>, ServerError> {
        match msg.msg_type {
            MessageType::PeerJoined => return self.join(session, msg).await,
            MessageType::Ping => return Ok(vec![SyncMessage::pong(Uuid::nil()).encode()?]),
            _ => {}
        }

        let Some(joined) = session.joined.as_ref() else {
            log::debug!("Ignoring {:?} before PeerJoined", msg.msg_type);
            return Ok(Vec::new());
        };
        if msg.room_id != joined.room_id.as_str() {
            log::warn!("Ignoring frame for {} on a {} socket", msg.room_id, joined.room_id);
            return Ok(Vec::new());
        }
        let peer_id = joined.peer.peer_id;
        let session_id = session.id;
        let room = &joined.room;

        match msg.msg_type {
            MessageType::SyncStep1 => {
                let diff = room.doc.diff(&msg.payload)?;
                let answer = SyncMessage::sync_step2(Uuid::nil(), &joined.room_id, diff);
                let ask = SyncMessage::sync_step1(Uuid::nil(), &joined.room_id, room.doc.state_vector());
                Ok(vec![answer.encode()?, ask.encode()?])
            }
            MessageType::SyncStep2 | MessageType::Update => {
                room.doc.apply_update(&msg.payload)?;
                let relay = SyncMessage::update(peer_id, &joined.room_id, msg.clock, msg.payload);
                room.broadcast.broadcast(session_id, &relay)?;
                Ok(Vec::new())
            }
            MessageType::Awareness => {
                let awareness = AwarenessMessage::decode(&msg.payload)?;
                let relay = SyncMessage::awareness(peer_id, &joined.room_id, msg.clock, msg.payload);
                let bytes = Arc::new(relay.encode()?);
                match awareness {
                    AwarenessMessage::State { .. } => {
                        room.awareness().insert(peer_id, bytes.clone());
                    }
                    AwarenessMessage::Leave => {
                        room.awareness().remove(&peer_id);
                    }
                }
                room.broadcast.broadcast_raw(session_id, bytes);
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn join(&self, session: &mut PeerSession, msg: SyncMessage) -> Result<Vec<Vec<u8>>, ServerError> {
        if session.joined.is_some() {
            log::debug!("Duplicate PeerJoined from {}", msg.peer_id);
            return Ok(Vec::new());
        }
        let info = msg
            .peer_info()
            .unwrap_or_else(|_| PeerInfo::anonymous(msg.peer_id));
        let room_id = msg.room();

        // Registration happens under the rooms lock so a concurrent leave
        // cannot remove the room in between.
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(room_id.clone())
            .or_insert_with(|| Arc::new(RelayRoom::new(self.config.broadcast_capacity)))
            .clone();

        if room.broadcast.peer_count().await >= self.config.max_peers_per_room {
            if room.broadcast.peer_count().await == 0 {
                rooms.remove(&room_id);
            }
            return Err(ServerError::RoomFull(room_id));
        }

        let rx = room.broadcast.add_peer(session.id, info.clone()).await;
        let room_count = rooms.len();
        drop(rooms);

        let replay: Vec<Vec<u8>> = room
            .awareness()
            .iter()
            .filter(|(peer, _)| **peer != info.peer_id)
            .map(|(_, bytes)| bytes.to_vec())
            .collect();

        let announce = SyncMessage::peer_joined(&info, &room_id)?;
        room.broadcast.broadcast(session.id, &announce)?;

        self.stats.write().await.active_rooms = room_count;
        log::info!("Peer {} ({}) joined room {}", info.name, info.peer_id, room_id);

        session.rx = Some(rx);
        session.joined = Some(Joined {
            peer: info,
            room_id,
            room,
        });
        Ok(replay)
    }

    async fn leave(&self, session: &mut PeerSession) {
        session.rx = None;
        let Some(joined) = session.joined.take() else {
            return;
        };
        let peer_id = joined.peer.peer_id;

        let mut rooms = self.rooms.write().await;
        joined.room.broadcast.remove_peer(&session.id).await;
        // A newer session of the same peer keeps its presence.
        if joined.room.broadcast.has_peer(&peer_id).await {
            log::debug!("Stale session of peer {peer_id} closed in {}", joined.room_id);
        } else {
            joined.room.awareness().remove(&peer_id);
            let _ = joined
                .room
                .broadcast
                .broadcast(session.id, &SyncMessage::peer_left(peer_id, &joined.room_id));
        }

        if joined.room.broadcast.peer_count().await == 0
            && rooms
                .get(&joined.room_id)
                .is_some_and(|current| Arc::ptr_eq(current, &joined.room))
        {
            rooms.remove(&joined.room_id);
            log::info!("Room {} removed (empty)", joined.room_id);
        }
        let room_count = rooms.len();
        drop(rooms);

        self.stats.write().await.active_rooms = room_count;
        log::info!("Peer {} left room {}", peer_id, joined.room_id);
    }
}
