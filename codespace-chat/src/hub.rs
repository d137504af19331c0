//! Room membership, per-user de-duplication and message fan-out.
//!
//! ```text
//! connect(user) ──► [user has a live socket] ──► Close old socket, drop it
//!               ──► register ──► history to newcomer
//!                            ──► join notice + user_list to the room
//! message       ──► append history ──► every other socket in the room
//! leave / close ──► unregister ──► leave notice + user_list to the room
//! ```
//!
//! The hub never touches a socket directly: each connection owns a writer
//! task fed by an unbounded channel, so nothing here awaits. A failed send
//! means the writer is gone and only that socket is dropped.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ChatFrame, ChatMessage, ConnectParams, FrameType, OnlineUser, ProtocolError};

pub type ConnectionId = u64;

/// Sending half of a connection's writer task.
pub type Outbox = mpsc::UnboundedSender<Message>;

/// What the connection loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

struct Socket {
    user: OnlineUser,
    room_id: String,
    outbox: Outbox,
}

#[derive(Default)]
struct ChatRoom {
    members: BTreeSet<ConnectionId>,
    history: VecDeque<ChatMessage>,
}

impl ChatRoom {
    /// Nothing left worth keeping: no sockets and no messages.
    fn is_vacant(&self) -> bool {
        self.members.is_empty() && self.history.is_empty()
    }
}

#[derive(Default)]
struct HubState {
    sockets: HashMap<ConnectionId, Socket>,
    rooms: HashMap<String, ChatRoom>,
    by_user: HashMap<String, ConnectionId>,
}

impl HubState {
    /// Forget a socket without notifying anyone. Returns it if it was live.
    /// A room left without sockets or history is dropped.
    fn unregister(&mut self, id: ConnectionId) -> Option<Socket> {
        let socket = self.sockets.remove(&id)?;
        if let Some(room) = self.rooms.get_mut(&socket.room_id) {
            room.members.remove(&id);
            if room.is_vacant() {
                self.rooms.remove(&socket.room_id);
            }
        }
        if self.by_user.get(&socket.user.user_id) == Some(&id) {
            self.by_user.remove(&socket.user.user_id);
        }
        Some(socket)
    }

    /// Distinct identities of the sockets currently in the room.
    fn online_users(&self, room_id: &str) -> Vec<OnlineUser> {
        let Some(room) = self.rooms.get(room_id) else {
            return Vec::new();
        };
        let users: BTreeSet<&OnlineUser> = room
            .members
            .iter()
            .filter_map(|id| self.sockets.get(id))
            .map(|socket| &socket.user)
            .collect();
        let mut users: Vec<OnlineUser> = users.into_iter().cloned().collect();
        users.sort_by(|a, b| a.user_name.cmp(&b.user_name).then_with(|| a.user_id.cmp(&b.user_id)));
        users
    }

    /// Send `frame` to every socket in the room except `exclude`. Sockets
    /// whose writer is gone are dropped; the others still get the frame.
    fn broadcast(&mut self, room_id: &str, frame: &ChatFrame, exclude: Option<ConnectionId>) -> usize {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to encode {:?} frame: {e}", frame.frame_type);
                return 0;
            }
        };
        let Some(room) = self.rooms.get(room_id) else {
            return 0;
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for id in room.members.iter().filter(|id| Some(**id) != exclude) {
            let Some(socket) = self.sockets.get(id) else {
                continue;
            };
            if socket.outbox.send(Message::Text(text.clone().into())).is_ok() {
                delivered += 1;
            } else {
                failed.push(*id);
            }
        }

        for id in failed {
            if let Some(socket) = self.unregister(id) {
                log::warn!("Dropped dead socket {id} ({}) from room {room_id}", socket.user.user_id);
            }
        }
        delivered
    }

    fn broadcast_user_list(&mut self, room_id: &str) {
        let users = self.online_users(room_id);
        if let Some(frame) = built(ChatFrame::user_list(room_id, &users)) {
            self.broadcast(room_id, &frame, None);
        }
    }
}

fn built(frame: Result<ChatFrame, ProtocolError>) -> Option<ChatFrame> {
    frame
        .map_err(|e| log::error!("Failed to build frame: {e}"))
        .ok()
}

fn send_to(outbox: &Outbox, frame: &ChatFrame) -> bool {
    match frame.encode() {
        Ok(text) => outbox.send(Message::Text(text.into())).is_ok(),
        Err(e) => {
            log::error!("Failed to encode {:?} frame: {e}", frame.frame_type);
            false
        }
    }
}

fn close(outbox: &Outbox, code: CloseCode, reason: &'static str) {
    let _ = outbox.send(Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    })));
}

/// In-memory chat rooms. A room with history lives as long as the hub; one
/// that never got a message goes away with its last socket.
pub struct ChatHub {
    history_limit: usize,
    next_id: AtomicU64,
    state: Mutex<HubState>,
}

impl ChatHub {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit,
            next_id: AtomicU64::new(1),
            state: Mutex::new(HubState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// Register a new socket. A previous live socket of the same user is
    /// closed and removed first, so each user has at most one.
    pub fn connect(&self, params: ConnectParams, outbox: Outbox) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let room_id = params.room_id;
        let user = params.user;
        let mut state = self.lock();

        if let Some(previous) = state.by_user.get(&user.user_id).copied() {
            if let Some(old) = state.unregister(previous) {
                close(&old.outbox, CloseCode::Policy, "replaced by a newer connection");
                log::info!(
                    "User {} reconnected, closed socket {previous} in {}",
                    user.user_id,
                    old.room_id
                );
                if old.room_id != room_id {
                    state.broadcast_user_list(&old.room_id);
                }
            }
        }

        let room = state.rooms.entry(room_id.clone()).or_default();
        room.members.insert(id);
        let history: Vec<ChatMessage> = room.history.iter().cloned().collect();
        state.by_user.insert(user.user_id.clone(), id);
        state.sockets.insert(
            id,
            Socket {
                user: user.clone(),
                room_id: room_id.clone(),
                outbox: outbox.clone(),
            },
        );

        if let Some(frame) = built(ChatFrame::message_history(&room_id, &history)) {
            send_to(&outbox, &frame);
        }
        state.broadcast(&room_id, &ChatFrame::presence_notice(FrameType::Join, &room_id, &user), None);
        state.broadcast_user_list(&room_id);

        log::info!("{} ({}) joined chat room {room_id} as socket {id}", user.user_name, user.user_id);
        id
    }

    /// Handle one client frame.
    pub fn handle_frame(&self, id: ConnectionId, frame: ChatFrame) -> Flow {
        match frame.frame_type {
            FrameType::Message => {
                let Some(text) = frame.message_text() else {
                    log::warn!("Message frame without text from socket {id}");
                    return Flow::Continue;
                };
                self.post(id, text);
                Flow::Continue
            }
            FrameType::Leave => {
                let outbox = self.lock().sockets.get(&id).map(|s| s.outbox.clone());
                if let Some(outbox) = outbox {
                    self.disconnect(id);
                    close(&outbox, CloseCode::Normal, "left");
                }
                Flow::Close
            }
            FrameType::UserList | FrameType::MessageHistory => {
                self.reply_snapshot(id, frame.frame_type);
                Flow::Continue
            }
            FrameType::Join => {
                log::debug!("Ignoring join frame from socket {id}, membership comes from the upgrade");
                Flow::Continue
            }
        }
    }

    /// Append to history and send to every other socket in the room.
    /// Returns how many sockets got it, or `None` if `id` is not live.
    pub fn post(&self, id: ConnectionId, text: &str) -> Option<usize> {
        let mut state = self.lock();
        let (room_id, message) = {
            let socket = state.sockets.get(&id)?;
            (socket.room_id.clone(), ChatMessage::new(&socket.user, text))
        };

        if let Some(room) = state.rooms.get_mut(&room_id) {
            room.history.push_back(message.clone());
            while room.history.len() > self.history_limit {
                room.history.pop_front();
            }
        }
        let frame = built(ChatFrame::message(&room_id, &message))?;
        let delivered = state.broadcast(&room_id, &frame, Some(id));
        log::debug!("Message from {} in {room_id} delivered to {delivered}", message.user_id);
        Some(delivered)
    }

    fn reply_snapshot(&self, id: ConnectionId, kind: FrameType) {
        let state = self.lock();
        let Some(socket) = state.sockets.get(&id) else {
            return;
        };
        let frame = if kind == FrameType::UserList {
            built(ChatFrame::user_list(&socket.room_id, &state.online_users(&socket.room_id)))
        } else {
            let history: Vec<ChatMessage> = state
                .rooms
                .get(&socket.room_id)
                .map(|room| room.history.iter().cloned().collect())
                .unwrap_or_default();
            built(ChatFrame::message_history(&socket.room_id, &history))
        };
        if let Some(frame) = frame {
            send_to(&socket.outbox, &frame);
        }
    }

    /// Leave processing for a socket. Idempotent; a socket already replaced
    /// or removed is a no-op.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let mut state = self.lock();
        let Some(socket) = state.unregister(id) else {
            return false;
        };
        state.broadcast(
            &socket.room_id,
            &ChatFrame::presence_notice(FrameType::Leave, &socket.room_id, &socket.user),
            None,
        );
        state.broadcast_user_list(&socket.room_id);
        log::info!("{} left chat room {}", socket.user.user_id, socket.room_id);
        true
    }

    /// Send Close to every socket and forget them. History is kept.
    pub fn close_all(&self) -> usize {
        let mut state = self.lock();
        let count = state.sockets.len();
        for (_, socket) in state.sockets.drain() {
            close(&socket.outbox, CloseCode::Away, "server shutting down");
        }
        state.by_user.clear();
        state.rooms.retain(|_, room| {
            room.members.clear();
            !room.history.is_empty()
        });
        count
    }

    pub fn online_users(&self, room_id: &str) -> Vec<OnlineUser> {
        self.lock().online_users(room_id)
    }

    pub fn history(&self, room_id: &str) -> Vec<ChatMessage> {
        self.lock()
            .rooms
            .get(room_id)
            .map(|room| room.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn socket_count(&self, room_id: &str) -> usize {
        self.lock().rooms.get(room_id).map_or(0, |room| room.members.len())
    }

    pub fn connection_count(&self) -> usize {
        self.lock().sockets.len()
    }

    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    /// Live socket of `user_id`, if any.
    pub fn socket_of(&self, user_id: &str) -> Option<ConnectionId> {
        self.lock().by_user.get(user_id).copied()
    }
}
