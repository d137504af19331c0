//! Binary protocol between room transport sessions and the signaling relay.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room_id  │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ len+utf8 │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Every (re)connect runs the same handshake:
//!
//! ```text
//! client                        relay
//!   │── PeerJoined ───────────────►│
//!   │── SyncStep1 (client sv) ────►│
//!   │◄──────────── SyncStep2 (diff)│   client is now "synced"
//!   │◄──────── SyncStep1 (relay sv)│
//!   │── SyncStep2 (offline edits) ►│
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector, asks the other side for what it is missing
    SyncStep1 = 1,
    /// Yrs state diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental CRDT update
    Update = 3,
    /// Encoded `AwarenessMessage`
    Awareness = 4,
    /// First frame of every session, carries `PeerInfo`
    PeerJoined = 5,
    /// Relay notice that a peer's socket closed
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Feature namespaces sharing one signaling server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKind {
    /// Shared text editor, one room per file
    Editor,
    /// Shared command-runner console
    Terminal,
    /// Save/restore history panel
    History,
}

impl RoomKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            RoomKind::Editor => "editor",
            RoomKind::Terminal => "terminal",
            RoomKind::History => "history",
        }
    }
}

/// Room identifier: `<feature-prefix>-<repositoryId>[-<subpath>]`.
///
/// Unrelated features never collide on the same replicated document
/// because the prefix is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn namespaced(kind: RoomKind, repository_id: &str, subpath: Option<&str>) -> Self {
        match subpath {
            Some(sub) if !sub.is_empty() => {
                Self(format!("{}-{}-{}", kind.prefix(), repository_id, sub))
            }
            _ => Self(format!("{}-{}", kind.prefix(), repository_id)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for RoomId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Transport-level identity of one room session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub user_id: String,
    pub name: String,
}

impl PeerInfo {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), user_id, name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            user_id: user_id.into(),
            name: name.into(),
        }
    }

    pub fn anonymous(peer_id: Uuid) -> Self {
        Self::with_id(peer_id, peer_id.to_string(), "Anonymous")
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room_id: String,
    /// Sender-local counter, informational only; CRDT merges need no order
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn build(msg_type: MessageType, peer_id: Uuid, room_id: &RoomId, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room_id: room_id.as_str().to_string(),
            clock: 0,
            payload,
        }
    }

    /// Create an incremental update message.
    pub fn update(peer_id: Uuid, room_id: &RoomId, clock: u64, yrs_update: Vec<u8>) -> Self {
        let mut msg = Self::build(MessageType::Update, peer_id, room_id, yrs_update);
        msg.clock = clock;
        msg
    }

    pub fn sync_step1(peer_id: Uuid, room_id: &RoomId, state_vector: Vec<u8>) -> Self {
        Self::build(MessageType::SyncStep1, peer_id, room_id, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, room_id: &RoomId, state_diff: Vec<u8>) -> Self {
        Self::build(MessageType::SyncStep2, peer_id, room_id, state_diff)
    }

    /// Create an awareness message from an already encoded `AwarenessMessage`.
    pub fn awareness(peer_id: Uuid, room_id: &RoomId, clock: u64, encoded: Vec<u8>) -> Self {
        let mut msg = Self::build(MessageType::Awareness, peer_id, room_id, encoded);
        msg.clock = clock;
        msg
    }

    pub fn peer_joined(info: &PeerInfo, room_id: &RoomId) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::build(MessageType::PeerJoined, info.peer_id, room_id, payload))
    }

    pub fn peer_left(peer_id: Uuid, room_id: &RoomId) -> Self {
        Self::build(MessageType::PeerLeft, peer_id, room_id, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::build(MessageType::Ping, peer_id, &RoomId::new(""), Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::build(MessageType::Pong, peer_id, &RoomId::new(""), Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse peer info payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(info)
    }

    pub fn room(&self) -> RoomId {
        RoomId::new(self.room_id.clone())
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type: {0:?}")]
    InvalidMessageType(MessageType),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_roundtrip() {
        let peer = Uuid::new_v4();
        let room = RoomId::new("editor-repo1-main.rs");
        let msg = SyncMessage::update(peer, &room, 42, vec![1, 2, 3, 4, 5]);

        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.room(), room);
        assert_eq!(decoded.clock, 42);
    }

    #[test]
    fn test_peer_joined_carries_info() {
        let info = PeerInfo::new("u-1", "Alice");
        let room = RoomId::new("terminal-repo1");

        let msg = SyncMessage::peer_joined(&info, &room).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::PeerJoined);
        assert_eq!(decoded.peer_info().unwrap(), info);
    }

    #[test]
    fn test_peer_info_on_wrong_type() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert_eq!(
            msg.peer_info(),
            Err(ProtocolError::InvalidMessageType(MessageType::Ping))
        );
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_room_id_namespacing() {
        let editor = RoomId::namespaced(RoomKind::Editor, "repo1", Some("src/lib.rs"));
        let terminal = RoomId::namespaced(RoomKind::Terminal, "repo1", None);
        let history = RoomId::namespaced(RoomKind::History, "repo1", Some(""));

        assert_eq!(editor.as_str(), "editor-repo1-src/lib.rs");
        assert_eq!(terminal.as_str(), "terminal-repo1");
        assert_eq!(history.as_str(), "history-repo1");
        assert_ne!(terminal, history);
    }

    #[test]
    fn test_update_size_efficient() {
        let msg = SyncMessage::update(Uuid::new_v4(), &RoomId::new("editor-r-f"), 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 150, "Encoded size {} too large", encoded.len());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::SyncStep2 as u8, 2);
        assert_eq!(MessageType::Update as u8, 3);
        assert_eq!(MessageType::Awareness as u8, 4);
        assert_eq!(MessageType::PeerJoined as u8, 5);
        assert_eq!(MessageType::PeerLeft as u8, 6);
        assert_eq!(MessageType::Ping as u8, 7);
        assert_eq!(MessageType::Pong as u8, 8);
    }
}
