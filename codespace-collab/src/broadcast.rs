//! Fan-out of relay frames to every other peer of a room.
//!
//! One tokio broadcast channel per room; every socket holds a receiver and
//! skips envelopes it sent itself. Frames are encoded once and shared.
//!
//! Membership is keyed by a relay-assigned session id, not by the client's
//! peer id: a reconnecting client briefly has two sessions with the same
//! peer id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// One encoded frame and the session it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

impl Envelope {
    pub fn is_from(&self, session_id: &Uuid) -> bool {
        self.from == *session_id
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per peer before a slow peer starts
    /// losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    pub async fn add_peer(&self, session_id: Uuid, info: PeerInfo) -> broadcast::Receiver<Envelope> {
        let mut peers = self.peers.write().await;
        peers.insert(session_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, session_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(session_id)
    }

    /// Encode once and send to every receiver. Returns the receiver count,
    /// sender included; receivers filter their own frames.
    pub fn broadcast(&self, from: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(from, bytes))
    }

    pub fn broadcast_raw(&self, from: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Envelope { from, bytes }).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver lost.
    pub fn record_dropped(&self, count: u64) {
        self.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Whether any session still belongs to `peer_id`.
    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.values().any(|p| p.peer_id == *peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
