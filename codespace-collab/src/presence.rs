//! Presence: who else is in the room and where their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! PresenceEngine::set_cursor()
//!       │
//!       ▼
//! AwarenessMessage::State { identity, cursor, selection, timestamp }
//!       │   (SyncMessage::Awareness, also resent as heartbeat)
//!       ▼
//! relay ──► remote RoomConnection
//!       │
//!       ▼
//! AwarenessCache::apply()  ──►  watch<Vec<PresenceEntry>>  (replaced wholesale)
//!       ▲
//!       └── sweep(): evict entries not seen within the staleness window
//! ```
//!
//! Entries are keyed by transport peer id. A disconnect of the local
//! transport clears every remote entry; a remote peer that vanishes without
//! a `Leave` is removed either by the relay's `PeerLeft` or by the sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::ProtocolError;
use crate::registry::ParticipantHandle;
use crate::room::RoomConnection;

// ───────────────────────────────────────────────────────────────────
// Identity
// ───────────────────────────────────────────────────────────────────

/// Who a participant is, as shown to others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    /// `#rrggbb`, stable per user id
    pub color_tag: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let color_tag = color_tag_for(&user_id);
        Self {
            user_id,
            display_name: display_name.into(),
            color_tag,
        }
    }
}

/// Stable, vivid color for a user id.
///
/// Hue comes from an FNV-1a hash of the id so every replica picks the same
/// color without coordination.
pub fn color_tag_for(user_id: &str) -> String {
    let hash = user_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3));
    let hue = ((hash % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 {
        l * (1.0 + s)
    } else {
        l + s - l * s
    };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    (r, g, b)
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Wire protocol messages
// ───────────────────────────────────────────────────────────────────

/// Zero-based text position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

impl CursorPosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: CursorPosition,
    pub head: CursorPosition,
}

/// Awareness payload carried in `SyncMessage::Awareness` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Full local state. Also sent unchanged as the heartbeat.
    State {
        identity: Identity,
        cursor: Option<CursorPosition>,
        selection: Option<Selection>,
        /// Per-sender monotonic counter; older states are ignored
        timestamp: u64,
    },
    /// Clean departure.
    Leave,
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

// ───────────────────────────────────────────────────────────────────
// Remote state cache
// ───────────────────────────────────────────────────────────────────

/// One remote participant as currently known.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub peer_id: Uuid,
    pub user_id: String,
    pub display_name: String,
    pub color_tag: String,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<Selection>,
    /// Local receipt time of the last state or heartbeat
    pub last_seen: Instant,
    timestamp: u64,
}

/// Short-TTL cache of remote awareness states with explicit eviction.
#[derive(Debug)]
pub struct AwarenessCache {
    local_peer: Uuid,
    staleness: Duration,
    entries: HashMap<Uuid, PresenceEntry>,
}

impl AwarenessCache {
    pub fn new(local_peer: Uuid, staleness: Duration) -> Self {
        Self {
            local_peer,
            staleness,
            entries: HashMap::new(),
        }
    }

    /// Merge a message from `peer`. Returns `true` if the visible set changed.
    pub fn apply(&mut self, peer: Uuid, msg: &AwarenessMessage, now: Instant) -> bool {
        if peer == self.local_peer {
            return false;
        }

        match msg {
            AwarenessMessage::Leave => self.remove(&peer),
            AwarenessMessage::State {
                identity,
                cursor,
                selection,
                timestamp,
            } => {
                if let Some(existing) = self.entries.get_mut(&peer) {
                    if *timestamp <= existing.timestamp {
                        return false;
                    }
                    let changed = existing.cursor != *cursor
                        || existing.selection != *selection
                        || existing.display_name != identity.display_name;
                    existing.cursor = *cursor;
                    existing.selection = *selection;
                    existing.display_name = identity.display_name.clone();
                    existing.timestamp = *timestamp;
                    existing.last_seen = now;
                    return changed;
                }

                self.entries.insert(
                    peer,
                    PresenceEntry {
                        peer_id: peer,
                        user_id: identity.user_id.clone(),
                        display_name: identity.display_name.clone(),
                        color_tag: identity.color_tag.clone(),
                        cursor: *cursor,
                        selection: *selection,
                        last_seen: now,
                        timestamp: *timestamp,
                    },
                );
                true
            }
        }
    }

    pub fn remove(&mut self, peer: &Uuid) -> bool {
        self.entries.remove(peer).is_some()
    }

    /// Drop everything, e.g. when the local transport disconnects.
    pub fn clear(&mut self) -> bool {
        let had_entries = !self.entries.is_empty();
        self.entries.clear();
        had_entries
    }

    /// Evict entries not seen within the staleness window.
    pub fn sweep(&mut self, now: Instant) -> Vec<Uuid> {
        let staleness = self.staleness;
        let stale: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen) > staleness)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.entries.remove(id);
        }
        stale
    }

    /// The "other participants" list: one entry per user (freshest session
    /// wins), ordered by display name.
    pub fn others(&self) -> Vec<PresenceEntry> {
        let mut by_user: HashMap<&str, &PresenceEntry> = HashMap::new();
        for entry in self.entries.values() {
            by_user
                .entry(entry.user_id.as_str())
                .and_modify(|current| {
                    if entry.last_seen > current.last_seen {
                        *current = entry;
                    }
                })
                .or_insert(entry);
        }

        let mut others: Vec<PresenceEntry> = by_user.into_values().cloned().collect();
        others.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        others
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Local state
// ───────────────────────────────────────────────────────────────────

/// What this replica publishes about itself.
#[derive(Debug)]
pub struct LocalPresence {
    identity: Identity,
    cursor: Option<CursorPosition>,
    selection: Option<Selection>,
    timestamp_counter: u64,
}

impl LocalPresence {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            cursor: None,
            selection: None,
            timestamp_counter: 0,
        }
    }

    pub fn set(&mut self, cursor: Option<CursorPosition>, selection: Option<Selection>) {
        self.cursor = cursor;
        self.selection = selection;
    }

    /// Snapshot of the local state with a fresh timestamp.
    pub fn state_message(&mut self) -> AwarenessMessage {
        self.timestamp_counter += 1;
        AwarenessMessage::State {
            identity: self.identity.clone(),
            cursor: self.cursor,
            selection: self.selection,
            timestamp: self.timestamp_counter,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn cursor(&self) -> Option<CursorPosition> {
        self.cursor
    }
}

// ───────────────────────────────────────────────────────────────────
// Engine
// ───────────────────────────────────────────────────────────────────

/// Per-participant presence API over a joined room.
pub struct PresenceEngine {
    connection: Arc<RoomConnection>,
}

impl PresenceEngine {
    pub fn new(handle: &ParticipantHandle) -> Self {
        Self {
            connection: handle.connection().clone(),
        }
    }

    /// Publish a new cursor/selection. Dropped silently while offline;
    /// the full state is republished on reconnect.
    pub fn set_cursor(&self, cursor: Option<CursorPosition>, selection: Option<Selection>) {
        self.connection.update_local_presence(cursor, selection);
    }

    /// The others list; every change replaces the whole value.
    pub fn others(&self) -> watch::Receiver<Vec<PresenceEntry>> {
        self.connection.subscribe_presence()
    }

    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.connection.subscribe_presence().borrow().clone()
    }

    pub fn identity(&self) -> Identity {
        self.connection.local_identity()
    }
}
