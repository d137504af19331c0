//! Room connection registry: room id → one shared `RoomConnection`.
//!
//! ```text
//! join(room) ──► [no connection] ──► open ──► participants {p1}
//!                [connection]     ──► reuse, cancel pending cleanup
//!
//! handle.release() ──► participants {} ──► arm cleanup(grace)
//!                                              │ join before grace → cancelled
//!                                              ▼
//!                                           destroy + remove
//! ```
//!
//! The registry is an explicitly constructed service rather than global
//! state; clones share the same map. All bookkeeping for one room happens
//! under the registry lock, so there is never more than one connection per
//! room id.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::config::RoomConfig;
use crate::presence::Identity;
use crate::protocol::RoomId;
use crate::room::{ParticipantId, RoomConnection, RoomError};
use crate::transport::{Dialer, TransportState, WsDialer};

struct RegistryInner {
    config: RoomConfig,
    identity: Identity,
    dialer: Arc<dyn Dialer>,
    rooms: Mutex<HashMap<RoomId, Arc<RoomConnection>>>,
    next_participant: AtomicU64,
    outstanding: AtomicUsize,
    leaked: AtomicUsize,
    shut_down: AtomicBool,
}

impl RegistryInner {
    fn lock_rooms(&self) -> MutexGuard<'_, HashMap<RoomId, Arc<RoomConnection>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn leave(self: &Arc<Self>, participant: ParticipantId, connection: &Arc<RoomConnection>) {
        let room_id = connection.room_id().clone();
        let rooms = self.lock_rooms();
        let remaining = connection.release_participant(participant);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        log::debug!("Participant {participant} left {room_id} ({remaining} remaining)");

        if remaining > 0 {
            return;
        }

        let registered = rooms
            .get(&room_id)
            .is_some_and(|current| Arc::ptr_eq(current, connection));
        if !registered {
            // Replaced or shut down meanwhile; nothing else can reach it.
            drop(rooms);
            connection.destroy();
            return;
        }

        let registry = Arc::downgrade(self);
        let target = Arc::downgrade(connection);
        let grace = self.config.cleanup_grace();
        let cleanup = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let (Some(registry), Some(connection)) = (registry.upgrade(), target.upgrade()) {
                registry.reap(&connection);
            }
        });
        connection.arm_cleanup(cleanup);
        log::debug!("Room {room_id} empty, cleanup in {grace:?}");
    }

    /// Destroy `connection` if it is still registered and still empty.
    fn reap(&self, connection: &Arc<RoomConnection>) {
        let room_id = connection.room_id();
        let mut rooms = self.lock_rooms();
        let registered = rooms
            .get(room_id)
            .is_some_and(|current| Arc::ptr_eq(current, connection));
        if !registered || connection.participant_count() > 0 {
            return;
        }
        rooms.remove(room_id);
        drop(rooms);

        connection.detach_cleanup();
        connection.destroy();
        log::info!("Room {room_id} cleaned up after grace period");
    }
}

/// Process-wide (or test-local) multiplexer of room connections.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

impl RoomRegistry {
    pub fn new(config: RoomConfig, identity: Identity, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                identity,
                dialer,
                rooms: Mutex::new(HashMap::new()),
                next_participant: AtomicU64::new(0),
                outstanding: AtomicUsize::new(0),
                leaked: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Registry dialing the configured signaling relay over WebSocket.
    pub fn connect(config: RoomConfig, identity: Identity) -> Self {
        let dialer = Arc::new(WsDialer::new(config.signaling_url.clone()));
        Self::new(config, identity, dialer)
    }

    /// Join `room_id`, opening its connection if needed.
    ///
    /// The returned handle must be released exactly once with
    /// [`ParticipantHandle::release`]. Must be called inside a Tokio runtime.
    pub fn join(&self, room_id: impl Into<RoomId>) -> Result<ParticipantHandle, RoomError> {
        let room_id = room_id.into();
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(RoomError::RegistryShutDown);
        }
        let participant = self.inner.next_participant.fetch_add(1, Ordering::SeqCst) + 1;

        let connection = {
            let mut rooms = self.inner.lock_rooms();
            let reusable = rooms
                .get(&room_id)
                .filter(|c| {
                    c.transport_state() != TransportState::Errored || c.participant_count() > 0
                })
                .cloned();

            let connection = match reusable {
                Some(existing) => existing,
                None => {
                    if let Some(errored) = rooms.remove(&room_id) {
                        log::info!("Replacing errored connection for {room_id}");
                        errored.destroy();
                    }
                    let created = RoomConnection::open(
                        room_id.clone(),
                        &self.inner.identity,
                        self.inner.config.clone(),
                        self.inner.dialer.clone(),
                    );
                    rooms.insert(room_id.clone(), created.clone());
                    created
                }
            };

            if connection.cancel_cleanup() {
                log::debug!("Pending cleanup of {room_id} cancelled by join");
            }
            connection.add_participant(participant);
            connection
        };

        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        log::debug!("Participant {participant} joined {room_id}");

        Ok(ParticipantHandle {
            id: participant,
            room_id,
            connection,
            registry: Arc::downgrade(&self.inner),
            released: false,
        })
    }

    pub fn room_count(&self) -> usize {
        self.inner.lock_rooms().len()
    }

    pub fn connection(&self, room_id: &RoomId) -> Option<Arc<RoomConnection>> {
        self.inner.lock_rooms().get(room_id).cloned()
    }

    /// Handles joined and not yet released (leaked ones included).
    pub fn outstanding_handles(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Handles dropped without `release()`.
    pub fn leaked_handles(&self) -> usize {
        self.inner.leaked.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn config(&self) -> &RoomConfig {
        &self.inner.config
    }

    /// Destroy every connection now, ignoring grace periods.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let rooms: Vec<Arc<RoomConnection>> =
            self.inner.lock_rooms().drain().map(|(_, c)| c).collect();
        let count = rooms.len();
        for connection in rooms {
            connection.destroy();
        }
        log::info!("Room registry shut down ({count} rooms destroyed)");
    }
}

impl fmt::Debug for RoomRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomRegistry")
            .field("rooms", &self.room_count())
            .field("outstanding", &self.outstanding_handles())
            .finish()
    }
}

/// One participant's membership in a room.
///
/// `release()` is the only way to leave. Dropping an unreleased handle is a
/// leak: the room keeps counting the participant and is never cleaned up.
#[must_use = "a participant handle must be released"]
pub struct ParticipantHandle {
    id: ParticipantId,
    room_id: RoomId,
    connection: Arc<RoomConnection>,
    registry: Weak<RegistryInner>,
    released: bool,
}

impl ParticipantHandle {
    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn connection(&self) -> &Arc<RoomConnection> {
        &self.connection
    }

    pub fn state(&self) -> TransportState {
        self.connection.transport_state()
    }

    /// Leave the room, aborting this participant's relays.
    pub fn release(mut self) {
        self.released = true;
        match self.registry.upgrade() {
            Some(registry) => registry.leave(self.id, &self.connection),
            None => {
                self.connection.release_participant(self.id);
            }
        }
    }
}

impl Drop for ParticipantHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        log::warn!(
            "Participant {} of room {} dropped without release; the room cannot be reclaimed",
            self.id,
            self.room_id
        );
        if let Some(registry) = self.registry.upgrade() {
            registry.leaked.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl fmt::Debug for ParticipantHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticipantHandle")
            .field("id", &self.id)
            .field("room_id", &self.room_id)
            .finish()
    }
}
