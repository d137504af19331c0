//! One live room: replicated document + transport session + participants.
//!
//! A `RoomConnection` is shared by every participant that joined the same
//! room id through the registry. It owns every task and timer that touches
//! it (transport driver, presence sweep/heartbeat, the pending cleanup and
//! per-participant relays) so `destroy()` is the single place that cancels
//! them all.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backend::BackendError;
use crate::config::RoomConfig;
use crate::doc::{DocError, ReplicatedDoc};
use crate::presence::{
    AwarenessCache, AwarenessMessage, CursorPosition, Identity, LocalPresence, PresenceEntry,
    Selection,
};
use crate::protocol::{MessageType, PeerInfo, ProtocolError, RoomId, SyncMessage};
use crate::transport::{Dialer, TransportEvent, TransportSession, TransportState};

/// Registry-assigned id of one participant handle.
pub type ParticipantId = u64;

/// Who produced a document change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local(ParticipantId),
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    DocumentChanged { origin: Origin },
    PresenceChanged,
    Disconnected,
    Errored,
    Destroyed,
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Transport for room {0} gave up reconnecting")]
    TransportErrored(RoomId),
    #[error("Room {0} was destroyed")]
    Destroyed(RoomId),
    #[error("Registry is shut down")]
    RegistryShutDown,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Doc(#[from] DocError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Default)]
struct ConnectionTasks {
    driver: Option<JoinHandle<()>>,
    presence: Option<JoinHandle<()>>,
    cleanup: Option<JoinHandle<()>>,
    per_participant: HashMap<ParticipantId, Vec<JoinHandle<()>>>,
}

pub struct RoomConnection {
    room_id: RoomId,
    peer: PeerInfo,
    config: RoomConfig,
    doc: ReplicatedDoc,
    transport: TransportSession,
    events: broadcast::Sender<RoomEvent>,
    synced: watch::Sender<bool>,
    awareness: Mutex<AwarenessCache>,
    others: watch::Sender<Vec<PresenceEntry>>,
    local_presence: Mutex<LocalPresence>,
    participants: Mutex<HashSet<ParticipantId>>,
    initialized: AtomicBool,
    tearing_down: AtomicBool,
    tasks: Mutex<ConnectionTasks>,
    clock: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RoomConnection {
    /// Create the connection and start dialing. Requires a Tokio runtime.
    pub fn open(
        room_id: RoomId,
        identity: &Identity,
        config: RoomConfig,
        dialer: Arc<dyn Dialer>,
    ) -> Arc<Self> {
        let peer = PeerInfo::new(identity.user_id.clone(), identity.display_name.clone());
        let (transport, transport_events) =
            TransportSession::start(room_id.clone(), dialer, config.backoff());
        let (events, _) = broadcast::channel(256);
        let (synced, _) = watch::channel(false);
        let (others, _) = watch::channel(Vec::new());

        let connection = Arc::new(Self {
            awareness: Mutex::new(AwarenessCache::new(peer.peer_id, config.presence_staleness())),
            local_presence: Mutex::new(LocalPresence::new(identity.clone())),
            room_id,
            peer,
            doc: ReplicatedDoc::new(),
            transport,
            events,
            synced,
            others,
            participants: Mutex::new(HashSet::new()),
            initialized: AtomicBool::new(false),
            tearing_down: AtomicBool::new(false),
            tasks: Mutex::new(ConnectionTasks::default()),
            clock: AtomicU64::new(0),
            config,
        });

        let driver = tokio::spawn(drive(Arc::downgrade(&connection), transport_events));
        let presence = tokio::spawn(presence_timers(
            Arc::downgrade(&connection),
            connection.config.presence_sweep(),
            connection.config.presence_heartbeat(),
        ));
        {
            let mut tasks = lock(&connection.tasks);
            tasks.driver = Some(driver);
            tasks.presence = Some(presence);
        }

        log::info!(
            "Opened room {} as peer {}",
            connection.room_id,
            connection.peer.peer_id
        );
        connection
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn doc(&self) -> &ReplicatedDoc {
        &self.doc
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.transport.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub fn is_destroyed(&self) -> bool {
        self.tearing_down.load(Ordering::SeqCst)
    }

    // ── document ────────────────────────────────────────────────

    /// Relay a local update produced by `participant` and notify listeners.
    ///
    /// While offline the update only lives in the document; the reconnect
    /// handshake carries it to the relay.
    pub fn commit(&self, participant: ParticipantId, update: Vec<u8>) {
        let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let msg = SyncMessage::update(self.peer.peer_id, &self.room_id, clock, update);
        if !self.transport.send(msg) {
            log::trace!("Room {} offline, update deferred to resync", self.room_id);
        }
        let _ = self.events.send(RoomEvent::DocumentChanged {
            origin: Origin::Local(participant),
        });
    }

    /// Claim the one-time initial reconciliation. Only the first caller
    /// for this connection gets `true`.
    pub fn mark_initialized(&self) -> bool {
        self.initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Wait until the relay's state has been merged at least once since the
    /// last connect, or fail if the transport is terminal.
    pub async fn wait_synced(&self) -> Result<(), RoomError> {
        let mut synced = self.synced.subscribe();
        let mut state = self.transport.subscribe();
        loop {
            if *synced.borrow_and_update() {
                return Ok(());
            }
            match *state.borrow_and_update() {
                TransportState::Errored => {
                    return Err(RoomError::TransportErrored(self.room_id.clone()))
                }
                TransportState::Destroyed => return Err(RoomError::Destroyed(self.room_id.clone())),
                _ => {}
            }
            tokio::select! {
                changed = synced.changed() => {
                    if changed.is_err() {
                        return Err(RoomError::Destroyed(self.room_id.clone()));
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(RoomError::Destroyed(self.room_id.clone()));
                    }
                }
            }
        }
    }

    /// Publish a projection of the document that is recomputed after every
    /// change and pushed only when it differs from the last value.
    ///
    /// Changes made by `participant` itself are skipped when `skip_own` is
    /// set. With a non-zero `debounce`, bursts are coalesced and the
    /// projection runs once the room has been quiet for that long. The relay
    /// task belongs to `participant` and stops when it releases.
    pub fn watch_document<T, F>(
        self: &Arc<Self>,
        participant: ParticipantId,
        skip_own: bool,
        debounce: Duration,
        project: F,
    ) -> watch::Receiver<T>
    where
        T: PartialEq + Send + Sync + 'static,
        F: Fn(&ReplicatedDoc) -> T + Send + 'static,
    {
        let (tx, rx) = watch::channel(project(&self.doc));
        let mut events = self.events.subscribe();
        let connection = Arc::downgrade(self);

        let relay = tokio::spawn(async move {
            let relevant = |event: &RoomEvent| match event {
                RoomEvent::DocumentChanged { origin } => {
                    !(skip_own && *origin == Origin::Local(participant))
                }
                _ => false,
            };

            loop {
                match events.recv().await {
                    Ok(event) if relevant(&event) => {}
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        log::debug!("Document relay lagged by {skipped} events");
                    }
                    Err(RecvError::Closed) => return,
                }

                if !debounce.is_zero() {
                    loop {
                        match tokio::time::timeout(debounce, events.recv()).await {
                            Err(_) => break,
                            Ok(Err(RecvError::Closed)) => return,
                            Ok(_) => continue,
                        }
                    }
                }

                let Some(connection) = connection.upgrade() else {
                    return;
                };
                let value = project(&connection.doc);
                drop(connection);
                tx.send_if_modified(|current| {
                    if *current == value {
                        return false;
                    }
                    *current = value;
                    true
                });
                if tx.is_closed() {
                    return;
                }
            }
        });
        self.register_task(participant, relay);
        rx
    }

    // ── presence ────────────────────────────────────────────────

    pub fn local_identity(&self) -> Identity {
        lock(&self.local_presence).identity().clone()
    }

    pub fn update_local_presence(&self, cursor: Option<CursorPosition>, selection: Option<Selection>) {
        lock(&self.local_presence).set(cursor, selection);
        self.publish_local_presence();
    }

    pub fn subscribe_presence(&self) -> watch::Receiver<Vec<PresenceEntry>> {
        self.others.subscribe()
    }

    fn publish_local_presence(&self) {
        let message = lock(&self.local_presence).state_message();
        self.send_awareness(&message);
    }

    fn send_awareness(&self, message: &AwarenessMessage) {
        match message.encode() {
            Ok(encoded) => {
                let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
                self.transport.send(SyncMessage::awareness(
                    self.peer.peer_id,
                    &self.room_id,
                    clock,
                    encoded,
                ));
            }
            Err(e) => log::warn!("Failed to encode awareness for {}: {e}", self.room_id),
        }
    }

    /// Replace the published others list with the cache's current view.
    fn publish_others(&self) {
        let others = lock(&self.awareness).others();
        self.others.send_replace(others);
        let _ = self.events.send(RoomEvent::PresenceChanged);
    }

    fn clear_presence(&self) {
        let cleared = lock(&self.awareness).clear();
        if cleared {
            self.publish_others();
        }
    }

    fn sweep_presence(&self, now: Instant) {
        let evicted = lock(&self.awareness).sweep(now);
        if !evicted.is_empty() {
            log::debug!("Evicted {} stale presence entries in {}", evicted.len(), self.room_id);
            self.publish_others();
        }
    }

    // ── transport ───────────────────────────────────────────────

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                match SyncMessage::peer_joined(&self.peer, &self.room_id) {
                    Ok(joined) => {
                        self.transport.send(joined);
                    }
                    Err(e) => log::error!("Failed to encode join for {}: {e}", self.room_id),
                }
                self.transport.send(SyncMessage::sync_step1(
                    self.peer.peer_id,
                    &self.room_id,
                    self.doc.state_vector(),
                ));
                self.publish_local_presence();
            }
            TransportEvent::Message(msg) => self.handle_message(msg),
            TransportEvent::Disconnected => {
                self.synced.send_replace(false);
                self.clear_presence();
                let _ = self.events.send(RoomEvent::Disconnected);
            }
            TransportEvent::Errored { attempts } => {
                log::error!("Room {} errored after {attempts} reconnect attempts", self.room_id);
                self.synced.send_replace(false);
                self.clear_presence();
                let _ = self.events.send(RoomEvent::Errored);
            }
        }
    }

    fn handle_message(&self, msg: SyncMessage) {
        match msg.msg_type {
            MessageType::SyncStep1 => match self.doc.diff(&msg.payload) {
                Ok(diff) => {
                    self.transport
                        .send(SyncMessage::sync_step2(self.peer.peer_id, &self.room_id, diff));
                }
                Err(e) => log::warn!("Ignoring bad SyncStep1 in {}: {e}", self.room_id),
            },
            MessageType::SyncStep2 => {
                if let Err(e) = self.doc.apply_update(&msg.payload) {
                    log::warn!("Ignoring bad SyncStep2 in {}: {e}", self.room_id);
                    return;
                }
                let first = !self.synced.send_replace(true);
                let _ = self.events.send(RoomEvent::DocumentChanged {
                    origin: Origin::Remote,
                });
                if first {
                    log::debug!("Room {} synced", self.room_id);
                }
            }
            MessageType::Update => match self.doc.apply_update(&msg.payload) {
                Ok(()) => {
                    let _ = self.events.send(RoomEvent::DocumentChanged {
                        origin: Origin::Remote,
                    });
                }
                Err(e) => log::warn!("Ignoring bad update in {}: {e}", self.room_id),
            },
            MessageType::Awareness => match AwarenessMessage::decode(&msg.payload) {
                Ok(awareness) => {
                    let changed = lock(&self.awareness).apply(msg.peer_id, &awareness, Instant::now());
                    if changed {
                        self.publish_others();
                    }
                }
                Err(e) => log::warn!("Ignoring bad awareness in {}: {e}", self.room_id),
            },
            MessageType::PeerLeft => {
                let removed = lock(&self.awareness).remove(&msg.peer_id);
                if removed {
                    self.publish_others();
                }
            }
            MessageType::PeerJoined => {
                log::debug!("Peer {} joined {}", msg.peer_id, self.room_id);
            }
            MessageType::Ping => {
                self.transport.send(SyncMessage::pong(self.peer.peer_id));
            }
            MessageType::Pong => {}
        }
    }

    // ── participants & tasks ────────────────────────────────────

    pub(crate) fn add_participant(&self, participant: ParticipantId) {
        lock(&self.participants).insert(participant);
    }

    /// Remove `participant` and abort its tasks. Returns how many remain.
    pub(crate) fn release_participant(&self, participant: ParticipantId) -> usize {
        let tasks = lock(&self.tasks).per_participant.remove(&participant);
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
        let mut participants = lock(&self.participants);
        participants.remove(&participant);
        participants.len()
    }

    pub fn participant_count(&self) -> usize {
        lock(&self.participants).len()
    }

    /// Attach a task to `participant`; it is aborted when that participant
    /// releases or the room is destroyed.
    pub fn register_task(&self, participant: ParticipantId, task: JoinHandle<()>) {
        if self.is_destroyed() {
            task.abort();
            return;
        }
        lock(&self.tasks)
            .per_participant
            .entry(participant)
            .or_default()
            .push(task);
    }

    pub(crate) fn arm_cleanup(&self, task: JoinHandle<()>) {
        if let Some(previous) = lock(&self.tasks).cleanup.replace(task) {
            previous.abort();
        }
    }

    /// Cancel a pending cleanup. Returns `true` if one was pending.
    pub(crate) fn cancel_cleanup(&self) -> bool {
        match lock(&self.tasks).cleanup.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn has_pending_cleanup(&self) -> bool {
        lock(&self.tasks).cleanup.is_some()
    }

    /// Forget the cleanup handle without aborting it; used by the cleanup
    /// task itself right before it tears the room down.
    pub(crate) fn detach_cleanup(&self) {
        lock(&self.tasks).cleanup.take();
    }

    /// Tear everything down. Safe to call more than once.
    pub fn destroy(&self) {
        if self.tearing_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.transport.shutdown();

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        let ConnectionTasks {
            driver,
            presence,
            cleanup,
            per_participant,
        } = tasks;
        for task in driver
            .into_iter()
            .chain(presence)
            .chain(cleanup)
            .chain(per_participant.into_values().flatten())
        {
            task.abort();
        }

        self.synced.send_replace(false);
        self.clear_presence();
        let _ = self.events.send(RoomEvent::Destroyed);
        log::info!("Room {} destroyed", self.room_id);
    }
}

impl Drop for RoomConnection {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Feed transport events into the connection until either side goes away.
async fn drive(connection: Weak<RoomConnection>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(connection) = connection.upgrade() else {
            return;
        };
        connection.handle_transport_event(event);
    }
}

/// Presence sweep and heartbeat timers.
async fn presence_timers(connection: Weak<RoomConnection>, sweep_every: Duration, heartbeat_every: Duration) {
    let mut sweep = tokio::time::interval(sweep_every);
    let mut heartbeat = tokio::time::interval(heartbeat_every);
    sweep.tick().await;
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                let Some(connection) = connection.upgrade() else { return };
                connection.sweep_presence(Instant::now());
            }
            _ = heartbeat.tick() => {
                let Some(connection) = connection.upgrade() else { return };
                if connection.transport_state() == TransportState::Connected {
                    connection.publish_local_presence();
                }
            }
        }
    }
}
