//! Transport session: one WebSocket link to the signaling relay per room.
//!
//! ```text
//!               dial ok                    link drops
//! Disconnected ────────► Connecting ─────► Connected ─────► Disconnected
//!      ▲                     │                                  │
//!      └──── backoff wait ◄──┴──────────── attempt += 1 ◄───────┘
//!                                               │ attempt > max
//!                                               ▼
//!                                            Errored ──► Destroyed
//! ```
//!
//! A supervisor task owns the link and the reconnect loop. `shutdown()`
//! moves the session to `Destroyed`, which no other state can leave, so a
//! teardown always beats a pending reconnect.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ProtocolError, RoomId, SyncMessage};

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted; only a teardown leaves this state.
    Errored,
    /// Deliberately torn down.
    Destroyed,
}

impl TransportState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportState::Errored | TransportState::Destroyed)
    }

    fn can_become(&self, next: TransportState) -> bool {
        match self {
            TransportState::Destroyed => false,
            TransportState::Errored => next == TransportState::Destroyed,
            _ => true,
        }
    }
}

/// Capped exponential backoff with a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
    /// A link that stayed up this long resets the attempt counter
    pub stable_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 10,
            stable_after: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// A live, already-handshaken link to the relay.
///
/// The link is over when `incoming` yields `None`.
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<SyncMessage>,
    pub incoming: mpsc::UnboundedReceiver<SyncMessage>,
}

/// Opens links to the relay. Production code uses [`WsDialer`]; tests
/// inject in-memory dialers.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, room_id: &RoomId) -> BoxFuture<'static, Result<Link, ProtocolError>>;
}

/// Dials `<base_url>/<room_id>` over WebSocket.
#[derive(Debug, Clone)]
pub struct WsDialer {
    base_url: String,
}

impl WsDialer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Dialer for WsDialer {
    fn dial(&self, room_id: &RoomId) -> BoxFuture<'static, Result<Link, ProtocolError>> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), room_id);
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| ProtocolError::ConnectFailed(e.to_string()))?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SyncMessage>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<SyncMessage>();

            // Writer task: forward outgoing channel to WebSocket
            tokio::spawn(async move {
                while let Some(msg) = out_rx.recv().await {
                    let encoded = match msg.encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            log::warn!("Dropping unencodable frame: {e}");
                            continue;
                        }
                    };
                    if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_writer.send(Message::Close(None)).await;
            });

            // Reader task: decode frames; a bad frame is dropped, not fatal
            tokio::spawn(async move {
                while let Some(frame) = ws_reader.next().await {
                    match frame {
                        Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                            Ok(msg) => {
                                if in_tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Dropping malformed frame: {e}"),
                        },
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
            });

            Ok(Link {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

/// Events delivered to the owning room connection.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Message(SyncMessage),
    Disconnected,
    Errored { attempts: u32 },
}

/// Handle to the supervisor task of one room's link.
pub struct TransportSession {
    room_id: RoomId,
    state: Arc<watch::Sender<TransportState>>,
    outgoing: mpsc::UnboundedSender<SyncMessage>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportSession {
    /// Start connecting immediately. Must be called inside a Tokio runtime.
    pub fn start(
        room_id: RoomId,
        dialer: Arc<dyn Dialer>,
        backoff: BackoffPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (state_tx, _) = watch::channel(TransportState::Disconnected);
        let state = Arc::new(state_tx);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = Supervisor {
            room_id: room_id.clone(),
            dialer,
            backoff,
            state: state.clone(),
            outgoing: out_rx,
            shutdown: shutdown_rx,
            events: event_tx,
        };
        let task = tokio::spawn(supervisor.run());

        let session = Self {
            room_id,
            state,
            outgoing: out_tx,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        };
        (session, event_rx)
    }

    /// Queue a frame for the relay. Frames queued while not connected are
    /// discarded at the next connect; the handshake resynchronises state.
    pub fn send(&self, msg: SyncMessage) -> bool {
        self.state() == TransportState::Connected && self.outgoing.send(msg).is_ok()
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Deliberate teardown: stops any reconnect immediately.
    pub fn shutdown(&self) {
        transition(&self.state, TransportState::Destroyed);
        let _ = self.shutdown.send(true);
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
        }
        log::debug!("Transport for {} destroyed", self.room_id);
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if !self.state().is_terminal() {
            self.shutdown();
        }
    }
}

/// Move to `next` unless the current state forbids it.
/// Returns `false` once the session is terminal, which ends the supervisor.
fn transition(state: &watch::Sender<TransportState>, next: TransportState) -> bool {
    let mut allowed = true;
    state.send_if_modified(|current| {
        if !current.can_become(next) {
            allowed = false;
            return false;
        }
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
    allowed
}

struct Supervisor {
    room_id: RoomId,
    dialer: Arc<dyn Dialer>,
    backoff: BackoffPolicy,
    state: Arc<watch::Sender<TransportState>>,
    outgoing: mpsc::UnboundedReceiver<SyncMessage>,
    shutdown: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut attempts = 0u32;

        loop {
            if *self.shutdown.borrow() || !transition(&self.state, TransportState::Connecting) {
                return;
            }

            let dialed = tokio::select! {
                _ = self.shutdown.changed() => return,
                res = self.dialer.dial(&self.room_id) => res,
            };

            match dialed {
                Ok(link) => {
                    // Stale frames from before this link would precede the handshake.
                    while self.outgoing.try_recv().is_ok() {}
                    if !transition(&self.state, TransportState::Connected) {
                        return;
                    }
                    log::info!("Transport for {} connected", self.room_id);
                    let _ = self.events.send(TransportEvent::Connected);

                    let connected_at = Instant::now();
                    if !self.pump(link).await {
                        return;
                    }
                    if connected_at.elapsed() >= self.backoff.stable_after {
                        attempts = 0;
                    }
                    log::warn!("Transport for {} dropped", self.room_id);
                }
                Err(e) => {
                    log::warn!("Dial for {} failed: {e}", self.room_id);
                }
            }

            if !transition(&self.state, TransportState::Disconnected) {
                return;
            }
            let _ = self.events.send(TransportEvent::Disconnected);

            attempts += 1;
            if attempts > self.backoff.max_attempts {
                log::error!(
                    "Transport for {} gave up after {} attempts",
                    self.room_id,
                    self.backoff.max_attempts
                );
                if transition(&self.state, TransportState::Errored) {
                    let _ = self.events.send(TransportEvent::Errored {
                        attempts: self.backoff.max_attempts,
                    });
                }
                return;
            }

            let delay = self.backoff.delay(attempts);
            log::debug!("Reconnecting {} in {delay:?} (attempt {attempts})", self.room_id);
            if !self.wait(delay).await {
                return;
            }
        }
    }

    /// Relay frames both ways until the link ends.
    /// Returns `false` if the session itself is shutting down.
    async fn pump(&mut self, mut link: Link) -> bool {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return false,
                incoming = link.incoming.recv() => match incoming {
                    Some(msg) => {
                        let _ = self.events.send(TransportEvent::Message(msg));
                    }
                    None => return true,
                },
                outgoing = self.outgoing.recv() => match outgoing {
                    Some(msg) => {
                        if link.outgoing.send(msg).is_err() {
                            return true;
                        }
                    }
                    None => return false,
                },
            }
        }
    }

    /// Backoff wait; frames queued meanwhile are dropped.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return false,
                _ = &mut sleep => return true,
                outgoing = self.outgoing.recv() => {
                    if outgoing.is_none() {
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory dialers shared by unit tests across the crate.

    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Never completes a dial; the session sits in `Connecting`.
    pub struct PendingDialer;

    impl Dialer for PendingDialer {
        fn dial(&self, _room_id: &RoomId) -> BoxFuture<'static, Result<Link, ProtocolError>> {
            Box::pin(futures_util::future::pending())
        }
    }

    /// Fails every dial and counts attempts.
    #[derive(Default)]
    pub struct FailingDialer {
        pub attempts: Arc<AtomicU32>,
    }

    impl Dialer for FailingDialer {
        fn dial(&self, _room_id: &RoomId) -> BoxFuture<'static, Result<Link, ProtocolError>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(ProtocolError::ConnectFailed("refused".into())) })
        }
    }

    /// Accepts every dial, then hangs up at once.
    #[derive(Default)]
    pub struct HangUpDialer {
        pub attempts: Arc<AtomicU32>,
    }

    impl Dialer for HangUpDialer {
        fn dial(&self, _room_id: &RoomId) -> BoxFuture<'static, Result<Link, ProtocolError>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let (outgoing, _) = mpsc::unbounded_channel();
            let (_, incoming) = mpsc::unbounded_channel();
            Box::pin(async move { Ok(Link { outgoing, incoming }) })
        }
    }

    /// The far end of a scripted link, held by the test.
    pub struct RemoteEnd {
        pub from_client: mpsc::UnboundedReceiver<SyncMessage>,
        pub to_client: mpsc::UnboundedSender<SyncMessage>,
    }

    /// Hands each successful dial's far end to the test through a channel.
    pub struct ScriptedDialer {
        ends: mpsc::UnboundedSender<RemoteEnd>,
    }

    impl ScriptedDialer {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Self { ends: tx }, rx)
        }
    }

    impl Dialer for ScriptedDialer {
        fn dial(&self, _room_id: &RoomId) -> BoxFuture<'static, Result<Link, ProtocolError>> {
            let (client_tx, client_rx) = mpsc::unbounded_channel();
            let (remote_tx, remote_rx) = mpsc::unbounded_channel();
            let sent = self.ends.send(RemoteEnd {
                from_client: client_rx,
                to_client: remote_tx,
            });
            Box::pin(async move {
                sent.map_err(|_| ProtocolError::ConnectionClosed)?;
                Ok(Link {
                    outgoing: client_tx,
                    incoming: remote_rx,
                })
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;
    use uuid::Uuid;

    fn fast_backoff(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(400),
            max_attempts,
            stable_after: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_backoff_delay_is_capped_exponential() {
        let policy = fast_backoff(10);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(400));
        assert_eq!(policy.delay(40), Duration::from_millis(400));
    }

    #[test]
    fn test_state_transitions() {
        assert!(TransportState::Connected.can_become(TransportState::Disconnected));
        assert!(TransportState::Errored.can_become(TransportState::Destroyed));
        assert!(!TransportState::Errored.can_become(TransportState::Connecting));
        assert!(!TransportState::Destroyed.can_become(TransportState::Connecting));
        assert!(TransportState::Errored.is_terminal());
        assert!(!TransportState::Disconnected.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_become_errored() {
        let dialer = FailingDialer::default();
        let attempts = dialer.attempts.clone();
        let (session, mut events) =
            TransportSession::start(RoomId::new("editor-r"), Arc::new(dialer), fast_backoff(3));

        let mut errored = false;
        while let Some(event) = events.recv().await {
            if let TransportEvent::Errored { attempts } = event {
                assert_eq!(attempts, 3);
                errored = true;
                break;
            }
        }
        assert!(errored);
        assert_eq!(session.state(), TransportState::Errored);
        // Initial dial plus three retries, then no more.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(session.state(), TransportState::Errored);

        session.shutdown();
        assert_eq!(session.state(), TransportState::Destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_links_dropped_at_once_still_exhaust_attempts() {
        let dialer = HangUpDialer::default();
        let attempts = dialer.attempts.clone();
        let (session, mut events) =
            TransportSession::start(RoomId::new("editor-r"), Arc::new(dialer), fast_backoff(3));

        let mut connects = 0;
        loop {
            match events.recv().await {
                Some(TransportEvent::Connected) => connects += 1,
                Some(TransportEvent::Errored { attempts }) => {
                    assert_eq!(attempts, 3);
                    break;
                }
                Some(_) => {}
                None => panic!("Session ended without erroring"),
            }
        }
        assert_eq!(connects, 4);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(session.state(), TransportState::Errored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_link_resets_attempts() {
        let (dialer, mut ends) = ScriptedDialer::new();
        let (session, _events) =
            TransportSession::start(RoomId::new("editor-r"), Arc::new(dialer), fast_backoff(1));

        for _ in 0..4 {
            let end = ends.recv().await.expect("session gave up");
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(end);
        }
        let _end = ends.recv().await.expect("session gave up");
        assert_ne!(session.state(), TransportState::Errored);
        session.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_reconnect() {
        let dialer = FailingDialer::default();
        let attempts = dialer.attempts.clone();
        let (session, _events) =
            TransportSession::start(RoomId::new("editor-r"), Arc::new(dialer), fast_backoff(100));

        tokio::time::sleep(Duration::from_millis(50)).await;
        session.shutdown();
        let seen = attempts.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), seen);
        assert_eq!(session.state(), TransportState::Destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_drop() {
        let (dialer, mut ends) = ScriptedDialer::new();
        let (session, mut events) =
            TransportSession::start(RoomId::new("editor-r"), Arc::new(dialer), fast_backoff(5));

        let first = ends.recv().await.unwrap();
        assert!(matches!(events.recv().await, Some(TransportEvent::Connected)));
        assert_eq!(session.state(), TransportState::Connected);

        let ping = SyncMessage::ping(Uuid::new_v4());
        first.to_client.send(ping.clone()).unwrap();
        match events.recv().await {
            Some(TransportEvent::Message(msg)) => assert_eq!(msg, ping),
            other => panic!("Expected message, got {other:?}"),
        }

        drop(first);
        assert!(matches!(events.recv().await, Some(TransportEvent::Disconnected)));

        let mut second = ends.recv().await.unwrap();
        assert!(matches!(events.recv().await, Some(TransportEvent::Connected)));
        assert!(session.send(SyncMessage::pong(Uuid::new_v4())));
        assert!(second.from_client.recv().await.is_some());

        session.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected_is_dropped() {
        let (session, _events) =
            TransportSession::start(RoomId::new("editor-r"), Arc::new(PendingDialer), fast_backoff(1));
        let mut state = session.subscribe();
        state
            .wait_for(|s| *s == TransportState::Connecting)
            .await
            .unwrap();
        assert!(!session.send(SyncMessage::ping(Uuid::new_v4())));
    }
}
