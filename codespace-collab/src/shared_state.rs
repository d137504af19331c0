//! Replicated key-value state and the one-shot notification signal.
//!
//! The `state` map of a history room holds two keys:
//!
//! - `history`: the durable history list, re-fetched from the backend after
//!   every save/restore and written back so nobody else has to fetch it.
//! - `notification`: the last `NotificationSignal`. Writing it is how one
//!   participant tells the others "a restore just happened". Readers only
//!   act on fresh signals from other clients, once each, so a signal
//!   replayed by a reconnect resync is ignored.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

use crate::backend::{HistoryBackend, HistoryEntry};
use crate::doc::ReplicatedDoc;
use crate::registry::ParticipantHandle;
use crate::room::{Origin, ParticipantId, RoomConnection, RoomError, RoomEvent};

pub const STATE_FIELD: &str = "state";
pub const HISTORY_KEY: &str = "history";
pub const NOTIFICATION_KEY: &str = "notification";

/// JSON values in a replicated map, last writer wins per key.
pub struct SharedMap {
    connection: Arc<RoomConnection>,
    participant: ParticipantId,
    field: String,
}

impl SharedMap {
    pub fn new(handle: &ParticipantHandle) -> Self {
        Self::with_field(handle, STATE_FIELD)
    }

    pub fn with_field(handle: &ParticipantHandle, field: impl Into<String>) -> Self {
        Self {
            connection: handle.connection().clone(),
            participant: handle.id(),
            field: field.into(),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, RoomError> {
        read_json(self.connection.doc(), &self.field, key)
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), RoomError> {
        let json = serde_json::to_string(value)?;
        let update = self.connection.doc().map_set(&self.field, key, json);
        self.connection.commit(self.participant, update);
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(doc: &ReplicatedDoc, field: &str, key: &str) -> Result<Option<T>, RoomError> {
    match doc.map_get(field, key) {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Save,
    Restore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSignal {
    pub operation_type: OperationType,
    #[serde(default)]
    pub payload: Value,
    /// Unix milliseconds at the writer's clock
    pub timestamp: i64,
    pub originating_client_id: String,
}

impl NotificationSignal {
    pub fn new(operation_type: OperationType, payload: Value, originating_client_id: impl Into<String>) -> Self {
        Self {
            operation_type,
            payload,
            timestamp: Utc::now().timestamp_millis(),
            originating_client_id: originating_client_id.into(),
        }
    }

    /// Younger than `window` at `now_ms`. Timestamps slightly in the future
    /// (clock skew) count as fresh.
    pub fn is_fresh_at(&self, now_ms: i64, window: Duration) -> bool {
        now_ms - self.timestamp < window.as_millis() as i64
    }
}

/// Decides which observed signals should be acted upon.
struct SignalFilter {
    client_id: String,
    freshness: Duration,
    last_handled: Mutex<Option<(i64, String)>>,
}

impl SignalFilter {
    fn accept(&self, signal: &NotificationSignal, now_ms: i64) -> bool {
        if signal.originating_client_id == self.client_id {
            return false;
        }
        if !signal.is_fresh_at(now_ms, self.freshness) {
            log::debug!(
                "Ignoring stale {:?} signal from {}",
                signal.operation_type,
                signal.originating_client_id
            );
            return false;
        }
        let key = (signal.timestamp, signal.originating_client_id.clone());
        let mut last = self.last_handled.lock().unwrap_or_else(PoisonError::into_inner);
        if last.as_ref() == Some(&key) {
            return false;
        }
        *last = Some(key);
        true
    }
}

/// History list + restore notifications for one repository.
pub struct SharedHistory<B: HistoryBackend> {
    map: SharedMap,
    backend: B,
    repository_id: String,
    filter: Arc<SignalFilter>,
}

impl<B: HistoryBackend> SharedHistory<B> {
    pub fn new(handle: &ParticipantHandle, repository_id: impl Into<String>, backend: B) -> Self {
        let connection = handle.connection();
        let filter = SignalFilter {
            client_id: connection.peer().peer_id.to_string(),
            freshness: connection.config().notification_freshness(),
            last_handled: Mutex::new(None),
        };
        Self {
            map: SharedMap::new(handle),
            backend,
            repository_id: repository_id.into(),
            filter: Arc::new(filter),
        }
    }

    /// Id written into signals sent from here.
    pub fn client_id(&self) -> &str {
        &self.filter.client_id
    }

    /// History as last published in the shared map.
    pub fn entries(&self) -> Result<Vec<HistoryEntry>, RoomError> {
        Ok(self.map.get(HISTORY_KEY)?.unwrap_or_default())
    }

    /// Re-fetch from the backend and publish to everyone.
    pub async fn refresh(&self) -> Result<Vec<HistoryEntry>, RoomError> {
        let entries = self.backend.fetch_history(&self.repository_id).await?;
        self.map.set(HISTORY_KEY, &entries)?;
        Ok(entries)
    }

    /// Call after a save or restore went through the backend.
    pub async fn after_mutation(
        &self,
        operation: OperationType,
        payload: Value,
    ) -> Result<Vec<HistoryEntry>, RoomError> {
        let entries = self.refresh().await?;
        if operation == OperationType::Restore {
            self.signal(operation, payload)?;
        }
        Ok(entries)
    }

    pub fn signal(&self, operation: OperationType, payload: Value) -> Result<NotificationSignal, RoomError> {
        let signal = NotificationSignal::new(operation, payload, self.filter.client_id.clone());
        self.map.set(NOTIFICATION_KEY, &signal)?;
        log::info!("Sent {operation:?} notification for {}", self.repository_id);
        Ok(signal)
    }

    pub fn poll_signal(&self) -> Option<NotificationSignal> {
        self.poll_signal_at(Utc::now().timestamp_millis())
    }

    /// The current signal if it should be acted on at `now_ms`. Each signal
    /// is returned at most once.
    pub fn poll_signal_at(&self, now_ms: i64) -> Option<NotificationSignal> {
        let signal = read_signal(self.map.connection.doc())?;
        self.filter.accept(&signal, now_ms).then_some(signal)
    }

    /// Signals written by other participants, as they arrive.
    pub fn subscribe_signals(&self) -> mpsc::UnboundedReceiver<NotificationSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut events = self.map.connection.subscribe_events();
        let connection = Arc::downgrade(&self.map.connection);
        let filter = self.filter.clone();

        let relay = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RoomEvent::DocumentChanged { origin: Origin::Remote }) => {}
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return,
                }
                let Some(connection) = connection.upgrade() else {
                    return;
                };
                let Some(signal) = read_signal(connection.doc()) else {
                    continue;
                };
                if filter.accept(&signal, Utc::now().timestamp_millis()) && tx.send(signal).is_err() {
                    return;
                }
            }
        });
        self.map.connection.register_task(self.map.participant, relay);
        rx
    }
}

fn read_signal(doc: &ReplicatedDoc) -> Option<NotificationSignal> {
    match read_json(doc, STATE_FIELD, NOTIFICATION_KEY) {
        Ok(signal) => signal,
        Err(e) => {
            log::warn!("Ignoring malformed notification signal: {e}");
            None
        }
    }
}
