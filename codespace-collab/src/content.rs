//! Content sync: reconcile a local text buffer with the room's shared text
//! once, then relay edits both ways.
//!
//! Reconciliation runs once per connection, the first time it is synced
//! with the relay:
//!
//! | shared text | local buffer | outcome                          |
//! |-------------|--------------|----------------------------------|
//! | empty       | empty        | nothing to do                    |
//! | empty       | non-empty    | seed shared text (first editor)  |
//! | non-empty   | differs      | local buffer adopts shared text  |
//!
//! Two first joiners racing to seed the same empty document both insert;
//! the CRDT keeps both insertions, so the merged text may contain both
//! buffers. There is no causal check to prevent that.

use std::sync::Arc;

use tokio::sync::watch;

use crate::registry::ParticipantHandle;
use crate::room::{ParticipantId, RoomConnection, RoomError};

/// Text root used by the shared editor.
pub const TEXT_FIELD: &str = "content";

/// Result of the initial reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Both sides were empty, or already equal.
    Unchanged,
    /// The shared text was empty and now holds the local buffer.
    Seeded,
    /// The local buffer must be replaced by this shared text.
    Adopted(String),
    /// Another participant already reconciled this connection; this is the
    /// current shared text.
    AlreadyInitialized(String),
}

impl Reconciliation {
    /// The text the local buffer should show, if it has to change.
    pub fn replacement(&self) -> Option<&str> {
        match self {
            Reconciliation::Adopted(text) | Reconciliation::AlreadyInitialized(text) => {
                Some(text)
            }
            Reconciliation::Unchanged | Reconciliation::Seeded => None,
        }
    }
}

pub struct ContentSync {
    connection: Arc<RoomConnection>,
    participant: ParticipantId,
    field: String,
}

impl ContentSync {
    pub fn new(handle: &ParticipantHandle) -> Self {
        Self::with_field(handle, TEXT_FIELD)
    }

    pub fn with_field(handle: &ParticipantHandle, field: impl Into<String>) -> Self {
        Self {
            connection: handle.connection().clone(),
            participant: handle.id(),
            field: field.into(),
        }
    }

    /// Wait for the first sync with the relay, then reconcile `local`.
    pub async fn initialize(&self, local: &str) -> Result<Reconciliation, RoomError> {
        self.connection.wait_synced().await?;
        Ok(self.reconcile(local))
    }

    /// Apply the reconciliation rule against the current shared text.
    /// Only the first call per connection can change the document.
    pub fn reconcile(&self, local: &str) -> Reconciliation {
        if !self.connection.mark_initialized() {
            let shared = self.text();
            if shared == local {
                return Reconciliation::Unchanged;
            }
            return Reconciliation::AlreadyInitialized(shared);
        }

        let shared = self.text();
        let outcome = match (shared.is_empty(), local.is_empty()) {
            (true, true) => Reconciliation::Unchanged,
            (true, false) => {
                if let Some(update) = self.connection.doc().replace_text(&self.field, local) {
                    self.connection.commit(self.participant, update);
                }
                Reconciliation::Seeded
            }
            (false, _) if shared == local => Reconciliation::Unchanged,
            (false, _) => Reconciliation::Adopted(shared),
        };
        log::debug!(
            "Reconciled {} field '{}': {:?}",
            self.connection.room_id(),
            self.field,
            outcome
        );
        outcome
    }

    pub fn text(&self) -> String {
        self.connection.doc().text(&self.field)
    }

    /// Push the local buffer's new value. Returns `false` if nothing changed.
    pub fn apply_local_edit(&self, new: &str) -> bool {
        match self.connection.doc().replace_text(&self.field, new) {
            Some(update) => {
                self.connection.commit(self.participant, update);
                true
            }
            None => false,
        }
    }

    /// Shared text as seen by this participant's buffer: changes made by
    /// anyone else, debounced by `content_debounce`.
    pub fn remote_changes(&self) -> watch::Receiver<String> {
        let field = self.field.clone();
        let debounce = self.connection.config().content_debounce();
        self.connection
            .watch_document(self.participant, true, debounce, move |doc| doc.text(&field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomConfig;
    use crate::doc::ReplicatedDoc;
    use crate::presence::Identity;
    use crate::protocol::{MessageType, SyncMessage};
    use crate::registry::RoomRegistry;
    use crate::transport::testing::{RemoteEnd, ScriptedDialer};
    use std::time::Duration;
    use uuid::Uuid;

    /// Answer the client's handshake with `relay`'s state.
    async fn serve_sync(end: &mut RemoteEnd, relay: &ReplicatedDoc) {
        loop {
            let msg = end.from_client.recv().await.expect("client closed");
            if msg.msg_type == MessageType::SyncStep1 {
                let diff = relay.diff(&msg.payload).unwrap();
                end.to_client
                    .send(SyncMessage::sync_step2(Uuid::nil(), &msg.room(), diff))
                    .unwrap();
                return;
            }
        }
    }

    fn registry() -> (RoomRegistry, tokio::sync::mpsc::UnboundedReceiver<RemoteEnd>) {
        let (dialer, ends) = ScriptedDialer::new();
        let registry = RoomRegistry::new(
            RoomConfig::default(),
            Identity::new("u1", "Alice"),
            Arc::new(dialer),
        );
        (registry, ends)
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_joiner_adopts_shared_text() {
        let (registry, mut ends) = registry();
        let handle = registry.join("editor-repo1-file.ts").unwrap();
        let sync = ContentSync::new(&handle);

        let relay = ReplicatedDoc::new();
        relay.replace_text(TEXT_FIELD, "const x=1;").unwrap();
        let mut end = ends.recv().await.unwrap();
        serve_sync(&mut end, &relay).await;

        let outcome = sync.initialize("").await.unwrap();
        assert_eq!(outcome, Reconciliation::Adopted("const x=1;".into()));
        assert_eq!(outcome.replacement(), Some("const x=1;"));
        handle.release();
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_editor_seeds_shared_text() {
        let (registry, mut ends) = registry();
        let handle = registry.join("editor-repo1-file.ts").unwrap();
        let sync = ContentSync::new(&handle);

        let mut end = ends.recv().await.unwrap();
        serve_sync(&mut end, &ReplicatedDoc::new()).await;

        assert_eq!(sync.initialize("hello").await.unwrap(), Reconciliation::Seeded);
        assert_eq!(sync.text(), "hello");

        // The seed is relayed as an update.
        let relay = ReplicatedDoc::new();
        loop {
            let msg = end.from_client.recv().await.unwrap();
            if msg.msg_type == MessageType::Update {
                relay.apply_update(&msg.payload).unwrap();
                break;
            }
        }
        assert_eq!(relay.text(TEXT_FIELD), "hello");
        handle.release();
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_empty_is_noop() {
        let (registry, mut ends) = registry();
        let handle = registry.join("editor-r-f").unwrap();
        let sync = ContentSync::new(&handle);
        let mut end = ends.recv().await.unwrap();
        serve_sync(&mut end, &ReplicatedDoc::new()).await;

        assert_eq!(sync.initialize("").await.unwrap(), Reconciliation::Unchanged);
        assert_eq!(sync.text(), "");
        handle.release();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_twice_is_noop() {
        let (registry, mut ends) = registry();
        let first = registry.join("editor-r-f").unwrap();
        let second = registry.join("editor-r-f").unwrap();
        let mut end = ends.recv().await.unwrap();
        serve_sync(&mut end, &ReplicatedDoc::new()).await;

        let a = ContentSync::new(&first);
        let b = ContentSync::new(&second);
        assert_eq!(a.initialize("from a").await.unwrap(), Reconciliation::Seeded);
        assert_eq!(
            b.initialize("from b").await.unwrap(),
            Reconciliation::AlreadyInitialized("from a".into())
        );
        assert_eq!(a.reconcile("something else"), Reconciliation::AlreadyInitialized("from a".into()));
        assert_eq!(a.text(), "from a");

        first.release();
        second.release();
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_edits_reach_other_participants() {
        let (registry, mut ends) = registry();
        let editor = registry.join("editor-r-f").unwrap();
        let viewer = registry.join("editor-r-f").unwrap();
        let _end = ends.recv().await.unwrap();

        let editing = ContentSync::new(&editor);
        let viewing = ContentSync::new(&viewer);
        let mut seen_by_editor = editing.remote_changes();
        let mut seen_by_viewer = viewing.remote_changes();

        assert!(editing.apply_local_edit("fn main() {}"));
        assert!(!editing.apply_local_edit("fn main() {}"));

        seen_by_viewer.changed().await.unwrap();
        assert_eq!(*seen_by_viewer.borrow(), "fn main() {}");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!seen_by_editor.has_changed().unwrap());

        editor.release();
        viewer.release();
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_fails_on_errored_transport() {
        let registry = RoomRegistry::new(
            RoomConfig {
                reconnect_initial_ms: 10,
                reconnect_max_ms: 10,
                reconnect_max_attempts: 1,
                ..RoomConfig::default()
            },
            Identity::new("u1", "Alice"),
            Arc::new(crate::transport::testing::FailingDialer::default()),
        );
        let handle = registry.join("editor-r-f").unwrap();
        let sync = ContentSync::new(&handle);

        assert!(matches!(sync.initialize("x").await, Err(RoomError::TransportErrored(_))));
        assert!(!handle.connection().is_initialized());
        handle.release();
    }
}
