//! Append-only replicated log of executed console commands.
//!
//! Entries are JSON objects pushed onto the `commands` array of the room's
//! document. The array's replicated order is the only ordering; timestamps
//! are informational.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::registry::ParticipantHandle;
use crate::room::{ParticipantId, RoomConnection, RoomError};

pub const COMMANDS_FIELD: &str = "commands";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandLogEntry {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub command: String,
    pub output: String,
    /// Unix milliseconds at the author's clock
    pub timestamp: i64,
}

impl CommandLogEntry {
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        command: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            user_name: user_name.into(),
            command: command.into(),
            output: output.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn is_authored_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

fn parse_entries(raw: Vec<String>) -> Vec<CommandLogEntry> {
    raw.into_iter()
        .filter_map(|json| match serde_json::from_str(&json) {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("Skipping malformed command log entry: {e}");
                None
            }
        })
        .collect()
}

pub struct CommandLog {
    connection: Arc<RoomConnection>,
    participant: ParticipantId,
}

impl CommandLog {
    pub fn new(handle: &ParticipantHandle) -> Self {
        Self {
            connection: handle.connection().clone(),
            participant: handle.id(),
        }
    }

    /// Record a command run by the local user.
    pub fn append(
        &self,
        command: impl Into<String>,
        output: impl Into<String>,
    ) -> Result<CommandLogEntry, RoomError> {
        let identity = self.connection.local_identity();
        let entry = CommandLogEntry::new(identity.user_id, identity.display_name, command, output);
        self.append_entry(&entry)?;
        Ok(entry)
    }

    pub fn append_entry(&self, entry: &CommandLogEntry) -> Result<(), RoomError> {
        let json = serde_json::to_string(entry)?;
        let update = self.connection.doc().push_log(COMMANDS_FIELD, json);
        self.connection.commit(self.participant, update);
        Ok(())
    }

    pub fn entries(&self) -> Vec<CommandLogEntry> {
        parse_entries(self.connection.doc().log(COMMANDS_FIELD))
    }

    pub fn len(&self) -> usize {
        self.connection.doc().log_len(COMMANDS_FIELD) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The full log, republished on every change from any participant.
    pub fn changes(&self) -> watch::Receiver<Vec<CommandLogEntry>> {
        self.connection.watch_document(
            self.participant,
            false,
            std::time::Duration::ZERO,
            |doc| parse_entries(doc.log(COMMANDS_FIELD)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomConfig;
    use crate::presence::Identity;
    use crate::registry::RoomRegistry;
    use crate::transport::testing::PendingDialer;

    fn registry(user: &str, name: &str) -> RoomRegistry {
        RoomRegistry::new(RoomConfig::default(), Identity::new(user, name), Arc::new(PendingDialer))
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = CommandLogEntry::new("u1", "Alice", "ls", "a.txt");
        let json: serde_json::Value = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["userName"], "Alice");
        assert_eq!(json["command"], "ls");
        assert!(json["timestamp"].is_i64());
        assert!(entry.is_authored_by("u1"));
        assert!(!entry.is_authored_by("u2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_and_read_back() {
        let registry = registry("u1", "Alice");
        let handle = registry.join("terminal-repo1").unwrap();
        let log = CommandLog::new(&handle);
        assert!(log.is_empty());

        let first = log.append("cargo build", "ok").unwrap();
        log.append("cargo test", "3 passed").unwrap();

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], first);
        assert_eq!(entries[1].command, "cargo test");
        assert!(entries.iter().all(|e| e.is_authored_by("u1")));
        handle.release();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_appends_keep_both_authors() {
        let alice = registry("u1", "Alice");
        let bob = registry("u2", "Bob");
        let ha = alice.join("terminal-repo1").unwrap();
        let hb = bob.join("terminal-repo1").unwrap();
        let (la, lb) = (CommandLog::new(&ha), CommandLog::new(&hb));

        la.append("ls", "").unwrap();
        lb.append("pwd", "/").unwrap();

        // Exchange full state both ways, as the relay would.
        let state_a = ha.connection().doc().encode_state();
        let state_b = hb.connection().doc().encode_state();
        ha.connection().doc().apply_update(&state_b).unwrap();
        hb.connection().doc().apply_update(&state_a).unwrap();

        let (ea, eb) = (la.entries(), lb.entries());
        assert_eq!(ea, eb);
        assert_eq!(ea.len(), 2);
        assert_eq!(ea.iter().filter(|e| e.is_authored_by("u1")).count(), 1);
        assert_eq!(ea.iter().filter(|e| e.is_authored_by("u2")).count(), 1);

        ha.release();
        hb.release();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_entries_skipped() {
        let registry = registry("u1", "Alice");
        let handle = registry.join("terminal-repo1").unwrap();
        let log = CommandLog::new(&handle);

        handle.connection().doc().push_log(COMMANDS_FIELD, "not json".into());
        log.append("echo hi", "hi").unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(log.entries().len(), 1);
        handle.release();
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_include_own_appends() {
        let registry = registry("u1", "Alice");
        let handle = registry.join("terminal-repo1").unwrap();
        let log = CommandLog::new(&handle);
        let mut changes = log.changes();

        log.append("make", "done").unwrap();
        changes.changed().await.unwrap();
        assert_eq!(changes.borrow().len(), 1);
        handle.release();
    }
}
