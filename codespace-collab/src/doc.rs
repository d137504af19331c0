//! Replicated document: a Yrs `Doc` exposing text, ordered-log and map
//! capabilities.
//!
//! Every mutation runs in its own transaction and returns the v1 update it
//! produced, which the caller relays to the rest of the room. Updates from
//! other replicas are merged with [`ReplicatedDoc::apply_update`]; merges are
//! commutative and idempotent, so delivery order never matters.

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Array, Doc, GetString, Map, Out, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DocError {
    #[error("Malformed update: {0}")]
    MalformedUpdate(String),
    #[error("Malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("Update could not be merged: {0}")]
    Integration(String),
}

/// Thread-safe wrapper around a Yrs document.
///
/// Yrs allows a single read-write transaction at a time, so all access goes
/// through one mutex. No transaction ever lives across an `.await`.
pub struct ReplicatedDoc {
    doc: Mutex<Doc>,
}

impl Default for ReplicatedDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedDoc {
    pub fn new() -> Self {
        Self {
            doc: Mutex::new(Doc::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Doc> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── text ────────────────────────────────────────────────────

    /// Current value of a text root (empty if it was never written).
    pub fn text(&self, name: &str) -> String {
        let doc = self.lock();
        let txn = doc.transact();
        txn.get_text(name)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    /// Replace the whole text with `new`, expressed as the smallest
    /// splice between the shared prefix and suffix.
    ///
    /// Returns `None` when the text already equals `new`.
    pub fn replace_text(&self, name: &str, new: &str) -> Option<Vec<u8>> {
        let doc = self.lock();
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text(name);
        let old = text.get_string(&txn);
        if old == new {
            return None;
        }

        let splice = Splice::between(&old, new);
        if splice.removed > 0 {
            text.remove_range(&mut txn, splice.at as u32, splice.removed as u32);
        }
        if !splice.inserted.is_empty() {
            text.insert(&mut txn, splice.at as u32, splice.inserted);
        }
        Some(txn.encode_update_v1())
    }

    /// Insert `chunk` at byte offset `index`.
    pub fn insert_text(&self, name: &str, index: u32, chunk: &str) -> Vec<u8> {
        let doc = self.lock();
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text(name);
        text.insert(&mut txn, index, chunk);
        txn.encode_update_v1()
    }

    /// Remove `len` bytes starting at byte offset `index`.
    pub fn delete_text(&self, name: &str, index: u32, len: u32) -> Vec<u8> {
        let doc = self.lock();
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text(name);
        text.remove_range(&mut txn, index, len);
        txn.encode_update_v1()
    }

    // ── ordered log ─────────────────────────────────────────────

    /// Append one entry to an ordered log. Appends from different replicas
    /// never overwrite each other.
    pub fn push_log(&self, name: &str, entry: String) -> Vec<u8> {
        let doc = self.lock();
        let mut txn = doc.transact_mut();
        let log = txn.get_or_insert_array(name);
        log.push_back(&mut txn, entry);
        txn.encode_update_v1()
    }

    /// All string entries of a log in replicated order.
    pub fn log(&self, name: &str) -> Vec<String> {
        let doc = self.lock();
        let txn = doc.transact();
        match txn.get_array(name) {
            Some(log) => log.iter(&txn).filter_map(out_to_string).collect(),
            None => Vec::new(),
        }
    }

    pub fn log_len(&self, name: &str) -> u32 {
        let doc = self.lock();
        let txn = doc.transact();
        txn.get_array(name).map_or(0, |log| log.len(&txn))
    }

    // ── map ─────────────────────────────────────────────────────

    /// Last-writer-wins assignment of `key` in map `name`.
    pub fn map_set(&self, name: &str, key: &str, value: String) -> Vec<u8> {
        let doc = self.lock();
        let mut txn = doc.transact_mut();
        let map = txn.get_or_insert_map(name);
        map.insert(&mut txn, key, value);
        txn.encode_update_v1()
    }

    pub fn map_get(&self, name: &str, key: &str) -> Option<String> {
        let doc = self.lock();
        let txn = doc.transact();
        txn.get_map(name)
            .and_then(|map| map.get(&txn, key))
            .and_then(out_to_string)
    }

    // ── sync ────────────────────────────────────────────────────

    /// Encoded state vector, sent as SyncStep1.
    pub fn state_vector(&self) -> Vec<u8> {
        let doc = self.lock();
        let txn = doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that the remote state vector lacks.
    pub fn diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|e| DocError::MalformedStateVector(e.to_string()))?;
        let doc = self.lock();
        let txn = doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let doc = self.lock();
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge an update produced by any replica.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocError> {
        let update = Update::decode_v1(update).map_err(|e| DocError::MalformedUpdate(e.to_string()))?;
        let doc = self.lock();
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocError::Integration(e.to_string()))?;
        Ok(())
    }
}

fn out_to_string(out: Out) -> Option<String> {
    match out {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

/// Minimal replacement turning `old` into `new`, in byte offsets that always
/// fall on char boundaries.
#[derive(Debug, PartialEq)]
struct Splice<'a> {
    at: usize,
    removed: usize,
    inserted: &'a str,
}

impl<'a> Splice<'a> {
    fn between(old: &str, new: &'a str) -> Self {
        let prefix: usize = old
            .chars()
            .zip(new.chars())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| a.len_utf8())
            .sum();

        let old_rest = &old[prefix..];
        let new_rest = &new[prefix..];
        let suffix: usize = old_rest
            .chars()
            .rev()
            .zip(new_rest.chars().rev())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| a.len_utf8())
            .sum();

        Splice {
            at: prefix,
            removed: old_rest.len() - suffix,
            inserted: &new_rest[..new_rest.len() - suffix],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "content";

    /// Deliver every update to every other replica, in the given order.
    fn deliver(replicas: &[ReplicatedDoc], updates: &[(usize, Vec<u8>)], order: &[usize]) {
        for &i in order {
            let (origin, update) = &updates[i];
            for (idx, replica) in replicas.iter().enumerate() {
                if idx != *origin {
                    replica.apply_update(update).unwrap();
                }
            }
        }
    }

    #[test]
    fn test_splice_minimal() {
        assert_eq!(
            Splice::between("hello world", "hello brave world"),
            Splice { at: 6, removed: 0, inserted: "brave " }
        );
        assert_eq!(
            Splice::between("abcdef", "abef"),
            Splice { at: 2, removed: 2, inserted: "" }
        );
        assert_eq!(
            Splice::between("", "seed"),
            Splice { at: 0, removed: 0, inserted: "seed" }
        );
    }

    #[test]
    fn test_splice_multibyte_boundaries() {
        let splice = Splice::between("héllo wörld", "héllo wérld");
        assert_eq!(splice.inserted, "é");
        assert_eq!(splice.removed, "ö".len());
        assert_eq!(splice.at, "héllo w".len());
    }

    #[test]
    fn test_replace_text_roundtrip() {
        let doc = ReplicatedDoc::new();
        assert!(doc.replace_text(TEXT, "fn main() {}").is_some());
        assert!(doc.replace_text(TEXT, "fn main() { run(); }").is_some());
        assert_eq!(doc.text(TEXT), "fn main() { run(); }");
        assert!(doc.replace_text(TEXT, "fn main() { run(); }").is_none());
    }

    #[test]
    fn test_text_missing_root_is_empty() {
        let doc = ReplicatedDoc::new();
        assert_eq!(doc.text("never-written"), "");
        assert!(doc.log("never-written").is_empty());
        assert_eq!(doc.map_get("never", "written"), None);
    }

    #[test]
    fn test_replicas_converge_regardless_of_order() {
        let replicas: Vec<ReplicatedDoc> = (0..3).map(|_| ReplicatedDoc::new()).collect();

        let seed = replicas[0].replace_text(TEXT, "let a = 1;").unwrap();
        replicas[1].apply_update(&seed).unwrap();
        replicas[2].apply_update(&seed).unwrap();

        let updates = vec![
            (0, replicas[0].insert_text(TEXT, 0, "// A\n")),
            (1, replicas[1].replace_text(TEXT, "let a = 2;").unwrap()),
            (2, replicas[2].insert_text(TEXT, 10, "\nlet c = 3;")),
            (1, replicas[1].delete_text(TEXT, 0, 4)),
            (0, replicas[0].insert_text(TEXT, 0, "#")),
        ];

        deliver(&replicas, &updates, &[4, 2, 0, 3, 1]);

        let first = replicas[0].text(TEXT);
        assert!(replicas.iter().all(|r| r.text(TEXT) == first), "replicas diverged");
        assert!(first.contains("let c = 3;"));
    }

    #[test]
    fn test_convergence_many_orders() {
        let orders: [[usize; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1]];
        let mut finals = Vec::new();

        for order in orders {
            let replicas: Vec<ReplicatedDoc> = (0..2).map(|_| ReplicatedDoc::new()).collect();
            let updates = vec![
                (0, replicas[0].insert_text(TEXT, 0, "left")),
                (1, replicas[1].insert_text(TEXT, 0, "right")),
                (0, replicas[0].insert_text(TEXT, 0, ">")),
                (1, replicas[1].insert_text(TEXT, 0, "<")),
            ];
            deliver(&replicas, &updates, &order);
            assert_eq!(replicas[0].text(TEXT), replicas[1].text(TEXT));
            finals.push(replicas[0].text(TEXT).len());
        }
        // Nothing is lost whatever the order.
        assert!(finals.iter().all(|len| *len == "left".len() + "right".len() + 2));
    }

    #[test]
    fn test_apply_update_idempotent() {
        let a = ReplicatedDoc::new();
        let b = ReplicatedDoc::new();
        let update = a.replace_text(TEXT, "once").unwrap();

        b.apply_update(&update).unwrap();
        b.apply_update(&update).unwrap();
        assert_eq!(b.text(TEXT), "once");
    }

    #[test]
    fn test_log_appends_never_conflict() {
        let a = ReplicatedDoc::new();
        let b = ReplicatedDoc::new();

        let ua = a.push_log("commands", "from-a".into());
        let ub = b.push_log("commands", "from-b".into());
        a.apply_update(&ub).unwrap();
        b.apply_update(&ua).unwrap();

        assert_eq!(a.log("commands"), b.log("commands"));
        assert_eq!(a.log_len("commands"), 2);
    }

    #[test]
    fn test_map_last_writer_converges() {
        let a = ReplicatedDoc::new();
        let b = ReplicatedDoc::new();

        let ua = a.map_set("state", "history", "[1]".into());
        let ub = b.map_set("state", "history", "[2]".into());
        a.apply_update(&ub).unwrap();
        b.apply_update(&ua).unwrap();

        assert_eq!(a.map_get("state", "history"), b.map_get("state", "history"));
    }

    #[test]
    fn test_state_vector_diff_sync() {
        let a = ReplicatedDoc::new();
        let b = ReplicatedDoc::new();
        a.replace_text(TEXT, "from a").unwrap();

        let diff = a.diff(&b.state_vector()).unwrap();
        b.apply_update(&diff).unwrap();
        assert_eq!(b.text(TEXT), "from a");

        let full = a.encode_state();
        let c = ReplicatedDoc::new();
        c.apply_update(&full).unwrap();
        assert_eq!(c.text(TEXT), "from a");
    }

    #[test]
    fn test_malformed_inputs_rejected() {
        let doc = ReplicatedDoc::new();
        assert!(matches!(doc.apply_update(&[0xFF, 0xFF, 0xFF]), Err(DocError::MalformedUpdate(_))));
        assert!(matches!(doc.diff(&[0xFF, 0xFF, 0xFF]), Err(DocError::MalformedStateVector(_))));
    }

    #[test]
    fn test_update_that_cannot_merge_is_an_error() {
        // Client 1 writes "ab" into the `content` root.
        let mut seed = vec![1, 1, 1, 0, 0x04, 1, 7];
        seed.extend_from_slice(b"content");
        seed.extend_from_slice(&[2, b'a', b'b', 0]);
        // Client 2 inserts "x" into item (1, 0), which is text, not a type.
        let orphan = vec![1, 1, 2, 0, 0x04, 0, 1, 0, 1, b'x', 0];

        let doc = ReplicatedDoc::new();
        doc.apply_update(&seed).unwrap();
        assert_eq!(doc.text("content"), "ab");

        let result = doc.apply_update(&orphan);
        assert!(matches!(result, Err(DocError::Integration(_))), "got {result:?}");
        assert_eq!(doc.text("content"), "ab");
    }

    #[test]
    fn test_concurrent_seeds_keep_both() {
        let a = ReplicatedDoc::new();
        let b = ReplicatedDoc::new();
        let ua = a.replace_text(TEXT, "alpha").unwrap();
        let ub = b.replace_text(TEXT, "beta").unwrap();
        a.apply_update(&ub).unwrap();
        b.apply_update(&ua).unwrap();

        let merged = a.text(TEXT);
        assert_eq!(merged, b.text(TEXT));
        assert_eq!(merged.len(), "alpha".len() + "beta".len());
        assert!(merged.contains("alpha") && merged.contains("beta"));
    }
}
