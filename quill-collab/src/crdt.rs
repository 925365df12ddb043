//! Replicated document state over a Yrs CRDT.
//!
//! One rich-text root named `"content"` per document. Updates merge
//! commutatively and idempotently: any order, any number of repeats,
//! identical encoded bytes. Encoding is stable — the same logical state
//! always produces the same bytes — which keeps persistence and test
//! assertions reliable.

use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

use crate::error::EngineError;
use crate::storage::{DocumentStore, StoreError};

/// Name of the text root every document exposes.
pub const CONTENT_ROOT: &str = "content";

/// CRDT-layer errors.
#[derive(Debug, Clone)]
pub enum CrdtError {
    /// Persisted state bytes failed to decode.
    Corrupt(String),
    /// An incoming delta failed to decode or apply.
    InvalidUpdate(String),
}

impl std::fmt::Display for CrdtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Corrupt(e) => write!(f, "Corrupt document state: {e}"),
            Self::InvalidUpdate(e) => write!(f, "Invalid update: {e}"),
        }
    }
}

impl std::error::Error for CrdtError {}

/// The authoritative in-memory state of one document.
///
/// Uniquely owned by the document's room while the room is alive; merges
/// are serialized by the room's exclusive section.
pub struct DocumentState {
    doc: Doc,
}

impl DocumentState {
    /// Fresh, empty document.
    pub fn new() -> Self {
        let doc = Doc::new();
        {
            // Materialize the text root so encode/plain_text see it.
            let mut txn = doc.transact_mut();
            txn.get_or_insert_text(CONTENT_ROOT);
        }
        Self { doc }
    }

    /// Encode the full state as a v1 update.
    pub fn encode(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Decode previously encoded state.
    ///
    /// Corrupt bytes fail with [`CrdtError::Corrupt`]; callers decide
    /// between hard failure and recovery, never a silent empty document.
    pub fn decode(bytes: &[u8]) -> Result<Self, CrdtError> {
        let update = Update::decode_v1(bytes).map_err(|e| CrdtError::Corrupt(e.to_string()))?;
        let state = Self::new();
        {
            let mut txn = state.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| CrdtError::Corrupt(e.to_string()))?;
        }
        Ok(state)
    }

    /// Merge a delta into this state, in place.
    ///
    /// Idempotent and commutative across the update set.
    pub fn merge(&self, update: &[u8]) -> Result<(), CrdtError> {
        let update =
            Update::decode_v1(update).map_err(|e| CrdtError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CrdtError::InvalidUpdate(e.to_string()))?;
        Ok(())
    }

    /// Plain-text projection of the content root.
    pub fn plain_text(&self) -> String {
        let txn = self.doc.transact();
        txn.get_text(CONTENT_ROOT)
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    /// Encoded state vector (for diff-based sync).
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Diff against a remote state vector.
    pub fn diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, CrdtError> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|e| CrdtError::InvalidUpdate(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Apply a local text insertion and return the delta it produced.
    ///
    /// Used by editor clients and tests to generate real updates.
    pub fn insert_text(&self, index: u32, chunk: &str) -> Vec<u8> {
        let before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(CONTENT_ROOT);
            text.insert(&mut txn, index, chunk);
        }
        let txn = self.doc.transact();
        txn.encode_diff_v1(&before)
    }
}

impl Default for DocumentState {
    fn default() -> Self {
        Self::new()
    }
}

/// Load a document's state from the store.
///
/// Decodes the last saved state and replays any deltas persisted after it
/// (the crash-window log); a document with nothing persisted loads empty.
/// Corrupt saved state surfaces [`EngineError::Corrupt`].
pub fn load(store: &DocumentStore, doc_id: Uuid) -> Result<DocumentState, EngineError> {
    let state = match store.load_state(doc_id) {
        Ok(bytes) => DocumentState::decode(&bytes).map_err(EngineError::from)?,
        Err(StoreError::NotFound(_)) => DocumentState::new(),
        Err(e) => return Err(e.into()),
    };
    for (seq, delta) in store.deltas_since(doc_id, 0)? {
        if let Err(e) = state.merge(&delta) {
            log::warn!("Skipping unreplayable delta {seq} for doc {doc_id}: {e}");
        }
    }
    Ok(state)
}

/// Persist a document's current state.
pub fn save(store: &DocumentStore, doc_id: Uuid, state: &DocumentState) -> Result<(), EngineError> {
    store.save_state(doc_id, &state.encode())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;

    #[test]
    fn test_new_is_empty() {
        let state = DocumentState::new();
        assert_eq!(state.plain_text(), "");
    }

    #[test]
    fn test_insert_and_project() {
        let state = DocumentState::new();
        state.insert_text(0, "Hello");
        state.insert_text(5, ", world");
        assert_eq!(state.plain_text(), "Hello, world");
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let state = DocumentState::new();
        state.insert_text(0, "Memorandum of understanding");

        let encoded = state.encode();
        let restored = DocumentState::decode(&encoded).unwrap();
        assert_eq!(restored.plain_text(), "Memorandum of understanding");
        assert_eq!(restored.encode(), encoded);
    }

    #[test]
    fn test_decode_corrupt_bytes_fails() {
        let err = DocumentState::decode(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap_err();
        assert!(matches!(err, CrdtError::Corrupt(_)));
    }

    #[test]
    fn test_merge_invalid_update_fails() {
        let state = DocumentState::new();
        let err = state.merge(&[0xFF; 7]).unwrap_err();
        assert!(matches!(err, CrdtError::InvalidUpdate(_)));
    }

    #[test]
    fn test_merge_order_independent() {
        // Two sites produce concurrent edits; merging in either order
        // converges to byte-identical encoded state.
        let site_a = DocumentState::new();
        let site_b = DocumentState::new();
        let update_a = site_a.insert_text(0, "alpha ");
        let update_b = site_b.insert_text(0, "bravo ");

        let merged_ab = DocumentState::new();
        merged_ab.merge(&update_a).unwrap();
        merged_ab.merge(&update_b).unwrap();

        let merged_ba = DocumentState::new();
        merged_ba.merge(&update_b).unwrap();
        merged_ba.merge(&update_a).unwrap();

        assert_eq!(merged_ab.encode(), merged_ba.encode());
        assert_eq!(merged_ab.plain_text(), merged_ba.plain_text());
    }

    #[test]
    fn test_merge_idempotent() {
        let site = DocumentState::new();
        let update = site.insert_text(0, "clause 4.2");

        let once = DocumentState::new();
        once.merge(&update).unwrap();

        let twice = DocumentState::new();
        twice.merge(&update).unwrap();
        twice.merge(&update).unwrap();

        assert_eq!(once.encode(), twice.encode());
        assert_eq!(twice.plain_text(), "clause 4.2");
    }

    #[test]
    fn test_diff_sync() {
        let server = DocumentState::new();
        server.insert_text(0, "shared prefix");

        // A client that has nothing requests a full diff.
        let client = DocumentState::new();
        let diff = server.diff(&client.state_vector()).unwrap();
        client.merge(&diff).unwrap();
        assert_eq!(client.plain_text(), "shared prefix");
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

        let state = load(&store, Uuid::new_v4()).unwrap();
        assert_eq!(state.plain_text(), "");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let doc_id = Uuid::new_v4();

        let state = DocumentState::new();
        state.insert_text(0, "filed under seal");
        save(&store, doc_id, &state).unwrap();

        let loaded = load(&store, doc_id).unwrap();
        assert_eq!(loaded.plain_text(), "filed under seal");
    }

    #[test]
    fn test_load_replays_delta_log() {
        // A crash between merge and state save leaves deltas in the log;
        // load must replay them on top of the last saved state.
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let doc_id = Uuid::new_v4();

        let state = DocumentState::new();
        state.insert_text(0, "base");
        save(&store, doc_id, &state).unwrap();

        let delta = state.insert_text(4, " + unflushed");
        store.append_delta(doc_id, 1, &delta).unwrap();

        let loaded = load(&store, doc_id).unwrap();
        assert_eq!(loaded.plain_text(), "base + unflushed");
    }

    #[test]
    fn test_load_corrupt_state_is_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let doc_id = Uuid::new_v4();

        // Valid LZ4 framing around bytes that are not a yrs update.
        store.save_state(doc_id, &[0xAB; 32]).unwrap();

        let err = load(&store, doc_id).unwrap_err();
        assert!(matches!(err, EngineError::Corrupt(_)));
    }
}
