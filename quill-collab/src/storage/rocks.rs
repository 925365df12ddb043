//! RocksDB-backed durable store for documents, grants, and history.
//!
//! Column families:
//! - `state`     — live CRDT document state (LZ4 compressed)
//! - `deltas`    — per-document delta log (LZ4, keyed by doc_id:seq)
//! - `documents` — document rows (tenant, project, owner, current version)
//! - `snapshots` — immutable version records (keyed by doc_id:version)
//! - `grants`    — collaborator grants (keyed by doc_id:user_id)
//!
//! The delta log bounds the crash window on the merge path: deltas are
//! appended as updates arrive and compacted away after each successful
//! state save, so recovery replays only what the last save missed.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

use crate::acl::{AccessBackend, Grant};
use crate::error::EngineError;
use crate::versions::SnapshotRecord;

/// Column family names.
const CF_STATE: &str = "state";
const CF_DELTAS: &str = "deltas";
const CF_DOCUMENTS: &str = "documents";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_GRANTS: &str = "grants";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_STATE, CF_DELTAS, CF_DOCUMENTS, CF_SNAPSHOTS, CF_GRANTS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// A document row: ownership, tenancy, and version bookkeeping.
///
/// `current_version` always equals the newest snapshot's number and is
/// never decremented. `owner_id` is the creator of the parent project,
/// denormalized at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRow {
    pub doc_id: Uuid,
    pub project_id: Uuid,
    pub tenant_id: Uuid,
    pub owner_id: Uuid,
    pub current_version: u64,
    /// Seconds since epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentRow {
    pub fn new(doc_id: Uuid, project_id: Uuid, tenant_id: Uuid, owner_id: Uuid) -> Self {
        let now = now_secs();
        Self {
            doc_id,
            project_id,
            tenant_id,
            owner_id,
            current_version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (row, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(row)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    Database(String),
    /// Row or blob not found
    NotFound(Uuid),
    /// Persisted bytes failed decompression or decoding
    Corrupt(String),
    /// Serialization failed
    Serialization(String),
    /// I/O error
    Io(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Not found: {id}"),
            StoreError::Corrupt(e) => write!(f, "Corrupt stored bytes: {e}"),
            StoreError::Serialization(e) => write!(f, "Serialization error: {e}"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store at the configured path, creating the database and
    /// column families as needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(name, &config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_STATE => {
                // Large blobs, point lookups only
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_DELTAS | CF_SNAPSHOTS | CF_GRANTS => {
                // Prefix-scanned by doc_id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_DOCUMENTS => {
                // Small rows, frequent reads on every access resolution
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Document rows ────────────────────────────────────────────────

    /// Insert or replace a document row.
    pub fn put_document(&self, row: &DocumentRow) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        self.db.put_cf(&cf, row.doc_id.as_bytes(), row.encode()?)?;
        Ok(())
    }

    /// Load a document row, `None` when the document is unknown.
    pub fn document(&self, doc_id: Uuid) -> Result<Option<DocumentRow>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(DocumentRow::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn document_exists(&self, doc_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        Ok(self.db.get_cf(&cf, doc_id.as_bytes())?.is_some())
    }

    // ─── Live CRDT state ──────────────────────────────────────────────

    /// Save the full encoded document state (LZ4 compressed).
    pub fn save_state(&self, doc_id: Uuid, state: &[u8]) -> Result<(), StoreError> {
        let cf_state = self.cf(CF_STATE)?;
        let compressed = lz4_flex::compress_prepend_size(state);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_state, doc_id.as_bytes(), &compressed);

        // Bump the row's modification time alongside the state write.
        if let Some(mut row) = self.document(doc_id)? {
            let cf_docs = self.cf(CF_DOCUMENTS)?;
            row.updated_at = now_secs();
            batch.put_cf(&cf_docs, doc_id.as_bytes(), row.encode()?);
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Load the encoded document state (LZ4 decompressed).
    ///
    /// A missing blob is `NotFound`; a blob that fails decompression is
    /// `Corrupt` — callers must be able to tell the two apart.
    pub fn load_state(&self, doc_id: Uuid) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_STATE)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::Corrupt(e.to_string())),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    // ─── Delta log ────────────────────────────────────────────────────

    /// Append a delta to the document's log.
    ///
    /// Key format: `<doc_id:16><seq:8 BE>`; value LZ4 compressed.
    pub fn append_delta(&self, doc_id: Uuid, seq: u64, delta: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let compressed = lz4_flex::compress_prepend_size(delta);
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(false);
        self.db
            .put_cf_opt(&cf, composite_key(doc_id, seq), &compressed, &write_opts)?;
        Ok(())
    }

    /// Load deltas with sequence ≥ `since_seq`, in order.
    pub fn deltas_since(
        &self,
        doc_id: Uuid,
        since_seq: u64,
    ) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let start_key = composite_key(doc_id, since_seq);

        let mut deltas = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let seq = u64::from_be_bytes(
                key[16..24]
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("malformed delta key".into()))?,
            );
            let decompressed = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            deltas.push((seq, decompressed));
        }

        Ok(deltas)
    }

    /// Highest delta sequence for a document, if any.
    pub fn last_delta_seq(&self, doc_id: Uuid) -> Result<Option<u64>, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let end_key = composite_key(doc_id, u64::MAX);
        let mut iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&end_key, rocksdb::Direction::Reverse),
        );
        match iter.next() {
            Some(item) => {
                let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
                if key.len() >= 24 && &key[..16] == doc_id.as_bytes() {
                    let seq = u64::from_be_bytes(
                        key[16..24]
                            .try_into()
                            .map_err(|_| StoreError::Corrupt("malformed delta key".into()))?,
                    );
                    Ok(Some(seq))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    /// Delete deltas with sequence ≤ `up_to_seq` (after a state save).
    pub fn compact_deltas(&self, doc_id: Uuid, up_to_seq: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let start_key = composite_key(doc_id, 0);

        let mut count = 0u64;
        let mut batch = WriteBatch::default();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let seq = u64::from_be_bytes(
                key[16..24]
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("malformed delta key".into()))?,
            );
            if seq > up_to_seq {
                break;
            }
            batch.delete_cf(&cf, &key);
            count += 1;
        }

        if count > 0 {
            self.db.write(batch)?;
        }
        Ok(count)
    }

    // ─── Snapshots (version history) ──────────────────────────────────

    /// Append an immutable snapshot record and advance the document row's
    /// `current_version` in the same atomic batch.
    pub fn put_snapshot(&self, record: &SnapshotRecord) -> Result<(), StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let encoded = bincode::serde::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snap, composite_key(record.doc_id, record.version), &compressed);

        if let Some(mut row) = self.document(record.doc_id)? {
            let cf_docs = self.cf(CF_DOCUMENTS)?;
            row.current_version = row.current_version.max(record.version);
            row.updated_at = now_secs();
            batch.put_cf(&cf_docs, record.doc_id.as_bytes(), row.encode()?);
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Load one snapshot record.
    pub fn snapshot(&self, doc_id: Uuid, version: u64) -> Result<Option<SnapshotRecord>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, composite_key(doc_id, version))? {
            Some(compressed) => {
                let encoded = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                let (record, _) =
                    bincode::serde::decode_from_slice(&encoded, bincode::config::standard())
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List up to `limit` snapshots, newest first.
    pub fn list_snapshots(
        &self,
        doc_id: Uuid,
        limit: usize,
    ) -> Result<Vec<SnapshotRecord>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let end_key = composite_key(doc_id, u64::MAX);

        let mut records = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&end_key, rocksdb::Direction::Reverse),
        );
        for item in iter {
            if records.len() >= limit {
                break;
            }
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let encoded = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let (record, _) =
                bincode::serde::decode_from_slice(&encoded, bincode::config::standard())
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            records.push(record);
        }

        Ok(records)
    }

    /// Highest snapshot version for a document, if any.
    pub fn latest_snapshot_version(&self, doc_id: Uuid) -> Result<Option<u64>, StoreError> {
        Ok(self.list_snapshots(doc_id, 1)?.first().map(|r| r.version))
    }

    // ─── Grants ───────────────────────────────────────────────────────

    /// Insert or replace a collaborator grant.
    pub fn put_grant_row(&self, grant: &Grant) -> Result<(), StoreError> {
        let cf = self.cf(CF_GRANTS)?;
        let encoded = bincode::serde::encode_to_vec(grant, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.db
            .put_cf(&cf, grant_key(grant.doc_id, grant.user_id), &encoded)?;
        Ok(())
    }

    /// Load a grant, `None` when absent.
    pub fn grant_row(&self, doc_id: Uuid, user_id: Uuid) -> Result<Option<Grant>, StoreError> {
        let cf = self.cf(CF_GRANTS)?;
        match self.db.get_cf(&cf, grant_key(doc_id, user_id))? {
            Some(bytes) => {
                let (grant, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(Some(grant))
            }
            None => Ok(None),
        }
    }

    /// Delete a grant; returns whether it existed.
    pub fn delete_grant_row(&self, doc_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_GRANTS)?;
        let key = grant_key(doc_id, user_id);
        let existed = self.db.get_cf(&cf, &key)?.is_some();
        if existed {
            self.db.delete_cf(&cf, &key)?;
        }
        Ok(existed)
    }

    /// All grants for one document.
    pub fn list_grant_rows(&self, doc_id: Uuid) -> Result<Vec<Grant>, StoreError> {
        let cf = self.cf(CF_GRANTS)?;
        let start_key = grant_key(doc_id, Uuid::nil());

        let mut grants = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 32 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let (grant, _) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            grants.push(grant);
        }

        Ok(grants)
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

/// The store is the production access backend: ownership derives from the
/// document row's denormalized project creator, tenancy from its tenant
/// column.
impl AccessBackend for DocumentStore {
    fn document_tenant(&self, doc_id: Uuid) -> Result<Option<Uuid>, EngineError> {
        Ok(self.document(doc_id)?.map(|row| row.tenant_id))
    }

    fn is_owner(&self, doc_id: Uuid, user_id: Uuid) -> Result<bool, EngineError> {
        Ok(self
            .document(doc_id)?
            .is_some_and(|row| row.owner_id == user_id))
    }

    fn grant(&self, doc_id: Uuid, user_id: Uuid) -> Result<Option<Grant>, EngineError> {
        Ok(self.grant_row(doc_id, user_id)?)
    }

    fn put_grant(&self, grant: &Grant) -> Result<(), EngineError> {
        Ok(self.put_grant_row(grant)?)
    }

    fn remove_grant(&self, doc_id: Uuid, user_id: Uuid) -> Result<bool, EngineError> {
        Ok(self.delete_grant_row(doc_id, user_id)?)
    }

    fn list_grants(&self, doc_id: Uuid) -> Result<Vec<Grant>, EngineError> {
        Ok(self.list_grant_rows(doc_id)?)
    }
}

/// Build a `<doc_id:16><n:8 BE>` composite key.
fn composite_key(doc_id: Uuid, n: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(doc_id.as_bytes());
    key.extend_from_slice(&n.to_be_bytes());
    key
}

/// Build a `<doc_id:16><user_id:16>` grant key.
fn grant_key(doc_id: Uuid, user_id: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(doc_id.as_bytes());
    key.extend_from_slice(user_id.as_bytes());
    key
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::Level;

    fn open_store() -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    fn sample_grant(doc_id: Uuid, user_id: Uuid, level: Level) -> Grant {
        Grant {
            doc_id,
            user_id,
            level,
            granted_by: Uuid::new_v4(),
            created_at: 1,
            updated_at: 1,
        }
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_store();
        assert!(store.path().exists());
    }

    #[test]
    fn test_document_row_roundtrip() {
        let (_dir, store) = open_store();
        let row = DocumentRow::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        assert!(!store.document_exists(row.doc_id).unwrap());
        store.put_document(&row).unwrap();
        assert!(store.document_exists(row.doc_id).unwrap());

        let loaded = store.document(row.doc_id).unwrap().unwrap();
        assert_eq!(loaded, row);
        assert_eq!(loaded.current_version, 0);
    }

    #[test]
    fn test_state_save_load() {
        let (_dir, store) = open_store();
        let doc_id = Uuid::new_v4();
        let data = b"engagement letter draft with enough repetition to compress well well well";

        store.save_state(doc_id, data).unwrap();
        assert_eq!(store.load_state(doc_id).unwrap(), data);
    }

    #[test]
    fn test_state_not_found() {
        let (_dir, store) = open_store();
        let err = store.load_state(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_delta_log_roundtrip() {
        let (_dir, store) = open_store();
        let doc_id = Uuid::new_v4();

        for seq in 1..=10u64 {
            store
                .append_delta(doc_id, seq, format!("delta_{seq}").as_bytes())
                .unwrap();
        }

        let all = store.deltas_since(doc_id, 0).unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[0].0, 1);
        assert_eq!(all[0].1, b"delta_1");
        assert_eq!(all[9].0, 10);

        let since5 = store.deltas_since(doc_id, 5).unwrap();
        assert_eq!(since5.len(), 6);
        assert_eq!(since5[0].0, 5);

        assert_eq!(store.last_delta_seq(doc_id).unwrap(), Some(10));
    }

    #[test]
    fn test_delta_compaction() {
        let (_dir, store) = open_store();
        let doc_id = Uuid::new_v4();

        for seq in 1..=20u64 {
            store.append_delta(doc_id, seq, &[seq as u8; 64]).unwrap();
        }

        let removed = store.compact_deltas(doc_id, 10).unwrap();
        assert_eq!(removed, 10);

        let remaining = store.deltas_since(doc_id, 0).unwrap();
        assert_eq!(remaining.len(), 10);
        assert_eq!(remaining[0].0, 11);
    }

    #[test]
    fn test_last_delta_seq_empty() {
        let (_dir, store) = open_store();
        assert_eq!(store.last_delta_seq(Uuid::new_v4()).unwrap(), None);
    }

    #[test]
    fn test_delta_isolation_between_documents() {
        let (_dir, store) = open_store();
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();

        for seq in 1..=5u64 {
            store.append_delta(doc_a, seq, format!("a_{seq}").as_bytes()).unwrap();
        }
        for seq in 1..=3u64 {
            store.append_delta(doc_b, seq, format!("b_{seq}").as_bytes()).unwrap();
        }

        assert_eq!(store.deltas_since(doc_a, 0).unwrap().len(), 5);
        assert_eq!(store.deltas_since(doc_b, 0).unwrap().len(), 3);
    }

    #[test]
    fn test_snapshot_roundtrip_and_row_version() {
        let (_dir, store) = open_store();
        let row = DocumentRow::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.put_document(&row).unwrap();

        let record = SnapshotRecord {
            doc_id: row.doc_id,
            version: 1,
            content: vec![1, 2, 3],
            plain_text: "draft".into(),
            created_by: row.owner_id,
            description: Some("initial".into()),
            contributors: Vec::new(),
            created_at: 42,
        };
        store.put_snapshot(&record).unwrap();

        let loaded = store.snapshot(row.doc_id, 1).unwrap().unwrap();
        assert_eq!(loaded.content, vec![1, 2, 3]);
        assert_eq!(loaded.plain_text, "draft");

        // The row's current_version advanced in the same batch.
        let row = store.document(row.doc_id).unwrap().unwrap();
        assert_eq!(row.current_version, 1);
    }

    #[test]
    fn test_list_snapshots_descending() {
        let (_dir, store) = open_store();
        let doc_id = Uuid::new_v4();

        for version in 1..=5u64 {
            store
                .put_snapshot(&SnapshotRecord {
                    doc_id,
                    version,
                    content: vec![version as u8],
                    plain_text: String::new(),
                    created_by: Uuid::new_v4(),
                    description: None,
                    contributors: Vec::new(),
                    created_at: version,
                })
                .unwrap();
        }

        let listed = store.list_snapshots(doc_id, 3).unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].version, 5);
        assert_eq!(listed[1].version, 4);
        assert_eq!(listed[2].version, 3);

        assert_eq!(store.latest_snapshot_version(doc_id).unwrap(), Some(5));
        assert_eq!(store.latest_snapshot_version(Uuid::new_v4()).unwrap(), None);
    }

    #[test]
    fn test_grant_rows() {
        let (_dir, store) = open_store();
        let doc_id = Uuid::new_v4();
        let user = Uuid::new_v4();

        assert!(store.grant_row(doc_id, user).unwrap().is_none());

        let grant = sample_grant(doc_id, user, Level::Edit);
        store.put_grant_row(&grant).unwrap();
        assert_eq!(store.grant_row(doc_id, user).unwrap().unwrap().level, Level::Edit);

        let other = sample_grant(doc_id, Uuid::new_v4(), Level::View);
        store.put_grant_row(&other).unwrap();
        assert_eq!(store.list_grant_rows(doc_id).unwrap().len(), 2);

        assert!(store.delete_grant_row(doc_id, user).unwrap());
        assert!(!store.delete_grant_row(doc_id, user).unwrap());
        assert_eq!(store.list_grant_rows(doc_id).unwrap().len(), 1);
    }

    #[test]
    fn test_grants_isolated_by_document() {
        let (_dir, store) = open_store();
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();

        store.put_grant_row(&sample_grant(doc_a, Uuid::new_v4(), Level::View)).unwrap();
        store.put_grant_row(&sample_grant(doc_b, Uuid::new_v4(), Level::Edit)).unwrap();

        assert_eq!(store.list_grant_rows(doc_a).unwrap().len(), 1);
        assert_eq!(store.list_grant_rows(doc_b).unwrap().len(), 1);
    }

    #[test]
    fn test_access_backend_impl() {
        let (_dir, store) = open_store();
        let row = DocumentRow::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.put_document(&row).unwrap();

        assert_eq!(
            store.document_tenant(row.doc_id).unwrap(),
            Some(row.tenant_id)
        );
        assert!(store.is_owner(row.doc_id, row.owner_id).unwrap());
        assert!(!store.is_owner(row.doc_id, Uuid::new_v4()).unwrap());
        assert_eq!(store.document_tenant(Uuid::new_v4()).unwrap(), None);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let doc_id = Uuid::new_v4();

        {
            let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.save_state(doc_id, b"persisted state").unwrap();
            store.append_delta(doc_id, 7, b"tail delta").unwrap();
        }

        let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.load_state(doc_id).unwrap(), b"persisted state");
        assert_eq!(store.last_delta_seq(doc_id).unwrap(), Some(7));
    }

    #[test]
    fn test_large_state_roundtrip() {
        let (_dir, store) = open_store();
        let doc_id = Uuid::new_v4();
        let data = vec![42u8; 1_000_000];

        store.save_state(doc_id, &data).unwrap();
        let loaded = store.load_state(doc_id).unwrap();
        assert_eq!(loaded.len(), 1_000_000);
        assert_eq!(loaded[999_999], 42);
    }

    #[test]
    fn test_store_error_display() {
        assert!(StoreError::NotFound(Uuid::nil()).to_string().contains("Not found"));
        assert!(StoreError::Corrupt("bad frame".into()).to_string().contains("Corrupt"));
    }
}
