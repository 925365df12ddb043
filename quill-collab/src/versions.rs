//! Append-only version history.
//!
//! A snapshot is an immutable, attributed checkpoint of one document.
//! Version numbers per document start at 1 and form a gap-free increasing
//! sequence; restoring an old version copies its content forward as a new
//! snapshot rather than rewriting history.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::acl::{Level, PermissionGate};
use crate::error::EngineError;
use crate::storage::DocumentStore;
use crate::tracking::Contributor;

/// One immutable version record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub doc_id: Uuid,
    /// Strictly increasing per document, starting at 1.
    pub version: u64,
    /// Full encoded CRDT state at this version.
    pub content: Vec<u8>,
    pub plain_text: String,
    pub created_by: Uuid,
    pub description: Option<String>,
    /// Contributors since the previous snapshot, largest first.
    pub contributors: Vec<Contributor>,
    /// Seconds since epoch.
    pub created_at: u64,
}

/// Default page size for [`VersionHistory::list_versions`].
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// The version-history surface.
pub struct VersionHistory {
    store: Arc<DocumentStore>,
    gate: Arc<PermissionGate>,
    /// Serializes version assignment so the sequence stays gap-free under
    /// concurrent writers.
    write_lock: Mutex<()>,
}

impl VersionHistory {
    pub fn new(store: Arc<DocumentStore>, gate: Arc<PermissionGate>) -> Self {
        Self {
            store,
            gate,
            write_lock: Mutex::new(()),
        }
    }

    /// Append a new snapshot at the next version number.
    pub fn write_snapshot(
        &self,
        doc_id: Uuid,
        content: Vec<u8>,
        plain_text: String,
        created_by: Uuid,
        description: Option<String>,
        contributors: Vec<Contributor>,
    ) -> Result<u64, EngineError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| EngineError::Internal("version write lock poisoned".into()))?;

        let version = self.store.latest_snapshot_version(doc_id)?.unwrap_or(0) + 1;
        let record = SnapshotRecord {
            doc_id,
            version,
            content,
            plain_text,
            created_by,
            description,
            contributors,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        self.store.put_snapshot(&record)?;
        log::info!("Wrote snapshot v{version} for doc {doc_id}");
        Ok(version)
    }

    /// List snapshots, newest first.
    pub fn list_versions(
        &self,
        doc_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<SnapshotRecord>, EngineError> {
        Ok(self
            .store
            .list_snapshots(doc_id, limit.unwrap_or(DEFAULT_LIST_LIMIT))?)
    }

    /// Fetch one snapshot.
    pub fn get_version(&self, doc_id: Uuid, version: u64) -> Result<SnapshotRecord, EngineError> {
        self.store
            .snapshot(doc_id, version)?
            .ok_or(EngineError::NotFound)
    }

    /// Copy an old version forward as a new snapshot.
    ///
    /// Requires the requester to resolve to at least `Edit`; an
    /// unresolvable caller gets `NotFound` (never a tenancy leak). The
    /// restored content is byte-identical to the stored version.
    pub fn restore_version(
        &self,
        doc_id: Uuid,
        version: u64,
        requester_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<u64, EngineError> {
        match self.gate.resolve(doc_id, requester_id, tenant_id)? {
            None => return Err(EngineError::NotFound),
            Some(level) if !level.has_at_least(Level::Edit) => {
                return Err(EngineError::Forbidden(format!(
                    "restore requires edit, caller has {level}"
                )));
            }
            Some(_) => {}
        }

        let old = self.get_version(doc_id, version)?;
        self.write_snapshot(
            doc_id,
            old.content,
            old.plain_text,
            requester_id,
            Some(format!("Restored from version {version}")),
            Vec::new(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DocumentRow, StoreConfig};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<DocumentStore>,
        history: VersionHistory,
        doc: Uuid,
        tenant: Uuid,
        owner: Uuid,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let row = DocumentRow::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.put_document(&row).unwrap();

        let gate = Arc::new(PermissionGate::new(store.clone()));
        let history = VersionHistory::new(store.clone(), gate);
        Fixture {
            _dir: dir,
            store,
            history,
            doc: row.doc_id,
            tenant: row.tenant_id,
            owner: row.owner_id,
        }
    }

    fn write_n(f: &Fixture, n: u64) {
        for i in 1..=n {
            let v = f
                .history
                .write_snapshot(
                    f.doc,
                    vec![i as u8; 8],
                    format!("text v{i}"),
                    f.owner,
                    None,
                    Vec::new(),
                )
                .unwrap();
            assert_eq!(v, i);
        }
    }

    #[test]
    fn test_versions_start_at_one_and_are_gap_free() {
        let f = fixture();
        write_n(&f, 4);

        let listed = f.history.list_versions(f.doc, None).unwrap();
        let versions: Vec<u64> = listed.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![4, 3, 2, 1]);

        // Strictly decreasing and gap-free when reversed.
        let mut reversed = versions.clone();
        reversed.reverse();
        assert_eq!(reversed, (1..=4).collect::<Vec<u64>>());
    }

    #[test]
    fn test_current_version_tracks_latest() {
        let f = fixture();
        write_n(&f, 3);
        let row = f.store.document(f.doc).unwrap().unwrap();
        assert_eq!(row.current_version, 3);
    }

    #[test]
    fn test_list_limit() {
        let f = fixture();
        write_n(&f, 10);
        let listed = f.history.list_versions(f.doc, Some(4)).unwrap();
        assert_eq!(listed.len(), 4);
        assert_eq!(listed[0].version, 10);
    }

    #[test]
    fn test_get_version() {
        let f = fixture();
        write_n(&f, 2);
        let record = f.history.get_version(f.doc, 2).unwrap();
        assert_eq!(record.plain_text, "text v2");

        let err = f.history.get_version(f.doc, 99).unwrap_err();
        assert!(matches!(err, EngineError::NotFound));
    }

    #[test]
    fn test_restore_copies_content_forward() {
        // Restoring version 1 of a document at version 4 creates version 5
        // with byte-identical content; five entries listed afterward.
        let f = fixture();
        write_n(&f, 4);

        let new_version = f
            .history
            .restore_version(f.doc, 1, f.owner, f.tenant)
            .unwrap();
        assert_eq!(new_version, 5);

        let restored = f.history.get_version(f.doc, 5).unwrap();
        let original = f.history.get_version(f.doc, 1).unwrap();
        assert_eq!(restored.content, original.content);
        assert_eq!(restored.plain_text, original.plain_text);
        assert!(restored.description.as_deref().unwrap().contains("version 1"));

        assert_eq!(f.history.list_versions(f.doc, None).unwrap().len(), 5);
        assert_eq!(
            f.store.document(f.doc).unwrap().unwrap().current_version,
            5
        );
    }

    #[test]
    fn test_restore_requires_edit() {
        let f = fixture();
        write_n(&f, 1);

        let viewer = Uuid::new_v4();
        let gate = PermissionGate::new(f.store.clone());
        gate.add_collaborator(f.doc, viewer, crate::acl::Level::View, f.owner, f.tenant)
            .unwrap();

        let err = f
            .history
            .restore_version(f.doc, 1, viewer, f.tenant)
            .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));
    }

    #[test]
    fn test_restore_unresolvable_is_not_found() {
        let f = fixture();
        write_n(&f, 1);

        // A stranger and a wrong-tenant owner both get NotFound.
        let err = f
            .history
            .restore_version(f.doc, 1, Uuid::new_v4(), f.tenant)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound));

        let err = f
            .history
            .restore_version(f.doc, 1, f.owner, Uuid::new_v4())
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound));
    }

    #[test]
    fn test_contributors_persisted() {
        let f = fixture();
        let contributors = vec![
            Contributor {
                user_id: Uuid::new_v4(),
                name: "Bram".into(),
                bytes_changed: 160,
            },
            Contributor {
                user_id: Uuid::new_v4(),
                name: "Amal".into(),
                bytes_changed: 40,
            },
        ];
        f.history
            .write_snapshot(
                f.doc,
                vec![9; 4],
                "attributed".into(),
                f.owner,
                Some("weekly checkpoint".into()),
                contributors.clone(),
            )
            .unwrap();

        let record = f.history.get_version(f.doc, 1).unwrap();
        assert_eq!(record.contributors, contributors);
        assert_eq!(record.description.as_deref(), Some("weekly checkpoint"));
    }
}
