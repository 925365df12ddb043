//! Per-document rooms: membership, fan-out, and ordered persistence.
//!
//! A room owns the authoritative [`DocumentState`] for one document. The
//! registry hands out rooms behind a `Mutex`, which is the room's
//! exclusive section: membership changes and merges are serialized per
//! room structurally, while distinct rooms proceed fully in parallel.
//!
//! Fan-out uses a tokio broadcast channel. Every outbound message carries
//! the originating connection id so receivers drop their own frames —
//! updates reach every *other* member, never the sender.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::acl::Level;
use crate::crdt::DocumentState;
use crate::error::EngineError;
use crate::storage::DocumentStore;

/// An admitted connection.
#[derive(Debug, Clone)]
pub struct RoomMember {
    pub conn_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub level: Level,
}

/// A frame queued for fan-out.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Connection that originated the frame; that receiver skips it.
    pub origin: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

/// Work for the room's persistence task.
///
/// Jobs for one room are consumed sequentially, so persistence writes are
/// never reordered relative to each other; the merge path only enqueues
/// and never waits.
pub enum PersistJob {
    /// Append an accepted delta to the crash-window log.
    Delta(Vec<u8>),
    /// Save the full encoded state, then compact logged deltas.
    State(Vec<u8>),
}

/// Attempts per persistence write before giving up until the next job.
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF_BASE: Duration = Duration::from_millis(50);

/// One document's live collaboration state.
pub struct Room {
    doc_id: Uuid,
    /// Authoritative replicated state; mutations only under the room lock.
    pub state: DocumentState,
    members: HashMap<Uuid, RoomMember>,
    sender: broadcast::Sender<Outbound>,
    max_members: usize,
    persist_tx: Option<mpsc::UnboundedSender<PersistJob>>,
    persist_task: Option<JoinHandle<()>>,
}

impl Room {
    /// Create a room and spawn its persistence task.
    ///
    /// `start_seq` continues the document's delta-log sequence past
    /// whatever survived the last run.
    pub fn new(
        doc_id: Uuid,
        state: DocumentState,
        broadcast_capacity: usize,
        max_members: usize,
        store: Arc<DocumentStore>,
        start_seq: u64,
    ) -> Self {
        let (sender, _) = broadcast::channel(broadcast_capacity);
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let persist_task = spawn_persister(store, doc_id, start_seq, persist_rx);
        Self {
            doc_id,
            state,
            members: HashMap::new(),
            sender,
            max_members,
            persist_tx: Some(persist_tx),
            persist_task: Some(persist_task),
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Admit a member; `None` when the room is at capacity.
    ///
    /// The returned receiver is subscribed under the room lock, so a new
    /// member observes every broadcast after the state it was handed —
    /// no catch-up gap.
    pub fn join(&mut self, member: RoomMember) -> Option<broadcast::Receiver<Outbound>> {
        if self.members.len() >= self.max_members {
            return None;
        }
        self.members.insert(member.conn_id, member);
        Some(self.sender.subscribe())
    }

    pub fn leave(&mut self, conn_id: &Uuid) -> Option<RoomMember> {
        self.members.remove(conn_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> Vec<RoomMember> {
        self.members.values().cloned().collect()
    }

    /// Fan a pre-encoded frame out to every member except `origin`.
    pub fn broadcast_from(&self, origin: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        self.sender.send(Outbound { origin, bytes }).unwrap_or(0)
    }

    /// Queue a delta append; never blocks.
    pub fn enqueue_delta(&self, delta: Vec<u8>) {
        if let Some(tx) = &self.persist_tx {
            if tx.send(PersistJob::Delta(delta)).is_err() {
                log::error!("Persistence queue closed for doc {}", self.doc_id);
            }
        }
    }

    /// Queue a full state save; never blocks.
    pub fn enqueue_state(&self, state: Vec<u8>) {
        if let Some(tx) = &self.persist_tx {
            if tx.send(PersistJob::State(state)).is_err() {
                log::error!("Persistence queue closed for doc {}", self.doc_id);
            }
        }
    }

    /// Close the persistence queue and hand back the task for awaiting.
    ///
    /// The task drains every queued job before exiting, so awaiting the
    /// handle guarantees the final state write completed.
    pub fn close_queue(&mut self) -> Option<JoinHandle<()>> {
        self.persist_tx.take();
        self.persist_task.take()
    }
}

/// Sequentially applies [`PersistJob`]s for one room.
fn spawn_persister(
    store: Arc<DocumentStore>,
    doc_id: Uuid,
    start_seq: u64,
    mut rx: mpsc::UnboundedReceiver<PersistJob>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut next_seq = start_seq;
        while let Some(job) = rx.recv().await {
            match job {
                PersistJob::Delta(delta) => {
                    let seq = next_seq;
                    next_seq += 1;
                    persist_with_retry(doc_id, "delta append", || {
                        store.append_delta(doc_id, seq, &delta)
                    })
                    .await;
                }
                PersistJob::State(state) => {
                    let saved = persist_with_retry(doc_id, "state save", || {
                        store.save_state(doc_id, &state)
                    })
                    .await;
                    if saved && next_seq > 0 {
                        // The saved state covers every logged delta.
                        if let Err(e) = store.compact_deltas(doc_id, next_seq - 1) {
                            log::warn!("Delta compaction failed for doc {doc_id}: {e}");
                        }
                    }
                }
            }
        }
        log::debug!("Persistence task for doc {doc_id} drained");
    })
}

/// Retry a persistence write with exponential backoff.
///
/// Failures are logged, never propagated — durability lags behind the
/// in-memory merge rather than blocking it.
async fn persist_with_retry<F, E>(doc_id: Uuid, what: &str, mut op: F) -> bool
where
    F: FnMut() -> Result<(), E>,
    E: std::fmt::Display,
{
    let mut delay = PERSIST_BACKOFF_BASE;
    for attempt in 1..=PERSIST_ATTEMPTS {
        match op() {
            Ok(()) => return true,
            Err(e) if attempt < PERSIST_ATTEMPTS => {
                log::warn!("{what} for doc {doc_id} failed (attempt {attempt}): {e}; retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                log::error!("{what} for doc {doc_id} failed after {attempt} attempts: {e}");
            }
        }
    }
    false
}

/// All live rooms, keyed by document id.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, Arc<Mutex<Room>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, doc_id: Uuid) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(&doc_id).cloned()
    }

    /// Get the room for `doc_id`, creating it with `init` on first join.
    ///
    /// Returns `(room, created)`.
    pub async fn get_or_create<F>(
        &self,
        doc_id: Uuid,
        init: F,
    ) -> Result<(Arc<Mutex<Room>>, bool), EngineError>
    where
        F: FnOnce() -> Result<Room, EngineError>,
    {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id) {
                return Ok((room.clone(), false));
            }
        }

        // Slow path: write lock, double-check, create
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&doc_id) {
            return Ok((room.clone(), false));
        }
        let room = Arc::new(Mutex::new(init()?));
        rooms.insert(doc_id, room.clone());
        Ok((room.clone(), true))
    }

    /// Run `f` with the room locked, holding the registry read lock for
    /// the duration so removal cannot interleave with membership changes.
    pub async fn with_room<F, R>(&self, doc_id: Uuid, f: F) -> Option<R>
    where
        F: FnOnce(&mut Room) -> R,
    {
        let rooms = self.rooms.read().await;
        let room = rooms.get(&doc_id)?.clone();
        let mut guard = room.lock().await;
        Some(f(&mut guard))
    }

    /// Tear the room down if it has no members: final state save, queue
    /// drained, entry removed. Returns whether the room was closed.
    ///
    /// The registry write lock is held across the drain so a late joiner
    /// either reaches the old room before removal or loads the fully
    /// persisted state after it — never a stale in-between.
    pub async fn close_if_empty(&self, doc_id: Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(&doc_id).cloned() else {
            return false;
        };
        let handle = {
            let mut guard = room.lock().await;
            if guard.member_count() > 0 {
                return false;
            }
            let encoded = guard.state.encode();
            guard.enqueue_state(encoded);
            guard.close_queue()
        };
        rooms.remove(&doc_id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        true
    }

    /// Take every room out of the registry (server shutdown).
    pub async fn drain(&self) -> Vec<(Uuid, Arc<Mutex<Room>>)> {
        self.rooms.write().await.drain().collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;

    fn test_store() -> (tempfile::TempDir, Arc<DocumentStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        (dir, store)
    }

    fn member(level: Level) -> RoomMember {
        RoomMember {
            conn_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "Tester".into(),
            level,
        }
    }

    #[tokio::test]
    async fn test_join_leave() {
        let (_dir, store) = test_store();
        let mut room = Room::new(Uuid::new_v4(), DocumentState::new(), 16, 10, store, 0);

        let m = member(Level::Edit);
        let conn = m.conn_id;
        let _rx = room.join(m).unwrap();
        assert_eq!(room.member_count(), 1);

        let left = room.leave(&conn).unwrap();
        assert_eq!(left.conn_id, conn);
        assert_eq!(room.member_count(), 0);
    }

    #[tokio::test]
    async fn test_room_capacity() {
        let (_dir, store) = test_store();
        let mut room = Room::new(Uuid::new_v4(), DocumentState::new(), 16, 2, store, 0);

        assert!(room.join(member(Level::View)).is_some());
        assert!(room.join(member(Level::View)).is_some());
        assert!(room.join(member(Level::View)).is_none());
    }

    #[tokio::test]
    async fn test_broadcast_skips_origin() {
        let (_dir, store) = test_store();
        let mut room = Room::new(Uuid::new_v4(), DocumentState::new(), 16, 10, store, 0);

        let a = member(Level::Edit);
        let b = member(Level::View);
        let origin = a.conn_id;
        let mut rx_a = room.join(a).unwrap();
        let mut rx_b = room.join(b).unwrap();

        let count = room.broadcast_from(origin, Arc::new(vec![1, 2, 3]));
        assert_eq!(count, 2);

        // Receiver-side filtering: A sees its own origin and drops it.
        let out_a = rx_a.recv().await.unwrap();
        assert_eq!(out_a.origin, origin);
        let out_b = rx_b.recv().await.unwrap();
        assert_eq!(*out_b.bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_persister_saves_state_and_compacts() {
        let (_dir, store) = test_store();
        let doc_id = Uuid::new_v4();
        let state = DocumentState::new();
        let delta = state.insert_text(0, "hello");
        let encoded = state.encode();

        let mut room = Room::new(doc_id, state, 16, 10, store.clone(), 0);
        room.enqueue_delta(delta);
        room.enqueue_state(encoded.clone());

        let handle = room.close_queue().unwrap();
        handle.await.unwrap();

        assert_eq!(store.load_state(doc_id).unwrap(), encoded);
        // Delta log compacted after the covering state save.
        assert!(store.deltas_since(doc_id, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persister_delta_only_survives() {
        let (_dir, store) = test_store();
        let doc_id = Uuid::new_v4();
        let state = DocumentState::new();
        let delta = state.insert_text(0, "unsaved");

        let mut room = Room::new(doc_id, DocumentState::new(), 16, 10, store.clone(), 0);
        room.enqueue_delta(delta.clone());
        let handle = room.close_queue().unwrap();
        handle.await.unwrap();

        let logged = store.deltas_since(doc_id, 0).unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].1, delta);
    }

    #[tokio::test]
    async fn test_registry_get_or_create() {
        let (_dir, store) = test_store();
        let registry = RoomRegistry::new();
        let doc_id = Uuid::new_v4();

        let (room1, created1) = registry
            .get_or_create(doc_id, || {
                Ok(Room::new(doc_id, DocumentState::new(), 16, 10, store.clone(), 0))
            })
            .await
            .unwrap();
        assert!(created1);

        let (room2, created2) = registry
            .get_or_create(doc_id, || unreachable!("room already exists"))
            .await
            .unwrap();
        assert!(!created2);
        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_registry_close_if_empty() {
        let (_dir, store) = test_store();
        let registry = RoomRegistry::new();
        let doc_id = Uuid::new_v4();

        let state = DocumentState::new();
        state.insert_text(0, "closing argument");
        let (room, _) = registry
            .get_or_create(doc_id, || {
                Ok(Room::new(doc_id, state, 16, 10, store.clone(), 0))
            })
            .await
            .unwrap();

        let m = member(Level::Edit);
        let conn = m.conn_id;
        let _rx = room.lock().await.join(m).unwrap();

        assert!(!registry.close_if_empty(doc_id).await);
        assert_eq!(registry.room_count().await, 1);

        room.lock().await.leave(&conn);
        assert!(registry.close_if_empty(doc_id).await);
        assert_eq!(registry.room_count().await, 0);

        // The close persisted the final state.
        let persisted = DocumentState::decode(&store.load_state(doc_id).unwrap()).unwrap();
        assert_eq!(persisted.plain_text(), "closing argument");
    }

    #[tokio::test]
    async fn test_with_room() {
        let (_dir, store) = test_store();
        let registry = RoomRegistry::new();
        let doc_id = Uuid::new_v4();

        assert!(registry.with_room(doc_id, |_room| ()).await.is_none());

        registry
            .get_or_create(doc_id, || {
                Ok(Room::new(doc_id, DocumentState::new(), 16, 10, store.clone(), 0))
            })
            .await
            .unwrap();

        let count = registry.with_room(doc_id, |room| room.member_count()).await;
        assert_eq!(count, Some(0));
    }

    #[tokio::test]
    async fn test_registry_drain() {
        let (_dir, store) = test_store();
        let registry = RoomRegistry::new();

        for _ in 0..3 {
            let doc_id = Uuid::new_v4();
            registry
                .get_or_create(doc_id, || {
                    Ok(Room::new(doc_id, DocumentState::new(), 16, 10, store.clone(), 0))
                })
                .await
                .unwrap();
        }

        let drained = registry.drain().await;
        assert_eq!(drained.len(), 3);
        assert_eq!(registry.room_count().await, 0);
    }
}
