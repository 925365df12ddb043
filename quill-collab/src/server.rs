//! WebSocket collaboration server with per-document rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (doc_id) ── DocumentState ── broadcast fan-out
//! Client B ──┘        │
//!                     ├── ChangeTracker ──► VersionHistory (snapshots)
//!                     └── persistence queue ──► DocumentStore (RocksDB)
//! ```
//!
//! Connection lifecycle: Connecting → Authenticating → Joining → Active →
//! Closing → Closed. Connections authenticate with `token` and `document`
//! query parameters; the permission gate admits any level (read-only
//! observers included) but only `edit` and `owner` may submit updates.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::acl::{Level, PermissionGate};
use crate::auth::TokenVerifier;
use crate::crdt::{self, DocumentState};
use crate::directory::{fallback_name, UserDirectory};
use crate::error::EngineError;
use crate::protocol::{CloseReason, Frame, FrameKind, PresenceEvent, PresenceKind};
use crate::room::{Room, RoomRegistry};
use crate::storage::{DocumentStore, StoreConfig};
use crate::tracking::{ChangeTracker, SnapshotPolicy};
use crate::versions::VersionHistory;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Maximum members per room
    pub max_members_per_room: usize,
    /// Interval between server pings
    pub heartbeat_interval: Duration,
    /// Grace window after a missed pong before forcible close
    pub heartbeat_grace: Duration,
    /// Durable store configuration
    pub storage: StoreConfig,
    /// HS256 secret shared with the token-issuing auth service
    pub token_secret: String,
    /// Snapshot scheduling thresholds
    pub snapshot_policy: SnapshotPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9470".to_string(),
            broadcast_capacity: 256,
            max_members_per_room: 100,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_grace: Duration::from_secs(10),
            storage: StoreConfig::default(),
            token_secret: "quill-dev-secret".to_string(),
            snapshot_policy: SnapshotPolicy::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub active_rooms: usize,
    pub merged_updates: u64,
    pub rejected_updates: u64,
    pub snapshots_written: u64,
}

/// The collaboration server.
///
/// Cheap to clone; every clone shares the same rooms, store, and
/// counters, so connection tasks carry a clone.
#[derive(Clone)]
pub struct CollabServer {
    config: Arc<ServerConfig>,
    store: Arc<DocumentStore>,
    gate: Arc<PermissionGate>,
    tracker: Arc<ChangeTracker>,
    versions: Arc<VersionHistory>,
    rooms: Arc<RoomRegistry>,
    directory: Arc<dyn UserDirectory>,
    verifier: Arc<TokenVerifier>,
    stats: Arc<RwLock<ServerStats>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl CollabServer {
    /// Create a server, opening the durable store.
    pub fn new(config: ServerConfig, directory: Arc<dyn UserDirectory>) -> Result<Self, EngineError> {
        let store = Arc::new(DocumentStore::open(config.storage.clone())?);
        let gate = Arc::new(PermissionGate::new(store.clone()));
        let tracker = Arc::new(ChangeTracker::new(config.snapshot_policy));
        let versions = Arc::new(VersionHistory::new(store.clone(), gate.clone()));
        let verifier = Arc::new(TokenVerifier::new(config.token_secret.as_bytes()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            store,
            gate,
            tracker,
            versions,
            rooms: Arc::new(RoomRegistry::new()),
            directory,
            verifier,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    /// Accept connections until [`CollabServer::shutdown`] is called.
    pub async fn run(&self) -> Result<(), EngineError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| EngineError::Internal(format!("bind failed: {e}")))?;
        log::info!("Collaboration server listening on {}", self.config.bind_addr);

        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted
                        .map_err(|e| EngineError::Internal(format!("accept failed: {e}")))?;
                    log::debug!("New TCP connection from {addr}");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("Accept loop stopping for shutdown");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Coordinated shutdown: close every connection with a distinct
    /// reason and persist every active room before releasing it.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        for (doc_id, room) in self.rooms.drain().await {
            let handle = {
                let mut guard = room.lock().await;
                let encoded = guard.state.encode();
                guard.enqueue_state(encoded);
                guard.close_queue()
            };
            if let Some(handle) = handle {
                let _ = handle.await;
            }
            self.tracker.cleanup(doc_id).await;
            log::info!("Persisted room {doc_id} during shutdown");
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), EngineError> {
        let mut request_uri = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            request_uri = Some(req.uri().clone());
            Ok(resp)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("handshake failed: {e}")))?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::debug!("WebSocket connection established from {addr}");

        // ── Authenticating ────────────────────────────────────────────
        let params = request_uri
            .as_ref()
            .and_then(|uri| uri.query())
            .map(parse_query)
            .unwrap_or_default();

        let Some(token) = params.get("token").filter(|t| !t.is_empty()) else {
            return close_rejected(&mut ws_sender, CloseReason::NoToken, addr).await;
        };
        let doc_id = match params.get("document").map(|d| Uuid::parse_str(d)) {
            Some(Ok(id)) => id,
            _ => {
                return close_rejected(&mut ws_sender, CloseReason::MissingDocumentId, addr).await;
            }
        };
        let auth = match self.verifier.verify(token) {
            Ok(auth) => auth,
            Err(e) => {
                log::debug!("Rejected connection from {addr}: {e}");
                return close_rejected(&mut ws_sender, CloseReason::InvalidToken, addr).await;
            }
        };

        // ── Joining ───────────────────────────────────────────────────
        // Unknown document, wrong tenant, and no grant all land here with
        // the same close reason — existence never leaks across tenants.
        let level = match self.gate.resolve(doc_id, auth.user_id, auth.tenant_id) {
            Ok(Some(level)) => level,
            Ok(None) => {
                return close_rejected(&mut ws_sender, CloseReason::AccessDenied, addr).await;
            }
            Err(e) => {
                log::error!("Access resolution failed for doc {doc_id}: {e}");
                return close_rejected(&mut ws_sender, CloseReason::AccessDenied, addr).await;
            }
        };

        let conn_id = Uuid::new_v4();
        let user_id = auth.user_id;
        let name = self
            .directory
            .display_name(user_id)
            .unwrap_or_else(|| fallback_name(user_id));

        // Join, capture state, and announce presence under the registry
        // read lock + room lock: the new member sees every merge applied
        // before it joined and every broadcast after — no catch-up gap —
        // and room removal cannot interleave. The retry covers a room
        // that was torn down between creation and join.
        let mut admitted = None;
        for _ in 0..2 {
            let (_, created) = self
                .rooms
                .get_or_create(doc_id, || {
                    let state = self.load_or_recover(doc_id)?;
                    let start_seq = self.store.last_delta_seq(doc_id)?.map_or(0, |s| s + 1);
                    Ok(Room::new(
                        doc_id,
                        state,
                        self.config.broadcast_capacity,
                        self.config.max_members_per_room,
                        self.store.clone(),
                        start_seq,
                    ))
                })
                .await?;
            if created {
                self.tracker.initialize(doc_id).await;
            }

            let member = crate::room::RoomMember {
                conn_id,
                user_id,
                name: name.clone(),
                level,
            };
            let join_event = PresenceEvent {
                kind: PresenceKind::Joined,
                user_id,
                name: name.clone(),
            };
            let joined = self
                .rooms
                .with_room(doc_id, |room| {
                    room.join(member).map(|rx| {
                        let state = room.state.encode();
                        if let Ok(bytes) = Frame::presence(doc_id, &join_event).encode() {
                            room.broadcast_from(conn_id, Arc::new(bytes));
                        }
                        (rx, state)
                    })
                })
                .await;
            match joined {
                Some(result) => {
                    admitted = Some(result);
                    break;
                }
                None => continue,
            }
        }
        let (mut broadcast_rx, state_bytes) = match admitted {
            Some(Some(pair)) => pair,
            Some(None) => {
                return close_rejected(&mut ws_sender, CloseReason::RoomFull, addr).await;
            }
            None => {
                log::error!("Room for doc {doc_id} vanished during admission");
                return close_rejected(&mut ws_sender, CloseReason::AccessDenied, addr).await;
            }
        };
        let Some(room) = self.rooms.get(doc_id).await else {
            // Drained by a concurrent shutdown between join and lookup.
            self.leave_room(doc_id, conn_id, user_id, &name).await;
            return close_rejected(&mut ws_sender, CloseReason::ServerShutdown, addr).await;
        };

        let sync_frame = Frame::state_sync(doc_id, state_bytes).encode().map_err(|e| {
            EngineError::Internal(format!("state sync encoding failed: {e}"))
        })?;
        if ws_sender.send(Message::Binary(sync_frame.into())).await.is_err() {
            self.leave_room(doc_id, conn_id, user_id, &name).await;
            return Ok(());
        }

        {
            let mut stats = self.stats.write().await;
            stats.total_connections += 1;
            stats.active_connections += 1;
            stats.active_rooms = self.rooms.room_count().await;
        }
        log::info!("{name} ({user_id}) joined doc {doc_id} as {level}");

        // ── Active ────────────────────────────────────────────────────
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut last_pong = Instant::now();
        let mut shutdown = self.shutdown_rx.clone();
        let mut close_reason = CloseReason::Normal;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            match Frame::decode(&bytes) {
                                Ok(frame) => match frame.kind {
                                    FrameKind::Update => {
                                        if !self
                                            .handle_update(&room, conn_id, user_id, level, doc_id, frame.payload, &mut ws_sender)
                                            .await
                                        {
                                            break;
                                        }
                                    }
                                    FrameKind::Ping => {
                                        if let Ok(pong) = Frame::pong(Uuid::nil()).encode() {
                                            if ws_sender.send(Message::Binary(pong.into())).await.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                    FrameKind::Pong => {
                                        last_pong = Instant::now();
                                    }
                                    other => {
                                        log::debug!("Unhandled frame kind {other:?} from {addr}");
                                    }
                                },
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_pong = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                out = broadcast_rx.recv() => {
                    match out {
                        Ok(out) => {
                            // Never echo a frame back to its origin.
                            if out.origin != conn_id
                                && ws_sender
                                    .send(Message::Binary(out.bytes.to_vec().into()))
                                    .await
                                    .is_err()
                            {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {conn_id} lagged by {n} frames");
                        }
                        Err(_) => break,
                    }
                }

                _ = heartbeat.tick() => {
                    if last_pong.elapsed() > self.config.heartbeat_interval + self.config.heartbeat_grace {
                        log::info!("Heartbeat timeout for {name} on doc {doc_id}");
                        close_reason = CloseReason::HeartbeatTimeout;
                        break;
                    }
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        close_reason = CloseReason::ServerShutdown;
                        break;
                    }
                }
            }
        }

        // ── Closing ───────────────────────────────────────────────────
        if close_reason != CloseReason::Normal {
            let _ = ws_sender
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::from(close_reason.close_code()),
                    reason: close_reason.reason().into(),
                })))
                .await;
        }

        self.leave_room(doc_id, conn_id, user_id, &name).await;
        {
            let mut stats = self.stats.write().await;
            stats.active_connections = stats.active_connections.saturating_sub(1);
            stats.active_rooms = self.rooms.room_count().await;
        }
        log::info!("{name} ({user_id}) left doc {doc_id}");
        Ok(())
    }

    /// Apply one incoming update. Returns `false` when the connection died.
    async fn handle_update(
        &self,
        room: &Arc<Mutex<Room>>,
        conn_id: Uuid,
        user_id: Uuid,
        level: Level,
        doc_id: Uuid,
        payload: Vec<u8>,
        ws_sender: &mut WsSink,
    ) -> bool {
        if !level.can_edit() {
            // Rejected explicitly: never merged, never broadcast, but the
            // client learns its edit was not accepted.
            self.stats.write().await.rejected_updates += 1;
            log::debug!("Rejected update from {user_id} on doc {doc_id} (level {level})");
            let Ok(rejection) =
                Frame::update_rejected(doc_id, "content updates require edit permission").encode()
            else {
                return true;
            };
            return ws_sender.send(Message::Binary(rejection.into())).await.is_ok();
        }

        // Attribution comes from the authenticated identity, never from
        // what the client put in the frame.
        let Ok(outbound) = Frame::update(user_id, doc_id, payload.clone()).encode() else {
            return true;
        };

        let merged = {
            let guard = room.lock().await;
            match guard.state.merge(&payload) {
                Ok(()) => {
                    self.tracker
                        .record_change(doc_id, user_id, payload.len() as u64)
                        .await;
                    // Fan out in merge order, then queue durability; the
                    // broadcast never waits on persistence.
                    guard.broadcast_from(conn_id, Arc::new(outbound));
                    guard.enqueue_delta(payload);
                    guard.enqueue_state(guard.state.encode());
                    true
                }
                Err(e) => {
                    log::warn!("Discarding unmergeable update from {user_id} on doc {doc_id}: {e}");
                    false
                }
            }
        };

        if merged {
            self.stats.write().await.merged_updates += 1;
            if self.tracker.should_snapshot(doc_id).await {
                self.write_scheduled_snapshot(doc_id, room, user_id).await;
            }
        }
        true
    }

    /// Materialize a scheduled snapshot from the room's current state.
    async fn write_scheduled_snapshot(
        &self,
        doc_id: Uuid,
        room: &Arc<Mutex<Room>>,
        triggered_by: Uuid,
    ) {
        // Contributor resolution resets the counters atomically; a racing
        // connection that also saw the threshold gets an empty list and
        // writes nothing.
        let contributors = self
            .tracker
            .contributors_and_reset(doc_id, self.directory.as_ref())
            .await;
        if contributors.is_empty() {
            return;
        }

        let (content, plain_text) = {
            let guard = room.lock().await;
            (guard.state.encode(), guard.state.plain_text())
        };

        match self
            .versions
            .write_snapshot(doc_id, content, plain_text, triggered_by, None, contributors)
        {
            Ok(version) => {
                self.stats.write().await.snapshots_written += 1;
                log::info!("Scheduled snapshot v{version} for doc {doc_id}");
            }
            Err(e) => {
                log::error!("Scheduled snapshot for doc {doc_id} failed: {e}");
            }
        }
    }

    /// Load a document's state, recovering from the last good snapshot
    /// (or serving empty with a warning) when the live state is corrupt.
    fn load_or_recover(&self, doc_id: Uuid) -> Result<DocumentState, EngineError> {
        match crdt::load(&self.store, doc_id) {
            Ok(state) => Ok(state),
            Err(EngineError::Corrupt(msg)) => {
                log::error!("Live state for doc {doc_id} is corrupt ({msg}); recovering");
                if let Some(version) = self.store.latest_snapshot_version(doc_id)? {
                    if let Some(record) = self.store.snapshot(doc_id, version)? {
                        if let Ok(state) = DocumentState::decode(&record.content) {
                            log::warn!("Recovered doc {doc_id} from snapshot v{version}");
                            return Ok(state);
                        }
                    }
                }
                log::warn!("No recoverable snapshot for doc {doc_id}; serving empty document");
                Ok(DocumentState::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove a connection from its room; the last one out persists the
    /// room's state and discards tracking.
    async fn leave_room(&self, doc_id: Uuid, conn_id: Uuid, user_id: Uuid, name: &str) {
        let leave_event = PresenceEvent {
            kind: PresenceKind::Left,
            user_id,
            name: name.to_string(),
        };
        let empty = self
            .rooms
            .with_room(doc_id, |room| {
                if room.leave(&conn_id).is_none() {
                    return false;
                }
                if let Ok(bytes) = Frame::presence(doc_id, &leave_event).encode() {
                    room.broadcast_from(conn_id, Arc::new(bytes));
                }
                room.member_count() == 0
            })
            .await
            .unwrap_or(false);

        if empty && self.rooms.close_if_empty(doc_id).await {
            self.tracker.cleanup(doc_id).await;
            log::info!("Room {doc_id} closed; state persisted");
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    pub fn tracker(&self) -> &Arc<ChangeTracker> {
        &self.tracker
    }

    pub fn versions(&self) -> &Arc<VersionHistory> {
        &self.versions
    }

    pub fn verifier(&self) -> &Arc<TokenVerifier> {
        &self.verifier
    }
}

/// Send a policy close during the handshake phase and finish the task.
async fn close_rejected(
    ws_sender: &mut WsSink,
    reason: CloseReason,
    addr: SocketAddr,
) -> Result<(), EngineError> {
    log::info!("Closing connection from {addr}: {}", reason.reason());
    let _ = ws_sender
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::from(reason.close_code()),
            reason: reason.reason().into(),
        })))
        .await;
    Ok(())
}

/// Parse a query string into key/value pairs.
fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let value = parts.next().unwrap_or("");
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}
