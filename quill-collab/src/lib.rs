//! # quill-collab — Real-time collaboration engine for Quill
//!
//! WebSocket-based multi-user document editing with CRDT synchronization,
//! tenant-scoped permissions, and attributed version history.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ CollabServer │
//! │ (per editor) │    Binary frames    │ (central)    │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                              ┌─────┴──────────────┐
//! ┌──────────────┐                      │ PermissionGate     │
//! │ DocumentState│                      │ Room (per doc)     │
//! │ (local)      │                      │ ChangeTracker      │
//! └──────────────┘                      │ VersionHistory     │
//!                                       │ DocumentStore      │
//!                                       └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire frames and close reasons
//! - [`auth`] — Access-token verification
//! - [`acl`] — Permission gate and collaborator management
//! - [`crdt`] — Replicated document state (Yrs)
//! - [`tracking`] — Change attribution and snapshot scheduling
//! - [`versions`] — Append-only version history
//! - [`room`] — Per-document rooms and fan-out
//! - [`server`] — WebSocket collaboration server
//! - [`client`] — WebSocket client with offline queue
//! - [`storage`] — RocksDB persistence

pub mod acl;
pub mod auth;
pub mod client;
pub mod crdt;
pub mod directory;
pub mod error;
pub mod protocol;
pub mod room;
pub mod server;
pub mod storage;
pub mod tracking;
pub mod versions;

// Re-exports for convenience
pub use acl::{AccessBackend, Grant, Level, PermissionGate};
pub use auth::{AuthContext, Claims, TokenVerifier};
pub use client::{CollabClient, ConnectionState, OfflineQueue, SyncEvent};
pub use crdt::{CrdtError, DocumentState};
pub use directory::{StaticDirectory, UserDirectory};
pub use error::EngineError;
pub use protocol::{CloseReason, Frame, FrameKind, PresenceEvent, PresenceKind, ProtocolError};
pub use room::{Outbound, Room, RoomMember, RoomRegistry};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use storage::{DocumentRow, DocumentStore, StoreConfig, StoreError};
pub use tracking::{ChangeTracker, Contributor, SnapshotPolicy};
pub use versions::{SnapshotRecord, VersionHistory};
