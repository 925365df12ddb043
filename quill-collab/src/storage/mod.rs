//! Durable storage for documents, grants, and version history.
//!
//! ```text
//! ┌──────────────┐   state/deltas    ┌──────────────┐
//! │ CollabServer │ ────────────────► │ DocumentStore│
//! │ (in-memory)  │                   │ (RocksDB)    │
//! └──────┬───────┘                   └──────┬───────┘
//!        │ on join                          │ column families
//!        ▼                                  ▼
//! ┌──────────────┐   ┌─────────────────────────────────────┐
//! │ DocumentState│   │ CF "state"     — live CRDT blobs     │
//! │ (restored)   │   │ CF "deltas"    — crash-window log    │
//! └──────────────┘   │ CF "documents" — tenant/owner rows   │
//!                    │ CF "snapshots" — immutable versions  │
//!                    │ CF "grants"    — collaborator rows   │
//!                    └─────────────────────────────────────┘
//! ```

pub mod rocks;

pub use rocks::{DocumentRow, DocumentStore, StoreConfig, StoreError};
