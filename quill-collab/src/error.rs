//! Service-level error taxonomy.
//!
//! Connection-boundary failures (authentication, access resolution) are
//! translated to close reasons by the server and never escape as panics.
//! Persistence failures on the merge path are logged and retried, never
//! propagated into a room.

use thiserror::Error;

use crate::crdt::CrdtError;
use crate::storage::StoreError;

/// Errors surfaced by the collaboration engine.
///
/// `NotFound` deliberately covers both "document does not exist" and
/// "document belongs to another tenant" so that existence never leaks
/// across tenant boundaries. `Forbidden` is reserved for already-admitted
/// callers attempting an action above their granted level.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing, malformed, or expired access token.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Unknown document, or a document outside the caller's tenant.
    #[error("not found")]
    NotFound,

    /// Authenticated and in-tenant, but insufficient permission level.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The requested mutation cannot be applied (e.g. removing the owner).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Persisted bytes failed to decode.
    #[error("corrupt state: {0}")]
    Corrupt(String),

    /// Unexpected failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => EngineError::NotFound,
            StoreError::Corrupt(msg) => EngineError::Corrupt(msg),
            other => EngineError::Internal(other.to_string()),
        }
    }
}

impl From<CrdtError> for EngineError {
    fn from(e: CrdtError) -> Self {
        match e {
            CrdtError::Corrupt(msg) => EngineError::Corrupt(msg),
            CrdtError::InvalidUpdate(msg) => EngineError::Internal(msg),
        }
    }
}
