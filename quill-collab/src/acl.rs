//! Permission gate: resolves a (user, document) pair to a permission level
//! and hosts the collaborator-management surface.
//!
//! The gate fails closed: a document that does not exist and a document in
//! another tenant both resolve to `None`, and the server closes both with
//! the same reason. Ownership is not a stored grant — it is derived from
//! the creator of the document's parent project through
//! [`AccessBackend::is_owner`], so alternate storage backends can
//! reimplement the derivation without touching gate logic.
//!
//! The gate holds no cache: grants can change between connection attempts,
//! and every resolution reads the backing store.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::EngineError;

/// Permission levels, totally ordered: `View < Comment < Edit < Owner`.
///
/// `Owner` dominates every explicit level and is never stored as a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Level {
    View,
    Comment,
    Edit,
    Owner,
}

impl Level {
    /// True when `self` satisfies `required` (owner satisfies everything).
    pub fn has_at_least(self, required: Level) -> bool {
        self >= required
    }

    /// True when this level may submit content updates.
    pub fn can_edit(self) -> bool {
        self.has_at_least(Level::Edit)
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Level::View => "view",
            Level::Comment => "comment",
            Level::Edit => "edit",
            Level::Owner => "owner",
        };
        f.write_str(s)
    }
}

/// An explicit collaborator grant row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub doc_id: Uuid,
    pub user_id: Uuid,
    pub level: Level,
    /// The owner who issued the grant.
    pub granted_by: Uuid,
    /// Seconds since epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

/// Storage seam for access decisions.
///
/// Implemented by [`crate::storage::DocumentStore`]; tests use an in-memory
/// backend. All lookups are per-document; tenant scoping happens in the
/// gate against [`AccessBackend::document_tenant`].
pub trait AccessBackend: Send + Sync {
    /// Tenant owning the document, `None` when the document is unknown.
    fn document_tenant(&self, doc_id: Uuid) -> Result<Option<Uuid>, EngineError>;

    /// Whether `user_id` created the document's parent project.
    fn is_owner(&self, doc_id: Uuid, user_id: Uuid) -> Result<bool, EngineError>;

    fn grant(&self, doc_id: Uuid, user_id: Uuid) -> Result<Option<Grant>, EngineError>;

    fn put_grant(&self, grant: &Grant) -> Result<(), EngineError>;

    /// Returns whether a grant existed.
    fn remove_grant(&self, doc_id: Uuid, user_id: Uuid) -> Result<bool, EngineError>;

    fn list_grants(&self, doc_id: Uuid) -> Result<Vec<Grant>, EngineError>;
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The permission gate.
pub struct PermissionGate {
    backend: Arc<dyn AccessBackend>,
}

impl PermissionGate {
    pub fn new(backend: Arc<dyn AccessBackend>) -> Self {
        Self { backend }
    }

    /// Resolve the caller's level on a document, tenant-scoped.
    ///
    /// `None` covers: unknown document, document in another tenant, and no
    /// grant. Callers must treat all three identically.
    pub fn resolve(
        &self,
        doc_id: Uuid,
        user_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<Option<Level>, EngineError> {
        match self.backend.document_tenant(doc_id)? {
            None => Ok(None),
            Some(t) if t != tenant_id => Ok(None),
            Some(_) => {
                if self.backend.is_owner(doc_id, user_id)? {
                    return Ok(Some(Level::Owner));
                }
                Ok(self.backend.grant(doc_id, user_id)?.map(|g| g.level))
            }
        }
    }

    /// Grant `level` on `doc_id` to `user_id`. Requester must be owner.
    pub fn add_collaborator(
        &self,
        doc_id: Uuid,
        user_id: Uuid,
        level: Level,
        requester_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<(), EngineError> {
        self.require_owner(doc_id, requester_id, tenant_id)?;
        self.reject_owner_target(doc_id, user_id)?;
        if level == Level::Owner {
            return Err(EngineError::Conflict(
                "ownership cannot be granted explicitly".into(),
            ));
        }
        let now = now_secs();
        self.backend.put_grant(&Grant {
            doc_id,
            user_id,
            level,
            granted_by: requester_id,
            created_at: now,
            updated_at: now,
        })
    }

    /// Change an existing collaborator's level. Requester must be owner.
    pub fn update_collaborator_level(
        &self,
        doc_id: Uuid,
        user_id: Uuid,
        level: Level,
        requester_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<(), EngineError> {
        self.require_owner(doc_id, requester_id, tenant_id)?;
        self.reject_owner_target(doc_id, user_id)?;
        if level == Level::Owner {
            return Err(EngineError::Conflict(
                "ownership cannot be granted explicitly".into(),
            ));
        }
        let mut grant = self
            .backend
            .grant(doc_id, user_id)?
            .ok_or(EngineError::NotFound)?;
        grant.level = level;
        grant.granted_by = requester_id;
        grant.updated_at = now_secs();
        self.backend.put_grant(&grant)
    }

    /// Revoke a collaborator's grant. Requester must be owner.
    pub fn remove_collaborator(
        &self,
        doc_id: Uuid,
        user_id: Uuid,
        requester_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<(), EngineError> {
        self.require_owner(doc_id, requester_id, tenant_id)?;
        self.reject_owner_target(doc_id, user_id)?;
        if self.backend.remove_grant(doc_id, user_id)? {
            Ok(())
        } else {
            Err(EngineError::NotFound)
        }
    }

    /// List the document's explicit grants. Requester must be owner.
    pub fn list_collaborators(
        &self,
        doc_id: Uuid,
        requester_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<Vec<Grant>, EngineError> {
        self.require_owner(doc_id, requester_id, tenant_id)?;
        self.backend.list_grants(doc_id)
    }

    fn require_owner(
        &self,
        doc_id: Uuid,
        requester_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<(), EngineError> {
        match self.resolve(doc_id, requester_id, tenant_id)? {
            None => Err(EngineError::NotFound),
            Some(Level::Owner) => Ok(()),
            Some(level) => Err(EngineError::Forbidden(format!(
                "collaborator management requires owner, caller has {level}"
            ))),
        }
    }

    /// Targeting the owner is rejected unconditionally, regardless of the
    /// requester's level.
    fn reject_owner_target(&self, doc_id: Uuid, user_id: Uuid) -> Result<(), EngineError> {
        if self.backend.is_owner(doc_id, user_id)? {
            return Err(EngineError::Conflict(
                "the owner's implicit grant cannot be modified".into(),
            ));
        }
        Ok(())
    }
}
