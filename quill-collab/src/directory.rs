//! User-directory seam.
//!
//! The platform's user/tenant directory is an external collaborator; the
//! engine only needs display names for presence events and snapshot
//! contributor lists. [`StaticDirectory`] serves tests and single-process
//! embeddings.

use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// Resolves a user id to a display name.
pub trait UserDirectory: Send + Sync {
    fn display_name(&self, user_id: Uuid) -> Option<String>;
}

/// Fallback name for users the directory does not know.
pub fn fallback_name(user_id: Uuid) -> String {
    let hex = user_id.simple().to_string();
    format!("user-{}", &hex[..8])
}

/// In-memory directory.
#[derive(Default)]
pub struct StaticDirectory {
    names: RwLock<HashMap<Uuid, String>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: Uuid, name: impl Into<String>) {
        self.names
            .write()
            .expect("directory lock poisoned")
            .insert(user_id, name.into());
    }
}

impl UserDirectory for StaticDirectory {
    fn display_name(&self, user_id: Uuid) -> Option<String> {
        self.names
            .read()
            .expect("directory lock poisoned")
            .get(&user_id)
            .cloned()
    }
}
