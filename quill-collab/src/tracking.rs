//! Change tracking and snapshot scheduling.
//!
//! One tracking entry per actively edited document: cumulative bytes
//! changed per user since the last snapshot, a running total, and the time
//! of the last snapshot. The tracker decides *when* a snapshot is due;
//! the snapshot's content always comes from the room's current encoded
//! state at the moment the decision is acted on.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::directory::{fallback_name, UserDirectory};

/// When a snapshot becomes due. Both thresholds are configuration.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotPolicy {
    /// A snapshot is due once this much time has passed since the last
    /// one (given any changes at all).
    pub min_interval: Duration,
    /// A snapshot is due once this many bytes have changed, regardless of
    /// elapsed time.
    pub byte_threshold: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(300),
            byte_threshold: 100,
        }
    }
}

/// One contributor line in a snapshot's attribution list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contributor {
    pub user_id: Uuid,
    pub name: String,
    pub bytes_changed: u64,
}

/// Per-document tracking state.
struct DocTracking {
    per_user: HashMap<Uuid, u64>,
    total: u64,
    last_snapshot_at: Instant,
    /// Cumulative bytes at the last reset, kept to detect counter drift.
    baseline_total: u64,
}

impl DocTracking {
    fn new() -> Self {
        Self {
            per_user: HashMap::new(),
            total: 0,
            last_snapshot_at: Instant::now(),
            baseline_total: 0,
        }
    }
}

/// Tracks edit volume per document and schedules snapshots.
pub struct ChangeTracker {
    policy: SnapshotPolicy,
    docs: RwLock<HashMap<Uuid, DocTracking>>,
}

impl ChangeTracker {
    pub fn new(policy: SnapshotPolicy) -> Self {
        Self {
            policy,
            docs: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> SnapshotPolicy {
        self.policy
    }

    /// Create empty tracking state for a document. Idempotent.
    pub async fn initialize(&self, doc_id: Uuid) {
        self.docs
            .write()
            .await
            .entry(doc_id)
            .or_insert_with(DocTracking::new);
    }

    /// Record `bytes` changed by `user_id`.
    ///
    /// An untracked document is a warning, never a crash — the change is
    /// dropped and the caller proceeds.
    pub async fn record_change(&self, doc_id: Uuid, user_id: Uuid, bytes: u64) {
        let mut docs = self.docs.write().await;
        match docs.get_mut(&doc_id) {
            Some(tracking) => {
                *tracking.per_user.entry(user_id).or_insert(0) += bytes;
                tracking.total += bytes;
            }
            None => {
                log::warn!("recordChange for untracked document {doc_id}; dropping {bytes} bytes");
            }
        }
    }

    /// Whether a snapshot is due.
    ///
    /// True iff any changes were recorded and either the interval elapsed
    /// or the byte threshold was crossed.
    pub async fn should_snapshot(&self, doc_id: Uuid) -> bool {
        let docs = self.docs.read().await;
        let Some(tracking) = docs.get(&doc_id) else {
            return false;
        };
        tracking.total > 0
            && (tracking.last_snapshot_at.elapsed() >= self.policy.min_interval
                || tracking.total >= self.policy.byte_threshold)
    }

    /// Resolve tracked users to contributors and atomically reset.
    ///
    /// Contributors come back sorted by descending change volume; the
    /// per-user map and total clear, the timer re-arms, and the pre-reset
    /// total is folded into the baseline counter. An untracked document
    /// returns an empty list, so concurrent callers after a reset write
    /// nothing.
    pub async fn contributors_and_reset(
        &self,
        doc_id: Uuid,
        directory: &dyn UserDirectory,
    ) -> Vec<Contributor> {
        let drained: Vec<(Uuid, u64)> = {
            let mut docs = self.docs.write().await;
            let Some(tracking) = docs.get_mut(&doc_id) else {
                return Vec::new();
            };
            if tracking.total == 0 {
                return Vec::new();
            }
            tracking.baseline_total += tracking.total;
            tracking.total = 0;
            tracking.last_snapshot_at = Instant::now();
            tracking.per_user.drain().collect()
        };

        // Name resolution is I/O against the user directory; it runs
        // outside the tracker lock.
        let mut contributors: Vec<Contributor> = drained
            .into_iter()
            .map(|(user_id, bytes_changed)| Contributor {
                user_id,
                name: directory
                    .display_name(user_id)
                    .unwrap_or_else(|| fallback_name(user_id)),
                bytes_changed,
            })
            .collect();
        contributors.sort_by(|a, b| b.bytes_changed.cmp(&a.bytes_changed));
        contributors
    }

    /// Discard tracking state entirely (room closed).
    pub async fn cleanup(&self, doc_id: Uuid) {
        self.docs.write().await.remove(&doc_id);
    }

    /// Bytes recorded for one user since the last snapshot.
    pub async fn user_total(&self, doc_id: Uuid, user_id: Uuid) -> u64 {
        self.docs
            .read()
            .await
            .get(&doc_id)
            .and_then(|t| t.per_user.get(&user_id).copied())
            .unwrap_or(0)
    }

    /// Total bytes recorded since the last snapshot.
    pub async fn doc_total(&self, doc_id: Uuid) -> u64 {
        self.docs.read().await.get(&doc_id).map(|t| t.total).unwrap_or(0)
    }

    /// Cumulative bytes captured by all past resets (drift detection).
    pub async fn baseline(&self, doc_id: Uuid) -> u64 {
        self.docs
            .read()
            .await
            .get(&doc_id)
            .map(|t| t.baseline_total)
            .unwrap_or(0)
    }
}
