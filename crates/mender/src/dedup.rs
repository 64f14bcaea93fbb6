//! Deduplication index for admission.
//!
//! At most one case is admitted per `(repository, run_id, head_sha)` key per
//! TTL window, across all workers. The index is the single source of truth
//! for admission; `try_admit` has compare-and-set semantics.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting within the TTL window; key recorded
    Admitted,
    /// Key already admitted within the TTL window
    Duplicate,
}

/// One recorded admission.
#[derive(Debug, Clone)]
pub struct DedupEntry {
    /// When the key was admitted
    pub admitted_at: DateTime<Utc>,
    /// Window during which re-submissions are duplicates
    pub ttl: Duration,
}

impl DedupEntry {
    /// Whether this entry has expired at `now`.
    #[must_use]
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.admitted_at + self.ttl
    }
}

/// Process-wide admission index.
#[async_trait]
pub trait DedupIndex: Send + Sync {
    /// Atomically admit `key` unless it was already admitted within its TTL.
    async fn try_admit(&self, key: &str, ttl: Duration) -> Admission;

    /// Forget a key so a later event may re-admit (used when admission is
    /// rolled back, e.g. on backpressure).
    async fn forget(&self, key: &str);

    /// Drop expired entries; returns how many were removed.
    async fn evict_expired(&self) -> usize;
}

/// In-memory [`DedupIndex`]. A single mutex serializes `try_admit`, which
/// is what gives it compare-and-set semantics across workers.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDedupIndex {
    entries: Arc<Mutex<HashMap<String, DedupEntry>>>,
}

impl InMemoryDedupIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (possibly expired, not yet evicted) entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl DedupIndex for InMemoryDedupIndex {
    async fn try_admit(&self, key: &str, ttl: Duration) -> Admission {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();

        if let Some(existing) = entries.get(key) {
            if !existing.expired(now) {
                debug!(key, "duplicate admission suppressed");
                return Admission::Duplicate;
            }
        }

        entries.insert(
            key.to_string(),
            DedupEntry {
                admitted_at: now,
                ttl,
            },
        );
        Admission::Admitted
    }

    async fn forget(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }

    async fn evict_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        let before = entries.len();
        entries.retain(|_, e| !e.expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "evicted expired dedup entries");
        }
        removed
    }
}
