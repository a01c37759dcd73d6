use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info};

use crate::store::{Result, StateStore};
use crate::types::{CacheEntry, Task};

/// Default time-to-live for processed-task entries.
pub const DEFAULT_TTL_DAYS: i64 = 30;

/// Remembers which tasks have already been picked up.
///
/// Expired entries are ignored by [`DedupCache::has`] but stay on disk until
/// [`DedupCache::sweep_expired`] runs from the patrol loop.
pub struct DedupCache {
    store: Arc<dyn StateStore>,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            ttl: Duration::days(DEFAULT_TTL_DAYS),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// `true` if a live entry exists for `task_id`.
    pub async fn has(&self, task_id: &str) -> Result<bool> {
        let now = Utc::now();
        Ok(self
            .store
            .get_cache_entry(task_id)
            .await?
            .is_some_and(|e| !e.is_expired(now)))
    }

    /// Record `task` as seen. Returns `false` if a live entry already existed.
    pub async fn add(&self, task: &Task) -> Result<bool> {
        let now = Utc::now();
        let entry = CacheEntry::from_task(task, self.ttl, now);
        let inserted = self.store.try_insert_cache_entry(&entry, now).await?;
        if inserted {
            debug!(task_id = %task.id, expires_at = %entry.expires_at, "task cached");
        }
        Ok(inserted)
    }

    /// Remove physically expired entries. Returns how many were removed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let removed = self.store.delete_expired_cache_entries(Utc::now()).await?;
        if removed > 0 {
            info!(removed, "swept expired dedup entries");
        }
        Ok(removed)
    }
}
