use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Result, StateStore};
use crate::types::{CacheEntry, Pipeline, PrTrackingEntry, ReviewCycleEntry};

const PIPELINES_FILE: &str = "pipelines.json";
const REVIEW_CYCLES_FILE: &str = "review_cycles.json";
const PR_TRACKING_FILE: &str = "pr_tracking.json";
const PROCESSED_CACHE_FILE: &str = "processed_cache.json";

#[derive(Default)]
struct Collections {
    pipelines: BTreeMap<String, Pipeline>,
    review_cycles: BTreeMap<String, ReviewCycleEntry>,
    pr_tracking: BTreeMap<String, PrTrackingEntry>,
    processed_cache: BTreeMap<String, CacheEntry>,
}

/// File-system-backed state store.
///
/// Each collection lives in its own pretty-printed JSON object keyed by task
/// id (`pipelines.json`, `review_cycles.json`, ...). The whole state is kept
/// in memory and a collection file is rewritten atomically (temp file +
/// rename) after every change to it. Memory only takes a change once its
/// file has been written, so a failed write leaves both at the old state.
pub struct JsonFileStore {
    dir: PathBuf,
    state: Mutex<Collections>,
}

impl JsonFileStore {
    /// Open (or create) a store rooted at `dir`, loading any existing files.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let state = Collections {
            pipelines: read_collection(&dir.join(PIPELINES_FILE)).await?,
            review_cycles: read_collection(&dir.join(REVIEW_CYCLES_FILE)).await?,
            pr_tracking: read_collection(&dir.join(PR_TRACKING_FILE)).await?,
            processed_cache: read_collection(&dir.join(PROCESSED_CACHE_FILE)).await?,
        };
        debug!(
            dir = %dir.display(),
            pipelines = state.pipelines.len(),
            review_cycles = state.review_cycles.len(),
            pr_tracking = state.pr_tracking.len(),
            cache_entries = state.processed_cache.len(),
            "opened JSON state store"
        );

        Ok(Self {
            dir,
            state: Mutex::new(state),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }
}

async fn read_collection<T: DeserializeOwned>(path: &Path) -> Result<BTreeMap<String, T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(BTreeMap::new()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

async fn write_collection<T: Serialize>(path: &Path, items: &BTreeMap<String, T>) -> Result<()> {
    let json = serde_json::to_vec_pretty(items)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Apply `change` to a copy of `items`, persist the copy, then swap it in.
async fn commit<T, R>(
    path: &Path,
    items: &mut BTreeMap<String, T>,
    change: impl FnOnce(&mut BTreeMap<String, T>) -> R,
) -> Result<R>
where
    T: Serialize + Clone,
{
    let mut next = items.clone();
    let out = change(&mut next);
    write_collection(path, &next).await?;
    *items = next;
    Ok(out)
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load_pipeline(&self, task_id: &str) -> Result<Option<Pipeline>> {
        Ok(self.state.lock().await.pipelines.get(task_id).cloned())
    }

    async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let mut state = self.state.lock().await;
        commit(&self.path(PIPELINES_FILE), &mut state.pipelines, |items| {
            items.insert(pipeline.task_id.clone(), pipeline.clone());
        })
        .await
    }

    async fn list_pipelines(&self) -> Result<Vec<Pipeline>> {
        Ok(self.state.lock().await.pipelines.values().cloned().collect())
    }

    async fn delete_pipeline(&self, task_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.pipelines.contains_key(task_id) {
            return Ok(false);
        }
        commit(&self.path(PIPELINES_FILE), &mut state.pipelines, |items| {
            items.remove(task_id);
        })
        .await?;
        Ok(true)
    }

    async fn load_review_cycle(&self, task_id: &str) -> Result<Option<ReviewCycleEntry>> {
        Ok(self.state.lock().await.review_cycles.get(task_id).cloned())
    }

    async fn save_review_cycle(&self, entry: &ReviewCycleEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        commit(&self.path(REVIEW_CYCLES_FILE), &mut state.review_cycles, |items| {
            items.insert(entry.task_id.clone(), entry.clone());
        })
        .await
    }

    async fn list_review_cycles(&self) -> Result<Vec<ReviewCycleEntry>> {
        Ok(self
            .state
            .lock()
            .await
            .review_cycles
            .values()
            .cloned()
            .collect())
    }

    async fn delete_review_cycle(&self, task_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.review_cycles.contains_key(task_id) {
            return Ok(false);
        }
        commit(&self.path(REVIEW_CYCLES_FILE), &mut state.review_cycles, |items| {
            items.remove(task_id);
        })
        .await?;
        Ok(true)
    }

    async fn load_pr_tracking(&self, task_id: &str) -> Result<Option<PrTrackingEntry>> {
        Ok(self.state.lock().await.pr_tracking.get(task_id).cloned())
    }

    async fn save_pr_tracking(&self, entry: &PrTrackingEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        commit(&self.path(PR_TRACKING_FILE), &mut state.pr_tracking, |items| {
            items.insert(entry.task_id.clone(), entry.clone());
        })
        .await
    }

    async fn list_pr_tracking(&self) -> Result<Vec<PrTrackingEntry>> {
        Ok(self
            .state
            .lock()
            .await
            .pr_tracking
            .values()
            .cloned()
            .collect())
    }

    async fn delete_pr_tracking(&self, task_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.pr_tracking.contains_key(task_id) {
            return Ok(false);
        }
        commit(&self.path(PR_TRACKING_FILE), &mut state.pr_tracking, |items| {
            items.remove(task_id);
        })
        .await?;
        Ok(true)
    }

    async fn try_insert_cache_entry(
        &self,
        entry: &CacheEntry,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.processed_cache.get(&entry.id) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
        }
        commit(&self.path(PROCESSED_CACHE_FILE), &mut state.processed_cache, |items| {
            items.insert(entry.id.clone(), entry.clone());
        })
        .await?;
        Ok(true)
    }

    async fn get_cache_entry(&self, id: &str) -> Result<Option<CacheEntry>> {
        Ok(self.state.lock().await.processed_cache.get(id).cloned())
    }

    async fn list_cache_entries(&self) -> Result<Vec<CacheEntry>> {
        Ok(self
            .state
            .lock()
            .await
            .processed_cache
            .values()
            .cloned()
            .collect())
    }

    async fn delete_expired_cache_entries(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.lock().await;
        if !state.processed_cache.values().any(|e| e.is_expired(now)) {
            return Ok(0);
        }
        commit(&self.path(PROCESSED_CACHE_FILE), &mut state.processed_cache, |items| {
            let before = items.len();
            items.retain(|_, e| !e.is_expired(now));
            before - items.len()
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
