use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::store::{Result, StateStore, StoreError};
use crate::types::{Metadata, Pipeline, PipelineStatus, Stage, Task};

/// Durable per-task pipeline state machine.
///
/// Every mutating call runs load -> mutate -> persist while holding an async
/// mutex dedicated to the task id, so two loops touching the same pipeline
/// are serialized instead of overwriting each other's changes.
pub struct PipelineStore {
    store: Arc<dyn StateStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PipelineStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    /// The underlying storage backend.
    pub fn backend(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    fn lock_for(&self, task_id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(task_id.to_string()).or_default().clone()
    }

    /// Load, apply `f`, stamp `updated_at` and persist, all under the task lock.
    async fn mutate<F>(&self, task_id: &str, f: F) -> Result<Pipeline>
    where
        F: FnOnce(&mut Pipeline, DateTime<Utc>) + Send,
    {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        let mut pipeline = self
            .store
            .load_pipeline(task_id)
            .await?
            .ok_or_else(|| StoreError::PipelineNotFound(task_id.to_string()))?;
        let now = Utc::now();
        f(&mut pipeline, now);
        pipeline.updated_at = now;
        self.store.save_pipeline(&pipeline).await?;
        Ok(pipeline)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub async fn create(&self, task: &Task) -> Result<Pipeline> {
        let lock = self.lock_for(&task.id);
        let _guard = lock.lock().await;

        if self.store.load_pipeline(&task.id).await?.is_some() {
            return Err(StoreError::PipelineExists(task.id.clone()));
        }
        let pipeline = Pipeline::new(task, Utc::now());
        self.store.save_pipeline(&pipeline).await?;
        info!(task_id = %task.id, title = %task.title, "pipeline created");
        Ok(pipeline)
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Pipeline>> {
        self.store.load_pipeline(task_id).await
    }

    /// Mark the pipeline completed. Stage statuses are left untouched.
    pub async fn complete(&self, task_id: &str) -> Result<Pipeline> {
        let p = self.mutate(task_id, |p, now| p.mark_completed(now)).await?;
        info!(task_id, duration_ms = ?p.total_duration_ms, "pipeline completed");
        Ok(p)
    }

    pub async fn fail(&self, task_id: &str, error: &str) -> Result<Pipeline> {
        let p = self
            .mutate(task_id, |p, now| p.mark_failed(error, now))
            .await?;
        warn!(task_id, error, "pipeline failed");
        Ok(p)
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    pub async fn update_stage(&self, task_id: &str, stage: Stage, meta: Metadata) -> Result<Pipeline> {
        let p = self
            .mutate(task_id, move |p, now| p.enter_stage(stage, meta, now))
            .await?;
        debug!(task_id, stage = %stage, "stage started");
        Ok(p)
    }

    pub async fn complete_stage(
        &self,
        task_id: &str,
        stage: Stage,
        result: Metadata,
    ) -> Result<Pipeline> {
        let p = self
            .mutate(task_id, move |p, now| p.complete_stage(stage, result, now))
            .await?;
        let duration_ms = p.stage(stage).and_then(|s| s.duration_ms);
        debug!(task_id, stage = %stage, ?duration_ms, "stage completed");
        Ok(p)
    }

    pub async fn fail_stage(&self, task_id: &str, stage: Stage, error: &str) -> Result<Pipeline> {
        let p = self
            .mutate(task_id, |p, now| p.fail_stage(stage, error, now))
            .await?;
        warn!(task_id, stage = %stage, error, "stage failed");
        Ok(p)
    }

    pub async fn skip_stage(&self, task_id: &str, stage: Stage, reason: &str) -> Result<Pipeline> {
        let p = self
            .mutate(task_id, |p, now| p.skip_stage(stage, reason, now))
            .await?;
        debug!(task_id, stage = %stage, reason, "stage skipped");
        Ok(p)
    }

    /// Merge keys into pipeline metadata without touching `stages`.
    pub async fn update_metadata(&self, task_id: &str, meta: Metadata) -> Result<Pipeline> {
        self.mutate(task_id, move |p, _| p.merge_metadata(meta))
            .await
    }

    // -----------------------------------------------------------------------
    // Queries / retention
    // -----------------------------------------------------------------------

    /// All pipelines still in progress.
    pub async fn get_active(&self) -> Result<Vec<Pipeline>> {
        let mut all = self.store.list_pipelines().await?;
        all.retain(|p| p.status == PipelineStatus::InProgress);
        Ok(all)
    }

    /// Delete terminal pipelines that finished more than `max_age` ago.
    pub async fn cleanup(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_age;
        let candidates: Vec<String> = self
            .store
            .list_pipelines()
            .await?
            .into_iter()
            .filter(|p| p.terminal_at().is_some_and(|t| t < cutoff))
            .map(|p| p.task_id)
            .collect();

        let mut removed = 0;
        for task_id in candidates {
            let lock = self.lock_for(&task_id);
            let guard = lock.lock().await;
            // Re-check under the lock; the pipeline may have been touched since.
            let still_expired = self
                .store
                .load_pipeline(&task_id)
                .await?
                .and_then(|p| p.terminal_at())
                .is_some_and(|t| t < cutoff);
            if still_expired && self.store.delete_pipeline(&task_id).await? {
                removed += 1;
            }
            drop(guard);
            self.locks.remove(&task_id);
        }

        if removed > 0 {
            info!(removed, "cleaned up old pipelines");
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
