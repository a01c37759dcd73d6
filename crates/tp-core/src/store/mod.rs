//! Persistence port for orchestration state.
//!
//! The core only ever talks to [`StateStore`]; two interchangeable backends
//! are provided: [`json::JsonFileStore`] (one JSON file per collection) and
//! [`sqlite::SqliteStore`] (normalized relational schema).

pub mod json;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{CacheEntry, Pipeline, PrTrackingEntry, ReviewCycleEntry};

pub use json::JsonFileStore;
pub use sqlite::SqliteStore;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),
    #[error("pipeline already exists: {0}")]
    PipelineExists(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Keyed collections: `pipelines`, `review_cycles`, `pr_tracking` and
/// `processed_cache`, each keyed by task id.
///
/// Implementations make each individual call atomic. Read-modify-write
/// sequences spanning several calls are serialized one level up, in
/// [`crate::pipeline_store::PipelineStore`].
#[async_trait]
pub trait StateStore: Send + Sync {
    // -- pipelines ----------------------------------------------------------

    async fn load_pipeline(&self, task_id: &str) -> Result<Option<Pipeline>>;
    async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<()>;
    async fn list_pipelines(&self) -> Result<Vec<Pipeline>>;
    /// Returns `true` if a pipeline was removed.
    async fn delete_pipeline(&self, task_id: &str) -> Result<bool>;

    // -- review cycles ------------------------------------------------------

    async fn load_review_cycle(&self, task_id: &str) -> Result<Option<ReviewCycleEntry>>;
    async fn save_review_cycle(&self, entry: &ReviewCycleEntry) -> Result<()>;
    async fn list_review_cycles(&self) -> Result<Vec<ReviewCycleEntry>>;
    async fn delete_review_cycle(&self, task_id: &str) -> Result<bool>;

    // -- pr tracking --------------------------------------------------------

    async fn load_pr_tracking(&self, task_id: &str) -> Result<Option<PrTrackingEntry>>;
    async fn save_pr_tracking(&self, entry: &PrTrackingEntry) -> Result<()>;
    async fn list_pr_tracking(&self) -> Result<Vec<PrTrackingEntry>>;
    async fn delete_pr_tracking(&self, task_id: &str) -> Result<bool>;

    // -- processed cache ----------------------------------------------------

    /// Insert `entry` unless a live (unexpired at `now`) entry with the same
    /// id exists. Returns `true` if the entry was written.
    async fn try_insert_cache_entry(&self, entry: &CacheEntry, now: DateTime<Utc>)
        -> Result<bool>;
    async fn get_cache_entry(&self, id: &str) -> Result<Option<CacheEntry>>;
    async fn list_cache_entries(&self) -> Result<Vec<CacheEntry>>;
    /// Physically remove entries whose `expires_at` predates `now`.
    async fn delete_expired_cache_entries(&self, now: DateTime<Utc>) -> Result<usize>;
}
