use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_rusqlite::Connection;

use super::{Result, StateStore};
use crate::types::{
    CacheEntry, ErrorEntry, Metadata, Pipeline, PrTrackingEntry, ReviewCycleEntry, StageEntry,
};

/// Async SQLite-backed state store.
///
/// Stages and errors are normalized into `pipeline_stages` and
/// `pipeline_errors`, both cascading on delete from `pipelines`.
pub struct SqliteStore {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// helpers - enum / timestamp <-> SQLite string
// ---------------------------------------------------------------------------

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn enum_to_sql<T: Serialize>(val: &T) -> rusqlite::Result<String> {
    let s = serde_json::to_string(val)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    Ok(s.trim_matches('"').to_string())
}

fn enum_from_sql<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(&format!("\"{raw}\"")).map_err(|e| conversion_error(idx, e))
}

/// Fixed-width so that string comparison in SQL orders chronologically.
fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn ts_from_sql(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_ts_from_sql(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| ts_from_sql(idx, &s)).transpose()
}

fn map_to_sql(map: &Metadata) -> rusqlite::Result<String> {
    serde_json::to_string(map).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn map_from_sql(idx: usize, raw: Option<String>) -> rusqlite::Result<Metadata> {
    match raw {
        Some(s) if !s.is_empty() => serde_json::from_str(&s).map_err(|e| conversion_error(idx, e)),
        _ => Ok(Metadata::new()),
    }
}

impl SqliteStore {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    PRAGMA foreign_keys=ON;

                    CREATE TABLE IF NOT EXISTS pipelines (
                        task_id           TEXT PRIMARY KEY,
                        task_name         TEXT NOT NULL,
                        current_stage     TEXT NOT NULL,
                        status            TEXT NOT NULL,
                        created_at        TEXT NOT NULL,
                        updated_at        TEXT NOT NULL,
                        completed_at      TEXT,
                        failed_at         TEXT,
                        total_duration_ms INTEGER,
                        metadata          TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_pipelines_status ON pipelines(status);

                    CREATE TABLE IF NOT EXISTS pipeline_stages (
                        task_id      TEXT NOT NULL REFERENCES pipelines(task_id) ON DELETE CASCADE,
                        stage        TEXT NOT NULL,
                        position     INTEGER NOT NULL,
                        name         TEXT NOT NULL,
                        status       TEXT NOT NULL,
                        started_at   TEXT NOT NULL,
                        completed_at TEXT,
                        duration_ms  INTEGER,
                        error        TEXT,
                        extra        TEXT,
                        PRIMARY KEY (task_id, stage)
                    );

                    CREATE TABLE IF NOT EXISTS pipeline_errors (
                        id        INTEGER PRIMARY KEY AUTOINCREMENT,
                        task_id   TEXT NOT NULL REFERENCES pipelines(task_id) ON DELETE CASCADE,
                        stage     TEXT NOT NULL,
                        error     TEXT NOT NULL,
                        timestamp TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_pipeline_errors_task ON pipeline_errors(task_id);

                    CREATE TABLE IF NOT EXISTS review_cycles (
                        task_id         TEXT PRIMARY KEY,
                        branch          TEXT NOT NULL,
                        pr_number       INTEGER NOT NULL,
                        pr_url          TEXT NOT NULL,
                        stage           TEXT NOT NULL,
                        iteration       INTEGER NOT NULL,
                        max_iterations  INTEGER NOT NULL,
                        started_at      TEXT NOT NULL,
                        last_commit_sha TEXT
                    );

                    CREATE TABLE IF NOT EXISTS pr_tracking (
                        task_id    TEXT PRIMARY KEY,
                        branch     TEXT NOT NULL,
                        started_at TEXT NOT NULL,
                        owner      TEXT NOT NULL,
                        repo       TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS processed_cache (
                        id          TEXT PRIMARY KEY,
                        title       TEXT NOT NULL,
                        description TEXT,
                        detected_at TEXT NOT NULL,
                        expires_at  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_processed_cache_expires ON processed_cache(expires_at);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const PIPELINE_COLUMNS: &str = "task_id, task_name, current_stage, status, created_at,
    updated_at, completed_at, failed_at, total_duration_ms, metadata";

fn row_to_pipeline(row: &rusqlite::Row<'_>) -> rusqlite::Result<Pipeline> {
    let current_stage: String = row.get(2)?;
    let status: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;

    Ok(Pipeline {
        task_id: row.get(0)?,
        task_name: row.get(1)?,
        current_stage: enum_from_sql(2, &current_stage)?,
        status: enum_from_sql(3, &status)?,
        created_at: ts_from_sql(4, &created_at)?,
        updated_at: ts_from_sql(5, &updated_at)?,
        completed_at: opt_ts_from_sql(6, row.get(6)?)?,
        failed_at: opt_ts_from_sql(7, row.get(7)?)?,
        total_duration_ms: row.get(8)?,
        metadata: map_from_sql(9, row.get(9)?)?,
        stages: Vec::new(),
        errors: Vec::new(),
    })
}

fn row_to_stage(row: &rusqlite::Row<'_>) -> rusqlite::Result<StageEntry> {
    let stage: String = row.get(0)?;
    let status: String = row.get(2)?;
    let started_at: String = row.get(3)?;

    Ok(StageEntry {
        stage: enum_from_sql(0, &stage)?,
        name: row.get(1)?,
        status: enum_from_sql(2, &status)?,
        started_at: ts_from_sql(3, &started_at)?,
        completed_at: opt_ts_from_sql(4, row.get(4)?)?,
        duration_ms: row.get(5)?,
        error: row.get(6)?,
        extra: map_from_sql(7, row.get(7)?)?,
    })
}

fn row_to_error(row: &rusqlite::Row<'_>) -> rusqlite::Result<ErrorEntry> {
    let stage: String = row.get(0)?;
    let timestamp: String = row.get(2)?;
    Ok(ErrorEntry {
        stage: enum_from_sql(0, &stage)?,
        error: row.get(1)?,
        timestamp: ts_from_sql(2, &timestamp)?,
    })
}

fn row_to_review_cycle(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReviewCycleEntry> {
    let pr_number: i64 = row.get(2)?;
    let stage: String = row.get(4)?;
    let started_at: String = row.get(7)?;
    Ok(ReviewCycleEntry {
        task_id: row.get(0)?,
        branch: row.get(1)?,
        pr_number: pr_number as u64,
        pr_url: row.get(3)?,
        stage: enum_from_sql(4, &stage)?,
        iteration: row.get(5)?,
        max_iterations: row.get(6)?,
        started_at: ts_from_sql(7, &started_at)?,
        last_commit_sha: row.get(8)?,
    })
}

fn row_to_pr_tracking(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrTrackingEntry> {
    let started_at: String = row.get(2)?;
    Ok(PrTrackingEntry {
        task_id: row.get(0)?,
        branch: row.get(1)?,
        started_at: ts_from_sql(2, &started_at)?,
        owner: row.get(3)?,
        repo: row.get(4)?,
    })
}

fn row_to_cache_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheEntry> {
    let detected_at: String = row.get(3)?;
    let expires_at: String = row.get(4)?;
    Ok(CacheEntry {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        detected_at: ts_from_sql(3, &detected_at)?,
        expires_at: ts_from_sql(4, &expires_at)?,
    })
}

/// Load one pipeline together with its child rows.
fn select_pipeline(
    conn: &rusqlite::Connection,
    task_id: &str,
) -> rusqlite::Result<Option<Pipeline>> {
    let mut pipeline = match conn
        .query_row(
            &format!("SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE task_id = ?1"),
            params![task_id],
            row_to_pipeline,
        )
        .optional()?
    {
        Some(p) => p,
        None => return Ok(None),
    };

    let mut stmt = conn.prepare(
        "SELECT stage, name, status, started_at, completed_at, duration_ms, error, extra
         FROM pipeline_stages WHERE task_id = ?1 ORDER BY position",
    )?;
    pipeline.stages = stmt
        .query_map(params![task_id], row_to_stage)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare(
        "SELECT stage, error, timestamp FROM pipeline_errors WHERE task_id = ?1 ORDER BY id",
    )?;
    pipeline.errors = stmt
        .query_map(params![task_id], row_to_error)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Some(pipeline))
}

#[async_trait]
impl StateStore for SqliteStore {
    // -----------------------------------------------------------------------
    // Pipelines
    // -----------------------------------------------------------------------

    async fn load_pipeline(&self, task_id: &str) -> Result<Option<Pipeline>> {
        let task_id = task_id.to_string();
        let pipeline = self
            .conn
            .call(move |conn| Ok(select_pipeline(conn, &task_id)?))
            .await?;
        Ok(pipeline)
    }

    async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let p = pipeline.clone();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO pipelines (task_id, task_name, current_stage, status,
                        created_at, updated_at, completed_at, failed_at, total_duration_ms,
                        metadata)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
                     ON CONFLICT(task_id) DO UPDATE SET
                        task_name=excluded.task_name, current_stage=excluded.current_stage,
                        status=excluded.status, updated_at=excluded.updated_at,
                        completed_at=excluded.completed_at, failed_at=excluded.failed_at,
                        total_duration_ms=excluded.total_duration_ms,
                        metadata=excluded.metadata",
                    params![
                        p.task_id,
                        p.task_name,
                        enum_to_sql(&p.current_stage)?,
                        enum_to_sql(&p.status)?,
                        ts_to_sql(p.created_at),
                        ts_to_sql(p.updated_at),
                        p.completed_at.map(ts_to_sql),
                        p.failed_at.map(ts_to_sql),
                        p.total_duration_ms,
                        map_to_sql(&p.metadata)?,
                    ],
                )?;

                tx.execute(
                    "DELETE FROM pipeline_stages WHERE task_id = ?1",
                    params![p.task_id],
                )?;
                for (position, s) in p.stages.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO pipeline_stages (task_id, stage, position, name, status,
                            started_at, completed_at, duration_ms, error, extra)
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                        params![
                            p.task_id,
                            enum_to_sql(&s.stage)?,
                            position as i64,
                            s.name,
                            enum_to_sql(&s.status)?,
                            ts_to_sql(s.started_at),
                            s.completed_at.map(ts_to_sql),
                            s.duration_ms,
                            s.error,
                            map_to_sql(&s.extra)?,
                        ],
                    )?;
                }

                // Errors are append-only; only rows beyond what is stored are new.
                let stored: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM pipeline_errors WHERE task_id = ?1",
                    params![p.task_id],
                    |row| row.get(0),
                )?;
                for e in p.errors.iter().skip(stored.max(0) as usize) {
                    tx.execute(
                        "INSERT INTO pipeline_errors (task_id, stage, error, timestamp)
                         VALUES (?1,?2,?3,?4)",
                        params![
                            p.task_id,
                            enum_to_sql(&e.stage)?,
                            e.error,
                            ts_to_sql(e.timestamp)
                        ],
                    )?;
                }

                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn list_pipelines(&self) -> Result<Vec<Pipeline>> {
        let pipelines = self
            .conn
            .call(|conn| {
                let ids = {
                    let mut stmt =
                        conn.prepare("SELECT task_id FROM pipelines ORDER BY created_at")?;
                    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(p) = select_pipeline(conn, &id)? {
                        out.push(p);
                    }
                }
                Ok(out)
            })
            .await?;
        Ok(pipelines)
    }

    async fn delete_pipeline(&self, task_id: &str) -> Result<bool> {
        let task_id = task_id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute("DELETE FROM pipelines WHERE task_id = ?1", params![task_id])?;
                Ok(n > 0)
            })
            .await?;
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Review cycles
    // -----------------------------------------------------------------------

    async fn load_review_cycle(&self, task_id: &str) -> Result<Option<ReviewCycleEntry>> {
        let task_id = task_id.to_string();
        let entry = self
            .conn
            .call(move |conn| {
                let entry = conn
                    .query_row(
                        "SELECT task_id, branch, pr_number, pr_url, stage, iteration,
                                max_iterations, started_at, last_commit_sha
                         FROM review_cycles WHERE task_id = ?1",
                        params![task_id],
                        row_to_review_cycle,
                    )
                    .optional()?;
                Ok(entry)
            })
            .await?;
        Ok(entry)
    }

    async fn save_review_cycle(&self, entry: &ReviewCycleEntry) -> Result<()> {
        let e = entry.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO review_cycles (task_id, branch, pr_number, pr_url, stage,
                        iteration, max_iterations, started_at, last_commit_sha)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                     ON CONFLICT(task_id) DO UPDATE SET
                        branch=excluded.branch, pr_number=excluded.pr_number,
                        pr_url=excluded.pr_url, stage=excluded.stage,
                        iteration=excluded.iteration, max_iterations=excluded.max_iterations,
                        started_at=excluded.started_at, last_commit_sha=excluded.last_commit_sha",
                    params![
                        e.task_id,
                        e.branch,
                        e.pr_number as i64,
                        e.pr_url,
                        enum_to_sql(&e.stage)?,
                        e.iteration,
                        e.max_iterations,
                        ts_to_sql(e.started_at),
                        e.last_commit_sha,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn list_review_cycles(&self) -> Result<Vec<ReviewCycleEntry>> {
        let entries = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT task_id, branch, pr_number, pr_url, stage, iteration,
                            max_iterations, started_at, last_commit_sha
                     FROM review_cycles ORDER BY started_at",
                )?;
                let rows = stmt
                    .query_map([], row_to_review_cycle)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(entries)
    }

    async fn delete_review_cycle(&self, task_id: &str) -> Result<bool> {
        let task_id = task_id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM review_cycles WHERE task_id = ?1",
                    params![task_id],
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // PR tracking
    // -----------------------------------------------------------------------

    async fn load_pr_tracking(&self, task_id: &str) -> Result<Option<PrTrackingEntry>> {
        let task_id = task_id.to_string();
        let entry = self
            .conn
            .call(move |conn| {
                let entry = conn
                    .query_row(
                        "SELECT task_id, branch, started_at, owner, repo
                         FROM pr_tracking WHERE task_id = ?1",
                        params![task_id],
                        row_to_pr_tracking,
                    )
                    .optional()?;
                Ok(entry)
            })
            .await?;
        Ok(entry)
    }

    async fn save_pr_tracking(&self, entry: &PrTrackingEntry) -> Result<()> {
        let e = entry.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO pr_tracking (task_id, branch, started_at, owner, repo)
                     VALUES (?1,?2,?3,?4,?5)
                     ON CONFLICT(task_id) DO UPDATE SET
                        branch=excluded.branch, started_at=excluded.started_at,
                        owner=excluded.owner, repo=excluded.repo",
                    params![e.task_id, e.branch, ts_to_sql(e.started_at), e.owner, e.repo],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn list_pr_tracking(&self) -> Result<Vec<PrTrackingEntry>> {
        let entries = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT task_id, branch, started_at, owner, repo
                     FROM pr_tracking ORDER BY started_at",
                )?;
                let rows = stmt
                    .query_map([], row_to_pr_tracking)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(entries)
    }

    async fn delete_pr_tracking(&self, task_id: &str) -> Result<bool> {
        let task_id = task_id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM pr_tracking WHERE task_id = ?1",
                    params![task_id],
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Processed cache
    // -----------------------------------------------------------------------

    async fn try_insert_cache_entry(
        &self,
        entry: &CacheEntry,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let e = entry.clone();
        let inserted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let existing = tx
                    .query_row(
                        "SELECT id, title, description, detected_at, expires_at
                         FROM processed_cache WHERE id = ?1",
                        params![e.id],
                        row_to_cache_entry,
                    )
                    .optional()?;
                if existing.is_some_and(|x| !x.is_expired(now)) {
                    return Ok(false);
                }
                tx.execute(
                    "INSERT OR REPLACE INTO processed_cache
                        (id, title, description, detected_at, expires_at)
                     VALUES (?1,?2,?3,?4,?5)",
                    params![
                        e.id,
                        e.title,
                        e.description,
                        ts_to_sql(e.detected_at),
                        ts_to_sql(e.expires_at)
                    ],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await?;
        Ok(inserted)
    }

    async fn get_cache_entry(&self, id: &str) -> Result<Option<CacheEntry>> {
        let id = id.to_string();
        let entry = self
            .conn
            .call(move |conn| {
                let entry = conn
                    .query_row(
                        "SELECT id, title, description, detected_at, expires_at
                         FROM processed_cache WHERE id = ?1",
                        params![id],
                        row_to_cache_entry,
                    )
                    .optional()?;
                Ok(entry)
            })
            .await?;
        Ok(entry)
    }

    async fn list_cache_entries(&self) -> Result<Vec<CacheEntry>> {
        let entries = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, description, detected_at, expires_at
                     FROM processed_cache ORDER BY detected_at",
                )?;
                let rows = stmt
                    .query_map([], row_to_cache_entry)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(entries)
    }

    async fn delete_expired_cache_entries(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = ts_to_sql(now);
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM processed_cache WHERE expires_at < ?1",
                    params![cutoff],
                )?;
                Ok(n)
            })
            .await?;
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
