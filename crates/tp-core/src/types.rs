use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form key/value data attached to pipelines and stage entries.
pub type Metadata = Map<String, Value>;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A work item assigned to the automation by the work tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            url: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detected,
    Analyzing,
    Implementing,
    CodexReviewing,
    ClaudeFixing,
    Merging,
    PrCreating,
    Completed,
    Failed,
}

impl Stage {
    /// A failure in a critical stage aborts the whole pipeline.
    pub fn is_critical(&self) -> bool {
        matches!(self, Stage::Implementing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Detected => "detected",
            Stage::Analyzing => "analyzing",
            Stage::Implementing => "implementing",
            Stage::CodexReviewing => "codex_reviewing",
            Stage::ClaudeFixing => "claude_fixing",
            Stage::Merging => "merging",
            Stage::PrCreating => "pr_creating",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }

    /// Human readable name, used for `StageEntry::name` and notifications.
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Detected => "Task detected",
            Stage::Analyzing => "Requirements analysis",
            Stage::Implementing => "Implementation",
            Stage::CodexReviewing => "Codex review",
            Stage::ClaudeFixing => "Claude fixes",
            Stage::Merging => "Merging",
            Stage::PrCreating => "Pull request",
            Stage::Completed => "Completed",
            Stage::Failed => "Failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PipelineStatus
// ---------------------------------------------------------------------------

/// Status shared by pipelines and their stage entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Failed | PipelineStatus::Skipped
        )
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::InProgress => "in_progress",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// StageEntry / ErrorEntry
// ---------------------------------------------------------------------------

/// The current attempt of one named stage. Re-entering a stage overwrites
/// this record instead of appending a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEntry {
    pub name: String,
    pub stage: Stage,
    pub status: PipelineStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    /// Stage-specific fields such as `branch` or `artifact_path`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Metadata,
}

impl StageEntry {
    fn started(stage: Stage, now: DateTime<Utc>) -> Self {
        Self {
            name: stage.label().to_string(),
            stage,
            status: PipelineStatus::InProgress,
            started_at: now,
            completed_at: None,
            duration_ms: None,
            error: None,
            extra: Metadata::new(),
        }
    }

    fn finish(&mut self, status: PipelineStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = Some(elapsed_ms(self.started_at, now));
    }
}

/// One recorded failure. Append-only, survives stage re-entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub stage: Stage,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Persisted state machine for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub task_id: String,
    pub task_name: String,
    pub current_stage: Stage,
    pub status: PipelineStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_duration_ms: Option<i64>,
    #[serde(default)]
    pub stages: Vec<StageEntry>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
}

impl Pipeline {
    /// Create a pipeline for a freshly detected task. The `detected` stage is
    /// recorded as already completed.
    pub fn new(task: &Task, now: DateTime<Utc>) -> Self {
        let mut detected = StageEntry::started(Stage::Detected, now);
        detected.finish(PipelineStatus::Completed, now);
        if let Some(url) = &task.url {
            detected
                .extra
                .insert("task_url".into(), Value::String(url.clone()));
        }

        Self {
            task_id: task.id.clone(),
            task_name: task.title.clone(),
            current_stage: Stage::Detected,
            status: PipelineStatus::InProgress,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failed_at: None,
            total_duration_ms: None,
            stages: vec![detected],
            metadata: Metadata::new(),
            errors: Vec::new(),
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageEntry> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// When the pipeline reached its terminal status, if it did.
    pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at.or(self.failed_at)
    }

    /// Mark `stage` as in progress, overwriting any earlier attempt.
    pub fn enter_stage(&mut self, stage: Stage, meta: Metadata, now: DateTime<Utc>) {
        let entry = self.touch_stage(stage, now);
        *entry = StageEntry::started(stage, now);
        entry.extra = meta;
    }

    /// Mark `stage` as completed and merge `result` into its extra fields.
    pub fn complete_stage(&mut self, stage: Stage, result: Metadata, now: DateTime<Utc>) {
        let entry = self.touch_stage(stage, now);
        entry.finish(PipelineStatus::Completed, now);
        entry.error = None;
        entry.extra.extend(result);
    }

    /// Mark `stage` as failed and append an error record.
    pub fn fail_stage(&mut self, stage: Stage, error: &str, now: DateTime<Utc>) {
        let entry = self.touch_stage(stage, now);
        entry.finish(PipelineStatus::Failed, now);
        entry.error = Some(error.to_string());
        self.errors.push(ErrorEntry {
            stage,
            error: error.to_string(),
            timestamp: now,
        });
    }

    pub fn skip_stage(&mut self, stage: Stage, reason: &str, now: DateTime<Utc>) {
        let entry = self.touch_stage(stage, now);
        entry.finish(PipelineStatus::Skipped, now);
        entry
            .extra
            .insert("reason".into(), Value::String(reason.to_string()));
    }

    pub fn merge_metadata(&mut self, meta: Metadata) {
        self.metadata.extend(meta);
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = PipelineStatus::Completed;
        self.completed_at = Some(now);
        self.total_duration_ms = Some(elapsed_ms(self.created_at, now));
    }

    /// Pipeline-level failure. Stage errors are recorded separately through
    /// [`Pipeline::fail_stage`]; the reason here lands in metadata.
    pub fn mark_failed(&mut self, reason: &str, now: DateTime<Utc>) {
        self.status = PipelineStatus::Failed;
        self.failed_at = Some(now);
        self.total_duration_ms = Some(elapsed_ms(self.created_at, now));
        self.metadata
            .insert("failure_reason".into(), Value::String(reason.to_string()));
    }

    /// Find the entry for `stage` (creating it if needed) and make it current.
    fn touch_stage(&mut self, stage: Stage, now: DateTime<Utc>) -> &mut StageEntry {
        self.current_stage = stage;
        let idx = match self.stages.iter().position(|s| s.stage == stage) {
            Some(idx) => idx,
            None => {
                self.stages.push(StageEntry::started(stage, now));
                self.stages.len() - 1
            }
        };
        &mut self.stages[idx]
    }
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    to.signed_duration_since(from).num_milliseconds().max(0)
}

// ---------------------------------------------------------------------------
// Review cycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStage {
    WaitingForCodexReview,
    WaitingForClaudeFixes,
}

impl fmt::Display for ReviewStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReviewStage::WaitingForCodexReview => "waiting_for_codex_review",
            ReviewStage::WaitingForClaudeFixes => "waiting_for_claude_fixes",
        };
        f.write_str(label)
    }
}

/// Tracks the review -> fix loop of one open pull request. The record has
/// no terminal state; it is deleted when the loop finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewCycleEntry {
    pub task_id: String,
    pub branch: String,
    pub pr_number: u64,
    pub pr_url: String,
    pub stage: ReviewStage,
    pub iteration: u32,
    pub max_iterations: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub last_commit_sha: Option<String>,
}

impl ReviewCycleEntry {
    pub fn new(event: &PrDiscovered, max_iterations: u32, now: DateTime<Utc>) -> Self {
        Self {
            task_id: event.task_id.clone(),
            branch: event.branch.clone(),
            pr_number: event.pr_number,
            pr_url: event.pr_url.clone(),
            stage: ReviewStage::WaitingForCodexReview,
            iteration: 0,
            max_iterations,
            started_at: now,
            last_commit_sha: None,
        }
    }

    pub fn budget_exhausted(&self) -> bool {
        self.iteration >= self.max_iterations
    }
}

// ---------------------------------------------------------------------------
// PR tracking
// ---------------------------------------------------------------------------

/// A branch on which a pull request is expected to appear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrTrackingEntry {
    pub task_id: String,
    pub branch: String,
    pub started_at: DateTime<Utc>,
    pub owner: String,
    pub repo: String,
}

impl PrTrackingEntry {
    pub fn new(
        task_id: impl Into<String>,
        branch: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            branch: branch.into(),
            started_at: now,
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// Only wall-clock time counts toward the timeout.
    pub fn is_timed_out(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now.signed_duration_since(self.started_at) > timeout
    }
}

/// Published when a pull request shows up for a tracked branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrDiscovered {
    pub task_id: String,
    pub pr_number: u64,
    pub pr_url: String,
    pub branch: String,
}

// ---------------------------------------------------------------------------
// Dedup cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn from_task(task: &Task, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            detected_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
}

/// An externally spawned agent process registered against a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: Option<u32>,
    pub registered_at: DateTime<Utc>,
    pub status: ProcessStatus,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ProcessEntry {
    pub fn running(pid: Option<u32>, now: DateTime<Utc>) -> Self {
        Self {
            pid,
            registered_at: now,
            status: ProcessStatus::Running,
            completed_at: None,
            failed_at: None,
            error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ProcessStatus::Running
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = ProcessStatus::Completed;
        self.completed_at = Some(now);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = ProcessStatus::Failed;
        self.failed_at = Some(now);
        self.error = Some(error.into());
    }
}
