use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tp_core::types::Task;

use crate::registry::ProcessRegistry;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent not found")]
    NotFound,
    #[error("failed to launch agent: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("agent timed out after {0}s")]
    Timeout(u64),
}

pub type Result<T> = std::result::Result<T, AgentError>;

// ---------------------------------------------------------------------------
// Outcome / context
// ---------------------------------------------------------------------------

/// What an agent reports back. Expected failures come back as
/// `success: false`; only launch problems surface as [`AgentError`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub success: bool,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub artifact_path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentOutcome {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_artifact(mut self, path: impl Into<String>) -> Self {
        self.artifact_path = Some(path.into());
        self
    }
}

/// Repository the agents operate on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoConfig {
    pub owner: String,
    pub repo: String,
    pub workdir: Option<PathBuf>,
}

#[derive(Clone)]
pub struct AgentContext {
    pub repo: RepoConfig,
    /// Output of the previous stage, e.g. the analysis document.
    pub prior_artifact: Option<String>,
    /// Working branch, known from implementation onwards.
    pub branch: Option<String>,
    pub processes: Arc<ProcessRegistry>,
}

impl AgentContext {
    pub fn new(repo: RepoConfig, processes: Arc<ProcessRegistry>) -> Self {
        Self {
            repo,
            prior_artifact: None,
            branch: None,
            processes,
        }
    }

    pub fn with_prior_artifact(mut self, artifact: Option<String>) -> Self {
        self.prior_artifact = artifact;
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

// ---------------------------------------------------------------------------
// StageAgent
// ---------------------------------------------------------------------------

/// An external worker driving one pipeline stage.
///
/// Implementations that launch OS processes register them with
/// `ctx.processes` so the runner can settle them afterwards.
#[async_trait]
pub trait StageAgent: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, task: &Task, ctx: &AgentContext) -> Result<AgentOutcome>;
}

/// Stand-in for a stage that has no agent configured.
#[derive(Debug, Clone)]
pub struct MissingAgent {
    name: String,
}

impl MissingAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl StageAgent for MissingAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _task: &Task, _ctx: &AgentContext) -> Result<AgentOutcome> {
        Err(AgentError::NotFound)
    }
}

/// The four agents the pipeline drives.
#[derive(Clone)]
pub struct AgentSet {
    pub analysis: Arc<dyn StageAgent>,
    pub implementation: Arc<dyn StageAgent>,
    pub review: Arc<dyn StageAgent>,
    pub fix: Arc<dyn StageAgent>,
}

impl AgentSet {
    /// A set where every stage fails with "agent not found".
    pub fn missing() -> Self {
        Self {
            analysis: Arc::new(MissingAgent::new("analysis")),
            implementation: Arc::new(MissingAgent::new("implementation")),
            review: Arc::new(MissingAgent::new("review")),
            fix: Arc::new(MissingAgent::new("fix")),
        }
    }
}
