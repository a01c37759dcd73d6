//! Ports to the external systems the orchestrator polls.
//!
//! Adapters live in `tp-integrations`; tests substitute hand-written mocks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::Task;

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited")]
    RateLimited,
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, PortError>;

/// A pull request whose head is a tracked branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub number: u64,
    pub url: String,
    pub state: String,
}

/// Tip commit of a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub sha: String,
    pub message: String,
}

/// Work-tracking system (issues assigned to the automation).
#[async_trait]
pub trait WorkTracker: Send + Sync {
    async fn fetch_assigned(&self) -> Result<Vec<Task>>;
    async fn add_comment(&self, task_id: &str, text: &str) -> Result<()>;
    async fn update_status(&self, task_id: &str, status: &str) -> Result<()>;
}

/// Version-control host.
#[async_trait]
pub trait VcsHost: Send + Sync {
    async fn find_pull_request(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Option<PullRequestRef>>;

    async fn latest_commit(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Option<CommitRef>>;
}
