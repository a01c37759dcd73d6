pub mod client;
pub mod commits;
pub mod pull_requests;

use async_trait::async_trait;
use tp_core::ports::{self, CommitRef, PortError, PullRequestRef, VcsHost};

pub use client::{GitHubClient, GitHubClientConfig, GitHubError};

#[async_trait]
impl VcsHost for GitHubClient {
    async fn find_pull_request(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> ports::Result<Option<PullRequestRef>> {
        pull_requests::find_for_branch(self, owner, repo, branch)
            .await
            .map_err(PortError::from)
    }

    async fn latest_commit(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> ports::Result<Option<CommitRef>> {
        commits::latest_on_branch(self, owner, repo, branch)
            .await
            .map_err(PortError::from)
    }
}
