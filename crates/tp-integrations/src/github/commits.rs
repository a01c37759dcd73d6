use tp_core::ports::CommitRef;
use tracing::debug;

use super::client::{GitHubClient, GitHubError, Result};

/// Tip commit of `branch`, or `None` if the branch does not exist yet.
pub async fn latest_on_branch(
    client: &GitHubClient,
    owner: &str,
    repo: &str,
    branch: &str,
) -> Result<Option<CommitRef>> {
    let page = match client
        .octocrab
        .repos(owner, repo)
        .list_commits()
        .branch(branch)
        .per_page(1)
        .send()
        .await
    {
        Ok(page) => page,
        Err(octocrab::Error::GitHub { source, .. })
            if matches!(source.status_code.as_u16(), 404 | 409) =>
        {
            // 404: unknown branch, 409: empty repository.
            debug!(owner, repo, branch, "no commits on branch");
            return Ok(None);
        }
        Err(e) => return Err(GitHubError::Api(e)),
    };

    Ok(page.items.into_iter().next().map(|c| CommitRef {
        sha: c.sha,
        message: c.commit.message,
    }))
}
