use octocrab::models::pulls::PullRequest;
use octocrab::models::IssueState;
use octocrab::params::State;
use tp_core::ports::PullRequestRef;
use tracing::debug;

use super::client::{GitHubClient, Result};

/// Find the most recent pull request (any state) whose head is `branch`.
pub async fn find_for_branch(
    client: &GitHubClient,
    owner: &str,
    repo: &str,
    branch: &str,
) -> Result<Option<PullRequestRef>> {
    let page = client
        .octocrab
        .pulls(owner, repo)
        .list()
        .state(State::All)
        .head(format!("{owner}:{branch}"))
        .per_page(1)
        .send()
        .await?;

    let found = page.items.into_iter().next().map(to_ref);
    debug!(owner, repo, branch, found = found.is_some(), "pull request lookup");
    Ok(found)
}

pub(crate) fn state_label(merged: bool, state: Option<&IssueState>) -> &'static str {
    if merged {
        return "merged";
    }
    match state {
        Some(IssueState::Closed) => "closed",
        _ => "open",
    }
}

fn to_ref(pr: PullRequest) -> PullRequestRef {
    let state = state_label(pr.merged_at.is_some(), pr.state.as_ref());
    let url = pr
        .html_url
        .as_ref()
        .map(|u| u.to_string())
        .unwrap_or_else(|| pr.url.clone());
    PullRequestRef {
        number: pr.number,
        url,
        state: state.to_string(),
    }
}
