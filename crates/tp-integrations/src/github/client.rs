use octocrab::Octocrab;
use thiserror::Error;
use tp_core::ports::PortError;

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("GitHub API error: {0}")]
    Api(#[from] octocrab::Error),

    #[error("missing GitHub token, set GITHUB_TOKEN or the configured token_env")]
    MissingToken,
}

pub type Result<T> = std::result::Result<T, GitHubError>;

impl From<GitHubError> for PortError {
    fn from(err: GitHubError) -> Self {
        match err {
            GitHubError::MissingToken => PortError::Auth("missing GitHub token".into()),
            GitHubError::Api(octocrab::Error::GitHub { source, .. })
                if source.status_code.as_u16() == 401 =>
            {
                PortError::Auth(source.message)
            }
            GitHubError::Api(octocrab::Error::GitHub { source, .. })
                if source.status_code.as_u16() == 429 =>
            {
                PortError::RateLimited
            }
            GitHubError::Api(e) => PortError::Request(e.to_string()),
        }
    }
}

/// Connection settings; owner and repo are supplied per call.
#[derive(Debug, Clone, Default)]
pub struct GitHubClientConfig {
    pub token: Option<String>,
    /// Base URI override, e.g. for GitHub Enterprise.
    pub api_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GitHubClient {
    pub(crate) octocrab: Octocrab,
}

impl GitHubClient {
    /// Create a new `GitHubClient` from an explicit [`GitHubClientConfig`].
    pub fn new(config: GitHubClientConfig) -> Result<Self> {
        let token = config
            .token
            .filter(|t| !t.trim().is_empty())
            .ok_or(GitHubError::MissingToken)?;

        let mut builder = Octocrab::builder().personal_token(token);
        if let Some(url) = config.api_url {
            builder = builder.base_uri(url)?;
        }

        Ok(Self {
            octocrab: builder.build()?,
        })
    }

    /// Returns a reference to the inner `Octocrab` instance.
    pub fn inner(&self) -> &Octocrab {
        &self.octocrab
    }
}
