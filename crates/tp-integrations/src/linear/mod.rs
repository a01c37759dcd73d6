use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tp_core::ports::{self, PortError, WorkTracker};
use tp_core::types::Task;
use tracing::debug;

const LINEAR_ENDPOINT: &str = "https://api.linear.app/graphql";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur when interacting with the Linear GraphQL API.
#[derive(Debug, Error)]
pub enum LinearError {
    /// The Linear API returned GraphQL errors or an unexpected shape.
    #[error("Linear API error: {0}")]
    Api(String),

    #[error("missing Linear API key")]
    MissingApiKey,

    #[error("unknown workflow state `{0}`")]
    UnknownState(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, LinearError>;

impl From<LinearError> for PortError {
    fn from(err: LinearError) -> Self {
        match err {
            LinearError::MissingApiKey => PortError::Auth("missing Linear API key".into()),
            LinearError::Http(e) if e.status().map(|s| s.as_u16()) == Some(429) => {
                PortError::RateLimited
            }
            LinearError::Http(e) if e.status().map(|s| s.as_u16()) == Some(401) => {
                PortError::Auth(e.to_string())
            }
            LinearError::Api(msg) | LinearError::UnknownState(msg) => {
                PortError::InvalidResponse(msg)
            }
            other => PortError::Request(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LinearClient {
    api_key: String,
    team_id: Option<String>,
    endpoint: String,
    http: reqwest::Client,
}

impl LinearClient {
    pub fn new(api_key: &str) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(LinearError::MissingApiKey);
        }
        Ok(Self {
            api_key: api_key.to_string(),
            team_id: None,
            endpoint: LINEAR_ENDPOINT.to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
        })
    }

    /// Restrict `fetch_assigned` to one team.
    pub fn with_team(mut self, team_id: Option<String>) -> Self {
        self.team_id = team_id;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    // -- helpers ------------------------------------------------------------

    /// Execute a GraphQL query and return the `data` object. GraphQL-level
    /// errors are surfaced as [`LinearError::Api`].
    async fn graphql(&self, query: &str, variables: Map<String, Value>) -> Result<Value> {
        let payload = json!({ "query": query, "variables": variables });

        let resp = self
            .http
            .post(&self.endpoint)
            .header("Authorization", self.api_key.as_str())
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        let mut body: Value = resp.json().await?;
        if let Some(errors) = body.get("errors") {
            return Err(LinearError::Api(errors.to_string()));
        }
        Ok(body.get_mut("data").map(Value::take).unwrap_or(Value::Null))
    }

    // -- public API ---------------------------------------------------------

    /// Open issues assigned to the API key's user.
    pub async fn assigned_issues(&self) -> Result<Vec<Task>> {
        let query = assigned_issues_query(self.team_id.is_some());
        let mut variables = Map::new();
        if let Some(team) = &self.team_id {
            variables.insert("teamId".into(), Value::String(team.clone()));
        }

        let data = self.graphql(&query, variables).await?;
        let nodes = data["viewer"]["assignedIssues"]["nodes"]
            .as_array()
            .ok_or_else(|| LinearError::Api("missing assignedIssues.nodes".into()))?;
        Ok(nodes.iter().filter_map(parse_task).collect())
    }

    pub async fn create_comment(&self, issue_id: &str, body: &str) -> Result<()> {
        let query = r#"mutation($issueId: String!, $body: String!) {
            commentCreate(input: { issueId: $issueId, body: $body }) { success }
        }"#;
        let mut variables = Map::new();
        variables.insert("issueId".into(), Value::String(issue_id.to_string()));
        variables.insert("body".into(), Value::String(body.to_string()));

        let data = self.graphql(query, variables).await?;
        if data["commentCreate"]["success"].as_bool() != Some(true) {
            return Err(LinearError::Api(format!("commentCreate failed for {issue_id}")));
        }
        Ok(())
    }

    /// Move an issue to the workflow state named `state_name` (matched
    /// case-insensitively against the issue team's states).
    pub async fn set_state(&self, issue_id: &str, state_name: &str) -> Result<()> {
        let query = r#"query($id: String!) {
            issue(id: $id) { team { states { nodes { id name } } } }
        }"#;
        let mut variables = Map::new();
        variables.insert("id".into(), Value::String(issue_id.to_string()));
        let data = self.graphql(query, variables).await?;

        let state_id = resolve_state_id(&data["issue"]["team"]["states"]["nodes"], state_name)
            .ok_or_else(|| LinearError::UnknownState(state_name.to_string()))?;

        let mutation = r#"mutation($id: String!, $stateId: String!) {
            issueUpdate(id: $id, input: { stateId: $stateId }) { success }
        }"#;
        let mut variables = Map::new();
        variables.insert("id".into(), Value::String(issue_id.to_string()));
        variables.insert("stateId".into(), Value::String(state_id));
        let data = self.graphql(mutation, variables).await?;
        if data["issueUpdate"]["success"].as_bool() != Some(true) {
            return Err(LinearError::Api(format!("issueUpdate failed for {issue_id}")));
        }
        debug!(issue_id, state = state_name, "issue state updated");
        Ok(())
    }
}

fn assigned_issues_query(with_team: bool) -> String {
    let (decl, team_filter) = if with_team {
        ("($teamId: ID)", ", team: { id: { eq: $teamId } }")
    } else {
        ("", "")
    };
    format!(
        r#"query{decl} {{
            viewer {{
                assignedIssues(
                    filter: {{ state: {{ type: {{ in: ["backlog", "unstarted"] }} }}{team_filter} }},
                    first: 50
                ) {{
                    nodes {{ id identifier title description url }}
                }}
            }}
        }}"#
    )
}

/// Parse an issue node into a [`Task`]. Nodes without an id or title are skipped.
fn parse_task(n: &Value) -> Option<Task> {
    let id = n["id"].as_str().filter(|s| !s.is_empty())?;
    let title = n["title"].as_str()?;
    let title = match n["identifier"].as_str() {
        Some(ident) => format!("[{ident}] {title}"),
        None => title.to_string(),
    };
    let mut task = Task::new(id, title);
    if let Some(description) = n["description"].as_str() {
        task = task.with_description(description);
    }
    if let Some(url) = n["url"].as_str() {
        task = task.with_url(url);
    }
    Some(task)
}

fn resolve_state_id(nodes: &Value, state_name: &str) -> Option<String> {
    nodes.as_array()?.iter().find_map(|s| {
        let name = s["name"].as_str()?;
        if name.eq_ignore_ascii_case(state_name) {
            s["id"].as_str().map(str::to_string)
        } else {
            None
        }
    })
}

#[async_trait]
impl WorkTracker for LinearClient {
    async fn fetch_assigned(&self) -> ports::Result<Vec<Task>> {
        self.assigned_issues().await.map_err(PortError::from)
    }

    async fn add_comment(&self, task_id: &str, text: &str) -> ports::Result<()> {
        self.create_comment(task_id, text)
            .await
            .map_err(PortError::from)
    }

    async fn update_status(&self, task_id: &str, status: &str) -> ports::Result<()> {
        self.set_state(task_id, status)
            .await
            .map_err(PortError::from)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
