use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `~/.taskpilot/config.toml`.
///
/// Credentials are never stored here. Sections only name the environment
/// variables that hold them (`GITHUB_TOKEN`, `LINEAR_API_KEY` by default).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub pr_discovery: PrDiscoveryConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub linear: LinearConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
}

impl Config {
    /// Load config from `~/.taskpilot/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not expressible via types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("intake.poll_interval_secs", self.intake.poll_interval_secs)?;
        non_zero(
            "pr_discovery.poll_interval_secs",
            self.pr_discovery.poll_interval_secs,
        )?;
        non_zero("pr_discovery.timeout_mins", self.pr_discovery.timeout_mins)?;
        non_zero("review.poll_interval_secs", self.review.poll_interval_secs)?;
        non_zero("review.max_iterations", u64::from(self.review.max_iterations))?;
        non_zero("cache.ttl_days", self.cache.ttl_days)?;
        non_zero(
            "retention.patrol_interval_secs",
            self.retention.patrol_interval_secs,
        )?;
        non_zero("registry.wait_poll_secs", self.registry.wait_poll_secs)?;
        non_zero("timeouts.request_secs", self.timeouts.request_secs)?;
        non_zero("timeouts.agent_mins", self.timeouts.agent_mins)?;

        if self.github.owner.trim().is_empty() || self.github.repo.trim().is_empty() {
            return Err(ConfigError::Validation(
                "github.owner and github.repo must be set".into(),
            ));
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        home_dir().join(".taskpilot").join("config.toml")
    }
}

fn non_zero(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Validation(format!("{field} must be greater than 0")));
    }
    Ok(())
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None if path == "~" => home_dir(),
        None => Path::new(path).to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `"text"` or `"json"`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_project_name() -> String {
    "taskpilot".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Json,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Directory for the JSON backend.
    #[serde(default = "default_state_dir")]
    pub dir: String,
    /// Database file for the SQLite backend.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            dir: default_state_dir(),
            db_path: default_db_path(),
        }
    }
}

impl StoreConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        expand_home(&self.dir)
    }

    pub fn resolved_db_path(&self) -> PathBuf {
        expand_home(&self.db_path)
    }
}

fn default_state_dir() -> String {
    "~/.taskpilot/state".into()
}
fn default_db_path() -> String {
    "~/.taskpilot/state.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    #[serde(default = "default_intake_poll")]
    pub poll_interval_secs: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_intake_poll(),
        }
    }
}

impl IntakeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_intake_poll() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrDiscoveryConfig {
    #[serde(default = "default_pr_poll")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_pr_timeout")]
    pub timeout_mins: u64,
}

impl Default for PrDiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_pr_poll(),
            timeout_mins: default_pr_timeout(),
        }
    }
}

impl PrDiscoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_mins * 60)
    }
}

fn default_pr_poll() -> u64 {
    30
}
fn default_pr_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default = "default_review_poll")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_review_poll(),
            max_iterations: default_max_iterations(),
        }
    }
}

impl ReviewConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_review_poll() -> u64 {
    30
}
fn default_max_iterations() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_days: default_ttl_days(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.ttl_days as i64)
    }
}

fn default_ttl_days() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_patrol_interval")]
    pub patrol_interval_secs: u64,
    #[serde(default = "default_pipeline_max_age")]
    pub pipeline_max_age_days: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            patrol_interval_secs: default_patrol_interval(),
            pipeline_max_age_days: default_pipeline_max_age(),
        }
    }
}

impl RetentionConfig {
    pub fn patrol_interval(&self) -> Duration {
        Duration::from_secs(self.patrol_interval_secs)
    }

    pub fn pipeline_max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.pipeline_max_age_days as i64)
    }
}

fn default_patrol_interval() -> u64 {
    300
}
fn default_pipeline_max_age() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_wait_poll")]
    pub wait_poll_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            wait_poll_secs: default_wait_poll(),
        }
    }
}

impl RegistryConfig {
    pub fn wait_poll(&self) -> Duration {
        Duration::from_secs(self.wait_poll_secs)
    }
}

fn default_wait_poll() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Bound on every tracker / host call.
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,
    /// Bound on a single agent invocation.
    #[serde(default = "default_agent_mins")]
    pub agent_mins: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: default_request_secs(),
            agent_mins: default_agent_mins(),
        }
    }
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn agent(&self) -> Duration {
        Duration::from_secs(self.agent_mins * 60)
    }
}

fn default_request_secs() -> u64 {
    30
}
fn default_agent_mins() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default = "default_github_token_env")]
    pub token_env: String,
    /// Override for GitHub Enterprise.
    #[serde(default)]
    pub api_url: Option<String>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: String::new(),
            token_env: default_github_token_env(),
            api_url: None,
        }
    }
}

impl GitHubConfig {
    /// Read the token from the configured environment variable.
    pub fn resolve_token(&self) -> Option<String> {
        read_env(&self.token_env)
    }
}

fn default_github_token_env() -> String {
    "GITHUB_TOKEN".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearConfig {
    #[serde(default = "default_linear_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub team_id: Option<String>,
    /// Workflow state applied when a pipeline starts.
    #[serde(default = "default_started_status")]
    pub started_status: String,
    /// Workflow state applied once a pull request is found.
    #[serde(default = "default_review_status")]
    pub review_status: String,
}

impl Default for LinearConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_linear_key_env(),
            team_id: None,
            started_status: default_started_status(),
            review_status: default_review_status(),
        }
    }
}

impl LinearConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        read_env(&self.api_key_env)
    }
}

fn default_linear_key_env() -> String {
    "LINEAR_API_KEY".into()
}
fn default_started_status() -> String {
    "in progress".into()
}
fn default_review_status() -> String {
    "in review".into()
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Command line used to launch an agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One optional command per agent-driven stage. A missing command makes the
/// stage fail with "agent not found".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentsConfig {
    /// Working copy the agents operate on.
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub analysis: Option<AgentCommand>,
    #[serde(default)]
    pub implementation: Option<AgentCommand>,
    #[serde(default)]
    pub review: Option<AgentCommand>,
    #[serde(default)]
    pub fix: Option<AgentCommand>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [github]
        owner = "acme"
        repo = "widgets"
    "#;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(cfg.intake.poll_interval(), Duration::from_secs(15));
        assert_eq!(cfg.pr_discovery.poll_interval(), Duration::from_secs(30));
        assert_eq!(cfg.pr_discovery.timeout(), Duration::from_secs(30 * 60));
        assert_eq!(cfg.review.poll_interval(), Duration::from_secs(30));
        assert_eq!(cfg.review.max_iterations, 3);
        assert_eq!(cfg.cache.ttl(), chrono::Duration::days(30));
        assert_eq!(cfg.retention.patrol_interval(), Duration::from_secs(300));
        assert_eq!(cfg.retention.pipeline_max_age(), chrono::Duration::days(30));
        assert_eq!(cfg.registry.wait_poll(), Duration::from_secs(5));
        assert_eq!(cfg.timeouts.request(), Duration::from_secs(30));
        assert_eq!(cfg.timeouts.agent(), Duration::from_secs(3600));
        assert_eq!(cfg.store.backend, StoreBackend::Json);
        assert_eq!(cfg.github.token_env, "GITHUB_TOKEN");
        assert_eq!(cfg.linear.api_key_env, "LINEAR_API_KEY");
        assert!(cfg.agents.implementation.is_none());
    }

    #[test]
    fn missing_repo_is_rejected() {
        let err = Config::from_toml("[github]\nowner = \"acme\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let text = format!("{MINIMAL}\n[intake]\npoll_interval_secs = 0\n");
        let err = Config::from_toml(&text).unwrap_err();
        assert!(err.to_string().contains("intake.poll_interval_secs"));
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let text = format!("{MINIMAL}\n[review]\nmax_iterations = 0\n");
        assert!(Config::from_toml(&text).is_err());
    }

    #[test]
    fn parses_agents_and_backend() {
        let text = format!(
            "{MINIMAL}
            [store]
            backend = \"sqlite\"
            db_path = \"/tmp/tp.db\"

            [agents.implementation]
            program = \"claude\"
            args = [\"--print\"]
            "
        );
        let cfg = Config::from_toml(&text).unwrap();
        assert_eq!(cfg.store.backend, StoreBackend::Sqlite);
        assert_eq!(cfg.store.resolved_db_path(), PathBuf::from("/tmp/tp.db"));
        let implementation = cfg.agents.implementation.unwrap();
        assert_eq!(implementation.program, "claude");
        assert_eq!(implementation.args, vec!["--print".to_string()]);
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = Config::from_toml(MINIMAL).unwrap();
        let text = cfg.to_toml().unwrap();
        let again = Config::from_toml(&text).unwrap();
        assert_eq!(again.github.owner, "acme");
        assert_eq!(again.review.max_iterations, 3);
    }

    #[test]
    fn load_from_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.github.repo, "widgets");

        let missing = Config::load_from(tmp.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io(_)));
    }

    #[test]
    fn expand_home_handles_tilde() {
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
        assert!(expand_home("~/x").ends_with("x"));
    }
}
