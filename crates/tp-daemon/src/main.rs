//! taskpilot daemon: polls the work tracker and drives each assigned task
//! through analysis, implementation and the pull request review loop.
//!
//! Usage: `taskpilot [CONFIG_PATH]` (defaults to `~/.taskpilot/config.toml`).

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use tp_agents::agent::{AgentSet, MissingAgent, StageAgent};
use tp_agents::command::CommandAgent;
use tp_core::config::{AgentCommand, Config, StoreBackend};
use tp_core::store::{JsonFileStore, SqliteStore, StateStore};
use tp_daemon::daemon::Daemon;
use tp_integrations::github::{GitHubClient, GitHubClientConfig};
use tp_integrations::LinearClient;
use tp_telemetry::LogFormat;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from(&path)
            .with_context(|| format!("failed to load config from {path}"))?,
        None => Config::load().context("failed to load config")?,
    };

    let format = config
        .general
        .log_format
        .parse::<LogFormat>()
        .unwrap_or_default();
    tp_telemetry::init(format, "taskpilot", &config.general.log_level);
    info!(project = %config.general.project_name, "taskpilot starting");

    let store = open_store(&config).await?;

    let github = GitHubClient::new(GitHubClientConfig {
        token: config.github.resolve_token(),
        api_url: config.github.api_url.clone(),
    })
    .with_context(|| format!("GitHub token not found in ${}", config.github.token_env))?;

    let api_key = config
        .linear
        .resolve_api_key()
        .with_context(|| format!("Linear API key not found in ${}", config.linear.api_key_env))?;
    let linear = LinearClient::new(&api_key)
        .context("failed to create Linear client")?
        .with_team(config.linear.team_id.clone())
        .with_timeout(config.timeouts.request())
        .context("failed to create Linear HTTP client")?;

    let agents = build_agents(&config);
    let daemon = Daemon::new(&config, store, Arc::new(linear), Arc::new(github), agents);

    let shutdown = daemon.shutdown_signal();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received, shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c, shutting down"),
        }
        shutdown.trigger();
    });

    daemon.run().await;
    Ok(())
}

async fn open_store(config: &Config) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.store.backend {
        StoreBackend::Json => {
            let dir = config.store.resolved_dir();
            info!(dir = %dir.display(), "using JSON state store");
            Arc::new(
                JsonFileStore::open(dir.clone())
                    .await
                    .with_context(|| format!("failed to open state dir {}", dir.display()))?,
            )
        }
        StoreBackend::Sqlite => {
            let path = config.store.resolved_db_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            info!(path = %path.display(), "using SQLite state store");
            Arc::new(
                SqliteStore::open(&path)
                    .await
                    .with_context(|| format!("failed to open database {}", path.display()))?,
            )
        }
    };
    Ok(store)
}

fn build_agents(config: &Config) -> AgentSet {
    let timeout = config.timeouts.agent();
    let workdir = config
        .agents
        .workdir
        .as_deref()
        .map(tp_core::config::expand_home);
    let make = |name: &str, command: &Option<AgentCommand>| -> Arc<dyn StageAgent> {
        match command {
            Some(cmd) => Arc::new(
                CommandAgent::new(name, cmd.program.as_str())
                    .with_args(cmd.args.clone())
                    .with_workdir(workdir.clone())
                    .with_timeout(timeout),
            ),
            None => {
                warn!(agent = name, "no command configured, stage will fail");
                Arc::new(MissingAgent::new(name))
            }
        }
    };
    AgentSet {
        analysis: make("analysis", &config.agents.analysis),
        implementation: make("implementation", &config.agents.implementation),
        review: make("review", &config.agents.review),
        fix: make("fix", &config.agents.fix),
    }
}
