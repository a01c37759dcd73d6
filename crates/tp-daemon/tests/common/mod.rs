//! Hand-written port mocks and a fully wired set of daemon components.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tp_agents::agent::{self, AgentContext, AgentError, AgentOutcome, AgentSet, RepoConfig, StageAgent};
use tp_agents::registry::ProcessRegistry;
use tp_core::dedup::DedupCache;
use tp_core::pipeline_store::PipelineStore;
use tp_core::ports::{self, CommitRef, PortError, PullRequestRef, VcsHost, WorkTracker};
use tp_core::store::{SqliteStore, StateStore};
use tp_core::types::Task;
use tp_daemon::intake::IntakeLoop;
use tp_daemon::notify::Notifier;
use tp_daemon::pr_discovery::PrDiscovery;
use tp_daemon::review_cycle::ReviewCycle;
use tp_daemon::runner::StageRunner;

pub const OWNER: &str = "acme";
pub const REPO: &str = "webapp";

// ===========================================================================
// Work tracker
// ===========================================================================

#[derive(Default)]
pub struct MockTracker {
    pub tasks: Mutex<Vec<Task>>,
    pub comments: Mutex<Vec<(String, String)>>,
    pub statuses: Mutex<Vec<(String, String)>>,
    pub fetches: AtomicUsize,
    pub fail_fetch: AtomicBool,
}

impl MockTracker {
    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
            ..Self::default()
        }
    }

    pub fn comments_for(&self, task_id: &str) -> Vec<String> {
        self.comments
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn statuses_for(&self, task_id: &str) -> Vec<String> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, status)| status.clone())
            .collect()
    }
}

#[async_trait]
impl WorkTracker for MockTracker {
    async fn fetch_assigned(&self) -> ports::Result<Vec<Task>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(PortError::RateLimited);
        }
        Ok(self.tasks.lock().unwrap().clone())
    }

    async fn add_comment(&self, task_id: &str, text: &str) -> ports::Result<()> {
        self.comments
            .lock()
            .unwrap()
            .push((task_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn update_status(&self, task_id: &str, status: &str) -> ports::Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .push((task_id.to_string(), status.to_string()));
        Ok(())
    }
}

// ===========================================================================
// VCS host
// ===========================================================================

#[derive(Default)]
pub struct MockHost {
    pub prs: Mutex<HashMap<String, PullRequestRef>>,
    pub commits: Mutex<HashMap<String, CommitRef>>,
    pub fail_lookups: AtomicBool,
    pub pr_lookups: AtomicUsize,
}

impl MockHost {
    pub fn open_pr(&self, branch: &str, number: u64) {
        self.prs.lock().unwrap().insert(
            branch.to_string(),
            PullRequestRef {
                number,
                url: format!("https://github.com/{OWNER}/{REPO}/pull/{number}"),
                state: "open".into(),
            },
        );
    }

    /// Move the tip of `branch` to a new commit.
    pub fn push(&self, branch: &str, sha: &str, message: &str) {
        self.commits.lock().unwrap().insert(
            branch.to_string(),
            CommitRef {
                sha: sha.to_string(),
                message: message.to_string(),
            },
        );
    }
}

#[async_trait]
impl VcsHost for MockHost {
    async fn find_pull_request(
        &self,
        _owner: &str,
        _repo: &str,
        branch: &str,
    ) -> ports::Result<Option<PullRequestRef>> {
        self.pr_lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(PortError::Request("502 bad gateway".into()));
        }
        Ok(self.prs.lock().unwrap().get(branch).cloned())
    }

    async fn latest_commit(
        &self,
        _owner: &str,
        _repo: &str,
        branch: &str,
    ) -> ports::Result<Option<CommitRef>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(PortError::Request("502 bad gateway".into()));
        }
        Ok(self.commits.lock().unwrap().get(branch).cloned())
    }
}

// ===========================================================================
// Agents
// ===========================================================================

#[derive(Debug, Clone)]
pub enum Script {
    Succeed {
        branch: Option<String>,
        artifact: Option<String>,
    },
    Fail(String),
    NotFound,
    Hang,
}

impl Script {
    pub fn ok() -> Self {
        Script::Succeed {
            branch: None,
            artifact: None,
        }
    }

    pub fn branch(branch: &str) -> Self {
        Script::Succeed {
            branch: Some(branch.to_string()),
            artifact: None,
        }
    }

    pub fn artifact(path: &str) -> Self {
        Script::Succeed {
            branch: None,
            artifact: Some(path.to_string()),
        }
    }
}

/// What an agent saw in its context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub task_id: String,
    pub prior_artifact: Option<String>,
    pub branch: Option<String>,
}

pub struct ScriptedAgent {
    name: String,
    script: Mutex<Script>,
    register_pid: Mutex<Option<u32>>,
    pub calls: AtomicUsize,
    pub seen: Mutex<Vec<Seen>>,
}

impl ScriptedAgent {
    pub fn new(name: &str, script: Script) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script),
            register_pid: Mutex::new(None),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn set(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    /// Register `pid` with the process registry on every invocation.
    pub fn registers(&self, pid: u32) {
        *self.register_pid.lock().unwrap() = Some(pid);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_seen(&self) -> Option<Seen> {
        self.seen.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl StageAgent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, task: &Task, ctx: &AgentContext) -> agent::Result<AgentOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(Seen {
            task_id: task.id.clone(),
            prior_artifact: ctx.prior_artifact.clone(),
            branch: ctx.branch.clone(),
        });
        let pid = *self.register_pid.lock().unwrap();
        if let Some(pid) = pid {
            ctx.processes.register(&task.id, Some(pid));
        }

        let script = self.script.lock().unwrap().clone();
        match script {
            Script::Succeed { branch, artifact } => {
                let mut outcome = AgentOutcome::succeeded();
                outcome.branch = branch;
                outcome.artifact_path = artifact;
                Ok(outcome)
            }
            Script::Fail(msg) => Ok(AgentOutcome::failed(msg)),
            Script::NotFound => Err(AgentError::NotFound),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(AgentOutcome::succeeded())
            }
        }
    }
}

pub struct Agents {
    pub analysis: Arc<ScriptedAgent>,
    pub implementation: Arc<ScriptedAgent>,
    pub review: Arc<ScriptedAgent>,
    pub fix: Arc<ScriptedAgent>,
}

impl Agents {
    /// Every agent succeeds; implementation reports `branch`.
    pub fn happy(branch: &str) -> Self {
        Self {
            analysis: ScriptedAgent::new("analysis", Script::artifact("docs/analysis.md")),
            implementation: ScriptedAgent::new("implementation", Script::branch(branch)),
            review: ScriptedAgent::new("review", Script::ok()),
            fix: ScriptedAgent::new("fix", Script::ok()),
        }
    }

    pub fn agent_set(&self) -> AgentSet {
        AgentSet {
            analysis: self.analysis.clone(),
            implementation: self.implementation.clone(),
            review: self.review.clone(),
            fix: self.fix.clone(),
        }
    }
}

// ===========================================================================
// Harness
// ===========================================================================

pub struct Harness {
    pub store: Arc<dyn StateStore>,
    pub tracker: Arc<MockTracker>,
    pub host: Arc<MockHost>,
    pub agents: Agents,
    pub pipelines: Arc<PipelineStore>,
    pub cache: Arc<DedupCache>,
    pub processes: Arc<ProcessRegistry>,
    pub runner: Arc<StageRunner>,
    pub discovery: Arc<PrDiscovery>,
    pub review: Arc<ReviewCycle>,
    pub intake: IntakeLoop,
}

impl Harness {
    pub async fn new(tasks: Vec<Task>) -> Self {
        let store = SqliteStore::open_in_memory().await.expect("in-memory store");
        Self::with_store(Arc::new(store), tasks, Duration::from_secs(5))
    }

    pub fn with_store(
        store: Arc<dyn StateStore>,
        tasks: Vec<Task>,
        agent_timeout: Duration,
    ) -> Self {
        let tracker = Arc::new(MockTracker::with_tasks(tasks));
        let host = Arc::new(MockHost::default());
        let agents = Agents::happy("feat/t1");

        let notifier = Notifier::new(tracker.clone(), Duration::from_secs(1));
        let processes = Arc::new(ProcessRegistry::new().with_wait_poll(Duration::from_millis(10)));
        let pipelines = Arc::new(PipelineStore::new(store.clone()));
        let cache = Arc::new(DedupCache::new(store.clone()));
        let runner = Arc::new(
            StageRunner::new(
                pipelines.clone(),
                agents.agent_set(),
                notifier.clone(),
                processes.clone(),
                RepoConfig {
                    owner: OWNER.into(),
                    repo: REPO.into(),
                    workdir: None,
                },
            )
            .with_agent_timeout(agent_timeout),
        );

        let (tx, rx) = flume::unbounded();
        let discovery = Arc::new(PrDiscovery::new(
            store.clone(),
            host.clone(),
            notifier.clone(),
            tx,
            OWNER,
            REPO,
        ));
        let review = Arc::new(ReviewCycle::new(
            store.clone(),
            host.clone(),
            runner.clone(),
            notifier.clone(),
            rx,
            OWNER,
            REPO,
        ));
        let intake = IntakeLoop::new(
            tracker.clone(),
            cache.clone(),
            runner.clone(),
            discovery.clone(),
            notifier,
        );

        Self {
            store,
            tracker,
            host,
            agents,
            pipelines,
            cache,
            processes,
            runner,
            discovery,
            review,
            intake,
        }
    }
}

pub fn task(id: &str, title: &str) -> Task {
    Task::new(id, title).with_url(format!("https://linear.app/acme/issue/{id}"))
}
