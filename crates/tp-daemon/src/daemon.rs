use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use tp_agents::agent::{AgentSet, RepoConfig};
use tp_agents::registry::ProcessRegistry;
use tp_core::config::{expand_home, Config};
use tp_core::dedup::DedupCache;
use tp_core::pipeline_store::PipelineStore;
use tp_core::ports::{VcsHost, WorkTracker};
use tp_core::store::StateStore;

use crate::intake::IntakeLoop;
use crate::notify::Notifier;
use crate::patrol::PatrolRunner;
use crate::pr_discovery::PrDiscovery;
use crate::review_cycle::ReviewCycle;
use crate::runner::StageRunner;
use crate::shutdown::ShutdownSignal;

/// How long `run` waits for the loops to finish their current tick.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Tick periods of the background loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonIntervals {
    pub intake: Duration,
    pub pr_discovery: Duration,
    pub review: Duration,
    pub patrol: Duration,
}

impl DaemonIntervals {
    pub fn from_config(config: &Config) -> Self {
        Self {
            intake: config.intake.poll_interval(),
            pr_discovery: config.pr_discovery.poll_interval(),
            review: config.review.poll_interval(),
            patrol: config.retention.patrol_interval(),
        }
    }
}

/// Owns the four polling loops and the state they share.
pub struct Daemon {
    intake: Arc<IntakeLoop>,
    discovery: Arc<PrDiscovery>,
    review: Arc<ReviewCycle>,
    patrol: Arc<PatrolRunner>,
    intervals: DaemonIntervals,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Wire every component from `config` over the given ports.
    pub fn new(
        config: &Config,
        store: Arc<dyn StateStore>,
        tracker: Arc<dyn WorkTracker>,
        host: Arc<dyn VcsHost>,
        agents: AgentSet,
    ) -> Self {
        let request_timeout = config.timeouts.request();
        let notifier = Notifier::new(tracker.clone(), request_timeout);
        let processes = Arc::new(ProcessRegistry::new().with_wait_poll(config.registry.wait_poll()));
        let pipelines = Arc::new(PipelineStore::new(store.clone()));
        let cache = Arc::new(DedupCache::new(store.clone()).with_ttl(config.cache.ttl()));

        let repo = RepoConfig {
            owner: config.github.owner.clone(),
            repo: config.github.repo.clone(),
            workdir: config.agents.workdir.as_deref().map(expand_home),
        };
        let runner = Arc::new(
            StageRunner::new(
                pipelines.clone(),
                agents,
                notifier.clone(),
                processes.clone(),
                repo,
            )
            .with_agent_timeout(config.timeouts.agent()),
        );

        let (events_tx, events_rx) = flume::unbounded();
        let discovery = Arc::new(
            PrDiscovery::new(
                store.clone(),
                host.clone(),
                notifier.clone(),
                events_tx,
                config.github.owner.as_str(),
                config.github.repo.as_str(),
            )
            .with_timeout(config.pr_discovery.timeout())
            .with_request_timeout(request_timeout)
            .with_review_status(config.linear.review_status.as_str())
            .with_max_iterations(config.review.max_iterations),
        );
        let review = Arc::new(
            ReviewCycle::new(
                store,
                host,
                runner.clone(),
                notifier.clone(),
                events_rx,
                config.github.owner.as_str(),
                config.github.repo.as_str(),
            )
            .with_max_iterations(config.review.max_iterations)
            .with_request_timeout(request_timeout),
        );
        let intake = Arc::new(
            IntakeLoop::new(tracker, cache.clone(), runner, discovery.clone(), notifier)
                .with_started_status(config.linear.started_status.as_str())
                .with_request_timeout(request_timeout),
        );
        let patrol = Arc::new(
            PatrolRunner::new(cache, pipelines, processes)
                .with_pipeline_max_age(config.retention.pipeline_max_age()),
        );

        Self {
            intake,
            discovery,
            review,
            patrol,
            intervals: DaemonIntervals::from_config(config),
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn with_intervals(mut self, intervals: DaemonIntervals) -> Self {
        self.intervals = intervals;
        self
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn intake(&self) -> &Arc<IntakeLoop> {
        &self.intake
    }

    pub fn discovery(&self) -> &Arc<PrDiscovery> {
        &self.discovery
    }

    pub fn review(&self) -> &Arc<ReviewCycle> {
        &self.review
    }

    // ------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------

    /// Spawn intake, PR discovery, review and patrol loops.
    pub fn spawn_loops(&self) -> Vec<JoinHandle<()>> {
        let intake = self.intake.clone();
        let discovery = self.discovery.clone();
        let review = self.review.clone();
        let patrol = self.patrol.clone();

        vec![
            spawn_loop("intake", self.intervals.intake, self.shutdown.clone(), move || {
                let intake = intake.clone();
                async move {
                    intake.poll().await;
                }
            }),
            spawn_loop(
                "pr_discovery",
                self.intervals.pr_discovery,
                self.shutdown.clone(),
                move || {
                    let discovery = discovery.clone();
                    async move {
                        discovery.tick().await;
                    }
                },
            ),
            spawn_loop("review", self.intervals.review, self.shutdown.clone(), move || {
                let review = review.clone();
                async move {
                    let report = review.tick().await;
                    if report.completed > 0 {
                        info!(completed = report.completed, "review cycles finished");
                    }
                }
            }),
            spawn_loop("patrol", self.intervals.patrol, self.shutdown.clone(), move || {
                let patrol = patrol.clone();
                async move {
                    let report = patrol.run_patrol().await;
                    if report.errors > 0 {
                        error!(errors = report.errors, "patrol finished with failed sweeps");
                    }
                }
            }),
        ]
    }

    /// Run the loops until shutdown is triggered, then give them
    /// [`STOP_TIMEOUT`] to finish their current tick before aborting.
    pub async fn run(&self) {
        info!(
            intake_secs = self.intervals.intake.as_secs(),
            pr_discovery_secs = self.intervals.pr_discovery.as_secs(),
            review_secs = self.intervals.review.as_secs(),
            patrol_secs = self.intervals.patrol.as_secs(),
            "daemon started"
        );
        let handles = self.spawn_loops();
        self.shutdown.cancelled().await;

        let deadline = tokio::time::Instant::now() + STOP_TIMEOUT;
        let total = handles.len();
        let mut stopped = 0;
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => stopped += 1,
                Ok(Err(e)) => {
                    error!(error = %e, "loop task ended abnormally");
                    stopped += 1;
                }
                Err(_) => handle.abort(),
            }
        }
        if stopped == total {
            info!(loops = stopped, "daemon stopped");
        } else {
            warn!(stopped, total, "aborted loops that did not stop in time");
        }
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: ShutdownSignal,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
        info!(loop_name = name, "loop stopped");
    })
}
