use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use tp_core::dedup::DedupCache;
use tp_core::ports::WorkTracker;
use tp_core::types::Task;

use crate::notify::Notifier;
use crate::pr_discovery::PrDiscovery;
use crate::runner::{RunnerError, StageRunner};

/// What happened to one task during an intake poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Implementation succeeded; the branch is now tracked for a pull request.
    Started { branch: String },
    /// Already picked up within the cache TTL.
    Duplicate,
    Failed(String),
}

/// Summary of one intake poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntakeReport {
    pub fetched: usize,
    pub started: usize,
    pub duplicates: usize,
    pub failed: usize,
    /// `true` when the poll was skipped because the previous one still runs.
    pub skipped: bool,
}

/// Pulls assigned tasks and runs each new one through the stage runner.
pub struct IntakeLoop {
    tracker: Arc<dyn WorkTracker>,
    cache: Arc<DedupCache>,
    runner: Arc<StageRunner>,
    discovery: Arc<PrDiscovery>,
    notifier: Notifier,
    started_status: String,
    request_timeout: Duration,
    running: AtomicBool,
}

impl IntakeLoop {
    pub fn new(
        tracker: Arc<dyn WorkTracker>,
        cache: Arc<DedupCache>,
        runner: Arc<StageRunner>,
        discovery: Arc<PrDiscovery>,
        notifier: Notifier,
    ) -> Self {
        Self {
            tracker,
            cache,
            runner,
            discovery,
            notifier,
            started_status: "in progress".to_string(),
            request_timeout: Duration::from_secs(30),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_started_status(mut self, status: impl Into<String>) -> Self {
        self.started_status = status.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Fetch assigned tasks and process them one at a time.
    pub async fn poll(&self) -> IntakeReport {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("intake poll already running, skipping");
            return IntakeReport {
                skipped: true,
                ..IntakeReport::default()
            };
        }
        let report = self.poll_inner().await;
        self.running.store(false, Ordering::Release);
        report
    }

    async fn poll_inner(&self) -> IntakeReport {
        let mut report = IntakeReport::default();
        let tasks = match tokio::time::timeout(self.request_timeout, self.tracker.fetch_assigned())
            .await
        {
            Ok(Ok(tasks)) => tasks,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to fetch assigned tasks");
                return report;
            }
            Err(_) => {
                warn!("fetching assigned tasks timed out");
                return report;
            }
        };
        report.fetched = tasks.len();

        for task in &tasks {
            match self.process(task).await {
                IntakeOutcome::Started { .. } => report.started += 1,
                IntakeOutcome::Duplicate => report.duplicates += 1,
                IntakeOutcome::Failed(_) => report.failed += 1,
            }
        }
        if report.started + report.failed > 0 {
            info!(
                fetched = report.fetched,
                started = report.started,
                duplicates = report.duplicates,
                failed = report.failed,
                "intake poll finished"
            );
        }
        report
    }

    /// Take one task from detection to a tracked branch.
    ///
    /// The task is cached before any work starts so an overlapping poll
    /// sees it as a duplicate.
    pub async fn process(&self, task: &Task) -> IntakeOutcome {
        match self.claim(task).await {
            Ok(true) => {}
            Ok(false) => return IntakeOutcome::Duplicate,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "dedup cache unavailable");
                return IntakeOutcome::Failed(e.to_string());
            }
        }

        info!(task_id = %task.id, title = %task.title, "new task detected");
        if let Err(e) = self.runner.pipelines().create(task).await {
            error!(task_id = %task.id, error = %e, "failed to create pipeline");
            return IntakeOutcome::Failed(e.to_string());
        }
        self.notifier
            .comment(&task.id, "Task picked up. Starting requirements analysis.")
            .await;
        self.notifier
            .set_status(&task.id, &self.started_status)
            .await;

        let report = match self.runner.run(task).await {
            Ok(report) => report,
            Err(RunnerError::Critical { error, .. }) => return IntakeOutcome::Failed(error),
            Err(e) => {
                error!(task_id = %task.id, error = %e, "pipeline run failed");
                return IntakeOutcome::Failed(e.to_string());
            }
        };

        if let Err(e) = self.discovery.track(&task.id, &report.branch).await {
            error!(task_id = %task.id, error = %e, "failed to track branch for pull request");
            return IntakeOutcome::Failed(e.to_string());
        }
        IntakeOutcome::Started {
            branch: report.branch,
        }
    }

    async fn claim(&self, task: &Task) -> tp_core::store::Result<bool> {
        if self.cache.has(&task.id).await? {
            return Ok(false);
        }
        self.cache.add(task).await
    }
}
