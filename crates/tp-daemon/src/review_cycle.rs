use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use tp_core::ports::{CommitRef, PortError, VcsHost};
use tp_core::store::{StateStore, StoreError};
use tp_core::types::{PipelineStatus, PrDiscovered, ReviewCycleEntry, ReviewStage, Stage};

use crate::notify::Notifier;
use crate::runner::{RunnerError, StageOutcome, StageRunner};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("commit lookup failed: {0}")]
    Host(#[from] PortError),
    #[error("commit lookup timed out")]
    Timeout,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

pub type Result<T> = std::result::Result<T, ReviewError>;

// ---------------------------------------------------------------------------
// Commit classification
// ---------------------------------------------------------------------------

/// Signals read from a commit message. The two flags are independent: a
/// message can satisfy both, and the cycle's current stage decides which
/// one is consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Classification {
    /// Contains `review:` or `TODO`.
    pub is_review: bool,
    /// Contains both `fix:` and `TODO`.
    pub is_fix: bool,
}

pub fn classify(message: &str) -> Classification {
    let todo = message.contains("TODO");
    Classification {
        is_review: message.contains("review:") || todo,
        is_fix: message.contains("fix:") && todo,
    }
}

/// What one tick did to one review cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// First commit seen on the branch; recorded as the baseline.
    Baseline,
    /// Tip unchanged, or no commits yet.
    Unchanged,
    /// New commit that matches nothing the current stage waits for.
    Ignored,
    FixRequested { iteration: u32 },
    ReviewRequested { iteration: u32 },
    Completed { iterations: u32 },
}

/// Summary of one review tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewReport {
    pub started: usize,
    pub checked: usize,
    pub transitions: usize,
    pub completed: usize,
    pub errors: usize,
    pub skipped: bool,
}

// ---------------------------------------------------------------------------
// ReviewCycle
// ---------------------------------------------------------------------------

/// Drives the review -> fix loop of every open pull request by watching the
/// tip commit of its branch.
pub struct ReviewCycle {
    store: Arc<dyn StateStore>,
    host: Arc<dyn VcsHost>,
    runner: Arc<StageRunner>,
    notifier: Notifier,
    events: flume::Receiver<PrDiscovered>,
    owner: String,
    repo: String,
    max_iterations: u32,
    request_timeout: Duration,
    running: AtomicBool,
}

impl ReviewCycle {
    pub fn new(
        store: Arc<dyn StateStore>,
        host: Arc<dyn VcsHost>,
        runner: Arc<StageRunner>,
        notifier: Notifier,
        events: flume::Receiver<PrDiscovered>,
        owner: impl Into<String>,
        repo: impl Into<String>,
    ) -> Self {
        Self {
            store,
            host,
            runner,
            notifier,
            events,
            owner: owner.into(),
            repo: repo.into(),
            max_iterations: 3,
            request_timeout: Duration::from_secs(30),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Consume pending [`PrDiscovered`] events, then advance every cycle.
    pub async fn tick(&self) -> ReviewReport {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("review tick already running, skipping");
            return ReviewReport {
                skipped: true,
                ..ReviewReport::default()
            };
        }
        let mut report = ReviewReport::default();
        self.drain_events(&mut report).await;
        self.advance_all(&mut report).await;
        self.running.store(false, Ordering::Release);
        report
    }

    async fn drain_events(&self, report: &mut ReviewReport) {
        while let Ok(event) = self.events.try_recv() {
            match self.start(&event).await {
                Ok(_) => report.started += 1,
                Err(e) => {
                    error!(task_id = %event.task_id, error = %e, "failed to start review cycle");
                    report.errors += 1;
                }
            }
        }
    }

    /// Hand a discovered pull request to the review cycle: record it on the
    /// pipeline and ask for the first review. Reuses the cycle PR discovery
    /// already persisted, creating one only when none exists; a cycle that
    /// was already handed off is returned as is.
    pub async fn start(&self, event: &PrDiscovered) -> Result<ReviewCycleEntry> {
        let entry = match self.store.load_review_cycle(&event.task_id).await? {
            // Already resumed from the store before its event drained.
            Some(entry) if self.handed_off(&entry).await? => return Ok(entry),
            Some(entry) => entry,
            None => {
                let mut entry = ReviewCycleEntry::new(event, self.max_iterations, Utc::now());
                match self.latest_commit(&entry).await {
                    Ok(Some(commit)) => entry.last_commit_sha = Some(commit.sha),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(task_id = %event.task_id, error = %e, "no baseline commit for review cycle")
                    }
                }
                self.store.save_review_cycle(&entry).await?;
                entry
            }
        };
        self.hand_off(entry, event).await
    }

    async fn hand_off(&self, entry: ReviewCycleEntry, event: &PrDiscovered) -> Result<ReviewCycleEntry> {
        let task_id = event.task_id.as_str();
        self.runner.record_pull_request(task_id, event).await?;

        info!(task_id, pr_number = event.pr_number, "review cycle started");
        self.notifier
            .comment(
                task_id,
                &format!(
                    "Review cycle started for PR #{} (up to {} iterations).",
                    event.pr_number, entry.max_iterations
                ),
            )
            .await;
        self.log_stage("review", self.runner.request_review(task_id, &entry.branch).await?);
        Ok(entry)
    }

    async fn advance_all(&self, report: &mut ReviewReport) {
        let entries = match self.store.list_review_cycles().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to list review cycles");
                report.errors += 1;
                return;
            }
        };

        for entry in entries {
            // A cycle whose event was lost (restart, failed start) still
            // needs its pull request recorded and its first review.
            match self.handed_off(&entry).await {
                Ok(true) => {}
                Ok(false) => {
                    let event = PrDiscovered {
                        task_id: entry.task_id.clone(),
                        pr_number: entry.pr_number,
                        pr_url: entry.pr_url.clone(),
                        branch: entry.branch.clone(),
                    };
                    match self.hand_off(entry, &event).await {
                        Ok(_) => report.started += 1,
                        Err(e) => {
                            error!(task_id = %event.task_id, error = %e, "failed to resume review cycle");
                            report.errors += 1;
                        }
                    }
                    continue;
                }
                Err(e) => {
                    warn!(task_id = %entry.task_id, error = %e, "failed to load pipeline for review cycle");
                    report.errors += 1;
                    continue;
                }
            }

            report.checked += 1;
            match self.advance(entry.clone()).await {
                Ok(Transition::Completed { .. }) => {
                    report.transitions += 1;
                    report.completed += 1;
                }
                Ok(Transition::FixRequested { .. } | Transition::ReviewRequested { .. }) => {
                    report.transitions += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(task_id = %entry.task_id, error = %e, "review cycle check failed");
                    report.errors += 1;
                }
            }
        }
    }

    /// Compare the branch tip with the last seen commit and apply the
    /// matching transition.
    pub async fn advance(&self, mut entry: ReviewCycleEntry) -> Result<Transition> {
        let Some(commit) = self.latest_commit(&entry).await? else {
            return Ok(Transition::Unchanged);
        };
        let task_id = entry.task_id.clone();

        match entry.last_commit_sha.as_deref() {
            None => {
                entry.last_commit_sha = Some(commit.sha);
                self.store.save_review_cycle(&entry).await?;
                return Ok(Transition::Baseline);
            }
            Some(seen) if seen == commit.sha => return Ok(Transition::Unchanged),
            Some(_) => {}
        }

        let class = classify(&commit.message);
        debug!(
            task_id = %task_id,
            sha = %commit.sha,
            is_review = class.is_review,
            is_fix = class.is_fix,
            stage = %entry.stage,
            "new commit on review branch"
        );
        entry.last_commit_sha = Some(commit.sha);

        match entry.stage {
            ReviewStage::WaitingForCodexReview if class.is_review => {
                entry.stage = ReviewStage::WaitingForClaudeFixes;
                entry.iteration += 1;
                self.store.save_review_cycle(&entry).await?;
                self.notifier
                    .comment(
                        &task_id,
                        &format!(
                            "Review {}/{} received. Requesting fixes.",
                            entry.iteration, entry.max_iterations
                        ),
                    )
                    .await;
                self.log_stage("fix", self.runner.request_fix(&task_id, &entry.branch).await?);
                Ok(Transition::FixRequested {
                    iteration: entry.iteration,
                })
            }
            ReviewStage::WaitingForClaudeFixes if class.is_fix && !entry.budget_exhausted() => {
                entry.stage = ReviewStage::WaitingForCodexReview;
                self.store.save_review_cycle(&entry).await?;
                self.notifier
                    .comment(
                        &task_id,
                        &format!(
                            "Fixes for review {} pushed. Requesting another review.",
                            entry.iteration
                        ),
                    )
                    .await;
                self.log_stage(
                    "review",
                    self.runner.request_review(&task_id, &entry.branch).await?,
                );
                Ok(Transition::ReviewRequested {
                    iteration: entry.iteration,
                })
            }
            ReviewStage::WaitingForClaudeFixes if class.is_fix => {
                let iterations = entry.iteration;
                self.store.delete_review_cycle(&task_id).await?;
                info!(task_id = %task_id, iterations, "review cycle finished");
                self.notifier
                    .comment(
                        &task_id,
                        &format!(
                            "Review cycle finished after {iterations} iterations. PR #{} is ready for a human merge.",
                            entry.pr_number
                        ),
                    )
                    .await;
                self.runner.finish(&task_id, iterations).await?;
                Ok(Transition::Completed { iterations })
            }
            _ => {
                self.store.save_review_cycle(&entry).await?;
                Ok(Transition::Ignored)
            }
        }
    }

    /// Whether the pull request has been recorded on the pipeline. Cycles
    /// without a pipeline are left to advance on their own.
    async fn handed_off(&self, entry: &ReviewCycleEntry) -> Result<bool> {
        let pipeline = self.runner.pipelines().get(&entry.task_id).await?;
        Ok(pipeline.map_or(true, |p| {
            p.stage(Stage::PrCreating)
                .is_some_and(|s| s.status == PipelineStatus::Completed)
        }))
    }

    async fn latest_commit(&self, entry: &ReviewCycleEntry) -> Result<Option<CommitRef>> {
        tokio::time::timeout(
            self.request_timeout,
            self.host.latest_commit(&self.owner, &self.repo, &entry.branch),
        )
        .await
        .map_err(|_| ReviewError::Timeout)?
        .map_err(ReviewError::from)
    }

    fn log_stage(&self, kind: &str, outcome: StageOutcome) {
        if let StageOutcome::Failed(err) = outcome {
            // Recorded on the pipeline; the cycle keeps polling.
            warn!(kind, error = %err, "review cycle agent failed");
        }
    }
}
