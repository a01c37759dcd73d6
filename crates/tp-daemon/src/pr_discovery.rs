use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use tp_core::ports::VcsHost;
use tp_core::store::{self, StateStore};
use tp_core::types::{PrDiscovered, PrTrackingEntry, ReviewCycleEntry};

use crate::notify::Notifier;

/// Summary of one discovery tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub found: usize,
    pub timed_out: usize,
    pub pending: usize,
    /// Host queries that failed; those entries stay for the next tick.
    pub errors: usize,
    pub skipped: bool,
}

/// Polls the VCS host until a pull request appears for each tracked branch
/// or the tracking entry times out.
///
/// A found pull request gets its review cycle persisted before the tracking
/// entry is dropped; the [`PrDiscovered`] event only wakes the review loop.
pub struct PrDiscovery {
    store: Arc<dyn StateStore>,
    host: Arc<dyn VcsHost>,
    notifier: Notifier,
    events: flume::Sender<PrDiscovered>,
    owner: String,
    repo: String,
    timeout: chrono::Duration,
    request_timeout: Duration,
    review_status: String,
    max_iterations: u32,
    running: AtomicBool,
}

impl PrDiscovery {
    pub fn new(
        store: Arc<dyn StateStore>,
        host: Arc<dyn VcsHost>,
        notifier: Notifier,
        events: flume::Sender<PrDiscovered>,
        owner: impl Into<String>,
        repo: impl Into<String>,
    ) -> Self {
        Self {
            store,
            host,
            notifier,
            events,
            owner: owner.into(),
            repo: repo.into(),
            timeout: chrono::Duration::minutes(30),
            request_timeout: Duration::from_secs(30),
            review_status: "in review".to_string(),
            max_iterations: 3,
            running: AtomicBool::new(false),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_review_status(mut self, status: impl Into<String>) -> Self {
        self.review_status = status.into();
        self
    }

    /// Iteration budget written into the review cycles this creates.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Start waiting for a pull request on `branch`.
    pub async fn track(&self, task_id: &str, branch: &str) -> store::Result<PrTrackingEntry> {
        let entry = PrTrackingEntry::new(task_id, branch, &self.owner, &self.repo, Utc::now());
        self.store.save_pr_tracking(&entry).await?;
        info!(task_id, branch, "tracking branch for pull request");
        self.notifier
            .comment(
                task_id,
                &format!("Implementation pushed to `{branch}`. Waiting for a pull request."),
            )
            .await;
        Ok(entry)
    }

    pub async fn tick(&self) -> DiscoveryReport {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("pr discovery tick already running, skipping");
            return DiscoveryReport {
                skipped: true,
                ..DiscoveryReport::default()
            };
        }
        let report = self.tick_inner().await;
        self.running.store(false, Ordering::Release);
        report
    }

    async fn tick_inner(&self) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        let entries = match self.store.list_pr_tracking().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to list tracked branches");
                report.errors += 1;
                return report;
            }
        };

        for entry in entries {
            if let Err(e) = self.check(&entry, &mut report).await {
                warn!(task_id = %entry.task_id, error = %e, "pr tracking update failed");
                report.errors += 1;
            }
        }
        if report.found + report.timed_out > 0 {
            info!(
                found = report.found,
                timed_out = report.timed_out,
                pending = report.pending,
                "pr discovery tick finished"
            );
        }
        report
    }

    async fn check(&self, entry: &PrTrackingEntry, report: &mut DiscoveryReport) -> store::Result<()> {
        let task_id = entry.task_id.as_str();

        if entry.is_timed_out(Utc::now(), self.timeout) {
            // Only the tick that removes the entry reports the timeout.
            if self.store.delete_pr_tracking(task_id).await? {
                warn!(task_id, branch = %entry.branch, "no pull request before timeout");
                self.notifier
                    .comment(
                        task_id,
                        &format!(
                            "No pull request appeared for `{}` within {} minutes. Stopped watching.",
                            entry.branch,
                            self.timeout.num_minutes()
                        ),
                    )
                    .await;
                report.timed_out += 1;
            }
            return Ok(());
        }

        let lookup = tokio::time::timeout(
            self.request_timeout,
            self.host
                .find_pull_request(&entry.owner, &entry.repo, &entry.branch),
        )
        .await;
        let pr = match lookup {
            Ok(Ok(Some(pr))) => pr,
            Ok(Ok(None)) => {
                report.pending += 1;
                return Ok(());
            }
            Ok(Err(e)) => {
                // Expected while the branch does not exist yet.
                warn!(task_id, branch = %entry.branch, error = %e, "pull request lookup failed");
                report.errors += 1;
                return Ok(());
            }
            Err(_) => {
                warn!(task_id, branch = %entry.branch, "pull request lookup timed out");
                report.errors += 1;
                return Ok(());
            }
        };

        let event = PrDiscovered {
            task_id: task_id.to_string(),
            pr_number: pr.number,
            pr_url: pr.url,
            branch: entry.branch.clone(),
        };

        // The cycle must exist before the tracking entry goes away.
        if self.store.load_review_cycle(task_id).await?.is_none() {
            let mut cycle = ReviewCycleEntry::new(&event, self.max_iterations, Utc::now());
            cycle.last_commit_sha = self.tip(entry).await;
            self.store.save_review_cycle(&cycle).await?;
        }
        if !self.store.delete_pr_tracking(task_id).await? {
            return Ok(());
        }
        info!(task_id, pr_number = event.pr_number, url = %event.pr_url, "pull request found");
        self.notifier
            .comment(task_id, &format!("Pull request opened: {}", event.pr_url))
            .await;
        self.notifier.set_status(task_id, &self.review_status).await;

        if self.events.send_async(event).await.is_err() {
            warn!(task_id, "review cycle is not listening, pull request event dropped");
        }
        report.found += 1;
        Ok(())
    }

    /// Current branch tip, used as the review cycle's baseline so the first
    /// review commit reads as new.
    async fn tip(&self, entry: &PrTrackingEntry) -> Option<String> {
        let lookup = tokio::time::timeout(
            self.request_timeout,
            self.host
                .latest_commit(&entry.owner, &entry.repo, &entry.branch),
        )
        .await;
        match lookup {
            Ok(Ok(commit)) => commit.map(|c| c.sha),
            Ok(Err(e)) => {
                warn!(task_id = %entry.task_id, error = %e, "no baseline commit for review cycle");
                None
            }
            Err(_) => {
                warn!(task_id = %entry.task_id, "baseline commit lookup timed out");
                None
            }
        }
    }
}
