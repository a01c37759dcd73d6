use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use tp_agents::agent::{AgentContext, AgentError, AgentOutcome, AgentSet, RepoConfig, StageAgent};
use tp_agents::registry::ProcessRegistry;
use tp_core::pipeline_store::PipelineStore;
use tp_core::store::StoreError;
use tp_core::types::{Metadata, Pipeline, PrDiscovered, Stage, Task};

use crate::notify::Notifier;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RunnerError {
    /// A critical stage failed; the pipeline has been marked failed.
    #[error("{stage} failed for task {task_id}: {error}")]
    Critical {
        task_id: String,
        stage: Stage,
        error: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of one non-critical stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Completed(AgentOutcome),
    /// Recorded on the pipeline; the caller continues with a fallback.
    Failed(String),
}

/// What a successful [`StageRunner::run`] hands to PR discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImplementationReport {
    pub branch: String,
    /// Analysis document the implementation was based on, if any.
    pub analysis_artifact: Option<String>,
}

const REAP_GRACE: Duration = Duration::from_secs(10);

const NO_BRANCH: &str = "implementation finished without reporting a branch";

// ---------------------------------------------------------------------------
// StageRunner
// ---------------------------------------------------------------------------

/// Drives tasks through the agent stages, recording every transition in the
/// [`PipelineStore`].
///
/// Failures of the implementation stage abort the pipeline and surface as
/// [`RunnerError::Critical`]. Analysis, review and fix failures are recorded
/// and reported as [`StageOutcome::Failed`].
pub struct StageRunner {
    pipelines: Arc<PipelineStore>,
    agents: AgentSet,
    notifier: Notifier,
    processes: Arc<ProcessRegistry>,
    repo: RepoConfig,
    agent_timeout: Duration,
}

impl StageRunner {
    pub fn new(
        pipelines: Arc<PipelineStore>,
        agents: AgentSet,
        notifier: Notifier,
        processes: Arc<ProcessRegistry>,
        repo: RepoConfig,
    ) -> Self {
        Self {
            pipelines,
            agents,
            notifier,
            processes,
            repo,
            agent_timeout: Duration::from_secs(60 * 60),
        }
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn pipelines(&self) -> &Arc<PipelineStore> {
        &self.pipelines
    }

    pub fn processes(&self) -> &Arc<ProcessRegistry> {
        &self.processes
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Analysis followed by implementation. The pipeline must already exist.
    pub async fn run(&self, task: &Task) -> Result<ImplementationReport> {
        info!(task_id = %task.id, title = %task.title, "running pipeline");

        let analysis = self
            .execute(task, Stage::Analyzing, &self.agents.analysis, self.context())
            .await?;
        let analysis_artifact = match analysis {
            StageOutcome::Completed(outcome) => outcome.artifact_path,
            StageOutcome::Failed(err) => {
                warn!(task_id = %task.id, error = %err, "analysis failed, continuing without it");
                self.notifier
                    .comment(
                        &task.id,
                        "Continuing with implementation without an analysis document.",
                    )
                    .await;
                None
            }
        };

        let ctx = self
            .context()
            .with_prior_artifact(analysis_artifact.clone());
        let outcome = self
            .execute(task, Stage::Implementing, &self.agents.implementation, ctx)
            .await?;

        // Critical failures already returned through `execute`.
        let StageOutcome::Completed(AgentOutcome {
            branch: Some(branch),
            ..
        }) = outcome
        else {
            return Err(RunnerError::Critical {
                task_id: task.id.clone(),
                stage: Stage::Implementing,
                error: NO_BRANCH.to_string(),
            });
        };

        self.pipelines
            .update_metadata(&task.id, metadata([("branch", Value::from(branch.as_str()))]))
            .await?;
        Ok(ImplementationReport {
            branch,
            analysis_artifact,
        })
    }

    /// Ask the review agent to look at `branch`.
    pub async fn request_review(&self, task_id: &str, branch: &str) -> Result<StageOutcome> {
        let task = self.task_for(task_id).await?;
        let ctx = self.context().with_branch(branch);
        self.execute(&task, Stage::CodexReviewing, &self.agents.review, ctx)
            .await
    }

    /// Ask the fix agent to address review notes on `branch`.
    pub async fn request_fix(&self, task_id: &str, branch: &str) -> Result<StageOutcome> {
        let task = self.task_for(task_id).await?;
        let ctx = self.context().with_branch(branch);
        self.execute(&task, Stage::ClaudeFixing, &self.agents.fix, ctx)
            .await
    }

    /// Record the discovered pull request on the pipeline.
    pub async fn record_pull_request(&self, task_id: &str, pr: &PrDiscovered) -> Result<Pipeline> {
        let details = metadata([
            ("pr_number", Value::from(pr.pr_number)),
            ("pr_url", Value::from(pr.pr_url.as_str())),
            ("branch", Value::from(pr.branch.as_str())),
        ]);
        self.pipelines
            .update_stage(task_id, Stage::PrCreating, Metadata::new())
            .await?;
        self.pipelines
            .complete_stage(task_id, Stage::PrCreating, details.clone())
            .await?;
        Ok(self.pipelines.update_metadata(task_id, details).await?)
    }

    /// Close the pipeline once the review loop has run out of iterations.
    /// Merging stays with human reviewers and is recorded as skipped.
    pub async fn finish(&self, task_id: &str, iterations: u32) -> Result<Pipeline> {
        self.pipelines
            .skip_stage(task_id, Stage::Merging, "merge is left to reviewers")
            .await?;
        self.pipelines
            .update_stage(task_id, Stage::Completed, Metadata::new())
            .await?;
        self.pipelines
            .complete_stage(
                task_id,
                Stage::Completed,
                metadata([("review_iterations", Value::from(iterations))]),
            )
            .await?;
        let pipeline = self.pipelines.complete(task_id).await?;
        self.processes.remove_task(task_id);
        info!(task_id, iterations, "pipeline completed");
        Ok(pipeline)
    }

    // -----------------------------------------------------------------------
    // Stage execution
    // -----------------------------------------------------------------------

    /// Run one agent-backed stage and apply the criticality policy.
    async fn execute(
        &self,
        task: &Task,
        stage: Stage,
        agent: &Arc<dyn StageAgent>,
        ctx: AgentContext,
    ) -> Result<StageOutcome> {
        let mut start_meta = metadata([("agent", Value::from(agent.name()))]);
        if let Some(branch) = &ctx.branch {
            start_meta.insert("branch".into(), Value::from(branch.as_str()));
        }
        self.pipelines
            .update_stage(&task.id, stage, start_meta)
            .await?;
        self.notifier
            .comment(&task.id, &format!("{} started.", stage.label()))
            .await;

        let result = self.invoke(task, stage, agent.as_ref(), &ctx).await;
        self.processes
            .settle(&task.id, result.as_ref().err().map(String::as_str));

        match result {
            Ok(outcome) => {
                self.pipelines
                    .complete_stage(&task.id, stage, outcome_metadata(&outcome))
                    .await?;
                self.notifier
                    .comment(&task.id, &format!("{} completed.", stage.label()))
                    .await;
                info!(task_id = %task.id, %stage, "stage completed");
                Ok(StageOutcome::Completed(outcome))
            }
            Err(err) => {
                self.pipelines.fail_stage(&task.id, stage, &err).await?;
                self.notifier
                    .comment(&task.id, &format!("{} failed: {err}", stage.label()))
                    .await;
                if stage.is_critical() {
                    error!(task_id = %task.id, %stage, error = %err, "critical stage failed");
                    self.pipelines.fail(&task.id, &err).await?;
                    self.processes.remove_task(&task.id);
                    self.notifier
                        .comment(&task.id, "Pipeline aborted.")
                        .await;
                    return Err(RunnerError::Critical {
                        task_id: task.id.clone(),
                        stage,
                        error: err,
                    });
                }
                warn!(task_id = %task.id, %stage, error = %err, "stage failed");
                Ok(StageOutcome::Failed(err))
            }
        }
    }

    /// Call the agent under the agent timeout and fold every failure shape
    /// into an error message.
    async fn invoke(
        &self,
        task: &Task,
        stage: Stage,
        agent: &dyn StageAgent,
        ctx: &AgentContext,
    ) -> std::result::Result<AgentOutcome, String> {
        let outcome = match tokio::time::timeout(self.agent_timeout, agent.invoke(task, ctx)).await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => {
                self.reap(&task.id).await;
                return Err(AgentError::Timeout(self.agent_timeout.as_secs()).to_string());
            }
        };
        if !outcome.success {
            return Err(outcome
                .error
                .unwrap_or_else(|| format!("{} agent reported failure", agent.name())));
        }
        if stage == Stage::Implementing && outcome.branch.is_none() {
            return Err(NO_BRANCH.to_string());
        }
        Ok(outcome)
    }

    /// Give the processes of a timed-out agent a grace period to exit and
    /// terminate the ones still running.
    async fn reap(&self, task_id: &str) {
        let outcomes = self.processes.wait_for_all(task_id, REAP_GRACE).await;
        for pid in outcomes
            .iter()
            .filter(|o| o.timed_out)
            .map(|o| o.pid)
        {
            warn!(task_id, pid, "agent process outlived its stage, terminating");
            self.processes.kill(pid);
        }
    }

    fn context(&self) -> AgentContext {
        AgentContext::new(self.repo.clone(), self.processes.clone())
    }

    /// Rebuild the task from its pipeline for stages started by the
    /// reconcilers, which only know the task id.
    async fn task_for(&self, task_id: &str) -> Result<Task> {
        let pipeline = self
            .pipelines
            .get(task_id)
            .await?
            .ok_or_else(|| StoreError::PipelineNotFound(task_id.to_string()))?;
        let mut task = Task::new(pipeline.task_id.as_str(), pipeline.task_name.as_str());
        if let Some(url) = pipeline
            .stage(Stage::Detected)
            .and_then(|s| s.extra.get("task_url"))
            .and_then(Value::as_str)
        {
            task = task.with_url(url);
        }
        Ok(task)
    }
}

fn metadata<const N: usize>(pairs: [(&str, Value); N]) -> Metadata {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn outcome_metadata(outcome: &AgentOutcome) -> Metadata {
    let mut meta = Metadata::new();
    if let Some(branch) = &outcome.branch {
        meta.insert("branch".into(), Value::from(branch.as_str()));
    }
    if let Some(path) = &outcome.artifact_path {
        meta.insert("artifact_path".into(), Value::from(path.as_str()));
    }
    meta
}
