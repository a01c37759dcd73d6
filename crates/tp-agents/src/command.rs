//! Agent adapter that runs an external command per invocation.
//!
//! The child receives the task through environment variables
//! (`TASKPILOT_TASK_ID`, `TASKPILOT_TASK_TITLE`, ...) and reports back on
//! stdout with `branch: <name>` and `artifact: <path>` lines. Exit status 0
//! means success.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, warn};
use tp_core::types::Task;

use crate::agent::{AgentContext, AgentError, AgentOutcome, Result, StageAgent};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct CommandAgent {
    name: String,
    program: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    timeout: Duration,
}

impl CommandAgent {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            workdir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_workdir(mut self, dir: Option<PathBuf>) -> Self {
        self.workdir = dir;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, task: &Task, ctx: &AgentContext) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("TASKPILOT_TASK_ID", &task.id)
            .env("TASKPILOT_TASK_TITLE", &task.title)
            .env(
                "TASKPILOT_TASK_DESCRIPTION",
                task.description.as_deref().unwrap_or_default(),
            )
            .env("TASKPILOT_REPO", format!("{}/{}", ctx.repo.owner, ctx.repo.repo))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(artifact) = &ctx.prior_artifact {
            cmd.env("TASKPILOT_PRIOR_ARTIFACT", artifact);
        }
        if let Some(branch) = &ctx.branch {
            cmd.env("TASKPILOT_BRANCH", branch);
        }
        if let Some(dir) = self.workdir.as_ref().or(ctx.repo.workdir.as_ref()) {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Pull `branch:` and `artifact:` report lines out of agent stdout. The last
/// occurrence of each wins.
pub fn parse_report(stdout: &str) -> (Option<String>, Option<String>) {
    let mut branch = None;
    let mut artifact = None;
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("branch:") {
            let value = rest.trim();
            if !value.is_empty() {
                branch = Some(value.to_string());
            }
        } else if let Some(rest) = line.strip_prefix("artifact:") {
            let value = rest.trim();
            if !value.is_empty() {
                artifact = Some(value.to_string());
            }
        }
    }
    (branch, artifact)
}

fn failure_message(status: std::process::ExitStatus, stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| match status.code() {
            Some(code) => format!("agent exited with status {code}"),
            None => "agent terminated by signal".to_string(),
        })
}

#[async_trait]
impl StageAgent for CommandAgent {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(agent = %self.name, task_id = %task.id))]
    async fn invoke(&self, task: &Task, ctx: &AgentContext) -> Result<AgentOutcome> {
        let child = self.command(task, ctx).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::NotFound
            } else {
                AgentError::Spawn(e)
            }
        })?;
        let pid = child.id();
        ctx.processes.register(&task.id, pid);
        debug!(?pid, program = %self.program, "agent process spawned");

        // Dropping the child on timeout kills it (kill_on_drop).
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(?pid, timeout_secs = self.timeout.as_secs(), "agent timed out");
                return Err(AgentError::Timeout(self.timeout.as_secs()));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (branch, artifact_path) = parse_report(&stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = failure_message(output.status, &stderr);
            debug!(exit_code = ?output.status.code(), error = %message, "agent failed");
            return Ok(AgentOutcome {
                success: false,
                branch,
                artifact_path,
                error: Some(message),
            });
        }

        debug!(?branch, ?artifact_path, "agent finished");
        Ok(AgentOutcome {
            success: true,
            branch,
            artifact_path,
            error: None,
        })
    }
}
