#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use tp_agents::agent::{AgentContext, AgentError, RepoConfig, StageAgent};
use tp_agents::command::CommandAgent;
use tp_agents::registry::ProcessRegistry;
use tp_core::types::{ProcessStatus, Task};

fn ctx(processes: Arc<ProcessRegistry>) -> AgentContext {
    AgentContext::new(
        RepoConfig {
            owner: "acme".into(),
            repo: "widgets".into(),
            workdir: None,
        },
        processes,
    )
}

fn sh(script: &str) -> CommandAgent {
    CommandAgent::new("test", "sh").with_args(vec!["-c".into(), script.into()])
}

#[tokio::test]
async fn successful_command_reports_branch_and_registers_pid() {
    let processes = Arc::new(ProcessRegistry::new());
    let agent = sh("echo \"branch: feat/$TASKPILOT_TASK_ID\"; echo 'artifact: /tmp/analysis.md'");

    let outcome = agent
        .invoke(&Task::new("T1", "Add login"), &ctx(processes.clone()))
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.branch.as_deref(), Some("feat/T1"));
    assert_eq!(outcome.artifact_path.as_deref(), Some("/tmp/analysis.md"));

    let entries = processes.entries("T1");
    assert_eq!(entries.len(), 1);
    assert!(entries[0].pid.is_some());
    assert_eq!(entries[0].status, ProcessStatus::Running);
}

#[tokio::test]
async fn prior_artifact_and_branch_are_passed_through() {
    let processes = Arc::new(ProcessRegistry::new());
    let agent = sh("echo \"artifact: $TASKPILOT_PRIOR_ARTIFACT\"; echo \"branch: $TASKPILOT_BRANCH\"");
    let ctx = ctx(processes)
        .with_prior_artifact(Some("/tmp/analysis.md".into()))
        .with_branch("feat/x");

    let outcome = agent.invoke(&Task::new("T2", "x"), &ctx).await.unwrap();
    assert_eq!(outcome.artifact_path.as_deref(), Some("/tmp/analysis.md"));
    assert_eq!(outcome.branch.as_deref(), Some("feat/x"));
}

#[tokio::test]
async fn non_zero_exit_is_a_failed_outcome() {
    let processes = Arc::new(ProcessRegistry::new());
    let agent = sh("echo 'tests are red' >&2; exit 3");

    let outcome = agent
        .invoke(&Task::new("T3", "x"), &ctx(processes))
        .await
        .unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("tests are red"));
}

#[tokio::test]
async fn missing_program_is_not_found() {
    let processes = Arc::new(ProcessRegistry::new());
    let agent = CommandAgent::new("ghost", "/nonexistent/taskpilot-agent");
    let err = agent
        .invoke(&Task::new("T4", "x"), &ctx(processes.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::NotFound));
    assert!(processes.entries("T4").is_empty());
}

#[tokio::test]
async fn slow_command_times_out() {
    let processes = Arc::new(ProcessRegistry::new());
    let agent = sh("sleep 5").with_timeout(Duration::from_millis(100));
    let err = agent
        .invoke(&Task::new("T5", "x"), &ctx(processes))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Timeout(_)));
}
