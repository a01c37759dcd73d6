//! Intake and stage runner: deduplication, criticality policy, stage records.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{task, Harness, Script};
use tp_core::store::{JsonFileStore, StateStore, StoreError};
use tp_core::types::{PipelineStatus, ProcessStatus, Stage};
use tp_daemon::intake::IntakeOutcome;
use tp_daemon::runner::{RunnerError, StageOutcome};

// ===========================================================================
// Intake
// ===========================================================================

#[tokio::test]
async fn intake_twice_creates_one_pipeline_and_one_implementation() {
    let h = Harness::new(vec![task("T1", "Add login")]).await;

    let first = h.intake.poll().await;
    assert_eq!(first.fetched, 1);
    assert_eq!(first.started, 1);

    let second = h.intake.poll().await;
    assert_eq!(second.started, 0);
    assert_eq!(second.duplicates, 1);

    assert_eq!(h.store.list_pipelines().await.unwrap().len(), 1);
    assert_eq!(h.agents.implementation.calls(), 1);
    assert_eq!(h.agents.analysis.calls(), 1);

    let tracking = h.store.load_pr_tracking("T1").await.unwrap().unwrap();
    assert_eq!(tracking.branch, "feat/t1");
    assert_eq!(tracking.owner, common::OWNER);
    assert_eq!(h.tracker.statuses_for("T1"), vec!["in progress".to_string()]);
}

#[tokio::test]
async fn overlapping_intake_of_same_task_runs_once() {
    let h = Harness::new(Vec::new()).await;
    let t = task("T1", "Add login");

    let (a, b) = tokio::join!(h.intake.process(&t), h.intake.process(&t));
    let started = [&a, &b]
        .iter()
        .filter(|o| matches!(o, IntakeOutcome::Started { .. }))
        .count();
    assert_eq!(started, 1);
    assert!(a == IntakeOutcome::Duplicate || b == IntakeOutcome::Duplicate);
    assert_eq!(h.agents.implementation.calls(), 1);
}

#[tokio::test]
async fn intake_with_json_store_deduplicates() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::open(dir.path()).await.unwrap();
    let h = Harness::with_store(
        Arc::new(store),
        vec![task("T1", "Add login"), task("T2", "Fix footer")],
        Duration::from_secs(5),
    );

    assert_eq!(h.intake.poll().await.started, 2);
    let again = h.intake.poll().await;
    assert_eq!(again.duplicates, 2);
    assert_eq!(h.agents.implementation.calls(), 2);

    // Reopen from disk: the cache survives a restart.
    let reopened = JsonFileStore::open(dir.path()).await.unwrap();
    let h2 = Harness::with_store(
        Arc::new(reopened),
        vec![task("T1", "Add login")],
        Duration::from_secs(5),
    );
    assert_eq!(h2.intake.poll().await.duplicates, 1);
    assert_eq!(h2.agents.implementation.calls(), 0);
}

#[tokio::test]
async fn fetch_failure_ends_poll_quietly() {
    let h = Harness::new(vec![task("T1", "Add login")]).await;
    h.tracker
        .fail_fetch
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let report = h.intake.poll().await;
    assert_eq!(report.fetched, 0);
    assert!(!report.skipped);
    assert!(h.store.list_pipelines().await.unwrap().is_empty());
}

// ===========================================================================
// Critical failure
// ===========================================================================

#[tokio::test]
async fn implementation_agent_not_found_aborts_pipeline() {
    let h = Harness::new(vec![task("T1", "Add login")]).await;
    h.agents.implementation.set(Script::NotFound);

    let report = h.intake.poll().await;
    assert_eq!(report.failed, 1);

    let p = h.pipelines.get("T1").await.unwrap().unwrap();
    assert_eq!(p.status, PipelineStatus::Failed);
    assert!(p.failed_at.is_some());

    let implementing = p.stage(Stage::Implementing).unwrap();
    assert_eq!(implementing.status, PipelineStatus::Failed);
    assert_eq!(implementing.error.as_deref(), Some("agent not found"));

    assert_eq!(p.errors.len(), 1);
    assert_eq!(p.errors[0].stage, Stage::Implementing);
    assert_eq!(p.errors[0].error, "agent not found");

    assert!(p.stage(Stage::CodexReviewing).is_none());
    assert!(p.stage(Stage::ClaudeFixing).is_none());
    assert!(h.store.load_pr_tracking("T1").await.unwrap().is_none());

    let comments = h.tracker.comments_for("T1");
    assert!(comments
        .iter()
        .any(|c| c == "Implementation failed: agent not found"));
    assert!(comments.iter().any(|c| c == "Pipeline aborted."));
}

#[tokio::test]
async fn runner_surfaces_critical_error() {
    let h = Harness::new(Vec::new()).await;
    let t = task("T1", "Add login");
    h.pipelines.create(&t).await.unwrap();
    h.agents.implementation.set(Script::Fail("tests red".into()));

    let err = h.runner.run(&t).await.unwrap_err();
    match err {
        RunnerError::Critical {
            task_id,
            stage,
            error,
        } => {
            assert_eq!(task_id, "T1");
            assert_eq!(stage, Stage::Implementing);
            assert_eq!(error, "tests red");
        }
        other => panic!("expected critical error, got {other:?}"),
    }
}

#[tokio::test]
async fn implementation_without_branch_is_critical() {
    let h = Harness::new(Vec::new()).await;
    let t = task("T1", "Add login");
    h.pipelines.create(&t).await.unwrap();
    h.agents.implementation.set(Script::ok());

    let err = h.runner.run(&t).await.unwrap_err();
    assert!(matches!(err, RunnerError::Critical { .. }));

    let p = h.pipelines.get("T1").await.unwrap().unwrap();
    assert_eq!(p.status, PipelineStatus::Failed);
    assert_eq!(
        p.stage(Stage::Implementing).unwrap().status,
        PipelineStatus::Failed
    );
}

#[tokio::test]
async fn hanging_implementation_times_out() {
    let store = tp_core::store::SqliteStore::open_in_memory().await.unwrap();
    let h = Harness::with_store(Arc::new(store), Vec::new(), Duration::from_millis(50));
    let t = task("T1", "Add login");
    h.pipelines.create(&t).await.unwrap();
    h.agents.implementation.set(Script::Hang);

    let err = h.runner.run(&t).await.unwrap_err();
    let RunnerError::Critical { error, .. } = err else {
        panic!("expected critical error");
    };
    assert!(error.contains("timed out"), "unexpected error: {error}");

    let p = h.pipelines.get("T1").await.unwrap().unwrap();
    assert_eq!(p.status, PipelineStatus::Failed);
}

// ===========================================================================
// Non-critical failure
// ===========================================================================

#[tokio::test]
async fn analysis_failure_continues_to_implementation() {
    let h = Harness::new(Vec::new()).await;
    let t = task("T1", "Add login");
    h.pipelines.create(&t).await.unwrap();
    h.agents.analysis.set(Script::Fail("model overloaded".into()));

    let report = h.runner.run(&t).await.unwrap();
    assert_eq!(report.branch, "feat/t1");
    assert_eq!(report.analysis_artifact, None);

    let p = h.pipelines.get("T1").await.unwrap().unwrap();
    assert_eq!(p.current_stage, Stage::Implementing);
    assert_eq!(p.status, PipelineStatus::InProgress);
    assert_eq!(
        p.stage(Stage::Analyzing).unwrap().status,
        PipelineStatus::Failed
    );
    assert_eq!(
        p.stage(Stage::Implementing).unwrap().status,
        PipelineStatus::Completed
    );
    assert_eq!(p.errors.len(), 1);
    assert_eq!(p.errors[0].stage, Stage::Analyzing);

    let seen = h.agents.implementation.last_seen().unwrap();
    assert_eq!(seen.prior_artifact, None);
    assert!(h
        .tracker
        .comments_for("T1")
        .iter()
        .any(|c| c.contains("without an analysis document")));
}

#[tokio::test]
async fn analysis_artifact_reaches_implementation() {
    let h = Harness::new(Vec::new()).await;
    let t = task("T1", "Add login");
    h.pipelines.create(&t).await.unwrap();

    let report = h.runner.run(&t).await.unwrap();
    assert_eq!(report.analysis_artifact.as_deref(), Some("docs/analysis.md"));

    let seen = h.agents.implementation.last_seen().unwrap();
    assert_eq!(seen.prior_artifact.as_deref(), Some("docs/analysis.md"));

    let p = h.pipelines.get("T1").await.unwrap().unwrap();
    let analysis = p.stage(Stage::Analyzing).unwrap();
    assert_eq!(analysis.extra["artifact_path"], "docs/analysis.md");
    assert_eq!(p.metadata["branch"], "feat/t1");
}

// ===========================================================================
// Stage records
// ===========================================================================

#[tokio::test]
async fn completed_stages_have_non_negative_durations() {
    let h = Harness::new(vec![task("T1", "Add login")]).await;
    h.intake.poll().await;

    let p = h.pipelines.get("T1").await.unwrap().unwrap();
    let completed: Vec<_> = p
        .stages
        .iter()
        .filter(|s| s.status == PipelineStatus::Completed)
        .collect();
    assert_eq!(completed.len(), 3, "detected, analyzing, implementing");
    for stage in completed {
        let finished = stage.completed_at.unwrap();
        assert!(finished >= stage.started_at);
        assert!(stage.duration_ms.unwrap() >= 0);
    }
}

#[tokio::test]
async fn runner_settles_registered_processes() {
    let h = Harness::new(Vec::new()).await;
    let t = task("T1", "Add login");
    h.pipelines.create(&t).await.unwrap();
    h.agents.analysis.registers(4242);

    h.runner.run(&t).await.unwrap();

    let entries = h.processes.entries("T1");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].pid, Some(4242));
    assert_eq!(entries[0].status, ProcessStatus::Completed);
}

#[tokio::test]
async fn failed_agent_marks_its_processes_failed() {
    let h = Harness::new(Vec::new()).await;
    let t = task("T1", "Add login");
    h.pipelines.create(&t).await.unwrap();
    h.agents.analysis.registers(4343);
    h.agents.analysis.set(Script::Fail("crashed".into()));

    h.runner.run(&t).await.unwrap();

    let entries = h.processes.entries("T1");
    assert_eq!(entries[0].status, ProcessStatus::Failed);
    assert_eq!(entries[0].error.as_deref(), Some("crashed"));
}

#[tokio::test]
async fn review_request_for_unknown_task_is_not_found() {
    let h = Harness::new(Vec::new()).await;
    let err = h.runner.request_review("ghost", "feat/x").await.unwrap_err();
    assert!(matches!(
        err,
        RunnerError::Store(StoreError::PipelineNotFound(id)) if id == "ghost"
    ));
    assert_eq!(h.agents.review.calls(), 0);
}

#[tokio::test]
async fn review_request_passes_branch_and_task() {
    let h = Harness::new(Vec::new()).await;
    let t = task("T1", "Add login");
    h.pipelines.create(&t).await.unwrap();

    let outcome = h.runner.request_review("T1", "feat/t1").await.unwrap();
    assert!(matches!(outcome, StageOutcome::Completed(_)));

    let seen = h.agents.review.last_seen().unwrap();
    assert_eq!(seen.task_id, "T1");
    assert_eq!(seen.branch.as_deref(), Some("feat/t1"));

    let p = h.pipelines.get("T1").await.unwrap().unwrap();
    assert_eq!(p.current_stage, Stage::CodexReviewing);
    assert_eq!(p.stage(Stage::CodexReviewing).unwrap().extra["branch"], "feat/t1");
}
