//! Patrol sweeps and the daemon's loop lifecycle.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{task, Agents, MockHost, MockTracker};
use tp_agents::registry::ProcessRegistry;
use tp_core::config::Config;
use tp_core::dedup::DedupCache;
use tp_core::pipeline_store::PipelineStore;
use tp_core::store::{JsonFileStore, SqliteStore, StateStore};
use tp_core::types::{CacheEntry, Pipeline, PipelineStatus};
use tp_daemon::daemon::{Daemon, DaemonIntervals};
use tp_daemon::patrol::PatrolRunner;

// ===========================================================================
// Patrol
// ===========================================================================

#[tokio::test]
async fn patrol_sweeps_expired_state() {
    let store: Arc<dyn StateStore> = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let cache = Arc::new(DedupCache::new(store.clone()));
    let pipelines = Arc::new(PipelineStore::new(store.clone()));
    let processes = Arc::new(ProcessRegistry::new());

    let now = Utc::now();
    let expired = CacheEntry::from_task(
        &task("OLD", "stale"),
        chrono::Duration::hours(1),
        now - chrono::Duration::hours(3),
    );
    store
        .try_insert_cache_entry(&expired, now - chrono::Duration::hours(3))
        .await
        .unwrap();
    assert!(cache.add(&task("FRESH", "fresh")).await.unwrap());

    let long_ago = now - chrono::Duration::days(40);
    let mut finished = Pipeline::new(&task("DONE", "shipped"), long_ago);
    finished.mark_completed(long_ago);
    store.save_pipeline(&finished).await.unwrap();
    pipelines.create(&task("ACTIVE", "in flight")).await.unwrap();

    // Not representable as a pid, so the probe reports it dead.
    processes.register("DONE", Some(u32::MAX));

    let patrol = PatrolRunner::new(cache.clone(), pipelines.clone(), processes.clone());
    let report = patrol.run_patrol().await;
    assert_eq!(report.errors, 0);
    assert_eq!(report.cache_swept, 1);
    assert_eq!(report.pipelines_removed, 1);
    assert_eq!(report.processes_swept, 1);

    assert!(cache.has("FRESH").await.unwrap());
    assert!(pipelines.get("DONE").await.unwrap().is_none());
    assert!(pipelines.get("ACTIVE").await.unwrap().is_some());

    let again = patrol.run_patrol().await;
    assert_eq!(again.cache_swept + again.pipelines_removed + again.processes_swept, 0);
}

#[tokio::test]
async fn failed_cache_sweep_does_not_stop_other_sweeps() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("state");
    let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::open(&dir).await.unwrap());
    let cache = Arc::new(DedupCache::new(store.clone()));
    let pipelines = Arc::new(PipelineStore::new(store.clone()));
    let processes = Arc::new(ProcessRegistry::new());

    let past = Utc::now() - chrono::Duration::hours(3);
    let expired = CacheEntry::from_task(&task("OLD", "stale"), chrono::Duration::hours(1), past);
    store.try_insert_cache_entry(&expired, past).await.unwrap();
    processes.register("T1", Some(u32::MAX));

    // The state directory disappears, so the cache sweep cannot persist.
    std::fs::remove_dir_all(&dir).unwrap();
    std::fs::write(&dir, "").unwrap();

    let report = PatrolRunner::new(cache.clone(), pipelines, processes.clone())
        .run_patrol()
        .await;
    assert_eq!(report.errors, 1);
    assert_eq!(report.cache_swept, 0);
    assert_eq!(report.processes_swept, 1);
    assert!(store.get_cache_entry("OLD").await.unwrap().is_some());
}

// ===========================================================================
// Daemon
// ===========================================================================

fn config() -> Config {
    let mut config = Config::default();
    config.github.owner = common::OWNER.into();
    config.github.repo = common::REPO.into();
    config
}

fn hourly() -> DaemonIntervals {
    let hour = Duration::from_secs(3600);
    DaemonIntervals {
        intake: hour,
        pr_discovery: hour,
        review: hour,
        patrol: hour,
    }
}

#[test]
fn intervals_follow_config() {
    let mut config = config();
    config.intake.poll_interval_secs = 15;
    let intervals = DaemonIntervals::from_config(&config);
    assert_eq!(intervals.intake, Duration::from_secs(15));
    assert_eq!(intervals.review, config.review.poll_interval());
}

#[tokio::test]
async fn daemon_runs_first_tick_and_stops_on_shutdown() {
    let store: Arc<dyn StateStore> = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let tracker = Arc::new(MockTracker::with_tasks(vec![task("T1", "Add login")]));
    let host = Arc::new(MockHost::default());
    let agents = Agents::happy("feat/t1");

    let daemon = Arc::new(
        Daemon::new(
            &config(),
            store.clone(),
            tracker.clone(),
            host,
            agents.agent_set(),
        )
        .with_intervals(hourly()),
    );
    let shutdown = daemon.shutdown_signal();

    let running = {
        let daemon = daemon.clone();
        tokio::spawn(async move { daemon.run().await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while tracker.fetches.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("intake never polled");

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("daemon did not stop")
        .unwrap();
    assert!(shutdown.is_shutting_down());

    // The in-flight intake tick finished before the loop exited.
    let pipeline = store.load_pipeline("T1").await.unwrap().unwrap();
    assert_eq!(pipeline.status, PipelineStatus::InProgress);
    assert!(store.load_pr_tracking("T1").await.unwrap().is_some());
    assert_eq!(agents.implementation.calls(), 1);
}

#[tokio::test]
async fn daemon_started_after_shutdown_returns_promptly() {
    let store: Arc<dyn StateStore> = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let tracker = Arc::new(MockTracker::default());
    let agents = Agents::happy("feat/t1");
    let daemon = Daemon::new(
        &config(),
        store,
        tracker,
        Arc::new(MockHost::default()),
        agents.agent_set(),
    )
    .with_intervals(hourly());

    daemon.shutdown_signal().trigger();
    tokio::time::timeout(Duration::from_secs(10), daemon.run())
        .await
        .expect("daemon did not stop");
}
