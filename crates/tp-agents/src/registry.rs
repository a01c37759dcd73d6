//! Bookkeeping for externally spawned agent processes.
//!
//! Entries are grouped by task id. Liveness and termination go through a
//! [`ProcessProbe`] so tests can substitute a fake process table.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tp_core::types::{ProcessEntry, ProcessStatus};

/// Default interval between liveness checks in [`ProcessRegistry::wait_for_all`].
pub const DEFAULT_WAIT_POLL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// ProcessProbe
// ---------------------------------------------------------------------------

pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
    /// Ask the process to terminate. Returns `true` if the signal was delivered.
    fn terminate(&self, pid: u32) -> bool;
}

/// Probe backed by the operating system's process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

#[cfg(unix)]
impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // SAFETY: kill with signal 0 checks existence without sending a signal.
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn terminate(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // SAFETY: sending SIGTERM to a pid has no memory-safety implications.
        unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
    }
}

#[cfg(not(unix))]
impl ProcessProbe for SystemProbe {
    fn is_alive(&self, _pid: u32) -> bool {
        // Assume alive rather than settle processes we cannot observe.
        true
    }

    fn terminate(&self, _pid: u32) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// ProcessRegistry
// ---------------------------------------------------------------------------

/// Result of waiting on one registered process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitOutcome {
    pub pid: u32,
    pub completed: bool,
    pub timed_out: bool,
}

pub struct ProcessRegistry {
    entries: DashMap<String, Vec<ProcessEntry>>,
    probe: Arc<dyn ProcessProbe>,
    wait_poll: Duration,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            probe: Arc::new(SystemProbe),
            wait_poll: DEFAULT_WAIT_POLL,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_wait_poll(mut self, interval: Duration) -> Self {
        self.wait_poll = interval;
        self
    }

    /// Record a freshly launched process for `task_id`.
    pub fn register(&self, task_id: &str, pid: Option<u32>) -> ProcessEntry {
        let entry = ProcessEntry::running(pid, Utc::now());
        self.entries
            .entry(task_id.to_string())
            .or_default()
            .push(entry.clone());
        debug!(task_id, ?pid, "process registered");
        entry
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.probe.is_alive(pid)
    }

    /// Send a termination signal. Matching running entries are marked failed.
    pub fn kill(&self, pid: u32) -> bool {
        let delivered = self.probe.terminate(pid);
        if delivered {
            let now = Utc::now();
            for mut list in self.entries.iter_mut() {
                for entry in list.iter_mut() {
                    if entry.pid == Some(pid) && entry.is_running() {
                        entry.mark_failed("killed", now);
                    }
                }
            }
            info!(pid, "process killed");
        } else {
            warn!(pid, "failed to signal process");
        }
        delivered
    }

    pub fn mark_completed(&self, task_id: &str, pid: u32) -> bool {
        self.update_running(task_id, Some(pid), |e, now| e.mark_completed(now)) > 0
    }

    pub fn mark_failed(&self, task_id: &str, pid: u32, error: &str) -> bool {
        self.update_running(task_id, Some(pid), |e, now| e.mark_failed(error, now)) > 0
    }

    /// Close out every still-running entry of `task_id`: completed when
    /// `error` is `None`, failed otherwise. Returns how many were settled.
    pub fn settle(&self, task_id: &str, error: Option<&str>) -> usize {
        self.update_running(task_id, None, |e, now| match error {
            None => e.mark_completed(now),
            Some(err) => e.mark_failed(err, now),
        })
    }

    fn update_running<F>(&self, task_id: &str, pid: Option<u32>, mut f: F) -> usize
    where
        F: FnMut(&mut ProcessEntry, chrono::DateTime<Utc>),
    {
        let now = Utc::now();
        let Some(mut list) = self.entries.get_mut(task_id) else {
            return 0;
        };
        let mut updated = 0;
        for entry in list.iter_mut() {
            if entry.is_running() && (pid.is_none() || entry.pid == pid) {
                f(entry, now);
                updated += 1;
            }
        }
        updated
    }

    pub fn entries(&self, task_id: &str) -> Vec<ProcessEntry> {
        self.entries
            .get(task_id)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    /// Drop all bookkeeping for `task_id`.
    pub fn remove_task(&self, task_id: &str) -> usize {
        self.entries
            .remove(task_id)
            .map(|(_, list)| list.len())
            .unwrap_or(0)
    }

    /// Poll until every registered process of `task_id` has exited or
    /// `timeout` elapses. Entries without a pid cannot be checked and are
    /// left out of the result.
    pub async fn wait_for_all(&self, task_id: &str, timeout: Duration) -> Vec<WaitOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Utc::now();
            let mut pending = 0;
            if let Some(mut list) = self.entries.get_mut(task_id) {
                for entry in list.iter_mut().filter(|e| e.is_running()) {
                    match entry.pid {
                        Some(pid) if !self.probe.is_alive(pid) => entry.mark_completed(now),
                        Some(_) => pending += 1,
                        None => {}
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if pending == 0 || remaining.is_zero() {
                break;
            }
            tokio::time::sleep(self.wait_poll.min(remaining)).await;
        }

        let timed_out = Instant::now() >= deadline;
        let outcomes: Vec<WaitOutcome> = self
            .entries(task_id)
            .into_iter()
            .filter_map(|e| {
                let completed = e.status != ProcessStatus::Running;
                e.pid.map(|pid| WaitOutcome {
                    pid,
                    completed,
                    timed_out: !completed && timed_out,
                })
            })
            .collect();
        debug!(
            task_id,
            total = outcomes.len(),
            timed_out = outcomes.iter().filter(|o| o.timed_out).count(),
            "wait finished"
        );
        outcomes
    }

    /// Mark running entries whose process is gone as completed.
    pub fn sweep_dead(&self) -> usize {
        let now = Utc::now();
        let mut swept = 0;
        for mut list in self.entries.iter_mut() {
            for entry in list.iter_mut().filter(|e| e.is_running()) {
                if let Some(pid) = entry.pid {
                    if !self.probe.is_alive(pid) {
                        entry.mark_completed(now);
                        swept += 1;
                    }
                }
            }
        }
        if swept > 0 {
            info!(swept, "marked dead processes completed");
        }
        swept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Fake process table: pids in the set are alive.
    #[derive(Default)]
    struct FakeProbe {
        alive: Mutex<HashSet<u32>>,
    }

    impl FakeProbe {
        fn spawn(&self, pid: u32) {
            self.alive.lock().unwrap().insert(pid);
        }

        fn exit(&self, pid: u32) {
            self.alive.lock().unwrap().remove(&pid);
        }
    }

    impl ProcessProbe for FakeProbe {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }

        fn terminate(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().remove(&pid)
        }
    }

    fn registry(probe: Arc<FakeProbe>) -> ProcessRegistry {
        ProcessRegistry::new()
            .with_probe(probe)
            .with_wait_poll(Duration::from_millis(10))
    }

    #[test]
    fn register_stamps_running() {
        let reg = ProcessRegistry::new();
        let entry = reg.register("T1", Some(42));
        assert_eq!(entry.status, ProcessStatus::Running);
        assert_eq!(entry.pid, Some(42));
        reg.register("T1", None);
        assert_eq!(reg.entries("T1").len(), 2);
        assert!(reg.entries("T2").is_empty());
    }

    #[test]
    fn sweep_marks_only_dead_processes() {
        let probe = Arc::new(FakeProbe::default());
        probe.spawn(1);
        probe.spawn(2);
        let reg = registry(probe.clone());
        reg.register("T1", Some(1));
        reg.register("T2", Some(2));
        reg.register("T2", None);

        probe.exit(2);
        assert_eq!(reg.sweep_dead(), 1);
        assert_eq!(reg.sweep_dead(), 0);

        let t2 = reg.entries("T2");
        assert_eq!(t2[0].status, ProcessStatus::Completed);
        assert!(t2[0].completed_at.is_some());
        assert_eq!(t2[1].status, ProcessStatus::Running);
        assert!(reg.entries("T1")[0].is_running());
    }

    #[test]
    fn kill_marks_entry_failed() {
        let probe = Arc::new(FakeProbe::default());
        probe.spawn(7);
        let reg = registry(probe.clone());
        reg.register("T1", Some(7));

        assert!(reg.kill(7));
        assert!(!reg.is_alive(7));
        let entry = &reg.entries("T1")[0];
        assert_eq!(entry.status, ProcessStatus::Failed);
        assert_eq!(entry.error.as_deref(), Some("killed"));
        assert!(!reg.kill(7));
    }

    #[test]
    fn settle_closes_running_entries() {
        let reg = ProcessRegistry::new();
        reg.register("T1", Some(10));
        reg.register("T1", None);
        assert!(reg.mark_completed("T1", 10));
        assert_eq!(reg.settle("T1", Some("agent crashed")), 1);
        let entries = reg.entries("T1");
        assert_eq!(entries[0].status, ProcessStatus::Completed);
        assert_eq!(entries[1].status, ProcessStatus::Failed);
        assert_eq!(entries[1].error.as_deref(), Some("agent crashed"));
        assert_eq!(reg.settle("T1", None), 0);
        assert_eq!(reg.remove_task("T1"), 2);
        assert!(reg.entries("T1").is_empty());
    }

    #[test]
    fn mark_failed_targets_pid() {
        let reg = ProcessRegistry::new();
        reg.register("T1", Some(1));
        reg.register("T1", Some(2));
        assert!(reg.mark_failed("T1", 2, "exit 1"));
        assert!(!reg.mark_failed("T1", 3, "exit 1"));
        let entries = reg.entries("T1");
        assert!(entries[0].is_running());
        assert_eq!(entries[1].status, ProcessStatus::Failed);
    }

    #[tokio::test]
    async fn wait_for_all_returns_when_processes_exit() {
        let probe = Arc::new(FakeProbe::default());
        probe.spawn(1);
        let reg = Arc::new(registry(probe.clone()));
        reg.register("T1", Some(1));

        let waiter = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.wait_for_all("T1", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        probe.exit(1);

        let outcomes = waiter.await.unwrap();
        assert_eq!(
            outcomes,
            vec![WaitOutcome {
                pid: 1,
                completed: true,
                timed_out: false
            }]
        );
    }

    #[tokio::test]
    async fn wait_for_all_times_out() {
        let probe = Arc::new(FakeProbe::default());
        probe.spawn(1);
        probe.spawn(2);
        let reg = registry(probe.clone());
        reg.register("T1", Some(1));
        reg.register("T1", Some(2));
        probe.exit(2);

        let outcomes = reg.wait_for_all("T1", Duration::from_millis(50)).await;
        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].completed && outcomes[0].timed_out);
        assert!(outcomes[1].completed && !outcomes[1].timed_out);
    }

    #[tokio::test]
    async fn wait_skips_entries_without_pid() {
        let probe = Arc::new(FakeProbe::default());
        probe.spawn(7);
        let reg = registry(probe.clone());
        reg.register("T1", None);
        reg.register("T1", Some(7));
        probe.exit(7);

        let outcomes = reg.wait_for_all("T1", Duration::from_secs(1)).await;
        assert_eq!(
            outcomes,
            vec![WaitOutcome {
                pid: 7,
                completed: true,
                timed_out: false
            }]
        );

        reg.register("T2", None);
        assert!(reg.wait_for_all("T2", Duration::from_millis(20)).await.is_empty());
    }

    #[tokio::test]
    async fn wait_for_unknown_task_is_empty() {
        let reg = ProcessRegistry::new();
        assert!(reg.wait_for_all("nope", Duration::from_secs(1)).await.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn system_probe_sees_current_process() {
        assert!(SystemProbe.is_alive(std::process::id()));
    }
}
