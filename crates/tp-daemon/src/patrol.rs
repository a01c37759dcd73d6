use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tp_agents::registry::ProcessRegistry;
use tp_core::dedup::DedupCache;
use tp_core::pipeline_store::PipelineStore;

/// Result of a single patrol sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatrolReport {
    /// Expired dedup cache entries removed.
    pub cache_swept: usize,
    /// Terminal pipelines older than the retention window removed.
    pub pipelines_removed: usize,
    /// Registered processes found dead and marked completed.
    pub processes_swept: usize,
    /// Sweeps that failed; the others still ran.
    pub errors: usize,
    pub timestamp: DateTime<Utc>,
}

/// Periodic housekeeping over the cache, the pipelines and the process
/// registry.
pub struct PatrolRunner {
    cache: Arc<DedupCache>,
    pipelines: Arc<PipelineStore>,
    processes: Arc<ProcessRegistry>,
    pipeline_max_age: ChronoDuration,
}

impl PatrolRunner {
    /// Pipelines are retained for 30 days by default.
    pub fn new(
        cache: Arc<DedupCache>,
        pipelines: Arc<PipelineStore>,
        processes: Arc<ProcessRegistry>,
    ) -> Self {
        Self {
            cache,
            pipelines,
            processes,
            pipeline_max_age: ChronoDuration::days(30),
        }
    }

    pub fn with_pipeline_max_age(mut self, max_age: ChronoDuration) -> Self {
        self.pipeline_max_age = max_age;
        self
    }

    pub async fn run_patrol(&self) -> PatrolReport {
        debug!("patrol sweep starting");
        let mut errors = 0;

        let cache_swept = self.cache.sweep_expired().await.unwrap_or_else(|e| {
            warn!(error = %e, "dedup cache sweep failed");
            errors += 1;
            0
        });
        let pipelines_removed = self
            .pipelines
            .cleanup(self.pipeline_max_age)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "pipeline cleanup failed");
                errors += 1;
                0
            });
        let processes_swept = self.processes.sweep_dead();

        let report = PatrolReport {
            cache_swept,
            pipelines_removed,
            processes_swept,
            errors,
            timestamp: Utc::now(),
        };
        if cache_swept + pipelines_removed + processes_swept > 0 {
            info!(
                cache_swept,
                pipelines_removed, processes_swept, "patrol sweep removed stale state"
            );
        }
        report
    }
}
