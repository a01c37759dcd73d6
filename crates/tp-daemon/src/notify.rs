use std::sync::Arc;
use std::time::Duration;

use tp_core::ports::WorkTracker;
use tracing::{debug, warn};

/// Best-effort notifications to the work tracker.
///
/// Comments and status changes never fail the caller: errors and timeouts
/// are logged and dropped.
#[derive(Clone)]
pub struct Notifier {
    tracker: Arc<dyn WorkTracker>,
    timeout: Duration,
}

impl Notifier {
    pub fn new(tracker: Arc<dyn WorkTracker>, timeout: Duration) -> Self {
        Self { tracker, timeout }
    }

    /// Post a comment on the task. Returns whether it was delivered.
    pub async fn comment(&self, task_id: &str, text: &str) -> bool {
        match tokio::time::timeout(self.timeout, self.tracker.add_comment(task_id, text)).await {
            Ok(Ok(())) => {
                debug!(task_id, "comment posted");
                true
            }
            Ok(Err(e)) => {
                warn!(task_id, error = %e, "failed to post comment");
                false
            }
            Err(_) => {
                warn!(task_id, timeout_secs = self.timeout.as_secs(), "comment timed out");
                false
            }
        }
    }

    /// Move the task to `status`. Returns whether the tracker accepted it.
    pub async fn set_status(&self, task_id: &str, status: &str) -> bool {
        match tokio::time::timeout(self.timeout, self.tracker.update_status(task_id, status)).await
        {
            Ok(Ok(())) => {
                debug!(task_id, status, "task status updated");
                true
            }
            Ok(Err(e)) => {
                warn!(task_id, status, error = %e, "failed to update task status");
                false
            }
            Err(_) => {
                warn!(task_id, status, "status update timed out");
                false
            }
        }
    }
}
