use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Stop flag shared by the daemon, its loops and the ctrl-c handler.
///
/// Loops race [`ShutdownSignal::cancelled`] against their interval and leave
/// once it resolves; a tick already in progress runs to completion.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown. Returns `false` when it was already requested.
    pub fn trigger(&self) -> bool {
        let first = self
            .tx
            .send_if_modified(|stopping| !std::mem::replace(stopping, true));
        if first {
            info!("shutdown requested");
        }
        first
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once shutdown is requested, immediately if it already was.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on `true`.
        let _ = rx.wait_for(|stopping| *stopping).await;
    }
}
