//! Shutdown coordination for the proxy.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::net::connection::SessionTracker;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// A future that resolves once shutdown is triggered.
    pub fn signalled(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.subscribe();
        async move {
            let _ = rx.recv().await;
        }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for live sessions to finish, giving up after `grace`.
/// Returns true if every session drained.
pub async fn drain_sessions(tracker: &SessionTracker, grace: Duration) -> bool {
    match tokio::time::timeout(grace, tracker.wait_for_drain()).await {
        Ok(()) => true,
        Err(_) => {
            tracing::warn!(
                active_sessions = tracker.active_count(),
                "Sessions still active after shutdown grace period"
            );
            false
        }
    }
}
