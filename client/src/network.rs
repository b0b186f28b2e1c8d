//! Network Monitor: the one source of truth for connectivity.

use std::sync::Arc;
use tokio::sync::watch;

/// Connectivity flag shared between platform code and the coordinator.
///
/// Platform hooks call [`NetworkMonitor::set_online`]; the coordinator
/// watches the flag and flushes the mutation queue on every offline to
/// online transition.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Record connectivity. Returns `true` if it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(online, "Connectivity changed");
        }
        changed
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        NetworkMonitor::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transitions_wake_watchers() {
        let monitor = NetworkMonitor::new(false);
        let mut rx = monitor.subscribe();

        assert!(!monitor.set_online(false));
        assert!(monitor.set_online(true));
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(monitor.is_online());
    }
}
