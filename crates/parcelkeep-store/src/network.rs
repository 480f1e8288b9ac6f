// ABOUTME: Tracks online/offline state and broadcasts transitions to interested tasks.
// ABOUTME: Going offline never fails a write; it only routes remote writes into the sync queue.

use tokio::sync::watch;

/// Shared online flag. Clones observe and update the same state.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record a connectivity change. Returns true when the state actually flipped.
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
            tracing::info!(online, "network state changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transitions_are_observed() {
        let monitor = NetworkMonitor::new(false);
        let mut rx = monitor.subscribe();

        assert!(!monitor.is_online());
        assert!(monitor.set_online(true));
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        // Same state again is not a transition.
        assert!(!monitor.set_online(true));
        assert!(!rx.has_changed().unwrap());
    }
}
