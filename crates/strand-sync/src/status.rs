use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::{info, warn};

use strand_types::models::{FeedQuery, PostId, UserId};

/// Background producer identity, used for stall reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Source {
    Push,
    NewMessages,
    ThreadList,
    Reconcile,
    History,
    FeedPage,
    Enrichment,
}

/// Observable health of background sync. Failures here never interrupt the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub push_connected: bool,
    pub stalled: BTreeSet<Source>,
    pub last_error: Option<String>,
}

impl SyncStatus {
    pub fn is_stalled(&self) -> bool {
        !self.stalled.is_empty()
    }
}

/// Notifications for the UI layer. Receivers re-read snapshots on demand.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncUpdate {
    ThreadsChanged,
    ActiveThreadChanged { peer: UserId },
    MessagesChanged { peer: UserId },
    /// Scroll the active chat pane; `force` bypasses the proximity check.
    Autoscroll { force: bool },
    FeedChanged { query: FeedQuery },
    ItemEnriched { post_id: PostId },
    BellCount { total: i64 },
    StatusChanged(SyncStatus),
}

/// Shared status plus the update fan-out every store publishes through.
pub struct StatusBoard {
    status: Mutex<SyncStatus>,
    updates: broadcast::Sender<SyncUpdate>,
}

impl StatusBoard {
    pub fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            status: Mutex::new(SyncStatus::default()),
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncUpdate> {
        self.updates.subscribe()
    }

    pub fn publish(&self, update: SyncUpdate) {
        let _ = self.updates.send(update);
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stall(&self, source: Source, error: impl ToString) {
        let error = error.to_string();
        warn!(?source, %error, "background sync failed");
        self.update(|status| {
            let changed = status.stalled.insert(source) || status.last_error.as_deref() != Some(&error);
            status.last_error = Some(error);
            changed
        });
    }

    pub fn recover(&self, source: Source) {
        self.update(|status| {
            let changed = status.stalled.remove(&source);
            if changed {
                info!(?source, "background sync recovered");
            }
            changed
        });
    }

    pub fn set_push_connected(&self, connected: bool) {
        self.update(|status| {
            let changed = status.push_connected != connected;
            status.push_connected = connected;
            changed
        });
    }

    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut SyncStatus) -> bool,
    {
        let snapshot = {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            if !f(&mut status) {
                return;
            }
            status.clone()
        };
        self.publish(SyncUpdate::StatusChanged(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stall_and_recover_publish_once() {
        let board = StatusBoard::new(16);
        let mut rx = board.subscribe();

        board.stall(Source::NewMessages, "timeout");
        board.recover(Source::NewMessages);
        board.recover(Source::NewMessages);

        let first = rx.try_recv().unwrap();
        match first {
            SyncUpdate::StatusChanged(status) => {
                assert!(status.stalled.contains(&Source::NewMessages));
                assert_eq!(status.last_error.as_deref(), Some("timeout"));
            }
            other => panic!("unexpected update {:?}", other),
        }
        assert!(matches!(rx.try_recv().unwrap(), SyncUpdate::StatusChanged(s) if !s.is_stalled()));
        assert!(rx.try_recv().is_err());
    }
}
