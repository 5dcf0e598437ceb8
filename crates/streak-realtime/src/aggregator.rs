use std::sync::Arc;

use tokio::sync::watch;

use crate::store::StoreError;
use crate::unread::{UnreadState, UnreadTracker};

/// Single "has new messages" flag over every tracked conversation.
///
/// Holds no state of its own: the flag is read straight from the tracker,
/// so it can never disagree with it.
#[derive(Clone)]
pub struct NotificationAggregator {
    tracker: Arc<UnreadTracker>,
}

impl NotificationAggregator {
    pub fn new(tracker: Arc<UnreadTracker>) -> Self {
        Self { tracker }
    }

    pub fn has_new_messages(&self) -> bool {
        self.tracker.has_unread()
    }

    /// Follow the flag as the tracker changes.
    pub fn watch(&self) -> NotificationWatch {
        NotificationWatch {
            rx: self.tracker.subscribe(),
        }
    }

    /// Bulk mark-read across all conversations. The flag drops to `false`
    /// unless a read mark failed to persist.
    pub async fn mark_messages_as_read(&self) -> Result<(), StoreError> {
        self.tracker.mark_all_read().await
    }
}

pub struct NotificationWatch {
    rx: watch::Receiver<UnreadState>,
}

impl NotificationWatch {
    pub fn has_new_messages(&self) -> bool {
        self.rx.borrow().has_unread()
    }

    /// Wait for the next tracker change and return the flag. Returns `None`
    /// once the tracker is gone.
    pub async fn changed(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().has_unread())
    }

    /// Wait until the flag equals `value`.
    pub async fn wait_for(&mut self, value: bool) -> Option<()> {
        self.rx
            .wait_for(|state| state.has_unread() == value)
            .await
            .ok()
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryStore, message_at};
    use chrono::Utc;
    use streak_types::models::Recipient;
    use uuid::Uuid;

    #[tokio::test]
    async fn flag_follows_tracker_and_clears_on_bulk_read() {
        let me = Uuid::new_v4();
        let store = Arc::new(MemoryStore::default());
        let tracker = Arc::new(UnreadTracker::new(store.clone()));
        tracker.begin(me);
        let aggregator = NotificationAggregator::new(tracker.clone());
        let mut watch = aggregator.watch();

        assert!(!aggregator.has_new_messages());

        for _ in 0..2 {
            tracker.record_incoming(&message_at(Uuid::new_v4(), Recipient::User(me), Utc::now()));
        }
        assert!(aggregator.has_new_messages());
        assert_eq!(watch.changed().await, Some(true));

        aggregator.mark_messages_as_read().await.unwrap();
        assert!(!aggregator.has_new_messages());
        assert!(!watch.has_new_messages());

        // Only a new qualifying message raises it again.
        tracker.record_incoming(&message_at(me, Recipient::User(Uuid::new_v4()), Utc::now()));
        assert!(!aggregator.has_new_messages());
        tracker.record_incoming(&message_at(Uuid::new_v4(), Recipient::User(me), Utc::now()));
        assert!(aggregator.has_new_messages());
        watch.wait_for(true).await.unwrap();
    }

    #[tokio::test]
    async fn failed_bulk_read_keeps_flag_up() {
        let me = Uuid::new_v4();
        let store = Arc::new(MemoryStore::default());
        let tracker = Arc::new(UnreadTracker::new(store.clone()));
        tracker.begin(me);
        let aggregator = NotificationAggregator::new(tracker.clone());

        tracker.record_incoming(&message_at(Uuid::new_v4(), Recipient::User(me), Utc::now()));
        store.set_failing(true);
        assert!(aggregator.mark_messages_as_read().await.is_err());
        assert!(aggregator.has_new_messages());
    }
}
