use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use streak_types::events::FeedFilter;
use streak_types::models::Message;

use crate::aggregator::NotificationAggregator;
use crate::config::ReconnectConfig;
use crate::feed::ChangeFeed;
use crate::store::MessageStore;
use crate::supervisor::{ReconnectSupervisor, SupervisorEvent, SupervisorStatus};
use crate::unread::UnreadTracker;

/// Notification state for the signed-in user.
///
/// Built once by the application and handed to whoever needs it. Between
/// [`start`](Self::start) and [`stop`](Self::stop) it keeps an inbox
/// subscription supervised, feeds its events into the unread tracker and
/// reconciles against storage after every (re)subscribe.
pub struct NotificationService {
    feed: Arc<dyn ChangeFeed>,
    tracker: Arc<UnreadTracker>,
    config: ReconnectConfig,
    messages_tx: broadcast::Sender<Message>,
    session: Mutex<Option<Session>>,
}

struct Session {
    user_id: Uuid,
    supervisor: ReconnectSupervisor,
    pump: JoinHandle<()>,
}

impl NotificationService {
    pub fn new(feed: Arc<dyn ChangeFeed>, store: Arc<dyn MessageStore>, config: ReconnectConfig) -> Self {
        let (messages_tx, _) = broadcast::channel(256);
        Self {
            feed,
            tracker: Arc::new(UnreadTracker::new(store)),
            config,
            messages_tx,
            session: Mutex::new(None),
        }
    }

    /// Begin tracking for `user_id`. A running session for another user is
    /// stopped first.
    pub async fn start(&self, user_id: Uuid) {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            Self::end(previous, &self.tracker).await;
        }

        self.tracker.begin(user_id);
        let (supervisor, events) = ReconnectSupervisor::spawn(
            self.feed.clone(),
            FeedFilter::Inbox { user_id },
            self.config.clone(),
        );
        let pump = tokio::spawn(pump_events(
            events,
            self.tracker.clone(),
            self.messages_tx.clone(),
        ));

        info!("Notifications started for {}", user_id);
        *session = Some(Session {
            user_id,
            supervisor,
            pump,
        });
    }

    /// Close the subscription and forget all unread state.
    pub async fn stop(&self) {
        if let Some(session) = self.session.lock().await.take() {
            Self::end(session, &self.tracker).await;
        }
    }

    pub fn aggregator(&self) -> NotificationAggregator {
        NotificationAggregator::new(self.tracker.clone())
    }

    pub fn tracker(&self) -> Arc<UnreadTracker> {
        self.tracker.clone()
    }

    /// Live messages for chat rendering, including ones the user sent.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.messages_tx.subscribe()
    }

    pub async fn connection_status(&self) -> Option<SupervisorStatus> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.supervisor.status())
    }

    /// Manual reconnect, e.g. after the connection reported `Failed`.
    pub async fn reconnect(&self) {
        if let Some(session) = self.session.lock().await.as_ref() {
            session.supervisor.reconnect();
        }
    }

    async fn end(session: Session, tracker: &UnreadTracker) {
        session.supervisor.shutdown().await;
        session.pump.abort();
        tracker.clear();
        info!("Notifications stopped for {}", session.user_id);
    }
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
    tracker: Arc<UnreadTracker>,
    messages_tx: broadcast::Sender<Message>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SupervisorEvent::Subscribed { target } => {
                // Changes made while disconnected were not delivered.
                if let Err(e) = tracker.reconcile().await {
                    warn!("Reconcile after subscribing to {} failed: {}", target, e);
                }
            }
            SupervisorEvent::Change(change) => {
                let message = change.message;
                if !tracker.record_incoming(&message) && tracker.is_unknown_group(&message) {
                    // Added to the group since the last reconcile.
                    if let Err(e) = tracker.reconcile().await {
                        warn!("Reconcile for new group {:?} failed: {}", message.recipient, e);
                    }
                }
                let _ = messages_tx.send(message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedStatus;
    use crate::supervisor::ConnectionState;
    use crate::testing::{MemoryStore, MockFeed, message_at};
    use chrono::Utc;
    use streak_types::events::ChangeEvent;
    use streak_types::models::{ConversationKey, Recipient};

    #[tokio::test(start_paused = true)]
    async fn start_reconcile_receive_read_stop() {
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let group = ConversationKey::Group(Uuid::new_v4());
        let (feed, mut opens) = MockFeed::new();
        let store = Arc::new(MemoryStore::default());
        store.add_member(group, me, None);
        store.add_message(message_at(peer, Recipient::Conversation(group.id()), Utc::now()));

        let service = NotificationService::new(feed.clone(), store.clone(), ReconnectConfig::default());
        let aggregator = service.aggregator();
        let mut watch = aggregator.watch();
        let mut live = service.subscribe_messages();

        service.start(me).await;
        let opened = opens.recv().await.unwrap();
        assert_eq!(opened.filter, FeedFilter::Inbox { user_id: me });

        // Subscribing triggers a reconcile which finds the group message.
        opened.sink.on_status(FeedStatus::Subscribed);
        watch.wait_for(true).await.unwrap();
        assert!(service.tracker().snapshot().is_unread(&group));

        aggregator.mark_messages_as_read().await.unwrap();
        assert!(!aggregator.has_new_messages());

        let incoming = message_at(peer, Recipient::User(me), Utc::now());
        opened.sink.on_event(ChangeEvent {
            message: incoming.clone(),
            commit_timestamp: Utc::now(),
        });
        watch.wait_for(true).await.unwrap();
        assert_eq!(live.recv().await.unwrap(), incoming);
        assert!(service.tracker().snapshot().is_unread(&ConversationKey::Direct(peer)));

        let status = service.connection_status().await.unwrap();
        assert_eq!(status.state, ConnectionState::Subscribed);

        service.stop().await;
        assert!(opened.is_closed());
        assert_eq!(feed.live(), 0);
        assert!(!aggregator.has_new_messages());
        assert!(service.connection_status().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_after_gap_reconciles_missed_messages() {
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let (feed, mut opens) = MockFeed::new();
        let store = Arc::new(MemoryStore::default());
        let service = NotificationService::new(feed.clone(), store.clone(), ReconnectConfig::default());
        let mut watch = service.aggregator().watch();

        service.start(me).await;
        let first = opens.recv().await.unwrap();
        first.sink.on_status(FeedStatus::Subscribed);
        first.sink.on_status(FeedStatus::Error);

        // Sent while we were disconnected; never delivered as an event.
        store.add_member(ConversationKey::Direct(peer), me, None);
        store.add_message(message_at(peer, Recipient::User(me), Utc::now()));

        let second = opens.recv().await.unwrap();
        assert!(first.is_closed());
        second.sink.on_status(FeedStatus::Subscribed);

        watch.wait_for(true).await.unwrap();
        assert!(service.tracker().snapshot().is_unread(&ConversationKey::Direct(peer)));
        service.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn message_from_newly_joined_group_triggers_reconcile() {
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let group = ConversationKey::Group(Uuid::new_v4());
        let (feed, mut opens) = MockFeed::new();
        let store = Arc::new(MemoryStore::default());
        let service = NotificationService::new(feed, store.clone(), ReconnectConfig::default());
        let mut watch = service.aggregator().watch();

        service.start(me).await;
        let opened = opens.recv().await.unwrap();
        opened.sink.on_status(FeedStatus::Subscribed);

        // Membership exists in storage but the tracker has not seen it.
        let message = message_at(peer, Recipient::Conversation(group.id()), Utc::now());
        store.add_member(group, me, None);
        store.add_message(message.clone());
        opened.sink.on_event(ChangeEvent {
            message,
            commit_timestamp: Utc::now(),
        });

        watch.wait_for(true).await.unwrap();
        assert!(service.tracker().snapshot().is_unread(&group));
        service.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_for_another_user_replaces_session() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (feed, mut opens) = MockFeed::new();
        let store = Arc::new(MemoryStore::default());
        let service = NotificationService::new(feed.clone(), store, ReconnectConfig::default());

        service.start(alice).await;
        let first = opens.recv().await.unwrap();
        first.sink.on_event(ChangeEvent {
            message: message_at(bob, Recipient::User(alice), Utc::now()),
            commit_timestamp: Utc::now(),
        });

        service.start(bob).await;
        let second = opens.recv().await.unwrap();
        assert!(first.is_closed());
        assert_eq!(second.filter, FeedFilter::Inbox { user_id: bob });
        assert_eq!(feed.max_live(), 1);
        assert_eq!(service.tracker().snapshot().owner(), Some(bob));
        assert!(!service.aggregator().has_new_messages());

        service.stop().await;
    }
}
