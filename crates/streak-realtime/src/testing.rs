//! In-process doubles for the feed and storage collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use streak_types::events::{ChangeEvent, FeedFilter};
use streak_types::models::{ConversationKey, ConversationMember, Message, Recipient};

use crate::feed::{ChangeFeed, FeedHandle, FeedSink};
use crate::store::{MessageStore, StoreError};

/// A subscription opened through [`MockFeed`]. The test drives it through
/// `sink`.
pub struct Opened {
    pub filter: FeedFilter,
    pub sink: FeedSink,
    pub at: Instant,
    closed: Arc<AtomicBool>,
}

impl Opened {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct MockFeed {
    opens_tx: mpsc::UnboundedSender<Opened>,
    live: Arc<AtomicUsize>,
    max_live: AtomicUsize,
    opened: AtomicUsize,
}

impl MockFeed {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Opened>) {
        let (opens_tx, opens_rx) = mpsc::unbounded_channel();
        let feed = Arc::new(Self {
            opens_tx,
            live: Arc::new(AtomicUsize::new(0)),
            max_live: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
        });
        (feed, opens_rx)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl ChangeFeed for MockFeed {
    fn open(&self, filter: FeedFilter, sink: FeedSink) -> Box<dyn FeedHandle> {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        self.opened.fetch_add(1, Ordering::SeqCst);

        let closed = Arc::new(AtomicBool::new(false));
        let _ = self.opens_tx.send(Opened {
            filter,
            sink,
            at: Instant::now(),
            closed: closed.clone(),
        });

        Box::new(MockHandle {
            closed,
            live: self.live.clone(),
        })
    }
}

struct MockHandle {
    closed: Arc<AtomicBool>,
    live: Arc<AtomicUsize>,
}

impl FeedHandle for MockHandle {
    fn close(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.close();
    }
}

pub fn message_at(sender: Uuid, recipient: Recipient, created_at: DateTime<Utc>) -> Message {
    Message {
        id: Uuid::new_v4(),
        sender_id: sender,
        recipient,
        content: Some("day 12 done".into()),
        challenge_id: None,
        created_at,
        read_at: None,
    }
}

pub fn change_from(sender: Uuid, receiver: Uuid) -> ChangeEvent {
    ChangeEvent {
        message: message_at(sender, Recipient::User(receiver), Utc::now()),
        commit_timestamp: Utc::now(),
    }
}

/// In-memory store with switchable failure.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    failing: AtomicBool,
}

#[derive(Default)]
struct MemoryInner {
    members: HashMap<(ConversationKey, Uuid), Option<DateTime<Utc>>>,
    messages: Vec<Message>,
}

impl MemoryStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn add_member(&self, conversation: ConversationKey, user_id: Uuid, last_read_at: Option<DateTime<Utc>>) {
        self.inner
            .lock()
            .unwrap()
            .members
            .insert((conversation, user_id), last_read_at);
    }

    pub fn add_message(&self, message: Message) {
        self.inner.lock().unwrap().messages.push(message);
    }

    pub fn last_read_at(&self, conversation: ConversationKey, user_id: Uuid) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .unwrap()
            .members
            .get(&(conversation, user_id))
            .copied()
            .flatten()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Backend("store unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn query_messages(
        &self,
        user_id: Uuid,
        conversation: ConversationKey,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.conversation_for(user_id) == Some(conversation))
            .filter(|m| after.is_none_or(|after| m.created_at > after))
            .cloned()
            .collect())
    }

    async fn update_last_read_at(
        &self,
        conversation: ConversationKey,
        user_id: Uuid,
        read_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner
            .lock()
            .unwrap()
            .members
            .insert((conversation, user_id), Some(read_at));
        Ok(())
    }

    async fn list_conversation_memberships(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ConversationMember>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().unwrap();
        let mut members: Vec<ConversationMember> = inner
            .members
            .iter()
            .filter(|((_, uid), _)| *uid == user_id)
            .map(|((conversation, uid), last_read_at)| ConversationMember {
                conversation: *conversation,
                user_id: *uid,
                last_read_at: *last_read_at,
            })
            .collect();
        members.sort_by_key(|m| m.conversation);
        Ok(members)
    }
}
