use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use streak_types::models::{ConversationKey, ConversationMember, Message};

use crate::store::{MessageStore, StoreError};

/// Unread messages per tracked conversation for one user.
///
/// Each conversation maps unread message ids to their creation time, so a
/// message delivered twice is still counted once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnreadState {
    owner: Option<Uuid>,
    conversations: BTreeMap<ConversationKey, BTreeMap<Uuid, DateTime<Utc>>>,
}

impl UnreadState {
    pub fn for_user(owner: Option<Uuid>) -> Self {
        Self {
            owner,
            conversations: BTreeMap::new(),
        }
    }

    pub fn owner(&self) -> Option<Uuid> {
        self.owner
    }

    pub fn is_tracked(&self, key: &ConversationKey) -> bool {
        self.conversations.contains_key(key)
    }

    pub fn is_unread(&self, key: &ConversationKey) -> bool {
        self.unread_count(key) > 0
    }

    pub fn unread_count(&self, key: &ConversationKey) -> usize {
        self.conversations.get(key).map_or(0, BTreeMap::len)
    }

    pub fn has_unread(&self) -> bool {
        self.conversations.values().any(|unread| !unread.is_empty())
    }

    pub fn unread_conversations(&self) -> impl Iterator<Item = ConversationKey> + '_ {
        self.conversations
            .iter()
            .filter(|(_, unread)| !unread.is_empty())
            .map(|(key, _)| *key)
    }

    /// Apply one incoming message. Returns true if the state changed.
    fn record(&mut self, message: &Message) -> bool {
        let Some(owner) = self.owner else {
            return false;
        };
        if message.sender_id == owner {
            return false;
        }
        let Some(key) = message.conversation_for(owner) else {
            return false;
        };

        let unread = match key {
            // A direct message to us opens the thread if we did not know it.
            ConversationKey::Direct(_) => self.conversations.entry(key).or_default(),
            ConversationKey::Group(_) => match self.conversations.get_mut(&key) {
                Some(unread) => unread,
                None => return false,
            },
        };
        unread.insert(message.id, message.created_at).is_none()
    }

    /// Drop unread entries created at or before `read_at`. Anything newer
    /// arrived while the read was being persisted and stays unread.
    fn mark_read_until(&mut self, key: &ConversationKey, read_at: DateTime<Utc>) -> bool {
        let Some(unread) = self.conversations.get_mut(key) else {
            return false;
        };
        let before = unread.len();
        unread.retain(|_, created_at| *created_at > read_at);
        unread.len() != before
    }
}

/// One conversation as loaded from storage for reconciliation.
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub member: ConversationMember,
    pub messages: Vec<Message>,
}

/// Recompute unread state from an authoritative snapshot.
///
/// A conversation is unread iff it holds a message from someone else
/// created after the member's `last_read_at` (the epoch when never read).
pub fn compute_unread(owner: Uuid, snapshot: &[ConversationSnapshot]) -> UnreadState {
    let mut state = UnreadState::for_user(Some(owner));

    for conversation in snapshot {
        let key = conversation.member.conversation;
        let last_read_at = conversation
            .member
            .last_read_at
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let unread = state.conversations.entry(key).or_default();
        for message in &conversation.messages {
            if message.sender_id != owner
                && message.created_at > last_read_at
                && message.conversation_for(owner) == Some(key)
            {
                unread.insert(message.id, message.created_at);
            }
        }
    }

    state
}

/// Maintains [`UnreadState`] from live events, read marks and periodic
/// reconciliation against the store.
///
/// State lives in a watch channel; every mutation is published in the same
/// step it is made.
///
/// A reconcile loads from the store while read marks may still land. Each
/// mark made during the load is logged against the reconcile and replayed
/// onto its result, so the snapshot is kept for every other conversation.
pub struct UnreadTracker {
    store: Arc<dyn MessageStore>,
    state: watch::Sender<UnreadState>,
    epoch: AtomicU64,
    /// Read marks made while each reconcile (keyed by epoch) was loading.
    in_flight: Mutex<HashMap<u64, Vec<(ConversationKey, DateTime<Utc>)>>>,
}

impl UnreadTracker {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        let (state, _) = watch::channel(UnreadState::default());
        Self {
            store,
            state,
            epoch: AtomicU64::new(0),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking for `user_id` with empty state.
    pub fn begin(&self, user_id: Uuid) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.reads().clear();
        self.state.send_replace(UnreadState::for_user(Some(user_id)));
    }

    /// Forget everything (logout).
    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.reads().clear();
        self.state.send_replace(UnreadState::default());
    }

    pub fn snapshot(&self) -> UnreadState {
        self.state.borrow().clone()
    }

    pub fn has_unread(&self) -> bool {
        self.state.borrow().has_unread()
    }

    pub fn subscribe(&self) -> watch::Receiver<UnreadState> {
        self.state.subscribe()
    }

    /// Mark the message's conversation unread if it came from someone else.
    /// Returns true if the state changed.
    pub fn record_incoming(&self, message: &Message) -> bool {
        self.state.send_if_modified(|state| state.record(message))
    }

    /// True for a message from someone else in a group we are not tracking
    /// yet, i.e. one we were added to after the last reconcile.
    pub fn is_unknown_group(&self, message: &Message) -> bool {
        let state = self.state.borrow();
        let Some(owner) = state.owner() else {
            return false;
        };
        match message.conversation_for(owner) {
            Some(key @ ConversationKey::Group(_)) => {
                message.sender_id != owner && !state.is_tracked(&key)
            }
            _ => false,
        }
    }

    /// Replace the state with one recomputed from `snapshot`. Any reconcile
    /// still in flight is superseded.
    pub fn recompute_from_snapshot(&self, snapshot: &[ConversationSnapshot]) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let Some(owner) = self.state.borrow().owner() else {
            return;
        };
        self.apply(compute_unread(owner, snapshot));
    }

    /// Reload memberships and messages since each `last_read_at` from the
    /// store and recompute. On failure the current state is kept.
    ///
    /// Read marks made while loading are applied on top of the result. A
    /// newer reconcile, `begin`, `clear` or explicit recompute supersedes it.
    pub async fn reconcile(&self) -> Result<(), StoreError> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(owner) = self.state.borrow().owner() else {
            return Ok(());
        };
        self.reads().insert(epoch, Vec::new());

        let loaded = self.load_snapshot(owner).await;

        let mut reads = self.reads();
        let marks = reads.remove(&epoch).unwrap_or_default();
        let snapshot = match loaded {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Unread reconcile for {} failed, keeping current state: {}", owner, e);
                return Err(e);
            }
        };

        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("Discarding superseded reconcile for {}", owner);
            return Ok(());
        }

        let mut computed = compute_unread(owner, &snapshot);
        for (key, read_at) in marks {
            computed.mark_read_until(&key, read_at);
        }
        self.apply(computed);
        Ok(())
    }

    /// Persist a read mark for `key`, then clear its unread entries. If
    /// persisting fails the conversation stays unread.
    pub async fn mark_read(&self, key: ConversationKey) -> Result<(), StoreError> {
        let Some(owner) = self.state.borrow().owner() else {
            return Ok(());
        };
        let read_at = Utc::now();

        if let Err(e) = self.store.update_last_read_at(key, owner, read_at).await {
            warn!("Failed to mark {} read for {}: {}", key, owner, e);
            return Err(e);
        }

        // Reconciles still loading may have read the old mark.
        let mut reads = self.reads();
        for marks in reads.values_mut() {
            marks.push((key, read_at));
        }
        self.state.send_if_modified(|state| {
            state.owner() == Some(owner) && state.mark_read_until(&key, read_at)
        });
        drop(reads);
        Ok(())
    }

    /// Mark every unread conversation read. Conversations whose read mark
    /// could not be persisted stay unread; the first error is returned.
    pub async fn mark_all_read(&self) -> Result<(), StoreError> {
        let keys: Vec<ConversationKey> = self.state.borrow().unread_conversations().collect();

        let mut first_error = None;
        for key in keys {
            if let Err(e) = self.mark_read(key).await {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn load_snapshot(&self, owner: Uuid) -> Result<Vec<ConversationSnapshot>, StoreError> {
        let members = self.store.list_conversation_memberships(owner).await?;

        let mut snapshot = Vec::with_capacity(members.len());
        for member in members {
            let messages = self
                .store
                .query_messages(owner, member.conversation, member.last_read_at)
                .await?;
            snapshot.push(ConversationSnapshot { member, messages });
        }
        Ok(snapshot)
    }

    fn reads(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Vec<(ConversationKey, DateTime<Utc>)>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, computed: UnreadState) {
        self.state.send_if_modified(|state| {
            if state.owner() != computed.owner() || *state == computed {
                false
            } else {
                *state = computed;
                true
            }
        });
    }
}
