use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

use streak_types::events::ChangeEvent;

/// Out-of-band updates for one user's connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotice {
    /// The user was enrolled in a group after subscribing.
    JoinedGroup(Uuid),
}

/// Fans change events out to every connected subscriber.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Every committed change; each connection filters for itself
    changes_tx: broadcast::Sender<ChangeEvent>,

    /// Per-user notice channels: user_id -> (conn_id -> sender)
    user_channels: RwLock<HashMap<Uuid, HashMap<Uuid, mpsc::UnboundedSender<ConnectionNotice>>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                changes_tx,
                user_channels: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.changes_tx.subscribe()
    }

    /// Publish a committed change to all connections.
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.inner.changes_tx.send(event);
    }

    /// Register a connection for `user_id`. Returns (conn_id, receiver).
    pub async fn register_connection(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<ConnectionNotice>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .user_channels
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(conn_id, tx);
        (conn_id, rx)
    }

    pub async fn unregister_connection(&self, user_id: Uuid, conn_id: Uuid) {
        let mut channels = self.inner.user_channels.write().await;
        if let Some(conns) = channels.get_mut(&user_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                channels.remove(&user_id);
            }
        }
    }

    /// Send a notice to every connection of `user_id`.
    pub async fn notify_user(&self, user_id: Uuid, notice: ConnectionNotice) {
        let channels = self.inner.user_channels.read().await;
        if let Some(conns) = channels.get(&user_id) {
            for tx in conns.values() {
                let _ = tx.send(notice.clone());
            }
        }
    }

    pub async fn connection_count(&self, user_id: Uuid) -> usize {
        self.inner
            .user_channels
            .read()
            .await
            .get(&user_id)
            .map_or(0, HashMap::len)
    }
}
