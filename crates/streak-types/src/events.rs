use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, Recipient};

/// Predicate selecting which message rows a change-feed subscription
/// receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "filter", rename_all = "snake_case")]
pub enum FeedFilter {
    /// Direct messages sent to or by the user, plus messages in every group
    /// the user belongs to.
    Inbox { user_id: Uuid },

    /// One direct thread between two users, in either direction.
    Direct { user_id: Uuid, peer_id: Uuid },

    /// One group conversation.
    Group { conversation_id: Uuid },
}

impl FeedFilter {
    /// Returns true if `message` passes this filter. `groups` is the set of
    /// group conversations the subscriber belongs to; only `Inbox` uses it.
    pub fn matches(&self, message: &Message, groups: &HashSet<Uuid>) -> bool {
        match (*self, message.recipient) {
            (Self::Inbox { user_id }, Recipient::User(receiver)) => {
                receiver == user_id || message.sender_id == user_id
            }
            (Self::Inbox { .. }, Recipient::Conversation(id)) => groups.contains(&id),
            (Self::Direct { user_id, peer_id }, Recipient::User(receiver)) => {
                (message.sender_id == user_id && receiver == peer_id)
                    || (message.sender_id == peer_id && receiver == user_id)
            }
            (Self::Group { conversation_id }, Recipient::Conversation(id)) => {
                conversation_id == id
            }
            _ => false,
        }
    }
}

impl fmt::Display for FeedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbox { user_id } => write!(f, "inbox:{}", user_id),
            Self::Direct { user_id, peer_id } => write!(f, "dm:{}<->{}", user_id, peer_id),
            Self::Group { conversation_id } => write!(f, "group:{}", conversation_id),
        }
    }
}

/// A row-level change pushed by the feed. Only message inserts are
/// published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub message: Message,
    pub commit_timestamp: DateTime<Utc>,
}

/// Events sent over the realtime gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FeedEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// The subscription is live; changes matching `filter` follow
    Subscribed { filter: FeedFilter },

    /// A row matching the active filter changed
    Change { event: ChangeEvent },

    /// The server rejected a command; the subscription is not live
    Error { message: String },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FeedCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Replace the connection's filter. A connection carries at most one.
    Subscribe { filter: FeedFilter },

    /// Drop the connection's filter without closing the socket
    Unsubscribe,
}

/// The first `max_chars` characters of a raw frame, for log lines.
pub fn frame_preview(text: &str, max_chars: usize) -> &str {
    text.char_indices()
        .nth(max_chars)
        .map_or(text, |(end, _)| &text[..end])
}
