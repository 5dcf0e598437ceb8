use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who a message is addressed to: a single user (direct message) or a
/// group conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    User(Uuid),
    Conversation(Uuid),
}

/// A chat message. Immutable once created except for `read_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub recipient: Recipient,
    pub content: Option<String>,
    pub challenge_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// The conversation this message belongs to, as seen by `viewer`.
    /// Returns `None` for direct messages the viewer is not part of.
    pub fn conversation_for(&self, viewer: Uuid) -> Option<ConversationKey> {
        match self.recipient {
            Recipient::Conversation(id) => Some(ConversationKey::Group(id)),
            Recipient::User(receiver) if self.sender_id == viewer => {
                Some(ConversationKey::Direct(receiver))
            }
            Recipient::User(receiver) if receiver == viewer => {
                Some(ConversationKey::Direct(self.sender_id))
            }
            Recipient::User(_) => None,
        }
    }
}

/// Identifies a conversation from one user's point of view.
///
/// Direct conversations are keyed by the peer, so the same thread has a
/// different key for each participant. Rendered as `dm:<uuid>` or
/// `group:<uuid>` on the wire and in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ConversationKey {
    Direct(Uuid),
    Group(Uuid),
}

impl ConversationKey {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Direct(_) => "dm",
            Self::Group(_) => "group",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Direct(id) | Self::Group(id) => *id,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid conversation key '{0}'")]
pub struct ParseConversationKeyError(String);

impl FromStr for ConversationKey {
    type Err = ParseConversationKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| ParseConversationKeyError(s.to_string()))?;
        let id: Uuid = id
            .parse()
            .map_err(|_| ParseConversationKeyError(s.to_string()))?;
        match kind {
            "dm" => Ok(Self::Direct(id)),
            "group" => Ok(Self::Group(id)),
            _ => Err(ParseConversationKeyError(s.to_string())),
        }
    }
}

impl From<ConversationKey> for String {
    fn from(key: ConversationKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for ConversationKey {
    type Error = ParseConversationKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A user's membership in a conversation. `last_read_at` is `None` until
/// the user marks the conversation read for the first time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMember {
    pub conversation: ConversationKey,
    pub user_id: Uuid,
    pub last_read_at: Option<DateTime<Utc>>,
}
