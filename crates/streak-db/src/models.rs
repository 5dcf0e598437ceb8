//! Database row types. These map directly to SQLite rows and stay
//! string-typed; conversion into streak-types models happens here so
//! callers never see raw column text.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use streak_types::models::{ConversationMember, Message, Recipient};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub recipient_kind: String,
    pub recipient_id: String,
    pub content: Option<String>,
    pub challenge_id: Option<String>,
    pub created_at: String,
    pub read_at: Option<String>,
}

pub struct MemberRow {
    pub conversation: String,
    pub user_id: String,
    pub last_read_at: Option<String>,
}

/// Fixed-width UTC rendering used for every stored timestamp.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

impl MessageRow {
    pub fn from_message(message: &Message) -> Self {
        let (recipient_kind, recipient_id) = match message.recipient {
            Recipient::User(id) => ("user", id),
            Recipient::Conversation(id) => ("conversation", id),
        };
        Self {
            id: message.id.to_string(),
            sender_id: message.sender_id.to_string(),
            recipient_kind: recipient_kind.to_string(),
            recipient_id: recipient_id.to_string(),
            content: message.content.clone(),
            challenge_id: message.challenge_id.map(|id| id.to_string()),
            created_at: format_ts(message.created_at),
            read_at: message.read_at.map(format_ts),
        }
    }

    pub fn into_message(self) -> Result<Message> {
        let recipient_id: Uuid = self.recipient_id.parse()?;
        let recipient = match self.recipient_kind.as_str() {
            "user" => Recipient::User(recipient_id),
            "conversation" => Recipient::Conversation(recipient_id),
            other => return Err(anyhow!("Corrupt recipient_kind '{}' on message '{}'", other, self.id)),
        };

        Ok(Message {
            id: self.id.parse()?,
            sender_id: self.sender_id.parse()?,
            recipient,
            content: self.content,
            challenge_id: self.challenge_id.as_deref().map(str::parse).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            read_at: self.read_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

impl MemberRow {
    pub fn into_member(self) -> Result<ConversationMember> {
        Ok(ConversationMember {
            conversation: self.conversation.parse()?,
            user_id: self.user_id.parse()?,
            last_read_at: self.last_read_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}
