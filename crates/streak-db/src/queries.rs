use crate::Database;
use crate::models::{MemberRow, MessageRow, UserRow, format_ts};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use streak_types::models::{ConversationKey, ConversationMember, Message, Recipient};

const MESSAGE_COLUMNS: &str =
    "id, sender_id, recipient_kind, recipient_id, content, challenge_id, created_at, read_at";

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    // -- Groups --

    /// Create a group conversation and enroll every member (creator included
    /// by the caller).
    pub fn create_group(&self, id: Uuid, name: &str, member_ids: &[Uuid]) -> Result<()> {
        let key = ConversationKey::Group(id).to_string();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO group_conversations (id, name) VALUES (?1, ?2)",
                (id.to_string(), name),
            )?;
            for member in member_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO conversation_members (conversation, user_id) VALUES (?1, ?2)",
                    (&key, member.to_string()),
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn is_member(&self, conversation: ConversationKey, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM conversation_members WHERE conversation = ?1 AND user_id = ?2",
                (conversation.to_string(), user_id.to_string()),
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Group conversation ids the user belongs to.
    pub fn group_ids_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .memberships(user_id)?
            .into_iter()
            .filter_map(|m| match m.conversation {
                ConversationKey::Group(id) => Some(id),
                ConversationKey::Direct(_) => None,
            })
            .collect())
    }

    // -- Memberships --

    pub fn memberships(&self, user_id: Uuid) -> Result<Vec<ConversationMember>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation, user_id, last_read_at FROM conversation_members
                 WHERE user_id = ?1 ORDER BY conversation",
            )?;
            let rows = stmt
                .query_map([user_id.to_string()], |row| {
                    Ok(MemberRow {
                        conversation: row.get(0)?,
                        user_id: row.get(1)?,
                        last_read_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(MemberRow::into_member).collect()
    }

    /// Record that `user_id` has read `conversation` up to `read_at`.
    /// Direct threads also stamp `read_at` on the peer's unread messages.
    pub fn update_last_read_at(
        &self,
        conversation: ConversationKey,
        user_id: Uuid,
        read_at: DateTime<Utc>,
    ) -> Result<()> {
        let ts = format_ts(read_at);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO conversation_members (conversation, user_id, last_read_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (conversation, user_id) DO UPDATE SET last_read_at = excluded.last_read_at",
                (conversation.to_string(), user_id.to_string(), &ts),
            )?;

            if let ConversationKey::Direct(peer) = conversation {
                tx.execute(
                    "UPDATE messages SET read_at = ?1
                     WHERE sender_id = ?2 AND recipient_kind = 'user' AND recipient_id = ?3
                       AND read_at IS NULL AND created_at <= ?1",
                    (&ts, peer.to_string(), user_id.to_string()),
                )?;
            }

            tx.commit()?;
            Ok(())
        })
    }

    // -- Messages --

    /// Persist a message. Direct messages enroll both sides in the thread so
    /// it shows up in their memberships.
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        let row = MessageRow::from_message(message);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!("INSERT INTO messages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)", MESSAGE_COLUMNS),
                rusqlite::params![
                    row.id,
                    row.sender_id,
                    row.recipient_kind,
                    row.recipient_id,
                    row.content,
                    row.challenge_id,
                    row.created_at,
                    row.read_at,
                ],
            )?;

            if let Recipient::User(receiver) = message.recipient {
                for (owner, peer) in [(message.sender_id, receiver), (receiver, message.sender_id)] {
                    tx.execute(
                        "INSERT OR IGNORE INTO conversation_members (conversation, user_id) VALUES (?1, ?2)",
                        (ConversationKey::Direct(peer).to_string(), owner.to_string()),
                    )?;
                }
            }

            tx.commit()?;
            Ok(())
        })
    }

    /// Messages in `conversation` (as seen by `user_id`) created strictly
    /// after `after`, oldest first.
    pub fn messages_after(
        &self,
        user_id: Uuid,
        conversation: ConversationKey,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        // An empty bound sorts before every stored timestamp.
        let after = after.map(format_ts).unwrap_or_default();
        let user = user_id.to_string();

        let rows = self.with_conn(|conn| match conversation {
            ConversationKey::Group(id) => query_messages(
                conn,
                "recipient_kind = 'conversation' AND recipient_id = ?1 AND created_at > ?2",
                rusqlite::params![id.to_string(), after],
            ),
            ConversationKey::Direct(peer) => query_messages(
                conn,
                "recipient_kind = 'user'
                 AND ((sender_id = ?1 AND recipient_id = ?2) OR (sender_id = ?2 AND recipient_id = ?1))
                 AND created_at > ?3",
                rusqlite::params![user, peer.to_string(), after],
            ),
        })?;

        rows.into_iter().map(MessageRow::into_message).collect()
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, username, password, created_at FROM users WHERE {} = ?1",
        column
    ))?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_messages(
    conn: &Connection,
    predicate: &str,
    params: &[&dyn rusqlite::types::ToSql],
) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages WHERE {} ORDER BY created_at ASC, id ASC",
        MESSAGE_COLUMNS, predicate
    ))?;

    let rows = stmt
        .query_map(params, |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                sender_id: row.get(1)?,
                recipient_kind: row.get(2)?,
                recipient_id: row.get(3)?,
                content: row.get(4)?,
                challenge_id: row.get(5)?,
                created_at: row.get(6)?,
                read_at: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
