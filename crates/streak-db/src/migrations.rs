use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS group_conversations (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- One row per (user, conversation) as seen by that user:
        -- 'dm:<peer_id>' or 'group:<group_id>'.
        CREATE TABLE IF NOT EXISTS conversation_members (
            conversation    TEXT NOT NULL,
            user_id         TEXT NOT NULL REFERENCES users(id),
            last_read_at    TEXT,
            PRIMARY KEY (conversation, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_members_user
            ON conversation_members(user_id);

        -- Timestamps are fixed-width RFC 3339 UTC so text order is time order.
        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            sender_id       TEXT NOT NULL REFERENCES users(id),
            recipient_kind  TEXT NOT NULL CHECK (recipient_kind IN ('user', 'conversation')),
            recipient_id    TEXT NOT NULL,
            content         TEXT,
            challenge_id    TEXT,
            created_at      TEXT NOT NULL,
            read_at         TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_recipient
            ON messages(recipient_kind, recipient_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_sender
            ON messages(sender_id, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
