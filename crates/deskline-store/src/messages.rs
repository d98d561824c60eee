//! CRUD operations for [`MessageRecord`] rows.
//!
//! Message bodies are immutable once written; only the delivery status and
//! the sync flag ever change.  Inserts use `OR IGNORE` so replaying the same
//! remote document is a no-op, which is what makes the pull-side merge a
//! union by message id.

use chrono::{DateTime, Utc};
use rusqlite::params;

use deskline_shared::{ChatId, Message, MessageId, MessageStatus, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{datetime_col, to_millis, MessageRecord};

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a message if its id is new.  Returns `true` when a row was
    /// actually written.
    pub fn insert_message(&self, record: &MessageRecord) -> Result<bool> {
        let affected = insert_message_row(self.conn(), record)?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch one message, or `None` when it is not cached.
    pub fn find_message(&self, id: &MessageId) -> Result<Option<MessageRecord>> {
        match self.conn().query_row(
            "SELECT id, chat_id, sender_id, sender_name, content, timestamp, status, is_synced
             FROM messages
             WHERE id = ?1",
            params![id.to_string()],
            row_to_message_record,
        ) {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(StoreError::Sqlite(other)),
        }
    }

    /// All messages of a chat ordered by `(timestamp, id)` ascending, the
    /// canonical display order.
    pub fn list_messages(&self, chat_id: &ChatId) -> Result<Vec<MessageRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, chat_id, sender_id, sender_name, content, timestamp, status, is_synced
             FROM messages
             WHERE chat_id = ?1
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![chat_id.as_str()], row_to_message_record)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Ids of every cached message in a chat; used when cascading a chat
    /// tombstone to its message documents.
    pub fn message_ids(&self, chat_id: &ChatId) -> Result<Vec<MessageId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id FROM messages WHERE chat_id = ?1 ORDER BY timestamp ASC, id ASC")?;
        let rows = stmt.query_map(params![chat_id.as_str()], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            let raw = row?;
            ids.push(MessageId::parse(&raw)?);
        }
        Ok(ids)
    }

    /// Messages from other senders strictly newer than `after`; the
    /// recomputation side of the unread ledger.
    pub fn count_messages_after(
        &self,
        chat_id: &ChatId,
        exclude_sender: &UserId,
        after: &DateTime<Utc>,
    ) -> Result<u32> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages
             WHERE chat_id = ?1 AND sender_id != ?2 AND timestamp > ?3",
            params![chat_id.as_str(), exclude_sender.as_str(), to_millis(after)],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u32)
    }

    // ------------------------------------------------------------------
    // Status transitions
    // ------------------------------------------------------------------

    /// Remote acknowledged the message: flag it synced and move
    /// `Sending -> Sent`.  A later status (`Delivered`, `Read`) is kept.
    pub fn mark_message_sent(&self, id: &MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages
             SET is_synced = 1,
                 status = CASE WHEN status = 'sending' THEN 'sent' ELSE status END
             WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// The message came back down the subscription stream, so it has
    /// reached the remote store.  `Sending`/`Sent` advance to `Delivered`.
    pub fn confirm_delivered(&self, id: &MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages
             SET is_synced = 1, status = 'delivered'
             WHERE id = ?1 AND status IN ('sending', 'sent')",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// The outbox gave up on the message.
    pub fn mark_message_failed(&self, id: &MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = 'failed' WHERE id = ?1 AND status = 'sending'",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Reset a failed message to `Sending` ahead of a user-driven retry.
    pub fn requeue_message(&self, id: &MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = 'sending', is_synced = 0
             WHERE id = ?1 AND status = 'failed'",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Mark incoming messages up to `up_to` as read by `reader_id`.
    /// Returns how many rows changed.
    pub fn mark_read_up_to(
        &self,
        chat_id: &ChatId,
        reader_id: &UserId,
        up_to: &DateTime<Utc>,
    ) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE messages
             SET status = 'read'
             WHERE chat_id = ?1 AND sender_id != ?2 AND timestamp <= ?3
               AND status IN ('sent', 'delivered')",
            params![chat_id.as_str(), reader_id.as_str(), to_millis(up_to)],
        )?;
        Ok(affected)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn insert_message_row(
    conn: &rusqlite::Connection,
    record: &MessageRecord,
) -> Result<usize> {
    let m = &record.message;
    let affected = conn.execute(
        "INSERT OR IGNORE INTO messages
             (id, chat_id, sender_id, sender_name, content, timestamp, status, is_synced)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            m.id.to_string(),
            m.chat_id.as_str(),
            m.sender_id.as_str(),
            m.sender_name,
            m.content,
            to_millis(&m.timestamp),
            m.status.as_str(),
            record.is_synced,
        ],
    )?;
    Ok(affected)
}

/// Map a `rusqlite::Row` to a [`MessageRecord`].
fn row_to_message_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let id_str: String = row.get(0)?;
    let chat_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let sender_name: String = row.get(3)?;
    let content: String = row.get(4)?;
    let ts_ms: i64 = row.get(5)?;
    let status_str: String = row.get(6)?;
    let is_synced: bool = row.get(7)?;

    let id = MessageId::parse(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status = MessageStatus::from_str(&status_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(MessageRecord {
        message: Message {
            id,
            chat_id: ChatId(chat_id),
            sender_id: UserId(sender_id),
            sender_name,
            content,
            timestamp: datetime_col(ts_ms, 5)?,
            status,
        },
        is_synced,
    })
}
