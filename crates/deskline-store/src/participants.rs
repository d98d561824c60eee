//! CRUD operations for [`ParticipantRecord`] rows, including the
//! counter side of the unread ledger.

use chrono::{DateTime, Utc};
use rusqlite::params;

use deskline_shared::{ChatId, Participant, ParticipantRole, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{datetime_col, to_millis, ParticipantRecord};

impl Database {
    // ------------------------------------------------------------------
    // Create / update
    // ------------------------------------------------------------------

    /// Insert or overwrite a participant row.
    pub fn upsert_participant(&self, record: &ParticipantRecord) -> Result<()> {
        insert_participant_row(self.conn(), record)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch one participant, or `None` when the user is not in the chat.
    pub fn find_participant(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
    ) -> Result<Option<ParticipantRecord>> {
        match self.conn().query_row(
            "SELECT chat_id, user_id, display_name, role, unread_count, last_read_at, is_synced
             FROM participants
             WHERE chat_id = ?1 AND user_id = ?2",
            params![chat_id.as_str(), user_id.as_str()],
            row_to_participant_record,
        ) {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(StoreError::Sqlite(other)),
        }
    }

    /// Fetch one participant, failing when the user is not in the chat.
    pub fn get_participant(&self, chat_id: &ChatId, user_id: &UserId) -> Result<ParticipantRecord> {
        self.find_participant(chat_id, user_id)?
            .ok_or(StoreError::NotFound)
    }

    /// All participants of a chat, creator-joined order.
    pub fn list_participants(&self, chat_id: &ChatId) -> Result<Vec<ParticipantRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT chat_id, user_id, display_name, role, unread_count, last_read_at, is_synced
             FROM participants
             WHERE chat_id = ?1
             ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![chat_id.as_str()], row_to_participant_record)?;

        let mut participants = Vec::new();
        for row in rows {
            participants.push(row?);
        }
        Ok(participants)
    }

    /// Sum of `unread_count` across every chat `user_id` belongs to,
    /// excluding tombstoned chats.
    pub fn total_unread(&self, user_id: &UserId) -> Result<u32> {
        let total: i64 = self.conn().query_row(
            "SELECT COALESCE(SUM(p.unread_count), 0)
             FROM participants p
             JOIN chats c ON c.id = p.chat_id
             WHERE p.user_id = ?1 AND c.status != 'deleted'",
            params![user_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(total.max(0) as u32)
    }

    // ------------------------------------------------------------------
    // Ledger
    // ------------------------------------------------------------------

    /// Bump the unread counter of every participant except the sender,
    /// skipping readers whose marker already passed the message.  Returns
    /// the number of counters touched.
    pub fn increment_unread_except(
        &self,
        chat_id: &ChatId,
        sender_id: &UserId,
        message_time: &DateTime<Utc>,
    ) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE participants
             SET unread_count = unread_count + 1
             WHERE chat_id = ?1 AND user_id != ?2 AND last_read_at < ?3",
            params![
                chat_id.as_str(),
                sender_id.as_str(),
                to_millis(message_time)
            ],
        )?;
        Ok(affected)
    }

    /// Zero the reader's counter and advance their read marker.  Marks the
    /// row unsynced; the caller enqueues the matching outbox entry.
    pub fn reset_unread(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
        last_read_at: &DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE participants
             SET unread_count = 0, last_read_at = ?3, is_synced = 0
             WHERE chat_id = ?1 AND user_id = ?2",
            params![chat_id.as_str(), user_id.as_str(), to_millis(last_read_at)],
        )?;
        Ok(())
    }

    /// Overwrite one counter with a recomputed value.  Used by the
    /// self-healing reconciliation pass; does not touch the sync flag.
    pub fn set_unread(&self, chat_id: &ChatId, user_id: &UserId, count: u32) -> Result<()> {
        self.conn().execute(
            "UPDATE participants
             SET unread_count = ?3
             WHERE chat_id = ?1 AND user_id = ?2",
            params![chat_id.as_str(), user_id.as_str(), count],
        )?;
        Ok(())
    }

    /// Flag the participant as acknowledged by the remote store.
    pub fn mark_participant_synced(&self, chat_id: &ChatId, user_id: &UserId) -> Result<()> {
        self.conn().execute(
            "UPDATE participants SET is_synced = 1 WHERE chat_id = ?1 AND user_id = ?2",
            params![chat_id.as_str(), user_id.as_str()],
        )?;
        Ok(())
    }

    /// Drop a participant row that was written provisionally and then
    /// refused by the remote store.  Returns `true` if a row was removed.
    pub fn remove_unsynced_participant(&self, chat_id: &ChatId, user_id: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM participants
             WHERE chat_id = ?1 AND user_id = ?2 AND is_synced = 0",
            params![chat_id.as_str(), user_id.as_str()],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn insert_participant_row(
    conn: &rusqlite::Connection,
    record: &ParticipantRecord,
) -> Result<()> {
    let p = &record.participant;
    conn.execute(
        "INSERT INTO participants
             (chat_id, user_id, display_name, role, unread_count, last_read_at, is_synced)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(chat_id, user_id) DO UPDATE SET
             display_name = excluded.display_name,
             role = excluded.role,
             unread_count = excluded.unread_count,
             last_read_at = excluded.last_read_at,
             is_synced = excluded.is_synced",
        params![
            p.chat_id.as_str(),
            p.user_id.as_str(),
            p.display_name,
            p.role.as_str(),
            p.unread_count,
            to_millis(&p.last_read_at),
            record.is_synced,
        ],
    )?;
    Ok(())
}

/// Map a `rusqlite::Row` to a [`ParticipantRecord`].
fn row_to_participant_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ParticipantRecord> {
    let chat_id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let display_name: String = row.get(2)?;
    let role_str: String = row.get(3)?;
    let unread_count: u32 = row.get(4)?;
    let last_read_ms: i64 = row.get(5)?;
    let is_synced: bool = row.get(6)?;

    let role = ParticipantRole::from_str(&role_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(ParticipantRecord {
        participant: Participant {
            chat_id: ChatId(chat_id),
            user_id: UserId(user_id),
            display_name,
            role,
            unread_count,
            last_read_at: datetime_col(last_read_ms, 5)?,
        },
        is_synced,
    })
}
