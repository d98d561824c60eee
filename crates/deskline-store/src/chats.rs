//! CRUD operations for [`ChatRecord`] rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter};

use deskline_shared::{Chat, ChatId, ChatStatus, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{
    datetime_col, to_millis, ChatRecord, MessageRecord, OutboxOp, ParticipantRecord,
};
use crate::outbox::enqueue_on;

const CHAT_COLUMNS: &str = "id, status, created_at, last_message_time, last_message_text, \
     creator_id, assigned_operator_id, subject, is_synced, is_cache_complete";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a freshly created chat together with its creator participant,
    /// its first message, and the outbox entries that will publish all
    /// three.  Runs in a single transaction so a crash never leaves a chat
    /// that the sync engine does not know about.
    pub fn create_chat_local(
        &mut self,
        chat: &ChatRecord,
        creator: &ParticipantRecord,
        first_message: &MessageRecord,
    ) -> Result<()> {
        let tx = self.conn_mut().transaction()?;

        insert_chat_row(&tx, chat)?;
        crate::participants::insert_participant_row(&tx, creator)?;
        crate::messages::insert_message_row(&tx, first_message)?;

        let chat_id = &chat.chat.id;
        enqueue_on(
            &tx,
            chat_id,
            &OutboxOp::PutChat {
                chat: chat.chat.clone(),
            },
        )?;
        enqueue_on(
            &tx,
            chat_id,
            &OutboxOp::PutParticipant {
                participant: creator.participant.clone(),
            },
        )?;
        enqueue_on(
            &tx,
            chat_id,
            &OutboxOp::PutMessage {
                message: first_message.message.clone(),
            },
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Insert or overwrite a chat row; used when merging remote state.
    pub fn upsert_chat(&self, record: &ChatRecord) -> Result<()> {
        insert_chat_row(self.conn(), record)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single chat by id.
    pub fn get_chat(&self, id: &ChatId) -> Result<ChatRecord> {
        self.find_chat(id)?.ok_or(StoreError::NotFound)
    }

    /// Fetch a single chat by id, or `None` when it is not cached.
    pub fn find_chat(&self, id: &ChatId) -> Result<Option<ChatRecord>> {
        let sql = format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1");
        match self
            .conn()
            .query_row(&sql, params![id.as_str()], row_to_chat_record)
        {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(StoreError::Sqlite(other)),
        }
    }

    /// List the chats `user_id` takes part in, newest activity first.
    ///
    /// `statuses` narrows the result when present; `None` returns every
    /// lifecycle state including tombstones.
    pub fn chats_for_user(
        &self,
        user_id: &UserId,
        statuses: Option<&[ChatStatus]>,
    ) -> Result<Vec<ChatRecord>> {
        let mut sql = format!(
            "SELECT {} FROM chats c
             JOIN participants p ON p.chat_id = c.id
             WHERE p.user_id = ?1",
            chat_columns_qualified()
        );

        let mut args: Vec<String> = vec![user_id.as_str().to_string()];
        if let Some(statuses) = statuses {
            let placeholders: Vec<String> = (0..statuses.len())
                .map(|i| format!("?{}", i + 2))
                .collect();
            sql.push_str(&format!(" AND c.status IN ({})", placeholders.join(", ")));
            args.extend(statuses.iter().map(|s| s.as_str().to_string()));
        }
        sql.push_str(" ORDER BY COALESCE(c.last_message_time, c.created_at) DESC");

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), row_to_chat_record)?;

        let mut chats = Vec::new();
        for row in rows {
            chats.push(row?);
        }
        Ok(chats)
    }

    /// List every cached chat in the given state, oldest first.  Drives the
    /// operator-side queue of unclaimed chats.
    pub fn chats_with_status(&self, status: ChatStatus) -> Result<Vec<ChatRecord>> {
        let sql = format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE status = ?1 ORDER BY created_at ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![status.as_str()], row_to_chat_record)?;

        let mut chats = Vec::new();
        for row in rows {
            chats.push(row?);
        }
        Ok(chats)
    }

    /// Every cached chat id; used by startup reconciliation.
    pub fn all_chat_ids(&self) -> Result<Vec<ChatId>> {
        let mut stmt = self.conn().prepare("SELECT id FROM chats ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(ChatId(row?));
        }
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Apply a local lifecycle transition.  Marks the row unsynced; the
    /// caller enqueues the matching outbox entry.
    pub fn apply_chat_transition(
        &self,
        id: &ChatId,
        status: ChatStatus,
        assigned_operator_id: Option<&UserId>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE chats
             SET status = ?2, assigned_operator_id = ?3, is_synced = 0
             WHERE id = ?1",
            params![
                id.as_str(),
                status.as_str(),
                assigned_operator_id.map(|u| u.as_str()),
            ],
        )?;
        Ok(())
    }

    /// Refresh the denormalised preview columns after a message landed.
    pub fn set_chat_preview(
        &self,
        id: &ChatId,
        time: &DateTime<Utc>,
        text: &str,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE chats
             SET last_message_time = ?2, last_message_text = ?3
             WHERE id = ?1 AND (last_message_time IS NULL OR last_message_time <= ?2)",
            params![id.as_str(), to_millis(time), text],
        )?;
        Ok(())
    }

    /// Flag the chat as acknowledged by the remote store.
    pub fn mark_chat_synced(&self, id: &ChatId) -> Result<()> {
        self.conn().execute(
            "UPDATE chats SET is_synced = 1 WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }

    /// Record that the full remote history of this chat has been fetched.
    pub fn mark_cache_complete(&self, id: &ChatId) -> Result<()> {
        self.conn().execute(
            "UPDATE chats SET is_cache_complete = 1 WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn chat_columns_qualified() -> String {
    CHAT_COLUMNS
        .split(", ")
        .map(|c| format!("c.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn insert_chat_row(conn: &rusqlite::Connection, record: &ChatRecord) -> Result<()> {
    let chat = &record.chat;
    conn.execute(
        "INSERT INTO chats
             (id, status, created_at, last_message_time, last_message_text,
              creator_id, assigned_operator_id, subject, is_synced, is_cache_complete)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
             status = excluded.status,
             created_at = excluded.created_at,
             last_message_time = excluded.last_message_time,
             last_message_text = excluded.last_message_text,
             creator_id = excluded.creator_id,
             assigned_operator_id = excluded.assigned_operator_id,
             subject = excluded.subject,
             is_synced = excluded.is_synced,
             is_cache_complete = excluded.is_cache_complete",
        params![
            chat.id.as_str(),
            chat.status.as_str(),
            to_millis(&chat.created_at),
            chat.last_message_time.as_ref().map(to_millis),
            chat.last_message_text,
            chat.creator_id.as_str(),
            chat.assigned_operator_id.as_ref().map(|u| u.as_str()),
            chat.subject,
            record.is_synced,
            record.is_cache_complete,
        ],
    )?;
    Ok(())
}

/// Map a `rusqlite::Row` to a [`ChatRecord`].
fn row_to_chat_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRecord> {
    let id: String = row.get(0)?;
    let status_str: String = row.get(1)?;
    let created_ms: i64 = row.get(2)?;
    let last_ms: Option<i64> = row.get(3)?;
    let last_text: Option<String> = row.get(4)?;
    let creator: String = row.get(5)?;
    let assigned: Option<String> = row.get(6)?;
    let subject: String = row.get(7)?;
    let is_synced: bool = row.get(8)?;
    let is_cache_complete: bool = row.get(9)?;

    let status = ChatStatus::from_str(&status_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let last_message_time = last_ms.map(|ms| datetime_col(ms, 3)).transpose()?;

    Ok(ChatRecord {
        chat: Chat {
            id: ChatId(id),
            status,
            created_at: datetime_col(created_ms, 2)?,
            last_message_time,
            last_message_text: last_text,
            creator_id: UserId(creator),
            assigned_operator_id: assigned.map(UserId),
            subject,
        },
        is_synced,
        is_cache_complete,
    })
}
