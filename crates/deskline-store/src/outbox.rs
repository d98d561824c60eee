//! The durable outbox queue.
//!
//! Every local mutation that must reach the remote store is captured here
//! before the mutating call returns.  Entries are keyed by
//! `(entity_type, entity_id, logical_version)` and drained per chat in
//! `seq` order; an entry is deleted only once the remote store has
//! acknowledged it, so a crash replays instead of losing writes.

use rusqlite::params;

use deskline_shared::ChatId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{datetime_col, to_millis, EntityType, OutboxEntry, OutboxOp, OutboxState};

const OUTBOX_COLUMNS: &str =
    "seq, chat_id, entity_type, entity_id, logical_version, op, attempts, last_error, state, created_at";

impl Database {
    // ------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------

    /// Append one mutation to the queue, allocating the next logical
    /// version for its entity.
    pub fn enqueue_outbox(&self, chat_id: &ChatId, op: &OutboxOp) -> Result<OutboxEntry> {
        enqueue_on(self.conn(), chat_id, op)
    }

    // ------------------------------------------------------------------
    // Drain
    // ------------------------------------------------------------------

    /// Head of the chat's queue, but only while that head is still
    /// drainable.  A failed head blocks the chat until the user retries,
    /// which is what keeps per-chat ordering strict across failures.
    pub fn next_pending(&self, chat_id: &ChatId) -> Result<Option<OutboxEntry>> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE chat_id = ?1 ORDER BY seq ASC LIMIT 1"
        );
        let head = match self
            .conn()
            .query_row(&sql, params![chat_id.as_str()], row_to_outbox_entry)
        {
            Ok(entry) => entry,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(other) => return Err(StoreError::Sqlite(other)),
        };

        if head.state == OutboxState::Pending {
            Ok(Some(head))
        } else {
            Ok(None)
        }
    }

    /// Chats that currently have pending entries, in first-enqueued order.
    pub fn pending_chats(&self) -> Result<Vec<ChatId>> {
        let mut stmt = self.conn().prepare(
            "SELECT chat_id FROM outbox WHERE state = 'pending'
             GROUP BY chat_id ORDER BY MIN(seq) ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(ChatId(row?));
        }
        Ok(ids)
    }

    /// Record one delivery attempt and return the new attempt count.
    pub fn record_attempt(&self, seq: i64, error: &str) -> Result<u32> {
        self.conn().execute(
            "UPDATE outbox SET attempts = attempts + 1, last_error = ?2 WHERE seq = ?1",
            params![seq, error],
        )?;
        let attempts: u32 = self.conn().query_row(
            "SELECT attempts FROM outbox WHERE seq = ?1",
            params![seq],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    /// Park the entry for user-visible retry.
    pub fn mark_entry_failed(&self, seq: i64, error: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE outbox SET state = 'failed', last_error = ?2 WHERE seq = ?1",
            params![seq, error],
        )?;
        Ok(())
    }

    /// Delete an acknowledged (or refused) entry.  Returns `true` when this
    /// call was the one that removed it.
    pub fn remove_entry(&self, seq: i64) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM outbox WHERE seq = ?1", params![seq])?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Failure surface
    // ------------------------------------------------------------------

    /// Entries parked as failed, optionally narrowed to one chat.
    pub fn failed_entries(&self, chat_id: Option<&ChatId>) -> Result<Vec<OutboxEntry>> {
        let mut sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE state = 'failed'");
        if chat_id.is_some() {
            sql.push_str(" AND chat_id = ?1");
        }
        sql.push_str(" ORDER BY seq ASC");

        let mut stmt = self.conn().prepare(&sql)?;
        let mut entries = Vec::new();
        if let Some(chat_id) = chat_id {
            let rows = stmt.query_map(params![chat_id.as_str()], row_to_outbox_entry)?;
            for row in rows {
                entries.push(row?);
            }
        } else {
            let rows = stmt.query_map([], row_to_outbox_entry)?;
            for row in rows {
                entries.push(row?);
            }
        }
        Ok(entries)
    }

    /// Requeue every failed entry of a chat, clearing its attempt budget.
    /// Returns how many entries went back to pending.
    pub fn retry_failed(&self, chat_id: &ChatId) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE outbox SET state = 'pending', attempts = 0, last_error = NULL
             WHERE chat_id = ?1 AND state = 'failed'",
            params![chat_id.as_str()],
        )?;
        Ok(affected)
    }

    // ------------------------------------------------------------------
    // Merge support
    // ------------------------------------------------------------------

    /// Every unacknowledged operation queued for one entity, oldest first.
    /// Failed entries count: they still represent local intent until the
    /// user discards or retries them.
    pub fn pending_ops_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<OutboxOp>> {
        let mut stmt = self.conn().prepare(
            "SELECT op FROM outbox WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![entity_type.as_str(), entity_id], |row| {
            row.get::<_, String>(0)
        })?;

        let mut ops = Vec::new();
        for row in rows {
            ops.push(serde_json::from_str(&row?)?);
        }
        Ok(ops)
    }

    /// Total queue length across all chats and states.
    pub fn outbox_len(&self) -> Result<u32> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(count.max(0) as u32)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Enqueue against a raw connection so chat creation can bundle its seed
/// entries into one transaction.
pub(crate) fn enqueue_on(
    conn: &rusqlite::Connection,
    chat_id: &ChatId,
    op: &OutboxOp,
) -> Result<OutboxEntry> {
    let entity_type = op.entity_type();
    let entity_id = op.entity_id(chat_id);
    let now = chrono::Utc::now();

    // Versions live in their own table so they keep growing after applied
    // entries leave the queue.
    let logical_version: i64 = conn.query_row(
        "INSERT INTO sync_versions (entity_type, entity_id, version) VALUES (?1, ?2, 1)
         ON CONFLICT(entity_type, entity_id) DO UPDATE SET version = version + 1
         RETURNING version",
        params![entity_type.as_str(), entity_id],
        |row| row.get(0),
    )?;

    let payload = serde_json::to_string(op)?;
    conn.execute(
        "INSERT INTO outbox
             (chat_id, entity_type, entity_id, logical_version, op, attempts, state, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, 'pending', ?6)",
        params![
            chat_id.as_str(),
            entity_type.as_str(),
            entity_id,
            logical_version,
            payload,
            to_millis(&now),
        ],
    )?;

    Ok(OutboxEntry {
        seq: conn.last_insert_rowid(),
        chat_id: chat_id.clone(),
        entity_type,
        entity_id,
        logical_version,
        op: op.clone(),
        attempts: 0,
        last_error: None,
        state: OutboxState::Pending,
        created_at: now,
    })
}

/// Map a `rusqlite::Row` to an [`OutboxEntry`].
fn row_to_outbox_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    let seq: i64 = row.get(0)?;
    let chat_id: String = row.get(1)?;
    let entity_type_str: String = row.get(2)?;
    let entity_id: String = row.get(3)?;
    let logical_version: i64 = row.get(4)?;
    let op_json: String = row.get(5)?;
    let attempts: u32 = row.get(6)?;
    let last_error: Option<String> = row.get(7)?;
    let state_str: String = row.get(8)?;
    let created_ms: i64 = row.get(9)?;

    let entity_type = EntityType::from_str(&entity_type_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let op: OutboxOp = serde_json::from_str(&op_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let state = OutboxState::from_str(&state_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(OutboxEntry {
        seq,
        chat_id: ChatId(chat_id),
        entity_type,
        entity_id,
        logical_version,
        op,
        attempts,
        last_error,
        state,
        created_at: datetime_col(created_ms, 9)?,
    })
}
