//! v001 -- Initial schema creation.
//!
//! Creates the core tables: `chats`, `participants`, `messages`, `outbox`,
//! and `sync_versions`.  All timestamps are stored as integer Unix
//! milliseconds so that range comparisons in the unread ledger stay
//! index-friendly.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id                   TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    status               TEXT NOT NULL,              -- pending | active | closed | deleted
    created_at           INTEGER NOT NULL,           -- Unix millis
    last_message_time    INTEGER,                    -- Unix millis, null until first message
    last_message_text    TEXT,                       -- truncated preview
    creator_id           TEXT NOT NULL,
    assigned_operator_id TEXT,                       -- null unless active/closed
    subject              TEXT NOT NULL,
    is_synced            INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    is_cache_complete    INTEGER NOT NULL DEFAULT 0  -- full history fetched?
);

CREATE INDEX IF NOT EXISTS idx_chats_status ON chats(status);

-- ----------------------------------------------------------------
-- Participants
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS participants (
    chat_id      TEXT NOT NULL,                      -- FK -> chats(id)
    user_id      TEXT NOT NULL,
    display_name TEXT NOT NULL,
    role         TEXT NOT NULL,                      -- user | operator | admin
    unread_count INTEGER NOT NULL DEFAULT 0,
    last_read_at INTEGER NOT NULL,                   -- Unix millis
    is_synced    INTEGER NOT NULL DEFAULT 0,

    PRIMARY KEY (chat_id, user_id),
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_participants_user ON participants(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id          TEXT PRIMARY KEY NOT NULL,           -- UUID v4
    chat_id     TEXT NOT NULL,                       -- FK -> chats(id)
    sender_id   TEXT NOT NULL,
    sender_name TEXT NOT NULL,
    content     TEXT NOT NULL,
    timestamp   INTEGER NOT NULL,                    -- Unix millis, sender clock
    status      TEXT NOT NULL,                       -- sending | sent | delivered | read | failed
    is_synced   INTEGER NOT NULL DEFAULT 0,

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_ts
    ON messages(chat_id, timestamp ASC, id ASC);

-- ----------------------------------------------------------------
-- Outbox (pending remote mutations)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS outbox (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT, -- global enqueue order
    chat_id         TEXT NOT NULL,
    entity_type     TEXT NOT NULL,                     -- chat | participant | message
    entity_id       TEXT NOT NULL,
    logical_version INTEGER NOT NULL,                  -- per-entity mutation counter
    op              TEXT NOT NULL,                     -- JSON payload
    attempts        INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT,
    state           TEXT NOT NULL DEFAULT 'pending',   -- pending | failed
    created_at      INTEGER NOT NULL,                  -- Unix millis

    UNIQUE (entity_type, entity_id, logical_version)
);

CREATE INDEX IF NOT EXISTS idx_outbox_chat_state ON outbox(chat_id, state, seq);

-- ----------------------------------------------------------------
-- Per-entity mutation counters
-- ----------------------------------------------------------------
-- Kept outside the outbox so versions stay monotonic after applied
-- entries are deleted from the queue.
CREATE TABLE IF NOT EXISTS sync_versions (
    entity_type TEXT NOT NULL,
    entity_id   TEXT NOT NULL,
    version     INTEGER NOT NULL DEFAULT 0,

    PRIMARY KEY (entity_type, entity_id)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
