//! Store-level records persisted in the local SQLite database.
//!
//! The cache keeps each domain entity together with its synchronization
//! metadata; the plain entity structs live in `deskline-shared` and are
//! embedded here unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use deskline_shared::{Chat, ChatId, ChatStatus, Message, Participant, UserId};

// ---------------------------------------------------------------------------
// Entity records
// ---------------------------------------------------------------------------

/// A cached chat plus its sync flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRecord {
    pub chat: Chat,
    /// All local mutations of this chat have been acknowledged remotely.
    pub is_synced: bool,
    /// The full remote message history has been fetched at least once.
    pub is_cache_complete: bool,
}

impl ChatRecord {
    /// Record for a chat created on this device; the local copy is the
    /// complete history by construction.
    pub fn local(chat: Chat) -> Self {
        Self {
            chat,
            is_synced: false,
            is_cache_complete: true,
        }
    }

    /// Record for a chat first learned about from the remote store.
    pub fn remote(chat: Chat) -> Self {
        Self {
            chat,
            is_synced: true,
            is_cache_complete: false,
        }
    }
}

/// A cached participant plus its sync flag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantRecord {
    pub participant: Participant,
    pub is_synced: bool,
}

impl ParticipantRecord {
    pub fn local(participant: Participant) -> Self {
        Self {
            participant,
            is_synced: false,
        }
    }

    pub fn remote(participant: Participant) -> Self {
        Self {
            participant,
            is_synced: true,
        }
    }
}

/// A cached message plus its sync flag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    pub message: Message,
    pub is_synced: bool,
}

impl MessageRecord {
    pub fn local(message: Message) -> Self {
        Self {
            message,
            is_synced: false,
        }
    }

    pub fn remote(message: Message) -> Self {
        Self {
            message,
            is_synced: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Which remote entity an outbox entry mutates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Chat,
    Participant,
    Message,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Participant => "participant",
            Self::Message => "message",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, deskline_shared::ParseEnumError> {
        match s {
            "chat" => Ok(Self::Chat),
            "participant" => Ok(Self::Participant),
            "message" => Ok(Self::Message),
            other => Err(deskline_shared::ParseEnumError {
                kind: "entity type",
                value: other.to_string(),
            }),
        }
    }
}

/// Queue state of an outbox entry.
///
/// There is no `applied` state; applied entries are deleted, so the queue
/// always holds exactly the work that remains.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    Pending,
    Failed,
}

impl OutboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, deskline_shared::ParseEnumError> {
        match s {
            "pending" => Ok(Self::Pending),
            "failed" => Ok(Self::Failed),
            other => Err(deskline_shared::ParseEnumError {
                kind: "outbox state",
                value: other.to_string(),
            }),
        }
    }
}

/// The remote mutation an outbox entry carries, serialized as JSON in the
/// `op` column.
///
/// Each variant embeds the full payload captured at enqueue time, so a drain
/// after restart needs no other table to reconstruct the write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboxOp {
    /// Create or fully overwrite the chat document.
    PutChat { chat: Chat },
    /// Field update of the chat document's lifecycle columns.
    UpdateChatStatus {
        status: ChatStatus,
        assigned_operator_id: Option<UserId>,
    },
    /// Claim the chat via compare-and-set on `assigned_operator_id`,
    /// then activate it and publish the operator's participant document.
    AcceptChat { operator: Participant },
    /// Mark the chat document deleted and tombstone its message documents.
    TombstoneChat,
    /// Create or fully overwrite one message document.
    PutMessage { message: Message },
    /// Create or fully overwrite one participant document.
    PutParticipant { participant: Participant },
    /// Advance the participant's read marker and clear their unread count.
    MarkRead {
        user_id: UserId,
        last_read_at: DateTime<Utc>,
    },
}

// The preview columns are absent: `last_message_time` / `last_message_text`
// are derived locally from the message stream on every device and never
// merged from remote chat documents.
const CHAT_ALL_FIELDS: &[&str] = &[
    "status",
    "created_at",
    "creator_id",
    "assigned_operator_id",
    "subject",
];

const CHAT_LIFECYCLE_FIELDS: &[&str] = &["status", "assigned_operator_id"];

const PARTICIPANT_ALL_FIELDS: &[&str] =
    &["display_name", "role", "unread_count", "last_read_at"];

const PARTICIPANT_READ_FIELDS: &[&str] = &["unread_count", "last_read_at"];

impl OutboxOp {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::PutChat { .. }
            | Self::UpdateChatStatus { .. }
            | Self::AcceptChat { .. }
            | Self::TombstoneChat => EntityType::Chat,
            Self::PutMessage { .. } => EntityType::Message,
            Self::PutParticipant { .. } | Self::MarkRead { .. } => EntityType::Participant,
        }
    }

    /// Identity of the mutated entity. Participants are keyed by chat and
    /// user together because a user takes part in many chats.
    pub fn entity_id(&self, chat_id: &ChatId) -> String {
        match self {
            Self::PutChat { .. }
            | Self::UpdateChatStatus { .. }
            | Self::AcceptChat { .. }
            | Self::TombstoneChat => chat_id.to_string(),
            Self::PutMessage { message } => message.id.to_string(),
            Self::PutParticipant { participant } => {
                format!("{}:{}", chat_id, participant.user_id)
            }
            Self::MarkRead { user_id, .. } => format!("{chat_id}:{user_id}"),
        }
    }

    /// Document fields this entry still owns locally.
    ///
    /// While the entry is unacknowledged, incoming remote values for these
    /// fields must not overwrite the local copy; everything else merges
    /// remote-wins. Message bodies are immutable and merge by union instead.
    pub fn covered_fields(&self) -> &'static [&'static str] {
        match self {
            Self::PutChat { .. } => CHAT_ALL_FIELDS,
            Self::UpdateChatStatus { .. } | Self::AcceptChat { .. } | Self::TombstoneChat => {
                CHAT_LIFECYCLE_FIELDS
            }
            Self::PutMessage { .. } => &[],
            Self::PutParticipant { .. } => PARTICIPANT_ALL_FIELDS,
            Self::MarkRead { .. } => PARTICIPANT_READ_FIELDS,
        }
    }
}

/// One row of the outbox queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    /// Global enqueue sequence; per-chat drain order follows it.
    pub seq: i64,
    pub chat_id: ChatId,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Per-entity mutation counter, starting at 1.
    pub logical_version: i64,
    pub op: OutboxOp,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub state: OutboxState,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Timestamp helpers
// ---------------------------------------------------------------------------

/// Convert a [`DateTime`] to the Unix-millisecond representation used in
/// every timestamp column.
pub fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Inverse of [`to_millis`]; `None` only for values outside chrono's range.
pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// Row-mapper helper: decode a millisecond column or fail with a typed
/// conversion error.
pub(crate) fn datetime_col(ms: i64, col: usize) -> rusqlite::Result<DateTime<Utc>> {
    from_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Integer,
            Box::new(rusqlite::types::FromSqlError::OutOfRange(ms)),
        )
    })
}
