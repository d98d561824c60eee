//! Domain model structs shared by the cache, the remote client and the
//! lifecycle engine.
//!
//! Every struct derives `Serialize` and `Deserialize`; the same shapes are
//! written to the local database and, as JSON documents, to the remote store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChatId, ChatStatus, MessageId, MessageStatus, ParticipantRole, UserId};

/// Longest accepted message body, in bytes of UTF-8.
pub const MAX_CONTENT_BYTES: usize = 10 * 1024;

/// Number of characters kept in a chat's denormalised message preview.
pub const PREVIEW_CHARS: usize = 120;

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A support conversation between an end user and (once accepted) an operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    /// Unique chat identifier.
    pub id: ChatId,
    /// Current lifecycle state.
    pub status: ChatStatus,
    /// When the chat was opened by its creator.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the newest message, if any. Derived locally from the
    /// message stream; not part of the remote chat document.
    #[serde(default)]
    pub last_message_time: Option<DateTime<Utc>>,
    /// Truncated preview of the newest message, if any. Derived locally.
    #[serde(default)]
    pub last_message_text: Option<String>,
    /// The end user who opened the chat.
    pub creator_id: UserId,
    /// Operator who claimed the chat. Present exactly while the chat is
    /// `Active` or `Closed`.
    pub assigned_operator_id: Option<UserId>,
    /// Short subject line entered at creation.
    pub subject: String,
}

impl Chat {
    pub fn new(id: ChatId, creator_id: UserId, subject: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: ChatStatus::Pending,
            created_at,
            last_message_time: None,
            last_message_text: None,
            creator_id,
            assigned_operator_id: None,
            subject,
        }
    }

    /// Moves the chat to `status`, dropping the operator assignment whenever
    /// the target state does not carry one.
    pub fn apply_status(&mut self, status: ChatStatus) {
        self.status = status;
        if !status.keeps_assignment() {
            self.assigned_operator_id = None;
        }
    }

    /// Records `message` as the newest message for list previews.
    pub fn note_message(&mut self, message: &Message) {
        self.last_message_time = Some(message.timestamp);
        self.last_message_text = Some(preview(&message.content));
    }
}

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// Membership of one user in one chat, with that user's read ledger.
///
/// The pair `(chat_id, user_id)` is the identity; a participant row is never
/// removed independently of its chat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub chat_id: ChatId,
    pub user_id: UserId,
    /// Name shown in the conversation header and message bubbles.
    pub display_name: String,
    pub role: ParticipantRole,
    /// Messages from other senders newer than `last_read_at`.
    pub unread_count: u32,
    /// High-water mark of what this user has seen.
    pub last_read_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(
        chat_id: ChatId,
        user_id: UserId,
        display_name: String,
        role: ParticipantRole,
        last_read_at: DateTime<Utc>,
    ) -> Self {
        Self {
            chat_id,
            user_id,
            display_name,
            role,
            unread_count: 0,
            last_read_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message. Content is plain UTF-8 text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Unique message identifier, generated on the sending device.
    pub id: MessageId,
    /// The chat this message belongs to.
    pub chat_id: ChatId,
    pub sender_id: UserId,
    /// Sender display name frozen at send time.
    pub sender_name: String,
    pub content: String,
    /// Send time as reported by the sending device. Per-sender timestamps
    /// are strictly monotonic within a chat.
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
}

impl Message {
    pub fn new(
        chat_id: ChatId,
        sender_id: UserId,
        sender_name: String,
        content: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            chat_id,
            sender_id,
            sender_name,
            content,
            timestamp,
            status: MessageStatus::Sending,
        }
    }
}

/// Truncates `content` to [`PREVIEW_CHARS`] characters for chat list rows.
pub fn preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_CHARS {
        content.to_string()
    } else {
        let cut: String = content.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat() -> Chat {
        Chat::new(
            ChatId::new(),
            UserId::from("user-1"),
            "Billing question".into(),
            Utc::now(),
        )
    }

    #[test]
    fn new_chat_is_pending_and_unassigned() {
        let c = chat();
        assert_eq!(c.status, ChatStatus::Pending);
        assert!(c.assigned_operator_id.is_none());
        assert!(c.last_message_time.is_none());
    }

    #[test]
    fn tombstoning_drops_the_assignment() {
        let mut c = chat();
        c.assigned_operator_id = Some(UserId::from("op-1"));
        c.apply_status(ChatStatus::Active);
        assert!(c.assigned_operator_id.is_some());
        c.apply_status(ChatStatus::Deleted);
        assert!(c.assigned_operator_id.is_none());
    }

    #[test]
    fn note_message_updates_the_preview() {
        let mut c = chat();
        let m = Message::new(
            c.id.clone(),
            UserId::from("user-1"),
            "Ann".into(),
            "Hello there".into(),
            Utc::now(),
        );
        c.note_message(&m);
        assert_eq!(c.last_message_text.as_deref(), Some("Hello there"));
        assert_eq!(c.last_message_time, Some(m.timestamp));
    }

    #[test]
    fn preview_truncates_long_content() {
        let long = "x".repeat(500);
        let p = preview(&long);
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 3);
        assert!(p.ends_with("..."));
        assert_eq!(preview("short"), "short");
    }
}
