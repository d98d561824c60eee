//! Engine events pushed to embedding UIs.
//!
//! Everything observable about a chat flows through one broadcast channel:
//! list rows refresh on `ChatUpdated`, conversation views append on
//! `MessageAppended`, delivery ticks follow `MessageStatusChanged`.
//! Subscribers that fall behind miss events rather than block the engine.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use deskline_shared::{Chat, ChatId, Message, MessageId, MessageStatus, UserId};

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Chat metadata changed: lifecycle state, assignment or preview.
    ChatUpdated { chat: Chat },
    /// A message joined the local cache, from either side of the sync.
    MessageAppended { message: Message },
    /// Delivery progress of one message.
    MessageStatusChanged {
        chat_id: ChatId,
        message_id: MessageId,
        status: MessageStatus,
    },
    /// A participant advanced their read marker.
    ReadMarked {
        chat_id: ChatId,
        user_id: UserId,
        last_read_at: DateTime<Utc>,
    },
    /// A provisional local transition lost against remote state and was
    /// rolled back.
    TransitionConflict { chat_id: ChatId, detail: String },
    /// An outbox entry exhausted its retry budget and awaits user retry.
    OutboxEntryFailed {
        chat_id: ChatId,
        seq: i64,
        error: String,
    },
    /// The chat's derived state was rebuilt, by a history refetch or by a
    /// counter recount that found drift.
    ChatResynced { chat_id: ChatId },
}

/// Snapshot-plus-updates view of one chat's message stream.
///
/// `snapshot` holds the full ordered history at subscription time;
/// [`MessageFeed::next`] then yields messages appended afterwards.
pub struct MessageFeed {
    pub snapshot: Vec<Message>,
    chat_id: ChatId,
    rx: broadcast::Receiver<EngineEvent>,
}

impl MessageFeed {
    pub(crate) fn new(
        chat_id: ChatId,
        snapshot: Vec<Message>,
        rx: broadcast::Receiver<EngineEvent>,
    ) -> Self {
        Self {
            snapshot,
            chat_id,
            rx,
        }
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    /// Next message appended to this chat; `None` once the engine shuts
    /// down.  A lagged subscriber skips what it missed.
    pub async fn next(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(EngineEvent::MessageAppended { message }) if message.chat_id == self.chat_id => {
                    return Some(message)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(chat_id = %self.chat_id, missed, "message feed lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
