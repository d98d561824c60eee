//! The per-participant unread ledger.
//!
//! Counters move by O(1) increments on the hot path; the full recount from
//! the message log exists only as a consistency check that repairs drift.
//! All functions here expect the caller to hold the chat's lock.

use deskline_shared::{preview, ChatId, Message, UserId};
use deskline_store::{Database, StoreError};

/// Book one appended message: bump everyone else's counter and refresh the
/// chat's preview columns.  Returns how many counters moved.
pub(crate) fn on_message_appended(db: &Database, message: &Message) -> Result<usize, StoreError> {
    let touched =
        db.increment_unread_except(&message.chat_id, &message.sender_id, &message.timestamp)?;
    db.set_chat_preview(
        &message.chat_id,
        &message.timestamp,
        &preview(&message.content),
    )?;
    Ok(touched)
}

/// One participant whose stored counter disagreed with the message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterDrift {
    pub user_id: UserId,
    pub stored: u32,
    pub computed: u32,
}

/// Recompute every counter of the chat from the message log, repairing
/// rows that drifted.  An empty result means the ledger was consistent.
pub(crate) fn reconcile(db: &Database, chat_id: &ChatId) -> Result<Vec<CounterDrift>, StoreError> {
    let mut drifts = Vec::new();

    for record in db.list_participants(chat_id)? {
        let p = &record.participant;
        let computed = db.count_messages_after(chat_id, &p.user_id, &p.last_read_at)?;
        if computed != p.unread_count {
            db.set_unread(chat_id, &p.user_id, computed)?;
            drifts.push(CounterDrift {
                user_id: p.user_id.clone(),
                stored: p.unread_count,
                computed,
            });
        }
    }

    Ok(drifts)
}
