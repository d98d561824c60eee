use thiserror::Error;

use deskline_remote::RemoteError;
use deskline_shared::ChatId;
use deskline_store::StoreError;

/// Errors surfaced to callers of the chat engine.
///
/// Transient network failures never appear here directly; the sync engine
/// retries them in the background, and exhaustion surfaces as a failed
/// outbox entry plus an `OutboxEntryFailed` event rather than an error
/// return.  Counter drift likewise heals through a background recompute
/// instead of propagating.
#[derive(Error, Debug)]
pub enum ChatError {
    /// The request itself is malformed, not allowed for this caller, or
    /// names a lifecycle transition the state machine does not define.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Another operator claimed the chat first.
    #[error("Chat {chat_id} is already assigned to another operator")]
    ChatAlreadyAssigned { chat_id: ChatId },

    /// A locally applied transition turned out to be stale against remote
    /// truth and has been rolled back.
    #[error("Conflicting transition on chat {chat_id}: {detail}")]
    ConflictingTransition { chat_id: ChatId, detail: String },

    /// Local persistence error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Remote store error that escaped on a foreground path, e.g. a
    /// history fetch for a chat whose cache is incomplete.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChatError>;
