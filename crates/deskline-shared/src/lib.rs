//! # deskline-shared
//!
//! Domain types for the Deskline support-chat engine: identifiers, lifecycle
//! enums, the chat/participant/message model and the caller session.
//!
//! This crate is dependency-light on purpose; both the local store and the
//! remote client build on these shapes.

pub mod model;
pub mod session;
pub mod types;

pub use model::{preview, Chat, Message, Participant, MAX_CONTENT_BYTES, PREVIEW_CHARS};
pub use session::Session;
pub use types::{
    ChatId, ChatStatus, MessageId, MessageStatus, ParseEnumError, ParticipantRole, UserId,
};
