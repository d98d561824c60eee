//! Document paths in the remote store.
//!
//! The layout is a fixed three-level tree under a company root:
//!
//! ```text
//! chats/{chat_id}
//! chats/{chat_id}/participants/{user_id}
//! chats/{chat_id}/messages/{message_id}
//! ```
//!
//! [`DocPath`] is the raw string form used on the wire; [`ParsedPath`]
//! classifies a path back into the entity it addresses.

use serde::{Deserialize, Serialize};

use deskline_shared::{ChatId, MessageId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath(pub String);

impl DocPath {
    /// Root of the whole chat tree; subscribing here observes everything.
    pub fn root() -> Self {
        Self("chats".to_string())
    }

    pub fn chat(chat_id: &ChatId) -> Self {
        Self(format!("chats/{chat_id}"))
    }

    pub fn participants(chat_id: &ChatId) -> Self {
        Self(format!("chats/{chat_id}/participants"))
    }

    pub fn participant(chat_id: &ChatId, user_id: &UserId) -> Self {
        Self(format!("chats/{chat_id}/participants/{user_id}"))
    }

    pub fn messages(chat_id: &ChatId) -> Self {
        Self(format!("chats/{chat_id}/messages"))
    }

    pub fn message(chat_id: &ChatId, message_id: &MessageId) -> Self {
        Self(format!("chats/{chat_id}/messages/{message_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix match on path segments, so `chats/a` does not cover
    /// `chats/ab`.
    pub fn contains(&self, other: &DocPath) -> bool {
        other.0 == self.0 || other.0.starts_with(&format!("{}/", self.0))
    }

    /// Classify the path by the entity it addresses.
    pub fn parse(&self) -> Option<ParsedPath> {
        let mut segments = self.0.split('/');
        if segments.next() != Some("chats") {
            return None;
        }
        let chat_id = ChatId(segments.next()?.to_string());

        match segments.next() {
            None => Some(ParsedPath::Chat(chat_id)),
            Some("participants") => {
                let user_id = UserId(segments.next()?.to_string());
                match segments.next() {
                    None => Some(ParsedPath::Participant(chat_id, user_id)),
                    Some(_) => None,
                }
            }
            Some("messages") => {
                let message_id = MessageId::parse(segments.next()?).ok()?;
                match segments.next() {
                    None => Some(ParsedPath::Message(chat_id, message_id)),
                    Some(_) => None,
                }
            }
            Some(_) => None,
        }
    }
}

impl std::fmt::Display for DocPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A [`DocPath`] resolved to the entity it names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPath {
    Chat(ChatId),
    Participant(ChatId, UserId),
    Message(ChatId, MessageId),
}
