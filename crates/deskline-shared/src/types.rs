use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Raised when a stored or transmitted enum tag is not recognised.
#[derive(Debug, Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

// Chat identity = UUID v4, kept as a string because it travels through
// document paths and SQL keys unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatId(pub String);

impl ChatId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> String {
        self.0.chars().take(8).collect()
    }
}

impl Default for ChatId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// User identity is assigned by the account service; opaque here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a support chat.
///
/// `Deleted` is a tombstone: the chat row survives so that references from
/// messages and sync metadata stay valid, but no further mutations are
/// accepted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    Pending,
    Active,
    Closed,
    Deleted,
}

impl ChatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            "deleted" => Ok(Self::Deleted),
            other => Err(ParseEnumError {
                kind: "chat status",
                value: other.to_string(),
            }),
        }
    }

    /// An assigned operator is carried only while the chat is live or archived.
    pub fn keeps_assignment(&self) -> bool {
        matches!(self, Self::Active | Self::Closed)
    }
}

impl std::fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    User,
    Operator,
    Admin,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Operator => "operator",
            Self::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "user" => Ok(Self::User),
            "operator" => Ok(Self::Operator),
            "admin" => Ok(Self::Admin),
            other => Err(ParseEnumError {
                kind: "participant role",
                value: other.to_string(),
            }),
        }
    }

    /// Operators and admins may claim and work pending chats.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Self::Operator | Self::Admin)
    }
}

/// Delivery state of a single message as seen by the local device.
///
/// `Sending` means the message sits in the outbox and has not been
/// acknowledged by the remote store. `Failed` is reached only after the
/// sync engine exhausts its retry budget.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError {
                kind: "message status",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_ids_are_unique() {
        assert_ne!(ChatId::new(), ChatId::new());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            ChatStatus::Pending,
            ChatStatus::Active,
            ChatStatus::Closed,
            ChatStatus::Deleted,
        ] {
            assert_eq!(ChatStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(ChatStatus::from_str("archived").is_err());
    }

    #[test]
    fn assignment_is_kept_only_while_live_or_archived() {
        assert!(!ChatStatus::Pending.keeps_assignment());
        assert!(ChatStatus::Active.keeps_assignment());
        assert!(ChatStatus::Closed.keeps_assignment());
        assert!(!ChatStatus::Deleted.keeps_assignment());
    }

    #[test]
    fn message_status_rejects_unknown_tags() {
        assert!(MessageStatus::from_str("queued").is_err());
        assert_eq!(
            MessageStatus::from_str("delivered").unwrap(),
            MessageStatus::Delivered
        );
    }
}
