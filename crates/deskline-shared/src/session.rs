//! Caller identity threaded through every engine operation.
//!
//! There is no ambient "current user"; each call names who is acting, which
//! keeps multi-account hosts and tests straightforward.

use serde::{Deserialize, Serialize};

use crate::types::{ParticipantRole, UserId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub display_name: String,
    pub role: ParticipantRole,
}

impl Session {
    pub fn new(user_id: UserId, display_name: impl Into<String>, role: ParticipantRole) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            role,
        }
    }

    pub fn user(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self::new(UserId(user_id.into()), display_name, ParticipantRole::User)
    }

    pub fn operator(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self::new(
            UserId(user_id.into()),
            display_name,
            ParticipantRole::Operator,
        )
    }

    pub fn admin(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self::new(UserId(user_id.into()), display_name, ParticipantRole::Admin)
    }

    pub fn is_privileged(&self) -> bool {
        self.role.is_privileged()
    }
}
