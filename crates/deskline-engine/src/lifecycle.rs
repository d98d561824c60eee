//! Lifecycle transition guards.
//!
//! Pure checks over the cached chat and the calling session; the engine
//! applies the local write and enqueues the remote mutation only after the
//! guard passes.  Re-running a transition that already took effect is a
//! no-op, not an error, so retried UI actions and races between devices
//! stay quiet.  A call with no edge in the state machine at all fails
//! validation and leaves the chat untouched.

use deskline_shared::{Chat, ChatStatus, Session, MAX_CONTENT_BYTES};

use crate::error::ChatError;

/// Whether a guarded transition still has work to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Apply,
    NoOp,
}

pub(crate) fn validate_subject(subject: &str) -> Result<(), ChatError> {
    if subject.trim().is_empty() {
        return Err(ChatError::Validation("chat subject is empty".into()));
    }
    Ok(())
}

pub(crate) fn validate_content(content: &str) -> Result<(), ChatError> {
    if content.trim().is_empty() {
        return Err(ChatError::Validation("message content is empty".into()));
    }
    if content.len() > MAX_CONTENT_BYTES {
        return Err(ChatError::Validation(format!(
            "message content exceeds {MAX_CONTENT_BYTES} bytes"
        )));
    }
    Ok(())
}

/// Accept requires a privileged caller and an unclaimed pending chat.  A
/// chat already carrying an assignment means another operator won the
/// claim, which gets its own error so callers can distinguish "lost the
/// race" from "nonsense request".
pub(crate) fn check_accept(chat: &Chat, session: &Session) -> Result<(), ChatError> {
    if !session.is_privileged() {
        return Err(ChatError::Validation(format!(
            "user {} may not accept chats",
            session.user_id
        )));
    }
    match chat.status {
        ChatStatus::Pending if chat.assigned_operator_id.is_none() => Ok(()),
        ChatStatus::Pending | ChatStatus::Active => Err(ChatError::ChatAlreadyAssigned {
            chat_id: chat.id.clone(),
        }),
        status => Err(undefined(chat, "accept", status)),
    }
}

/// Decline is the operator-side rejection of a pending chat.  A chat
/// another device already tombstoned declines as a no-op.
pub(crate) fn check_decline(chat: &Chat, session: &Session) -> Result<Outcome, ChatError> {
    if !session.is_privileged() {
        return Err(ChatError::Validation(format!(
            "user {} may not decline chats",
            session.user_id
        )));
    }
    match chat.status {
        ChatStatus::Pending => Ok(Outcome::Apply),
        ChatStatus::Deleted => Ok(Outcome::NoOp),
        status => Err(undefined(chat, "decline", status)),
    }
}

pub(crate) fn check_close(chat: &Chat, session: &Session) -> Result<Outcome, ChatError> {
    ensure_member_or_admin(chat, session, "close")?;
    match chat.status {
        ChatStatus::Active => Ok(Outcome::Apply),
        ChatStatus::Closed | ChatStatus::Deleted => Ok(Outcome::NoOp),
        status => Err(undefined(chat, "close", status)),
    }
}

/// Only the operator carrying the assignment (or an admin) can pull a chat
/// back out of the archive.
pub(crate) fn check_reopen(chat: &Chat, session: &Session) -> Result<Outcome, ChatError> {
    let is_assignee = chat.assigned_operator_id.as_ref() == Some(&session.user_id);
    if !is_assignee && session.role != deskline_shared::ParticipantRole::Admin {
        return Err(ChatError::Validation(format!(
            "user {} is not the assigned operator",
            session.user_id
        )));
    }
    match chat.status {
        ChatStatus::Closed => Ok(Outcome::Apply),
        ChatStatus::Active => Ok(Outcome::NoOp),
        status => Err(undefined(chat, "reopen", status)),
    }
}

pub(crate) fn check_delete(chat: &Chat, session: &Session) -> Result<Outcome, ChatError> {
    let is_creator = chat.creator_id == session.user_id;
    if !is_creator && session.role != deskline_shared::ParticipantRole::Admin {
        return Err(ChatError::Validation(format!(
            "user {} may not delete this chat",
            session.user_id
        )));
    }
    match chat.status {
        ChatStatus::Deleted => Ok(Outcome::NoOp),
        _ => Ok(Outcome::Apply),
    }
}

/// Messages append while the chat is pending or active.
pub(crate) fn check_send(chat: &Chat) -> Result<(), ChatError> {
    match chat.status {
        ChatStatus::Pending | ChatStatus::Active => Ok(()),
        ChatStatus::Closed => Err(ChatError::Validation(format!(
            "chat {} is closed; reopen it before sending",
            chat.id
        ))),
        ChatStatus::Deleted => Err(ChatError::Validation(format!(
            "chat {} is deleted and refuses writes",
            chat.id
        ))),
    }
}

pub(crate) fn check_mark_read(chat: &Chat) -> Result<(), ChatError> {
    if chat.status == ChatStatus::Deleted {
        return Err(ChatError::Validation(format!(
            "chat {} is deleted and refuses writes",
            chat.id
        )));
    }
    Ok(())
}

fn ensure_member_or_admin(chat: &Chat, session: &Session, verb: &str) -> Result<(), ChatError> {
    let is_creator = chat.creator_id == session.user_id;
    let is_assignee = chat.assigned_operator_id.as_ref() == Some(&session.user_id);
    let is_admin = session.role == deskline_shared::ParticipantRole::Admin;
    if is_creator || is_assignee || is_admin {
        Ok(())
    } else {
        Err(ChatError::Validation(format!(
            "user {} may not {verb} chat {}",
            session.user_id, chat.id
        )))
    }
}

/// Calls outside the transition table are caller mistakes, not conflicts.
fn undefined(chat: &Chat, verb: &str, status: ChatStatus) -> ChatError {
    ChatError::Validation(format!("cannot {verb} chat {} while it is {status}", chat.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use deskline_shared::{ChatId, UserId};

    fn chat_in(status: ChatStatus) -> Chat {
        let mut chat = Chat::new(
            ChatId::new(),
            UserId::from("creator"),
            "subject".into(),
            Utc::now(),
        );
        chat.status = status;
        if status.keeps_assignment() {
            chat.assigned_operator_id = Some(UserId::from("op-1"));
        }
        chat
    }

    #[test]
    fn accept_rejects_everything_but_unclaimed_pending() {
        let operator = Session::operator("op-2", "Olga");

        assert!(check_accept(&chat_in(ChatStatus::Pending), &operator).is_ok());
        assert!(matches!(
            check_accept(&chat_in(ChatStatus::Active), &operator),
            Err(ChatError::ChatAlreadyAssigned { .. })
        ));
        assert!(matches!(
            check_accept(&chat_in(ChatStatus::Closed), &operator),
            Err(ChatError::Validation(_))
        ));
        assert!(matches!(
            check_accept(&chat_in(ChatStatus::Deleted), &operator),
            Err(ChatError::Validation(_))
        ));
        assert!(matches!(
            check_accept(
                &chat_in(ChatStatus::Pending),
                &Session::user("u1", "Ann")
            ),
            Err(ChatError::Validation(_))
        ));
    }

    #[test]
    fn decline_is_idempotent_against_tombstones() {
        let operator = Session::operator("op-2", "Olga");
        assert_eq!(
            check_decline(&chat_in(ChatStatus::Pending), &operator).unwrap(),
            Outcome::Apply
        );
        assert_eq!(
            check_decline(&chat_in(ChatStatus::Deleted), &operator).unwrap(),
            Outcome::NoOp
        );
        assert!(check_decline(&chat_in(ChatStatus::Active), &operator).is_err());
    }

    #[test]
    fn close_and_reopen_form_a_cycle_with_noops() {
        let assignee = Session::operator("op-1", "Olga");

        assert_eq!(
            check_close(&chat_in(ChatStatus::Active), &assignee).unwrap(),
            Outcome::Apply
        );
        assert_eq!(
            check_close(&chat_in(ChatStatus::Closed), &assignee).unwrap(),
            Outcome::NoOp
        );
        assert_eq!(
            check_close(&chat_in(ChatStatus::Deleted), &assignee).unwrap(),
            Outcome::NoOp
        );
        let creator = Session::user("creator", "Ann");
        assert!(matches!(
            check_close(&chat_in(ChatStatus::Pending), &creator),
            Err(ChatError::Validation(_))
        ));
        assert_eq!(
            check_reopen(&chat_in(ChatStatus::Closed), &assignee).unwrap(),
            Outcome::Apply
        );
        assert_eq!(
            check_reopen(&chat_in(ChatStatus::Active), &assignee).unwrap(),
            Outcome::NoOp
        );
        let admin = Session::admin("root", "Root");
        assert!(matches!(
            check_reopen(&chat_in(ChatStatus::Pending), &admin),
            Err(ChatError::Validation(_))
        ));
    }

    #[test]
    fn reopen_is_reserved_for_the_assignee() {
        let stranger = Session::operator("op-9", "Oscar");
        assert!(matches!(
            check_reopen(&chat_in(ChatStatus::Closed), &stranger),
            Err(ChatError::Validation(_))
        ));

        let admin = Session::admin("root", "Root");
        assert!(check_reopen(&chat_in(ChatStatus::Closed), &admin).is_ok());
    }

    #[test]
    fn delete_reaches_every_state_and_then_stops() {
        let creator = Session::user("creator", "Ann");
        for status in [ChatStatus::Pending, ChatStatus::Active, ChatStatus::Closed] {
            assert_eq!(
                check_delete(&chat_in(status), &creator).unwrap(),
                Outcome::Apply
            );
        }
        assert_eq!(
            check_delete(&chat_in(ChatStatus::Deleted), &creator).unwrap(),
            Outcome::NoOp
        );

        let stranger = Session::user("someone", "Sam");
        assert!(check_delete(&chat_in(ChatStatus::Active), &stranger).is_err());
    }

    #[test]
    fn sends_stop_at_closed_and_deleted() {
        assert!(check_send(&chat_in(ChatStatus::Pending)).is_ok());
        assert!(check_send(&chat_in(ChatStatus::Active)).is_ok());
        assert!(check_send(&chat_in(ChatStatus::Closed)).is_err());
        assert!(check_send(&chat_in(ChatStatus::Deleted)).is_err());
        assert!(check_mark_read(&chat_in(ChatStatus::Closed)).is_ok());
        assert!(check_mark_read(&chat_in(ChatStatus::Deleted)).is_err());
    }

    #[test]
    fn content_validation_bounds_the_body() {
        assert!(validate_content("hello").is_ok());
        assert!(validate_content("   ").is_err());
        assert!(validate_content(&"x".repeat(MAX_CONTENT_BYTES + 1)).is_err());
        assert!(validate_subject("Billing").is_ok());
        assert!(validate_subject("").is_err());
    }
}
