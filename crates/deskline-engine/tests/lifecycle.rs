//! Chat lifecycle integration tests.
//!
//! These run a single engine with no background sync so every assertion
//! sees deterministic local state; only `accept_chat` touches the backend
//! through its inline claim push.

mod common;

use deskline_engine::ChatError;
use deskline_shared::{ChatStatus, MessageStatus, Session, MAX_CONTENT_BYTES};

#[tokio::test]
async fn create_chat_is_visible_before_any_push() {
    common::init_test_logging();
    let remote = common::backend();
    let engine = common::engine(&remote);
    let user = Session::user("user-1", "Ulla");

    let chat = engine
        .create_chat(&user, "Printer on fire", "It only prints ash now")
        .await
        .unwrap();

    assert_eq!(chat.status, ChatStatus::Pending);
    assert_eq!(chat.creator_id, user.user_id);
    assert_eq!(chat.assigned_operator_id, None);
    assert_eq!(
        chat.last_message_text.as_deref(),
        Some("It only prints ash now")
    );

    // Chat, creator participant and first message are queued, not pushed.
    assert_eq!(engine.outbox_len().unwrap(), 3);
    assert_eq!(remote.doc_count(), 0);

    let listed = engine.chats_for_user(&user, None).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, chat.id);

    let messages = engine.messages_for_chat(&chat.id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, MessageStatus::Sending);
}

#[tokio::test]
async fn subjects_and_contents_are_validated() {
    let remote = common::backend();
    let engine = common::engine(&remote);
    let user = Session::user("user-1", "Ulla");

    let err = engine
        .create_chat(&user, "   ", "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));

    let err = engine
        .create_chat(&user, "Subject", "")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));

    let chat = engine
        .create_chat(&user, "Subject", "hello")
        .await
        .unwrap();
    let oversized = "x".repeat(MAX_CONTENT_BYTES + 1);
    let err = engine
        .send_message(&user, &chat.id, &oversized)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));
}

/// Claiming a pending chat assigns the operator and seeds their unread
/// count from the existing backlog.
#[tokio::test]
async fn accept_assigns_and_seeds_the_backlog() {
    common::init_test_logging();
    let remote = common::backend();
    let engine = common::engine(&remote);
    let user = Session::user("user-1", "Ulla");
    let operator = Session::operator("op-1", "Olga");

    let chat = engine
        .create_chat(&user, "VPN drops hourly", "Tunnel dies at :00")
        .await
        .unwrap();

    let accepted = engine.accept_chat(&operator, &chat.id).await.unwrap();
    assert_eq!(accepted.status, ChatStatus::Active);
    assert_eq!(
        accepted.assigned_operator_id.as_ref(),
        Some(&operator.user_id)
    );
    assert_eq!(engine.unread_count(&operator, &chat.id).unwrap(), 1);

    // The inline claim push settles the whole queue for this chat.
    assert_eq!(engine.outbox_len().unwrap(), 0);
    assert!(remote.doc_count() > 0);
}

#[tokio::test]
async fn accept_refuses_plain_users_and_taken_chats() {
    let remote = common::backend();
    let engine = common::engine(&remote);
    let user = Session::user("user-1", "Ulla");
    let first = Session::operator("op-1", "Olga");
    let second = Session::operator("op-2", "Omar");

    let chat = engine
        .create_chat(&user, "Login loop", "Password page repeats")
        .await
        .unwrap();

    let err = engine.accept_chat(&user, &chat.id).await.unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));

    engine.accept_chat(&first, &chat.id).await.unwrap();
    let err = engine.accept_chat(&second, &chat.id).await.unwrap_err();
    assert!(matches!(err, ChatError::ChatAlreadyAssigned { .. }));
}

#[tokio::test]
async fn decline_is_privileged_and_idempotent() {
    let remote = common::backend();
    let engine = common::engine(&remote);
    let user = Session::user("user-1", "Ulla");
    let operator = Session::operator("op-1", "Olga");

    let chat = engine
        .create_chat(&user, "Wrong department", "Can you fix my chair")
        .await
        .unwrap();

    let err = engine.decline_chat(&user, &chat.id).await.unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));

    engine.decline_chat(&operator, &chat.id).await.unwrap();
    assert_eq!(engine.chat(&chat.id).unwrap().status, ChatStatus::Deleted);

    // A second decline, e.g. from another operator's stale view, is a no-op.
    engine.decline_chat(&operator, &chat.id).await.unwrap();

    let err = engine
        .send_message(&user, &chat.id, "hello?")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));
}

#[tokio::test]
async fn close_and_reopen_follow_standing() {
    let remote = common::backend();
    let engine = common::engine(&remote);
    let user = Session::user("user-1", "Ulla");
    let operator = Session::operator("op-1", "Olga");
    let stranger = Session::user("user-2", "Sten");

    let chat = engine
        .create_chat(&user, "Slow reports", "Dashboard takes minutes")
        .await
        .unwrap();
    engine.accept_chat(&operator, &chat.id).await.unwrap();

    let err = engine.close_chat(&stranger, &chat.id).await.unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));

    // The creator may close; the assignment survives for reopening.
    engine.close_chat(&user, &chat.id).await.unwrap();
    let closed = engine.chat(&chat.id).unwrap();
    assert_eq!(closed.status, ChatStatus::Closed);
    assert_eq!(
        closed.assigned_operator_id.as_ref(),
        Some(&operator.user_id)
    );

    engine.close_chat(&user, &chat.id).await.unwrap();

    let err = engine.reopen_chat(&user, &chat.id).await.unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));

    engine.reopen_chat(&operator, &chat.id).await.unwrap();
    assert_eq!(engine.chat(&chat.id).unwrap().status, ChatStatus::Active);
    engine.reopen_chat(&operator, &chat.id).await.unwrap();

    let err = engine
        .close_chat(&stranger, &chat.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));
    engine.close_chat(&operator, &chat.id).await.unwrap();
    assert_eq!(engine.chat(&chat.id).unwrap().status, ChatStatus::Closed);
}

#[tokio::test]
async fn messages_are_refused_outside_pending_and_active() {
    let remote = common::backend();
    let engine = common::engine(&remote);
    let user = Session::user("user-1", "Ulla");
    let operator = Session::operator("op-1", "Olga");

    let chat = engine
        .create_chat(&user, "Mouse jitters", "Cursor shakes on Mondays")
        .await
        .unwrap();
    engine.accept_chat(&operator, &chat.id).await.unwrap();
    engine.close_chat(&operator, &chat.id).await.unwrap();

    let err = engine
        .send_message(&user, &chat.id, "one more thing")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));

    // Reading a closed chat is still fine.
    engine.mark_read(&user, &chat.id).await.unwrap();
}

#[tokio::test]
async fn delete_requires_creator_or_admin() {
    let remote = common::backend();
    let engine = common::engine(&remote);
    let user = Session::user("user-1", "Ulla");
    let operator = Session::operator("op-1", "Olga");
    let admin = Session::admin("admin-1", "Ada");

    let chat = engine
        .create_chat(&user, "Duplicate ticket", "Opened this twice, sorry")
        .await
        .unwrap();
    engine.accept_chat(&operator, &chat.id).await.unwrap();

    // The assignee has no standing to delete someone else's chat.
    let err = engine.delete_chat(&operator, &chat.id).await.unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));

    engine.delete_chat(&user, &chat.id).await.unwrap();
    assert_eq!(engine.chat(&chat.id).unwrap().status, ChatStatus::Deleted);
    engine.delete_chat(&admin, &chat.id).await.unwrap();

    let visible = engine
        .chats_for_user(
            &user,
            Some(&[ChatStatus::Pending, ChatStatus::Active, ChatStatus::Closed]),
        )
        .unwrap();
    assert!(visible.is_empty());
    assert_eq!(engine.chats_for_user(&user, None).unwrap().len(), 1);
}

/// The per-participant counters move with every message from someone else
/// and reset on read, and tombstoned chats drop out of the badge total.
#[tokio::test]
async fn unread_counts_follow_the_conversation() {
    common::init_test_logging();
    let remote = common::backend();
    let engine = common::engine(&remote);
    let user = Session::user("user-1", "Ulla");
    let operator = Session::operator("op-1", "Olga");

    let chat = engine
        .create_chat(&user, "Broken export", "CSV has no rows")
        .await
        .unwrap();
    engine.accept_chat(&operator, &chat.id).await.unwrap();
    assert_eq!(engine.unread_count(&operator, &chat.id).unwrap(), 1);
    assert_eq!(engine.unread_count(&user, &chat.id).unwrap(), 0);

    engine
        .send_message(&operator, &chat.id, "Which report is this?")
        .await
        .unwrap();
    assert_eq!(engine.unread_count(&user, &chat.id).unwrap(), 1);
    assert_eq!(engine.unread_count(&operator, &chat.id).unwrap(), 1);

    engine
        .send_message(&user, &chat.id, "The quarterly one")
        .await
        .unwrap();
    assert_eq!(engine.unread_count(&operator, &chat.id).unwrap(), 2);
    assert_eq!(engine.total_unread(&operator).unwrap(), 2);

    engine.mark_read(&operator, &chat.id).await.unwrap();
    assert_eq!(engine.unread_count(&operator, &chat.id).unwrap(), 0);
    engine.mark_read(&operator, &chat.id).await.unwrap();
    assert_eq!(engine.unread_count(&operator, &chat.id).unwrap(), 0);

    // No drift between the counters and the message log.
    assert!(engine.reconcile_chat(&chat.id).await.unwrap().is_empty());

    engine.delete_chat(&user, &chat.id).await.unwrap();
    assert_eq!(engine.total_unread(&user).unwrap(), 0);
}

#[tokio::test]
async fn send_times_stay_monotonic_per_sender() {
    let remote = common::backend();
    let engine = common::engine(&remote);
    let user = Session::user("user-1", "Ulla");

    let chat = engine
        .create_chat(&user, "Typing test", "first")
        .await
        .unwrap();
    for text in ["second", "third", "fourth"] {
        engine.send_message(&user, &chat.id, text).await.unwrap();
    }

    let messages = engine.messages_for_chat(&chat.id).await.unwrap();
    let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["first", "second", "third", "fourth"]);
    for pair in messages.windows(2) {
        assert!(pair[0].timestamp < pair[1].timestamp);
    }

    let chat = engine.chat(&chat.id).unwrap();
    assert_eq!(chat.last_message_text.as_deref(), Some("fourth"));
    assert_eq!(chat.last_message_time, messages.last().map(|m| m.timestamp));
}

#[tokio::test]
async fn pending_queue_is_operator_only_and_oldest_first() {
    let remote = common::backend();
    let engine = common::engine(&remote);
    let user = Session::user("user-1", "Ulla");
    let operator = Session::operator("op-1", "Olga");

    let older = engine
        .create_chat(&user, "First in line", "hello")
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let newer = engine
        .create_chat(&user, "Second in line", "hello again")
        .await
        .unwrap();

    let err = engine.pending_queue(&user).unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));

    let queue = engine.pending_queue(&operator).unwrap();
    let ids: Vec<_> = queue.iter().map(|c| c.id.clone()).collect();
    assert_eq!(ids, [older.id.clone(), newer.id.clone()]);

    engine.accept_chat(&operator, &older.id).await.unwrap();
    let queue = engine.pending_queue(&operator).unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].id, newer.id);
}
