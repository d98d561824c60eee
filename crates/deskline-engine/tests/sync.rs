//! Synchronization integration tests.
//!
//! Multiple engines share one in-memory backend, each with its own cache,
//! so everything asserted here travelled through the outbox drain or the
//! change-stream merge.

mod common;

use deskline_engine::{ChatError, EngineEvent};
use deskline_remote::DocPath;
use deskline_shared::{ChatStatus, MessageStatus, Session};
use deskline_store::OutboxOp;

/// Entries queued before the sync loops exist drain as soon as they start,
/// which is exactly the restart-with-a-full-outbox shape.
#[tokio::test]
async fn queued_entries_drain_once_sync_starts() {
    common::init_test_logging();
    let remote = common::backend();
    let engine = common::engine(&remote);
    let user = Session::user("user-1", "Ulla");

    let chat = engine
        .create_chat(&user, "No sound", "Speakers went quiet")
        .await
        .unwrap();
    engine
        .send_message(&user, &chat.id, "Restarting did nothing")
        .await
        .unwrap();
    assert_eq!(engine.outbox_len().unwrap(), 4);
    assert_eq!(remote.doc_count(), 0);

    let handle = engine.start_sync().unwrap();
    common::wait_until("outbox drained", || engine.outbox_len().unwrap() == 0).await;
    assert_eq!(remote.doc_count(), 4);
    common::wait_for_messages(&engine, &chat.id, "messages acknowledged", |messages| {
        messages.len() == 2
            && messages.iter().all(|m| {
                matches!(
                    m.status,
                    MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Read
                )
            })
    })
    .await;

    handle.shutdown().await;
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    common::init_test_logging();
    let remote = common::backend();
    let device = common::device(&remote);
    let user = Session::user("user-1", "Ulla");

    // The first two remote calls fail; backoff retries carry the head
    // entry through.
    remote.fail_next(2);
    let chat = device
        .engine
        .create_chat(&user, "Flaky wifi", "Drops every few minutes")
        .await
        .unwrap();

    common::wait_until("outbox drained despite faults", || {
        device.engine.outbox_len().unwrap() == 0
    })
    .await;
    assert_eq!(remote.doc_count(), 3);
    assert!(remote.snapshot(&DocPath::chat(&chat.id)).is_some());

    device.stop().await;
}

/// A head entry that exhausts its retry budget parks as failed and blocks
/// the rest of the chat's queue until the user retries it.
#[tokio::test]
async fn exhausted_entry_blocks_the_queue_until_retried() {
    common::init_test_logging();
    let remote = common::backend();
    let device = common::device(&remote);
    let user = Session::user("user-1", "Ulla");
    let mut events = device.engine.subscribe();

    let chat = device
        .engine
        .create_chat(&user, "Attachment stuck", "Upload hangs at 99%")
        .await
        .unwrap();
    common::wait_until("initial push drained", || {
        device.engine.outbox_len().unwrap() == 0
    })
    .await;

    remote.set_online(false);
    let stuck = device
        .engine
        .send_message(&user, &chat.id, "Still stuck today")
        .await
        .unwrap();

    common::wait_until("entry parked as failed", || {
        device.engine.failed_syncs(Some(&chat.id)).unwrap().len() == 1
    })
    .await;
    let failed = &device.engine.failed_syncs(Some(&chat.id)).unwrap()[0];
    assert!(matches!(failed.op, OutboxOp::PutMessage { .. }));
    assert!(failed.attempts > 0);

    common::next_event_matching(&mut events, "message marked failed", |event| {
        matches!(
            event,
            EngineEvent::MessageStatusChanged { message_id, status, .. }
                if *message_id == stuck.id && *status == MessageStatus::Failed
        )
    })
    .await;
    common::next_event_matching(&mut events, "outbox failure surfaced", |event| {
        matches!(event, EngineEvent::OutboxEntryFailed { chat_id, .. } if *chat_id == chat.id)
    })
    .await;

    // A further message queues behind the failed head and is never
    // attempted on its own.
    let blocked = device
        .engine
        .send_message(&user, &chat.id, "And another thing")
        .await
        .unwrap();
    assert_eq!(device.engine.outbox_len().unwrap(), 2);
    common::wait_for_messages(&device.engine, &chat.id, "tail stays queued", |messages| {
        messages
            .iter()
            .any(|m| m.id == blocked.id && m.status == MessageStatus::Sending)
    })
    .await;

    remote.set_online(true);
    assert_eq!(device.engine.retry_chat_sync(&chat.id).await.unwrap(), 1);
    common::wait_until("queue drained after retry", || {
        device.engine.outbox_len().unwrap() == 0
    })
    .await;
    common::wait_for_messages(&device.engine, &chat.id, "both messages sent", |messages| {
        messages
            .iter()
            .filter(|m| m.id == stuck.id || m.id == blocked.id)
            .all(|m| {
                matches!(
                    m.status,
                    MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Read
                )
            })
    })
    .await;
    assert_eq!(remote.doc_count(), 5);

    device.stop().await;
}

/// Two operators race for the same pending chat; the remote compare-and-set
/// picks exactly one winner and the loser rolls back.
#[tokio::test]
async fn accept_race_has_a_single_winner() {
    common::init_test_logging();
    let remote = common::backend();
    let user_device = common::device(&remote);
    let first_device = common::device(&remote);
    let second_device = common::device(&remote);

    let user = Session::user("user-1", "Ulla");
    let first = Session::operator("op-1", "Abe");
    let second = Session::operator("op-2", "Bea");

    let chat = user_device
        .engine
        .create_chat(&user, "Race me", "Two of you, one of me")
        .await
        .unwrap();
    common::wait_until("both operators see the chat", || {
        first_device.engine.chat(&chat.id).is_ok() && second_device.engine.chat(&chat.id).is_ok()
    })
    .await;

    let (first_result, second_result) = tokio::join!(
        first_device.engine.accept_chat(&first, &chat.id),
        second_device.engine.accept_chat(&second, &chat.id),
    );

    let winners = [first_result.is_ok(), second_result.is_ok()]
        .iter()
        .filter(|ok| **ok)
        .count();
    assert_eq!(winners, 1, "exactly one claim must win");
    let (winner_id, loser_session, loser_device) = if first_result.is_ok() {
        assert!(matches!(
            second_result.unwrap_err(),
            ChatError::ChatAlreadyAssigned { .. }
        ));
        (&first.user_id, &second, &second_device)
    } else {
        assert!(matches!(
            first_result.unwrap_err(),
            ChatError::ChatAlreadyAssigned { .. }
        ));
        (&second.user_id, &first, &first_device)
    };

    for device in [&user_device, &first_device, &second_device] {
        let engine = &device.engine;
        common::wait_until("all devices converge on the winner", || {
            engine
                .chat(&chat.id)
                .map(|c| {
                    c.status == ChatStatus::Active
                        && c.assigned_operator_id.as_ref() == Some(winner_id)
                })
                .unwrap_or(false)
        })
        .await;
    }

    // The loser's provisional membership was rolled back.
    assert_eq!(
        loser_device
            .engine
            .unread_count(loser_session, &chat.id)
            .unwrap(),
        0
    );

    user_device.stop().await;
    first_device.stop().await;
    second_device.stop().await;
}

/// A conversation across two devices: messages converge without duplicates
/// and read markers come back as receipts on the sender's copies.
#[tokio::test]
async fn two_devices_converge_with_read_receipts() {
    common::init_test_logging();
    let remote = common::backend();
    let user_device = common::device(&remote);
    let op_device = common::device(&remote);
    let user = Session::user("user-1", "Ulla");
    let operator = Session::operator("op-1", "Olga");

    let chat = user_device
        .engine
        .create_chat(&user, "Screen flickers", "Only during calls")
        .await
        .unwrap();
    common::wait_until("operator sees the pending chat", || {
        !op_device.engine.pending_queue(&operator).unwrap().is_empty()
    })
    .await;

    op_device.engine.accept_chat(&operator, &chat.id).await.unwrap();
    common::wait_until("user sees the claim", || {
        user_device
            .engine
            .chat(&chat.id)
            .map(|c| c.assigned_operator_id.as_ref() == Some(&operator.user_id))
            .unwrap_or(false)
    })
    .await;

    user_device
        .engine
        .send_message(&user, &chat.id, "Happens on the external screen too")
        .await
        .unwrap();
    common::wait_for_messages(&op_device.engine, &chat.id, "reply arrives", |messages| {
        messages.len() == 2
    })
    .await;
    common::wait_until("operator backlog counts both messages", || {
        op_device.engine.unread_count(&operator, &chat.id).unwrap() == 2
    })
    .await;

    op_device.engine.mark_read(&operator, &chat.id).await.unwrap();
    assert_eq!(
        op_device.engine.unread_count(&operator, &chat.id).unwrap(),
        0
    );
    common::wait_for_messages(
        &user_device.engine,
        &chat.id,
        "receipts reach the sender",
        |messages| messages.iter().all(|m| m.status == MessageStatus::Read),
    )
    .await;

    // And the same in the other direction.
    op_device
        .engine
        .send_message(&operator, &chat.id, "Which cable is it on?")
        .await
        .unwrap();
    common::wait_for_messages(&user_device.engine, &chat.id, "question arrives", |messages| {
        messages.len() == 3
    })
    .await;
    common::wait_until("user unread moves", || {
        user_device.engine.unread_count(&user, &chat.id).unwrap() == 1
    })
    .await;
    user_device.engine.mark_read(&user, &chat.id).await.unwrap();
    common::wait_for_messages(
        &op_device.engine,
        &chat.id,
        "receipt for the question",
        |messages| messages.iter().all(|m| m.status == MessageStatus::Read),
    )
    .await;

    // No duplicates from either device's own echo.
    assert_eq!(
        op_device
            .engine
            .messages_for_chat(&chat.id)
            .await
            .unwrap()
            .len(),
        3
    );

    user_device.stop().await;
    op_device.stop().await;
}

/// A device that joins late bootstraps the chat, lazily fetches its
/// history and seeds a claimed backlog from it.
#[tokio::test]
async fn late_device_bootstraps_history_and_backlog() {
    common::init_test_logging();
    let remote = common::backend();
    let user_device = common::device(&remote);
    let user = Session::user("user-1", "Ulla");
    let operator = Session::operator("op-1", "Olga");

    let chat = user_device
        .engine
        .create_chat(&user, "Keyboard layout", "Keys type the wrong letters")
        .await
        .unwrap();
    for text in ["It started after the update", "Only in the editor"] {
        user_device
            .engine
            .send_message(&user, &chat.id, text)
            .await
            .unwrap();
    }
    common::wait_until("history pushed", || {
        user_device.engine.outbox_len().unwrap() == 0
    })
    .await;

    let op_device = common::device(&remote);
    common::wait_until("late device sees the pending chat", || {
        !op_device.engine.pending_queue(&operator).unwrap().is_empty()
    })
    .await;

    let history = op_device.engine.messages_for_chat(&chat.id).await.unwrap();
    assert_eq!(history.len(), 3);
    let local: Vec<_> = user_device
        .engine
        .messages_for_chat(&chat.id)
        .await
        .unwrap()
        .iter()
        .map(|m| m.id)
        .collect();
    let fetched: Vec<_> = history.iter().map(|m| m.id).collect();
    assert_eq!(local, fetched);

    op_device.engine.accept_chat(&operator, &chat.id).await.unwrap();
    assert_eq!(
        op_device.engine.unread_count(&operator, &chat.id).unwrap(),
        3
    );

    op_device.engine.mark_read(&operator, &chat.id).await.unwrap();
    common::wait_for_messages(
        &user_device.engine,
        &chat.id,
        "backlog receipts arrive",
        |messages| messages.iter().all(|m| m.status == MessageStatus::Read),
    )
    .await;

    user_device.stop().await;
    op_device.stop().await;
}

#[tokio::test]
async fn tombstones_propagate_to_other_devices() {
    common::init_test_logging();
    let remote = common::backend();
    let user_device = common::device(&remote);
    let op_device = common::device(&remote);
    let user = Session::user("user-1", "Ulla");
    let operator = Session::operator("op-1", "Olga");

    let chat = user_device
        .engine
        .create_chat(&user, "Nevermind", "Found the power button")
        .await
        .unwrap();
    common::wait_until("operator sees the chat", || {
        op_device.engine.chat(&chat.id).is_ok()
    })
    .await;
    op_device.engine.accept_chat(&operator, &chat.id).await.unwrap();
    assert_eq!(op_device.engine.total_unread(&operator).unwrap(), 1);

    user_device.engine.delete_chat(&user, &chat.id).await.unwrap();
    common::wait_until("tombstone reaches the other device", || {
        op_device
            .engine
            .chat(&chat.id)
            .map(|c| c.status == ChatStatus::Deleted)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(op_device.engine.total_unread(&operator).unwrap(), 0);

    let err = op_device
        .engine
        .send_message(&operator, &chat.id, "hello?")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));

    common::wait_until("tombstone lands remotely", || {
        remote
            .snapshot(&DocPath::chat(&chat.id))
            .and_then(|doc| doc.get("status").and_then(|v| v.as_str()).map(String::from))
            .as_deref()
            == Some("deleted")
    })
    .await;
    let doc = remote.snapshot(&DocPath::chat(&chat.id)).unwrap();
    assert_eq!(doc.get("deleted").and_then(|v| v.as_bool()), Some(true));

    user_device.stop().await;
    op_device.stop().await;
}

/// Full support session: open, claim, converse, read, close, reopen.
#[tokio::test]
async fn end_to_end_support_session() {
    common::init_test_logging();
    let remote = common::backend();
    let user_device = common::device(&remote);
    let op_device = common::device(&remote);
    let user = Session::user("user-1", "Ulla");
    let operator = Session::operator("op-1", "Olga");

    let chat = user_device
        .engine
        .create_chat(&user, "Calendar is empty", "All my meetings vanished")
        .await
        .unwrap();

    common::wait_until("chat shows up in the operator queue", || {
        op_device
            .engine
            .pending_queue(&operator)
            .unwrap()
            .iter()
            .any(|c| c.id == chat.id)
    })
    .await;
    op_device.engine.accept_chat(&operator, &chat.id).await.unwrap();
    common::wait_until("user sees the chat go active", || {
        user_device
            .engine
            .chat(&chat.id)
            .map(|c| c.status == ChatStatus::Active)
            .unwrap_or(false)
    })
    .await;

    user_device
        .engine
        .send_message(&user, &chat.id, "They were there on Friday")
        .await
        .unwrap();
    common::wait_for_messages(&op_device.engine, &chat.id, "operator sees it", |m| {
        m.len() == 2
    })
    .await;
    op_device.engine.mark_read(&operator, &chat.id).await.unwrap();
    op_device
        .engine
        .send_message(&operator, &chat.id, "Which account are you signed into?")
        .await
        .unwrap();
    common::wait_for_messages(&user_device.engine, &chat.id, "user sees the reply", |m| {
        m.len() == 3
    })
    .await;
    user_device.engine.mark_read(&user, &chat.id).await.unwrap();

    op_device.engine.close_chat(&operator, &chat.id).await.unwrap();
    common::wait_until("user sees the close", || {
        user_device
            .engine
            .chat(&chat.id)
            .map(|c| c.status == ChatStatus::Closed)
            .unwrap_or(false)
    })
    .await;

    op_device.engine.reopen_chat(&operator, &chat.id).await.unwrap();
    common::wait_until("user sees the reopen", || {
        user_device
            .engine
            .chat(&chat.id)
            .map(|c| c.status == ChatStatus::Active)
            .unwrap_or(false)
    })
    .await;

    for device in [&user_device, &op_device] {
        let engine = &device.engine;
        common::wait_until("both outboxes drained", || {
            engine.outbox_len().unwrap() == 0
        })
        .await;
        common::wait_for_messages(engine, &chat.id, "everything read everywhere", |messages| {
            messages.len() == 3 && messages.iter().all(|m| m.status == MessageStatus::Read)
        })
        .await;
    }

    let user_order: Vec<_> = user_device
        .engine
        .messages_for_chat(&chat.id)
        .await
        .unwrap()
        .iter()
        .map(|m| m.id)
        .collect();
    let op_order: Vec<_> = op_device
        .engine
        .messages_for_chat(&chat.id)
        .await
        .unwrap()
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(user_order, op_order);

    // One chat, two participants, three messages.
    assert_eq!(remote.doc_count(), 6);
    assert_eq!(user_device.engine.total_unread(&user).unwrap(), 0);
    assert_eq!(op_device.engine.total_unread(&operator).unwrap(), 0);

    user_device.stop().await;
    op_device.stop().await;
}
