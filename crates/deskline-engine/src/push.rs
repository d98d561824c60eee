//! Push half of the synchronizer: draining the outbox to the remote store.
//!
//! One coordinator task owns a worker per chat with queued work.  A worker
//! drains its chat strictly head-first: transient failures back off and
//! retry in place, so nothing behind the head is ever reordered around it.
//! Only a refused compare-and-set skips an entry, and that path rolls the
//! local state back instead.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};

use deskline_remote::{DocPath, RemoteError};
use deskline_shared::{ChatId, ChatStatus, MessageStatus, Participant};
use deskline_store::{OutboxEntry, OutboxOp};

use crate::backoff::RetryState;
use crate::docs;
use crate::engine::ChatEngine;
use crate::error::Result;
use crate::events::EngineEvent;

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Owns the per-chat drain workers.  Kicks from mutations start a worker
/// immediately; the periodic sweep picks up dropped kicks and work left
/// over from a previous run.
pub(crate) async fn coordinator(
    engine: Arc<ChatEngine>,
    mut kicks: mpsc::Receiver<ChatId>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut workers: HashMap<ChatId, JoinHandle<()>> = HashMap::new();
    let mut sweep = interval(engine.config.drain_interval);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            kicked = kicks.recv() => {
                match kicked {
                    Some(chat_id) => spawn_worker(&engine, &mut workers, chat_id, &shutdown),
                    None => break,
                }
            }
            _ = sweep.tick() => {
                workers.retain(|_, handle| !handle.is_finished());
                match engine.db().pending_chats() {
                    Ok(chat_ids) => {
                        for chat_id in chat_ids {
                            spawn_worker(&engine, &mut workers, chat_id, &shutdown);
                        }
                    }
                    Err(error) => tracing::error!(%error, "pending sweep failed"),
                }
            }
        }
    }

    // Workers watch the same shutdown signal; let each finish the entry it
    // is delivering rather than tearing it down mid-call.
    for (_, handle) in workers.drain() {
        let _ = handle.await;
    }
}

fn spawn_worker(
    engine: &Arc<ChatEngine>,
    workers: &mut HashMap<ChatId, JoinHandle<()>>,
    chat_id: ChatId,
    shutdown: &watch::Receiver<bool>,
) {
    if let Some(handle) = workers.get(&chat_id) {
        if !handle.is_finished() {
            return;
        }
    }
    let handle = tokio::spawn(drain_chat(
        Arc::clone(engine),
        chat_id.clone(),
        shutdown.clone(),
    ));
    workers.insert(chat_id, handle);
}

// ---------------------------------------------------------------------------
// Per-chat drain
// ---------------------------------------------------------------------------

/// Drain one chat's queue until it is empty, blocked on a failed head, or
/// shut down.
async fn drain_chat(engine: Arc<ChatEngine>, chat_id: ChatId, mut shutdown: watch::Receiver<bool>) {
    let drain_lock = engine.drain_locks.get(&chat_id);
    let _drain_guard = drain_lock.lock().await;

    let mut retry = RetryState::new(engine.config.retry_initial, engine.config.retry_max);

    loop {
        if *shutdown.borrow() {
            return;
        }

        let entry = match engine.db().next_pending(&chat_id) {
            Ok(Some(entry)) => entry,
            Ok(None) => return,
            Err(error) => {
                tracing::error!(chat_id = %chat_id.short(), %error, "outbox read failed");
                return;
            }
        };

        match deliver(&engine, &entry).await {
            Ok(()) => {
                retry.reset();
                if let Err(error) = post_apply(&engine, &entry) {
                    tracing::error!(
                        chat_id = %chat_id.short(),
                        seq = entry.seq,
                        %error,
                        "post-apply bookkeeping failed"
                    );
                    return;
                }
            }
            Err(ApplyError::Conflict) => {
                if let Err(error) = handle_conflict(&engine, &entry).await {
                    tracing::error!(
                        chat_id = %chat_id.short(),
                        seq = entry.seq,
                        %error,
                        "conflict rollback failed"
                    );
                    return;
                }
                retry.reset();
            }
            Err(ApplyError::Transient(remote_error)) => {
                let attempts = match engine
                    .db()
                    .record_attempt(entry.seq, &remote_error.to_string())
                {
                    Ok(attempts) => attempts,
                    Err(error) => {
                        tracing::error!(chat_id = %chat_id.short(), %error, "attempt bookkeeping failed");
                        return;
                    }
                };

                if attempts >= engine.config.max_attempts {
                    give_up(&engine, &entry, &remote_error);
                    return;
                }

                let delay = retry.next_delay();
                tracing::debug!(
                    chat_id = %chat_id.short(),
                    seq = entry.seq,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %remote_error,
                    "delivery failed, backing off"
                );
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }
    }
}

/// Outcome of [`drain_now`].
pub(crate) enum InlineDrain {
    /// Queue empty, everything acknowledged.
    Completed,
    /// A transient failure stopped the drain; the background worker takes
    /// the queue over.
    Deferred,
    /// An entry was refused and rolled back.
    Conflicted,
}

/// Drain a chat's queue in the caller's task, without backoff sleeps.
/// Accept runs this inline so the operator learns the claim outcome
/// synchronously while the backend is reachable.
pub(crate) async fn drain_now(engine: &Arc<ChatEngine>, chat_id: &ChatId) -> Result<InlineDrain> {
    let drain_lock = engine.drain_locks.get(chat_id);
    let _drain_guard = drain_lock.lock().await;

    loop {
        let entry = match engine.db().next_pending(chat_id)? {
            Some(entry) => entry,
            None => return Ok(InlineDrain::Completed),
        };

        match deliver(engine, &entry).await {
            Ok(()) => post_apply(engine, &entry)?,
            Err(ApplyError::Conflict) => {
                handle_conflict(engine, &entry).await?;
                return Ok(InlineDrain::Conflicted);
            }
            Err(ApplyError::Transient(error)) => {
                engine.db().record_attempt(entry.seq, &error.to_string())?;
                tracing::debug!(chat_id = %chat_id.short(), seq = entry.seq, %error, "inline drain deferred");
                engine.kick(chat_id);
                return Ok(InlineDrain::Deferred);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Applying one entry
// ---------------------------------------------------------------------------

enum ApplyError {
    /// The remote store refused the mutation; roll back, do not retry.
    Conflict,
    /// Worth retrying.
    Transient(RemoteError),
}

/// Deliver one outbox entry to the remote store.
async fn deliver(engine: &ChatEngine, entry: &OutboxEntry) -> std::result::Result<(), ApplyError> {
    match &entry.op {
        OutboxOp::PutChat { chat } => {
            let doc = encode(docs::chat_doc(chat))?;
            remote_call(engine, engine.remote.set(&DocPath::chat(&entry.chat_id), doc)).await
        }
        OutboxOp::UpdateChatStatus {
            status,
            assigned_operator_id,
        } => {
            let fields = encode(docs::status_fields(*status, assigned_operator_id))?;
            remote_call(
                engine,
                engine.remote.update(&DocPath::chat(&entry.chat_id), fields),
            )
            .await
        }
        OutboxOp::AcceptChat { operator } => accept_remote(engine, entry, operator).await,
        OutboxOp::TombstoneChat => tombstone_remote(engine, &entry.chat_id).await,
        OutboxOp::PutMessage { message } => {
            let doc = encode(docs::message_doc(message))?;
            remote_call(
                engine,
                engine
                    .remote
                    .set(&DocPath::message(&entry.chat_id, &message.id), doc),
            )
            .await
        }
        OutboxOp::PutParticipant { participant } => {
            let doc = encode(docs::participant_doc(participant))?;
            remote_call(
                engine,
                engine.remote.set(
                    &DocPath::participant(&entry.chat_id, &participant.user_id),
                    doc,
                ),
            )
            .await
        }
        OutboxOp::MarkRead {
            user_id,
            last_read_at,
        } => {
            let mut fields = serde_json::Map::new();
            fields.insert("unread_count".into(), Value::from(0u32));
            fields.insert(
                "last_read_at".into(),
                encode(serde_json::to_value(last_read_at))?,
            );
            remote_call(
                engine,
                engine
                    .remote
                    .update(&DocPath::participant(&entry.chat_id, user_id), fields),
            )
            .await
        }
    }
}

/// The assignment claim: one compare-and-set on the chat document, then
/// the activation fields and the operator's membership document.
async fn accept_remote(
    engine: &ChatEngine,
    entry: &OutboxEntry,
    operator: &Participant,
) -> std::result::Result<(), ApplyError> {
    let chat_path = DocPath::chat(&entry.chat_id);
    let uid = Value::String(operator.user_id.to_string());

    let won = remote_call(
        engine,
        engine.remote.compare_and_set(
            &chat_path,
            "assigned_operator_id",
            Value::Null,
            uid.clone(),
        ),
    )
    .await?;

    if !won {
        // A redelivery after a crash can find its own earlier claim in
        // place; only someone else's claim is a conflict.
        let current = remote_call(engine, engine.remote.get(&chat_path)).await?;
        let ours = current
            .as_ref()
            .and_then(|doc| doc.get("assigned_operator_id"))
            .is_some_and(|value| *value == uid);
        if !ours {
            return Err(ApplyError::Conflict);
        }
    }

    let fields = encode(docs::status_fields(
        ChatStatus::Active,
        &Some(operator.user_id.clone()),
    ))?;
    remote_call(engine, engine.remote.update(&chat_path, fields)).await?;

    let doc = encode(docs::participant_doc(operator))?;
    remote_call(
        engine,
        engine.remote.set(
            &DocPath::participant(&entry.chat_id, &operator.user_id),
            doc,
        ),
    )
    .await
}

/// Flag the chat document deleted and cascade the flag to every cached
/// message document.
async fn tombstone_remote(
    engine: &ChatEngine,
    chat_id: &ChatId,
) -> std::result::Result<(), ApplyError> {
    let mut fields = serde_json::Map::new();
    fields.insert("status".into(), Value::from(ChatStatus::Deleted.as_str()));
    fields.insert("assigned_operator_id".into(), Value::Null);
    fields.insert("deleted".into(), Value::from(true));
    remote_call(engine, engine.remote.update(&DocPath::chat(chat_id), fields)).await?;

    let message_ids = engine
        .db()
        .message_ids(chat_id)
        .map_err(|error| ApplyError::Transient(RemoteError::Backend(format!("local read: {error}"))))?;

    let mut tombstone = serde_json::Map::new();
    tombstone.insert("deleted".into(), Value::from(true));
    let paths: Vec<DocPath> = message_ids
        .iter()
        .map(|message_id| DocPath::message(chat_id, message_id))
        .collect();
    let updates = paths
        .iter()
        .map(|path| engine.remote.update(path, tombstone.clone()));
    remote_call(engine, futures::future::try_join_all(updates)).await?;
    Ok(())
}

fn encode<T>(result: std::result::Result<T, serde_json::Error>) -> std::result::Result<T, ApplyError> {
    result.map_err(|error| ApplyError::Transient(RemoteError::Backend(format!("encode: {error}"))))
}

/// Run one remote call under the configured deadline, folding timeouts
/// into the transient error space.
async fn remote_call<T, F>(engine: &ChatEngine, call: F) -> std::result::Result<T, ApplyError>
where
    F: std::future::Future<Output = std::result::Result<T, RemoteError>>,
{
    match timeout(engine.config.remote_timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(ApplyError::Transient(error)),
        Err(_) => Err(ApplyError::Transient(RemoteError::Timeout)),
    }
}

// ---------------------------------------------------------------------------
// Post-delivery bookkeeping
// ---------------------------------------------------------------------------

/// Bookkeeping after the remote store acknowledged one entry.
fn post_apply(engine: &ChatEngine, entry: &OutboxEntry) -> Result<()> {
    let db = engine.db();
    db.remove_entry(entry.seq)?;

    // The entity is clean once nothing else in the queue targets it.
    let clean = db
        .pending_ops_for_entity(entry.entity_type, &entry.entity_id)?
        .is_empty();

    match &entry.op {
        OutboxOp::PutMessage { message } => {
            db.mark_message_sent(&message.id)?;
            let status = db.find_message(&message.id)?.map(|r| r.message.status);
            drop(db);
            if let Some(status) = status {
                engine.emit(EngineEvent::MessageStatusChanged {
                    chat_id: entry.chat_id.clone(),
                    message_id: message.id,
                    status,
                });
            }
        }
        OutboxOp::PutChat { .. }
        | OutboxOp::UpdateChatStatus { .. }
        | OutboxOp::AcceptChat { .. }
        | OutboxOp::TombstoneChat => {
            if clean {
                db.mark_chat_synced(&entry.chat_id)?;
            }
        }
        OutboxOp::PutParticipant { participant } => {
            if clean {
                db.mark_participant_synced(&entry.chat_id, &participant.user_id)?;
            }
        }
        OutboxOp::MarkRead { user_id, .. } => {
            if clean {
                db.mark_participant_synced(&entry.chat_id, user_id)?;
            }
        }
    }
    Ok(())
}

/// A compare-and-set lost: drop the entry, roll the chat back to remote
/// truth and tell the UI.
async fn handle_conflict(engine: &ChatEngine, entry: &OutboxEntry) -> Result<()> {
    tracing::info!(
        chat_id = %entry.chat_id.short(),
        seq = entry.seq,
        "assignment lost, rolling back"
    );

    let lock = engine.data_locks.get(&entry.chat_id);
    let _guard = lock.lock().await;

    engine.db().remove_entry(entry.seq)?;

    let loser = match &entry.op {
        OutboxOp::AcceptChat { operator } => Some(operator.user_id.clone()),
        _ => None,
    };

    // Remote truth when reachable, the pre-claim state otherwise; either
    // way the next pull converges the rest.
    let remote_chat = match remote_call(engine, engine.remote.get(&DocPath::chat(&entry.chat_id))).await
    {
        Ok(doc) => doc.and_then(|d| docs::chat_from_doc(&d).ok()),
        Err(_) => None,
    };

    {
        let db = engine.db();
        match &remote_chat {
            Some(remote) => {
                db.apply_chat_transition(
                    &entry.chat_id,
                    remote.status,
                    remote.assigned_operator_id.as_ref(),
                )?;
            }
            None => {
                db.apply_chat_transition(&entry.chat_id, ChatStatus::Pending, None)?;
            }
        }
        db.mark_chat_synced(&entry.chat_id)?;
        if let Some(user_id) = &loser {
            db.remove_unsynced_participant(&entry.chat_id, user_id)?;
        }
    }

    let chat = engine.db().get_chat(&entry.chat_id)?.chat;
    let detail = match chat.assigned_operator_id.as_ref() {
        Some(winner) => format!("chat is assigned to {winner}"),
        None => format!("chat is {} on the backend", chat.status),
    };
    engine.emit(EngineEvent::TransitionConflict {
        chat_id: entry.chat_id.clone(),
        detail,
    });
    engine.emit(EngineEvent::ChatUpdated { chat });
    Ok(())
}

/// Park the entry as failed and surface it to the user.
fn give_up(engine: &ChatEngine, entry: &OutboxEntry, error: &RemoteError) {
    tracing::warn!(
        chat_id = %entry.chat_id.short(),
        seq = entry.seq,
        %error,
        "retry budget exhausted"
    );

    let bookkeeping = (|| -> Result<()> {
        let db = engine.db();
        db.mark_entry_failed(entry.seq, &error.to_string())?;
        if let OutboxOp::PutMessage { message } = &entry.op {
            if db.mark_message_failed(&message.id)? {
                drop(db);
                engine.emit(EngineEvent::MessageStatusChanged {
                    chat_id: entry.chat_id.clone(),
                    message_id: message.id,
                    status: MessageStatus::Failed,
                });
            }
        }
        Ok(())
    })();
    if let Err(error) = bookkeeping {
        tracing::error!(chat_id = %entry.chat_id.short(), %error, "failed-entry bookkeeping failed");
    }

    engine.emit(EngineEvent::OutboxEntryFailed {
        chat_id: entry.chat_id.clone(),
        seq: entry.seq,
        error: error.to_string(),
    });
}
