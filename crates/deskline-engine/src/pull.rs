//! Pull half of the synchronizer: merging remote changes into the cache.
//!
//! The loop subscribes to the whole chat tree before it lists it, so no
//! change can slip between bootstrap and stream; replayed documents merge
//! as no-ops.  Every merge runs under the chat's data lock and follows one
//! precedence rule: fields owned by unacknowledged outbox entries keep
//! their local value, everything else takes the remote one.  Messages are
//! immutable and merge by union on their id.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use deskline_remote::{ChangeKind, DocPath, ParsedPath, RemoteChange, WatchEvent};
use deskline_shared::{preview, ChatId, ChatStatus, Message, MessageId, MessageStatus, UserId};
use deskline_store::{ChatRecord, Database, EntityType, MessageRecord, ParticipantRecord};

use crate::docs;
use crate::engine::ChatEngine;
use crate::error::Result;
use crate::events::EngineEvent;
use crate::ledger;

pub(crate) async fn pull_loop(engine: Arc<ChatEngine>, mut shutdown: watch::Receiver<bool>) {
    let mut stream = engine.remote.subscribe(&DocPath::root());

    if let Err(error) = bootstrap(&engine).await {
        tracing::warn!(%error, "bootstrap failed; relying on the change stream");
    }

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            event = stream.next() => {
                match event {
                    Some(WatchEvent::Change(change)) => {
                        if let Err(error) = handle_change(&engine, &change).await {
                            tracing::error!(path = %change.path, %error, "merge failed");
                        }
                    }
                    Some(WatchEvent::Lagged(missed)) => {
                        tracing::warn!(missed, "change stream lagged, relisting");
                        if let Err(error) = bootstrap(&engine).await {
                            tracing::warn!(%error, "relist failed");
                        }
                    }
                    None => {
                        tracing::info!("change stream closed");
                        return;
                    }
                }
            }
        }
    }
}

/// Replay the full remote tree into the cache, then verify the unread
/// ledger of every fully cached chat.
async fn bootstrap(engine: &Arc<ChatEngine>) -> Result<()> {
    let listed = engine.remote.list(&DocPath::root()).await?;
    tracing::info!(documents = listed.len(), "bootstrapping from remote state");

    // List order is lexicographic, which puts each chat document before
    // its message and participant children.
    for (path, doc) in listed {
        let change = RemoteChange {
            kind: ChangeKind::Put,
            path,
            doc: Some(doc),
        };
        if let Err(error) = handle_change(engine, &change).await {
            tracing::error!(path = %change.path, %error, "bootstrap merge failed");
        }
    }

    let chat_ids = engine.db().all_chat_ids()?;
    for chat_id in chat_ids {
        let lock = engine.data_locks.get(&chat_id);
        let _guard = lock.lock().await;

        let Some(record) = engine.db().find_chat(&chat_id)? else {
            continue;
        };
        // Partially cached chats keep the counters their participant
        // documents carry; recounting a partial log would shrink them.
        if !record.is_cache_complete {
            continue;
        }
        let drifts = ledger::reconcile(&engine.db(), &chat_id)?;
        if !drifts.is_empty() {
            tracing::warn!(
                chat_id = %chat_id.short(),
                repaired = drifts.len(),
                "unread ledger repaired during bootstrap"
            );
            engine.emit(EngineEvent::ChatResynced { chat_id });
        }
    }
    Ok(())
}

/// Merge one remote change under its chat's lock.
async fn handle_change(engine: &Arc<ChatEngine>, change: &RemoteChange) -> Result<()> {
    let Some(parsed) = change.path.parse() else {
        tracing::debug!(path = %change.path, "ignoring foreign document");
        return Ok(());
    };

    let chat_id = match &parsed {
        ParsedPath::Chat(id) | ParsedPath::Participant(id, _) | ParsedPath::Message(id, _) => {
            id.clone()
        }
    };
    let lock = engine.data_locks.get(&chat_id);
    let _guard = lock.lock().await;

    match (parsed, change.kind) {
        (ParsedPath::Chat(chat_id), ChangeKind::Put) => {
            if let Some(doc) = &change.doc {
                merge_chat_locked(engine, &chat_id, doc)?;
            }
        }
        (ParsedPath::Chat(chat_id), ChangeKind::Delete) => {
            // Physical removal merges as a tombstone.
            if engine.db().find_chat(&chat_id)?.is_some() {
                engine
                    .db()
                    .apply_chat_transition(&chat_id, ChatStatus::Deleted, None)?;
                engine.db().mark_chat_synced(&chat_id)?;
                let chat = engine.db().get_chat(&chat_id)?.chat;
                engine.emit(EngineEvent::ChatUpdated { chat });
            }
        }
        (ParsedPath::Participant(chat_id, user_id), ChangeKind::Put) => {
            if let Some(doc) = &change.doc {
                merge_participant_locked(engine, &chat_id, &user_id, doc)?;
            }
        }
        (ParsedPath::Message(chat_id, message_id), ChangeKind::Put) => {
            if let Some(doc) = &change.doc {
                merge_message_locked(engine, &chat_id, &message_id, doc)?;
            }
        }
        (_, ChangeKind::Delete) => {
            // This engine never physically removes child documents;
            // nothing to mirror.
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-entity merges
// ---------------------------------------------------------------------------

fn merge_chat_locked(engine: &ChatEngine, chat_id: &ChatId, doc: &Value) -> Result<()> {
    let remote = match docs::chat_from_doc(doc) {
        Ok(chat) => chat,
        Err(error) => {
            tracing::warn!(chat_id = %chat_id.short(), %error, "undecodable chat document");
            return Ok(());
        }
    };
    if remote.id != *chat_id {
        tracing::warn!(chat_id = %chat_id.short(), doc_id = %remote.id, "chat document id mismatch");
        return Ok(());
    }

    let db = engine.db();
    let updated = match db.find_chat(chat_id)? {
        None => {
            db.upsert_chat(&ChatRecord::remote(remote.clone()))?;
            Some(remote)
        }
        Some(mut record) => {
            let covered = covered_fields_for(&db, EntityType::Chat, chat_id.as_str())?;
            if docs::merge_chat(&mut record.chat, &remote, &covered) {
                db.upsert_chat(&record)?;
                Some(record.chat)
            } else {
                None
            }
        }
    };
    drop(db);

    if let Some(chat) = updated {
        engine.emit(EngineEvent::ChatUpdated { chat });
    }
    Ok(())
}

/// Merge a remote participant document.  Their marker moving forward is
/// the read receipt on everyone else's messages.
fn merge_participant_locked(
    engine: &ChatEngine,
    chat_id: &ChatId,
    user_id: &UserId,
    doc: &Value,
) -> Result<()> {
    let remote = match docs::participant_from_doc(doc) {
        Ok(participant) => participant,
        Err(error) => {
            tracing::warn!(
                chat_id = %chat_id.short(),
                user_id = %user_id,
                %error,
                "undecodable participant document"
            );
            return Ok(());
        }
    };

    let db = engine.db();
    if db.find_chat(chat_id)?.is_none() {
        // Parent unknown; its document is on the way and the next
        // bootstrap replays this one.
        tracing::debug!(chat_id = %chat_id.short(), "participant for unknown chat, deferring");
        return Ok(());
    }

    let entity_id = format!("{chat_id}:{user_id}");
    let marker_advanced_to = match db.find_participant(chat_id, user_id)? {
        None => {
            db.upsert_participant(&ParticipantRecord::remote(remote.clone()))?;
            Some(remote.last_read_at)
        }
        Some(mut record) => {
            let covered = covered_fields_for(&db, EntityType::Participant, &entity_id)?;
            let prior_mark = record.participant.last_read_at;
            if docs::merge_participant(&mut record.participant, &remote, &covered) {
                db.upsert_participant(&record)?;
                (record.participant.last_read_at > prior_mark)
                    .then_some(record.participant.last_read_at)
            } else {
                None
            }
        }
    };

    if let Some(mark) = marker_advanced_to {
        db.mark_read_up_to(chat_id, user_id, &mark)?;
        drop(db);
        engine.emit(EngineEvent::ReadMarked {
            chat_id: chat_id.clone(),
            user_id: user_id.clone(),
            last_read_at: mark,
        });
    }
    Ok(())
}

/// Merge a remote message document.  A round trip of a message this cache
/// already holds confirms delivery; a genuinely new message feeds the
/// unread ledger.
fn merge_message_locked(
    engine: &ChatEngine,
    chat_id: &ChatId,
    message_id: &MessageId,
    doc: &Value,
) -> Result<()> {
    if docs::doc_is_tombstoned(doc) {
        return Ok(());
    }
    let remote = match docs::message_from_doc(doc) {
        Ok(message) => message,
        Err(error) => {
            tracing::warn!(
                chat_id = %chat_id.short(),
                message_id = %message_id,
                %error,
                "undecodable message document"
            );
            return Ok(());
        }
    };

    let db = engine.db();
    let Some(chat_record) = db.find_chat(chat_id)? else {
        tracing::debug!(chat_id = %chat_id.short(), "message for unknown chat, deferring");
        return Ok(());
    };

    if db.find_message(message_id)?.is_some() {
        if db.confirm_delivered(message_id)? {
            drop(db);
            engine.emit(EngineEvent::MessageStatusChanged {
                chat_id: chat_id.clone(),
                message_id: *message_id,
                status: MessageStatus::Delivered,
            });
        }
        return Ok(());
    }

    let mut message = remote;
    message.status = delivered_status(&db.list_participants(chat_id)?, &message);
    if !db.insert_message(&MessageRecord::remote(message.clone()))? {
        return Ok(());
    }

    if chat_record.is_cache_complete {
        ledger::on_message_appended(&db, &message)?;
    } else {
        // Counters of a partially cached chat stay remote-authoritative;
        // only the list preview moves.
        db.set_chat_preview(chat_id, &message.timestamp, &preview(&message.content))?;
    }
    let updated_chat = db.find_chat(chat_id)?.map(|r| r.chat);
    drop(db);

    engine.emit(EngineEvent::MessageAppended { message });
    if let Some(chat) = updated_chat {
        engine.emit(EngineEvent::ChatUpdated { chat });
    }
    Ok(())
}

/// Fetch the full remote message history of one chat into the cache and
/// flag it complete.  Caller holds the chat's data lock.
pub(crate) async fn fetch_history_locked(engine: &Arc<ChatEngine>, chat_id: &ChatId) -> Result<()> {
    let listed = engine.remote.list(&DocPath::messages(chat_id)).await?;
    tracing::debug!(
        chat_id = %chat_id.short(),
        documents = listed.len(),
        "fetching message history"
    );

    {
        let db = engine.db();
        let participants = db.list_participants(chat_id)?;
        for (path, doc) in &listed {
            let Some(ParsedPath::Message(_, message_id)) = path.parse() else {
                continue;
            };
            if docs::doc_is_tombstoned(doc) {
                continue;
            }
            let mut message = match docs::message_from_doc(doc) {
                Ok(message) => message,
                Err(error) => {
                    tracing::warn!(
                        chat_id = %chat_id.short(),
                        message_id = %message_id,
                        %error,
                        "undecodable message document"
                    );
                    continue;
                }
            };
            message.status = delivered_status(&participants, &message);
            db.insert_message(&MessageRecord::remote(message))?;
        }

        if let Some(last) = db.list_messages(chat_id)?.last() {
            db.set_chat_preview(chat_id, &last.message.timestamp, &preview(&last.message.content))?;
        }
        db.mark_cache_complete(chat_id)?;

        // The local log is the whole history now, so it takes over as the
        // source of truth for the counters.
        ledger::reconcile(&db, chat_id)?;
    }

    engine.emit(EngineEvent::ChatResynced {
        chat_id: chat_id.clone(),
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Union of the fields still owned by unacknowledged local writes against
/// one entity.
fn covered_fields_for(
    db: &Database,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<HashSet<&'static str>> {
    let mut covered = HashSet::new();
    for op in db.pending_ops_for_entity(entity_type, entity_id)? {
        covered.extend(op.covered_fields().iter().copied());
    }
    Ok(covered)
}

/// Status for a message that reached the remote store: at least delivered,
/// read once a peer's marker passed it.
fn delivered_status(participants: &[ParticipantRecord], message: &Message) -> MessageStatus {
    let read = participants
        .iter()
        .filter(|record| record.participant.user_id != message.sender_id)
        .any(|record| record.participant.last_read_at >= message.timestamp);
    if read {
        MessageStatus::Read
    } else {
        MessageStatus::Delivered
    }
}
