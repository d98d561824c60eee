//! The chat engine.
//!
//! Every operation follows the same local-first shape: validate against the
//! cached state, write the cache and the outbox in one step, emit an event,
//! kick the drain.  The caller never waits for the network; the one
//! exception is [`ChatEngine::accept_chat`], which drives its own outbox
//! entry inline so the operator learns the claim outcome while the backend
//! is reachable.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use deskline_remote::RemoteStore;
use deskline_shared::{
    Chat, ChatId, ChatStatus, Message, MessageStatus, Participant, Session, UserId,
};
use deskline_store::{
    ChatRecord, Database, MessageRecord, OutboxEntry, OutboxOp, ParticipantRecord,
};

use crate::config::EngineConfig;
use crate::error::{ChatError, Result};
use crate::events::{EngineEvent, MessageFeed};
use crate::ledger::{self, CounterDrift};
use crate::lifecycle::{self, Outcome};
use crate::locks::ChatLocks;
use crate::{pull, push};

/// Buffered drain kicks; the periodic sweep catches anything dropped here.
const KICK_CAPACITY: usize = 64;

pub struct ChatEngine {
    store: StdMutex<Database>,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) config: EngineConfig,
    /// Serializes mutations and pull merges per chat.
    pub(crate) data_locks: ChatLocks,
    /// Serializes outbox drains per chat, independent of the data locks.
    pub(crate) drain_locks: ChatLocks,
    events: broadcast::Sender<EngineEvent>,
    drain_tx: mpsc::Sender<ChatId>,
    drain_rx: StdMutex<Option<mpsc::Receiver<ChatId>>>,
}

impl ChatEngine {
    pub fn new(store: Database, remote: Arc<dyn RemoteStore>, config: EngineConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity);
        let (drain_tx, drain_rx) = mpsc::channel(KICK_CAPACITY);
        Arc::new(Self {
            store: StdMutex::new(store),
            remote,
            config,
            data_locks: ChatLocks::new(),
            drain_locks: ChatLocks::new(),
            events,
            drain_tx,
            drain_rx: StdMutex::new(Some(drain_rx)),
        })
    }

    /// Receiver of everything observable: chat updates, appended messages,
    /// delivery ticks, sync failures.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub(crate) fn db(&self) -> MutexGuard<'_, Database> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Ask the drain coordinator to look at this chat soon.  A full kick
    /// channel costs latency, not correctness: the periodic sweep finds
    /// the chat anyway.
    pub(crate) fn kick(&self, chat_id: &ChatId) {
        let _ = self.drain_tx.try_send(chat_id.clone());
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Open a new support chat with its first message.  The chat is
    /// visible locally at once and published in the background.
    pub async fn create_chat(
        self: &Arc<Self>,
        session: &Session,
        subject: &str,
        first_message: &str,
    ) -> Result<Chat> {
        lifecycle::validate_subject(subject)?;
        lifecycle::validate_content(first_message)?;

        let now = Utc::now();
        let chat_id = ChatId::new();
        let mut chat = Chat::new(
            chat_id.clone(),
            session.user_id.clone(),
            subject.trim().to_string(),
            now,
        );
        let creator = Participant::new(
            chat_id.clone(),
            session.user_id.clone(),
            session.display_name.clone(),
            session.role,
            now,
        );
        let message = Message::new(
            chat_id.clone(),
            session.user_id.clone(),
            session.display_name.clone(),
            first_message.to_string(),
            now,
        );
        chat.note_message(&message);

        let lock = self.data_locks.get(&chat_id);
        let guard = lock.lock().await;
        {
            let mut db = self.db();
            db.create_chat_local(
                &ChatRecord::local(chat.clone()),
                &ParticipantRecord::local(creator),
                &MessageRecord::local(message.clone()),
            )?;
        }
        drop(guard);

        tracing::info!(chat_id = %chat_id.short(), user = %session.user_id, "chat created");
        self.emit(EngineEvent::ChatUpdated { chat: chat.clone() });
        self.emit(EngineEvent::MessageAppended { message });
        self.kick(&chat_id);
        Ok(chat)
    }

    /// Claim a pending chat for the calling operator.
    ///
    /// The claim is applied locally first and then pushed as a
    /// compare-and-set on the chat document.  When another operator's claim
    /// reached the remote store first, the local state rolls back and
    /// [`ChatError::ChatAlreadyAssigned`] is returned; a claim the backend
    /// rejected for any other reason (the chat was withdrawn meanwhile)
    /// rolls back the same way and surfaces as
    /// [`ChatError::ConflictingTransition`].  While offline the claim stays
    /// provisional and settles on reconnect.
    pub async fn accept_chat(
        self: &Arc<Self>,
        session: &Session,
        chat_id: &ChatId,
    ) -> Result<Chat> {
        let lock = self.data_locks.get(chat_id);
        let guard = lock.lock().await;

        let record = self.db().get_chat(chat_id)?;
        lifecycle::check_accept(&record.chat, session)?;

        if !record.is_cache_complete {
            // Best effort; an unreachable backend will fail the claim
            // itself soon enough, and counters self-heal after the fetch.
            if let Err(error) = pull::fetch_history_locked(self, chat_id).await {
                tracing::debug!(chat_id = %chat_id.short(), %error, "history fetch deferred during accept");
            }
        }

        // The operator joins with the whole backlog unread.
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        let mut operator = Participant::new(
            chat_id.clone(),
            session.user_id.clone(),
            session.display_name.clone(),
            session.role,
            epoch,
        );
        {
            let db = self.db();
            operator.unread_count = db.count_messages_after(chat_id, &session.user_id, &epoch)?;
            db.apply_chat_transition(chat_id, ChatStatus::Active, Some(&session.user_id))?;
            db.upsert_participant(&ParticipantRecord::local(operator.clone()))?;
            db.enqueue_outbox(chat_id, &OutboxOp::AcceptChat { operator })?;
        }
        drop(guard);

        if let push::InlineDrain::Conflicted = push::drain_now(self, chat_id).await? {
            let record = self.db().get_chat(chat_id)?;
            return Err(claim_conflict(&record.chat));
        }

        let record = self.db().get_chat(chat_id)?;
        if record.chat.assigned_operator_id.as_ref() != Some(&session.user_id) {
            // A concurrent background drain resolved the claim against us.
            return Err(claim_conflict(&record.chat));
        }

        tracing::info!(chat_id = %chat_id.short(), operator = %session.user_id, "chat accepted");
        self.emit(EngineEvent::ChatUpdated {
            chat: record.chat.clone(),
        });
        Ok(record.chat)
    }

    /// Reject a pending chat.  The chat is tombstoned rather than returned
    /// to the queue.
    pub async fn decline_chat(self: &Arc<Self>, session: &Session, chat_id: &ChatId) -> Result<()> {
        let lock = self.data_locks.get(chat_id);
        let guard = lock.lock().await;

        let record = self.db().get_chat(chat_id)?;
        if lifecycle::check_decline(&record.chat, session)? == Outcome::NoOp {
            return Ok(());
        }

        self.apply_transition_locked(&record.chat, ChatStatus::Deleted, None)?;
        drop(guard);

        tracing::info!(chat_id = %chat_id.short(), operator = %session.user_id, "chat declined");
        self.kick(chat_id);
        Ok(())
    }

    /// Archive an active chat.  The assignment is kept so the chat can be
    /// reopened by the same operator.
    pub async fn close_chat(self: &Arc<Self>, session: &Session, chat_id: &ChatId) -> Result<()> {
        let lock = self.data_locks.get(chat_id);
        let guard = lock.lock().await;

        let record = self.db().get_chat(chat_id)?;
        if lifecycle::check_close(&record.chat, session)? == Outcome::NoOp {
            return Ok(());
        }

        self.apply_transition_locked(
            &record.chat,
            ChatStatus::Closed,
            record.chat.assigned_operator_id.as_ref(),
        )?;
        drop(guard);
        self.kick(chat_id);
        Ok(())
    }

    /// Pull a closed chat back out of the archive.
    pub async fn reopen_chat(self: &Arc<Self>, session: &Session, chat_id: &ChatId) -> Result<()> {
        let lock = self.data_locks.get(chat_id);
        let guard = lock.lock().await;

        let record = self.db().get_chat(chat_id)?;
        if lifecycle::check_reopen(&record.chat, session)? == Outcome::NoOp {
            return Ok(());
        }

        self.apply_transition_locked(
            &record.chat,
            ChatStatus::Active,
            record.chat.assigned_operator_id.as_ref(),
        )?;
        drop(guard);
        self.kick(chat_id);
        Ok(())
    }

    /// Tombstone a chat and its messages.  The local rows survive so that
    /// references and sync metadata stay valid; the chat simply refuses
    /// further writes.
    pub async fn delete_chat(self: &Arc<Self>, session: &Session, chat_id: &ChatId) -> Result<()> {
        let lock = self.data_locks.get(chat_id);
        let guard = lock.lock().await;

        let record = self.db().get_chat(chat_id)?;
        if lifecycle::check_delete(&record.chat, session)? == Outcome::NoOp {
            return Ok(());
        }

        {
            let db = self.db();
            db.apply_chat_transition(chat_id, ChatStatus::Deleted, None)?;
            db.enqueue_outbox(chat_id, &OutboxOp::TombstoneChat)?;
        }
        let mut chat = record.chat;
        chat.apply_status(ChatStatus::Deleted);
        drop(guard);

        tracing::info!(chat_id = %chat_id.short(), user = %session.user_id, "chat deleted");
        self.emit(EngineEvent::ChatUpdated { chat });
        self.kick(chat_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Append a message.  Returns it immediately in `Sending` state;
    /// delivery progress arrives as [`EngineEvent::MessageStatusChanged`].
    pub async fn send_message(
        self: &Arc<Self>,
        session: &Session,
        chat_id: &ChatId,
        content: &str,
    ) -> Result<Message> {
        lifecycle::validate_content(content)?;

        let lock = self.data_locks.get(chat_id);
        let guard = lock.lock().await;

        let record = self.db().get_chat(chat_id)?;
        lifecycle::check_send(&record.chat)?;
        self.require_participant(chat_id, &session.user_id)?;

        // Send times are strictly monotonic within a chat at the stored
        // millisecond resolution: a new message lands after everything
        // cached, so display order is stable and a reply never ties with
        // the read marker it answers.
        let mut timestamp = Utc::now();
        let floor = record
            .chat
            .last_message_time
            .unwrap_or(record.chat.created_at);
        if timestamp.timestamp_millis() <= floor.timestamp_millis() {
            timestamp = floor + ChronoDuration::milliseconds(1);
        }

        let message = Message::new(
            chat_id.clone(),
            session.user_id.clone(),
            session.display_name.clone(),
            content.to_string(),
            timestamp,
        );

        {
            let db = self.db();
            db.insert_message(&MessageRecord::local(message.clone()))?;
            ledger::on_message_appended(&db, &message)?;
            db.enqueue_outbox(
                chat_id,
                &OutboxOp::PutMessage {
                    message: message.clone(),
                },
            )?;
        }
        let updated = self.db().find_chat(chat_id)?.map(|r| r.chat);
        drop(guard);

        self.emit(EngineEvent::MessageAppended {
            message: message.clone(),
        });
        if let Some(chat) = updated {
            self.emit(EngineEvent::ChatUpdated { chat });
        }
        self.kick(chat_id);
        Ok(message)
    }

    /// Clear the caller's unread counter and advance their read marker to
    /// the newest cached activity.  An already-read chat queues nothing.
    pub async fn mark_read(self: &Arc<Self>, session: &Session, chat_id: &ChatId) -> Result<()> {
        let lock = self.data_locks.get(chat_id);
        let guard = lock.lock().await;

        let record = self.db().get_chat(chat_id)?;
        lifecycle::check_mark_read(&record.chat)?;
        let participant = self.require_participant(chat_id, &session.user_id)?;

        let newest = record
            .chat
            .last_message_time
            .unwrap_or(record.chat.created_at);
        let mark = newest.max(participant.last_read_at);

        if participant.unread_count == 0 && participant.last_read_at >= mark {
            return Ok(());
        }

        {
            let db = self.db();
            db.reset_unread(chat_id, &session.user_id, &mark)?;
            db.mark_read_up_to(chat_id, &session.user_id, &mark)?;
            db.enqueue_outbox(
                chat_id,
                &OutboxOp::MarkRead {
                    user_id: session.user_id.clone(),
                    last_read_at: mark,
                },
            )?;
        }
        drop(guard);

        self.emit(EngineEvent::ReadMarked {
            chat_id: chat_id.clone(),
            user_id: session.user_id.clone(),
            last_read_at: mark,
        });
        self.kick(chat_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// One cached chat by id.
    pub fn chat(&self, chat_id: &ChatId) -> Result<Chat> {
        Ok(self.db().get_chat(chat_id)?.chat)
    }

    /// Chats the caller takes part in, newest activity first.  `statuses`
    /// narrows the result; `None` includes tombstones.
    pub fn chats_for_user(
        &self,
        session: &Session,
        statuses: Option<&[ChatStatus]>,
    ) -> Result<Vec<Chat>> {
        let records = self.db().chats_for_user(&session.user_id, statuses)?;
        Ok(records.into_iter().map(|r| r.chat).collect())
    }

    /// Unclaimed chats for the operator dashboard, oldest first.
    pub fn pending_queue(&self, session: &Session) -> Result<Vec<Chat>> {
        if !session.is_privileged() {
            return Err(ChatError::Validation(format!(
                "user {} may not view the pending queue",
                session.user_id
            )));
        }
        let records = self.db().chats_with_status(ChatStatus::Pending)?;
        Ok(records.into_iter().map(|r| r.chat).collect())
    }

    /// Full message history in display order.  A chat first seen through
    /// the change stream fetches its backlog from the remote store once,
    /// then serves from the cache.
    pub async fn messages_for_chat(self: &Arc<Self>, chat_id: &ChatId) -> Result<Vec<Message>> {
        let lock = self.data_locks.get(chat_id);
        let _guard = lock.lock().await;

        let record = self.db().get_chat(chat_id)?;
        if !record.is_cache_complete {
            pull::fetch_history_locked(self, chat_id).await?;
        }

        let records = self.db().list_messages(chat_id)?;
        Ok(records.into_iter().map(|r| r.message).collect())
    }

    /// Snapshot of a chat's history plus a live feed of appended messages.
    pub async fn watch_messages(self: &Arc<Self>, chat_id: &ChatId) -> Result<MessageFeed> {
        let lock = self.data_locks.get(chat_id);
        let _guard = lock.lock().await;

        let record = self.db().get_chat(chat_id)?;
        if !record.is_cache_complete {
            pull::fetch_history_locked(self, chat_id).await?;
        }

        // Subscribe while the chat is still locked so nothing lands
        // between the snapshot and the feed.
        let rx = self.events.subscribe();
        let snapshot = self
            .db()
            .list_messages(chat_id)?
            .into_iter()
            .map(|r| r.message)
            .collect();
        Ok(MessageFeed::new(chat_id.clone(), snapshot, rx))
    }

    /// The caller's unread counter for one chat; zero when they are not a
    /// participant.
    pub fn unread_count(&self, session: &Session, chat_id: &ChatId) -> Result<u32> {
        Ok(self
            .db()
            .find_participant(chat_id, &session.user_id)?
            .map(|r| r.participant.unread_count)
            .unwrap_or(0))
    }

    /// Sum of the caller's unread counters across all chats, tombstones
    /// excluded.  Drives the application badge.
    pub fn total_unread(&self, session: &Session) -> Result<u32> {
        Ok(self.db().total_unread(&session.user_id)?)
    }

    // ------------------------------------------------------------------
    // Sync surface
    // ------------------------------------------------------------------

    /// Outbox entries parked after exhausting their retry budget,
    /// optionally narrowed to one chat.
    pub fn failed_syncs(&self, chat_id: Option<&ChatId>) -> Result<Vec<OutboxEntry>> {
        Ok(self.db().failed_entries(chat_id)?)
    }

    /// Requeue every failed entry of a chat and kick its drain.  Returns
    /// how many entries went back to pending.
    pub async fn retry_chat_sync(self: &Arc<Self>, chat_id: &ChatId) -> Result<usize> {
        let lock = self.data_locks.get(chat_id);
        let guard = lock.lock().await;

        let mut requeued_messages = Vec::new();
        let requeued = {
            let db = self.db();
            for entry in db.failed_entries(Some(chat_id))? {
                if let OutboxOp::PutMessage { message } = &entry.op {
                    if db.requeue_message(&message.id)? {
                        requeued_messages.push(message.id);
                    }
                }
            }
            db.retry_failed(chat_id)?
        };
        drop(guard);

        for message_id in requeued_messages {
            self.emit(EngineEvent::MessageStatusChanged {
                chat_id: chat_id.clone(),
                message_id,
                status: MessageStatus::Sending,
            });
        }
        if requeued > 0 {
            tracing::info!(chat_id = %chat_id.short(), requeued, "failed entries requeued");
            self.kick(chat_id);
        }
        Ok(requeued)
    }

    /// Recompute the chat's unread counters from the message log,
    /// repairing rows that drifted.  Returns what was repaired.
    pub async fn reconcile_chat(&self, chat_id: &ChatId) -> Result<Vec<CounterDrift>> {
        let lock = self.data_locks.get(chat_id);
        let _guard = lock.lock().await;

        let drifts = ledger::reconcile(&self.db(), chat_id)?;
        if !drifts.is_empty() {
            tracing::warn!(
                chat_id = %chat_id.short(),
                repaired = drifts.len(),
                "unread ledger drifted"
            );
            self.emit(EngineEvent::ChatResynced {
                chat_id: chat_id.clone(),
            });
        }
        Ok(drifts)
    }

    /// Total queued outbox entries across all chats; diagnostics.
    pub fn outbox_len(&self) -> Result<u32> {
        Ok(self.db().outbox_len()?)
    }

    /// Start the background synchronizer: the outbox drain plus the
    /// subscription pull loop.  Callable once per engine.
    pub fn start_sync(self: &Arc<Self>) -> Result<SyncHandle> {
        let drain_rx = self
            .drain_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ChatError::Validation("sync engine already started".into()))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let push_task = tokio::spawn(push::coordinator(
            Arc::clone(self),
            drain_rx,
            shutdown_rx.clone(),
        ));
        let pull_task = tokio::spawn(pull::pull_loop(Arc::clone(self), shutdown_rx));

        tracing::info!("sync engine started");
        Ok(SyncHandle {
            shutdown: shutdown_tx,
            push_task,
            pull_task,
        })
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn require_participant(&self, chat_id: &ChatId, user_id: &UserId) -> Result<Participant> {
        self.db()
            .find_participant(chat_id, user_id)?
            .map(|r| r.participant)
            .ok_or_else(|| {
                ChatError::Validation(format!(
                    "user {user_id} is not a participant of chat {chat_id}"
                ))
            })
    }

    /// Local write plus outbox entry for one lifecycle change.  Caller
    /// holds the chat's data lock.
    fn apply_transition_locked(
        &self,
        chat: &Chat,
        status: ChatStatus,
        assigned: Option<&UserId>,
    ) -> Result<Chat> {
        {
            let db = self.db();
            db.apply_chat_transition(&chat.id, status, assigned)?;
            db.enqueue_outbox(
                &chat.id,
                &OutboxOp::UpdateChatStatus {
                    status,
                    assigned_operator_id: assigned.cloned(),
                },
            )?;
        }

        let mut updated = chat.clone();
        updated.apply_status(status);
        updated.assigned_operator_id = assigned.cloned();
        self.emit(EngineEvent::ChatUpdated {
            chat: updated.clone(),
        });
        Ok(updated)
    }
}

/// A rejected claim has already rolled the chat back to remote truth by
/// the time this runs; name the reason the operator lost it.
fn claim_conflict(chat: &Chat) -> ChatError {
    match chat.assigned_operator_id {
        Some(_) => ChatError::ChatAlreadyAssigned {
            chat_id: chat.id.clone(),
        },
        None => ChatError::ConflictingTransition {
            chat_id: chat.id.clone(),
            detail: format!("chat is {} on the backend", chat.status),
        },
    }
}

/// Handle over the background sync tasks.  [`SyncHandle::shutdown`] stops
/// them gracefully; dropping the handle stops them as well, just without
/// waiting.
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    push_task: JoinHandle<()>,
    pull_task: JoinHandle<()>,
}

impl SyncHandle {
    /// Signal both loops to stop and wait for them to finish.  In-flight
    /// deliveries complete; queued work stays in the outbox for the next
    /// run.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.push_task.await;
        let _ = self.pull_task.await;
        tracing::info!("sync engine stopped");
    }
}
