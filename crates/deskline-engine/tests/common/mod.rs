//! Shared harness for the engine integration tests.
//!
//! Each test wires one or more engines (one per simulated device) to a
//! shared in-memory backend.  Devices get their own SQLite cache, so
//! convergence between them only ever happens through the sync loops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use deskline_engine::{ChatEngine, EngineConfig, EngineEvent, SyncHandle};
use deskline_remote::{MemoryRemote, RemoteStore};
use deskline_shared::{ChatId, Message};
use deskline_store::Database;

/// How long a test waits for background sync to settle.
pub const SETTLE: Duration = Duration::from_secs(5);

/// Initialize test logging with appropriate filters.
///
/// Safe to call multiple times (subsequent calls are no-ops).
#[allow(dead_code)]
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("deskline_engine=debug,deskline_store=info")),
        )
        .with_test_writer()
        .try_init();
}

pub fn backend() -> Arc<MemoryRemote> {
    Arc::new(MemoryRemote::new())
}

/// An engine over a fresh cache with no background sync running.  Local
/// state stays fully deterministic; only inline pushes touch the backend.
#[allow(dead_code)]
pub fn engine(remote: &Arc<MemoryRemote>) -> Arc<ChatEngine> {
    let store = Database::open_in_memory().expect("in-memory store");
    ChatEngine::new(
        store,
        Arc::clone(remote) as Arc<dyn RemoteStore>,
        EngineConfig::fast(),
    )
}

/// One simulated device: an engine with both sync halves running.
pub struct Device {
    pub engine: Arc<ChatEngine>,
    sync: SyncHandle,
}

impl Device {
    #[allow(dead_code)]
    pub async fn stop(self) {
        self.sync.shutdown().await;
    }
}

#[allow(dead_code)]
pub fn device(remote: &Arc<MemoryRemote>) -> Device {
    let engine = engine(remote);
    let sync = engine.start_sync().expect("start sync");
    Device { engine, sync }
}

/// Poll `condition` until it holds or the settle window runs out.
#[allow(dead_code)]
pub async fn wait_until(label: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + SETTLE;
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {SETTLE:?}: {label}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll one chat's message list until `pred` holds for it.
#[allow(dead_code)]
pub async fn wait_for_messages(
    engine: &Arc<ChatEngine>,
    chat_id: &ChatId,
    label: &str,
    pred: impl Fn(&[Message]) -> bool,
) {
    let deadline = tokio::time::Instant::now() + SETTLE;
    loop {
        let messages = engine
            .messages_for_chat(chat_id)
            .await
            .expect("list messages");
        if pred(&messages) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("messages did not settle within {SETTLE:?}: {label}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for the first event satisfying `pred`, discarding the rest.
#[allow(dead_code)]
pub async fn next_event_matching(
    rx: &mut broadcast::Receiver<EngineEvent>,
    label: &str,
    pred: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    let deadline = tokio::time::Instant::now() + SETTLE;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            panic!("event not observed within {SETTLE:?}: {label}");
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) if pred(&event) => return event,
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                panic!("event stream closed while waiting: {label}")
            }
            Err(_) => panic!("event not observed within {SETTLE:?}: {label}"),
        }
    }
}
