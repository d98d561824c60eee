//! The authoritative document-store interface.
//!
//! The engine talks to the remote backend exclusively through the
//! [`RemoteStore`] trait: keyed JSON documents, single-field
//! compare-and-set, and a change subscription.  Production backends adapt
//! their SDK behind this trait; tests and local development use
//! [`MemoryRemote`](crate::MemoryRemote).

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::path::DocPath;

/// Errors surfaced by a remote backend.  All of them are transient from
/// the engine's point of view; a refused compare-and-set is NOT an error
/// but a `false` return.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The backend is unreachable (no connectivity, DNS failure, ...).
    #[error("remote store is offline")]
    Offline,

    /// The call did not complete within the configured deadline.
    #[error("remote call timed out")]
    Timeout,

    /// The backend answered with an error of its own.
    #[error("remote backend error: {0}")]
    Backend(String),
}

/// What happened to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Created or overwritten (including partial field updates).
    Put,
    /// Physically removed.
    Delete,
}

/// One event on a change subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub kind: ChangeKind,
    pub path: DocPath,
    /// Full document contents after the change; `None` for deletes.
    pub doc: Option<Value>,
}

/// Outcome of one [`RemoteWatch::next`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Change(RemoteChange),
    /// The subscriber fell behind and `missed` events were dropped; the
    /// caller should re-list the tree it cares about.
    Lagged(u64),
}

/// A live change subscription filtered to one path prefix.
pub struct RemoteWatch {
    prefix: DocPath,
    rx: broadcast::Receiver<RemoteChange>,
}

impl RemoteWatch {
    pub fn new(prefix: DocPath, rx: broadcast::Receiver<RemoteChange>) -> Self {
        Self { prefix, rx }
    }

    /// Next event under the subscribed prefix; `None` once the backend
    /// drops the stream.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(change) if self.prefix.contains(&change.path) => {
                    return Some(WatchEvent::Change(change))
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Some(WatchEvent::Lagged(missed))
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Authoritative store of chat state, keyed by [`DocPath`].
///
/// Writes are last-writer-wins per field except [`compare_and_set`], which
/// is the one atomic primitive and the basis of operator assignment.
///
/// [`compare_and_set`]: RemoteStore::compare_and_set
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch one document.
    async fn get(&self, path: &DocPath) -> Result<Option<Value>, RemoteError>;

    /// Fetch every document under `prefix`, shallow and deep.
    async fn list(&self, prefix: &DocPath) -> Result<Vec<(DocPath, Value)>, RemoteError>;

    /// Create or fully overwrite one document.
    async fn set(&self, path: &DocPath, doc: Value) -> Result<(), RemoteError>;

    /// Merge `fields` into one document, creating it when absent.
    async fn update(&self, path: &DocPath, fields: Map<String, Value>) -> Result<(), RemoteError>;

    /// Physically remove one document.
    async fn delete(&self, path: &DocPath) -> Result<(), RemoteError>;

    /// Atomically set `field` to `new` iff its current value equals
    /// `expected`.  Returns whether the swap happened.  A missing document
    /// never matches.
    async fn compare_and_set(
        &self,
        path: &DocPath,
        field: &str,
        expected: Value,
        new: Value,
    ) -> Result<bool, RemoteError>;

    /// Subscribe to every change under `prefix`, starting now.
    fn subscribe(&self, prefix: &DocPath) -> RemoteWatch;
}
