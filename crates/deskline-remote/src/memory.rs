//! In-memory [`RemoteStore`] used by tests and local development.
//!
//! One `MemoryRemote` shared between several engines stands in for the
//! hosted backend: documents live in a `BTreeMap`, change events fan out
//! over a broadcast channel, and faults are injected per call so sync
//! retry paths can be exercised deterministically.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::client::{ChangeKind, RemoteChange, RemoteError, RemoteStore, RemoteWatch};
use crate::path::DocPath;

const EVENT_CAPACITY: usize = 1024;

pub struct MemoryRemote {
    docs: Mutex<BTreeMap<String, Value>>,
    events: broadcast::Sender<RemoteChange>,
    online: AtomicBool,
    fault_budget: AtomicU32,
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            docs: Mutex::new(BTreeMap::new()),
            events,
            online: AtomicBool::new(true),
            fault_budget: AtomicU32::new(0),
        }
    }

    /// Simulate losing or regaining connectivity.  While offline every
    /// call fails with [`RemoteError::Offline`].
    pub fn set_online(&self, online: bool) {
        tracing::debug!(online, "connectivity toggled");
        self.online.store(online, Ordering::SeqCst);
    }

    /// Make the next `n` calls fail with a backend error, then recover.
    pub fn fail_next(&self, n: u32) {
        tracing::debug!(faults = n, "fault budget armed");
        self.fault_budget.store(n, Ordering::SeqCst);
    }

    /// Number of stored documents; test observability.
    pub fn doc_count(&self) -> usize {
        self.docs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Synchronous peek at one document; test observability.
    pub fn snapshot(&self, path: &DocPath) -> Option<Value> {
        self.docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path.as_str())
            .cloned()
    }

    fn gate(&self) -> Result<(), RemoteError> {
        if !self.online.load(Ordering::SeqCst) {
            tracing::trace!("call refused while offline");
            return Err(RemoteError::Offline);
        }
        let consumed = self
            .fault_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            tracing::trace!("injected fault consumed");
            return Err(RemoteError::Backend("injected fault".to_string()));
        }
        Ok(())
    }

    fn emit(&self, kind: ChangeKind, path: &DocPath, doc: Option<Value>) {
        let _ = self.events.send(RemoteChange {
            kind,
            path: path.clone(),
            doc,
        });
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn get(&self, path: &DocPath) -> Result<Option<Value>, RemoteError> {
        self.gate()?;
        Ok(self
            .docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path.as_str())
            .cloned())
    }

    async fn list(&self, prefix: &DocPath) -> Result<Vec<(DocPath, Value)>, RemoteError> {
        self.gate()?;
        let docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(docs
            .range(prefix.as_str().to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix.as_str()))
            .filter(|(key, _)| prefix.contains(&DocPath((*key).clone())))
            .map(|(key, doc)| (DocPath(key.clone()), doc.clone()))
            .collect())
    }

    async fn set(&self, path: &DocPath, doc: Value) -> Result<(), RemoteError> {
        self.gate()?;
        self.docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.as_str().to_string(), doc.clone());
        self.emit(ChangeKind::Put, path, Some(doc));
        Ok(())
    }

    async fn update(&self, path: &DocPath, fields: Map<String, Value>) -> Result<(), RemoteError> {
        self.gate()?;
        let merged = {
            let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
            let doc = docs
                .entry(path.as_str().to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(map) = doc {
                for (key, value) in fields {
                    map.insert(key, value);
                }
            }
            doc.clone()
        };
        self.emit(ChangeKind::Put, path, Some(merged));
        Ok(())
    }

    async fn delete(&self, path: &DocPath) -> Result<(), RemoteError> {
        self.gate()?;
        let removed = self
            .docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path.as_str());
        if removed.is_some() {
            self.emit(ChangeKind::Delete, path, None);
        }
        Ok(())
    }

    async fn compare_and_set(
        &self,
        path: &DocPath,
        field: &str,
        expected: Value,
        new: Value,
    ) -> Result<bool, RemoteError> {
        self.gate()?;
        let swapped = {
            let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
            match docs.get_mut(path.as_str()) {
                Some(Value::Object(map)) => {
                    let current = map.get(field).cloned().unwrap_or(Value::Null);
                    if current == expected {
                        map.insert(field.to_string(), new);
                        Some(Value::Object(map.clone()))
                    } else {
                        None
                    }
                }
                // A missing document never matches.
                _ => None,
            }
        };

        match swapped {
            Some(doc) => {
                self.emit(ChangeKind::Put, path, Some(doc));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn subscribe(&self, prefix: &DocPath) -> RemoteWatch {
        RemoteWatch::new(prefix.clone(), self.events.subscribe())
    }
}
