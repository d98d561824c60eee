//! Per-chat async locks.
//!
//! Every mutation and every pull-side merge of a chat runs under that
//! chat's lock, which serializes writers per chat while chats stay
//! independent of each other.  The registry hands out `Arc`ed mutexes so
//! a guard can be held across await points.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;

use deskline_shared::ChatId;

#[derive(Default)]
pub struct ChatLocks {
    inner: StdMutex<HashMap<ChatId, Arc<Mutex<()>>>>,
}

impl ChatLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `chat_id`, created on first use and shared afterwards.
    pub fn get(&self, chat_id: &ChatId) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(chat_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
