//! # deskline-engine
//!
//! Chat lifecycle and synchronization engine for the Deskline support
//! client.  The [`ChatEngine`] owns a local [`deskline_store::Database`]
//! cache and a handle to the remote document store, applies every user
//! action locally first, queues it in a durable outbox, and reconciles
//! both directions: a per-chat push drain delivers queued writes in
//! order, and a pull loop merges remote changes under a field-ownership
//! rule that lets pending local writes win.
//!
//! Start the background halves with [`ChatEngine::start_sync`]; UI layers
//! observe the cache through [`ChatEngine::subscribe`] and the per-chat
//! [`MessageFeed`].

pub mod config;
pub mod engine;
pub mod error;
pub mod events;

mod backoff;
mod docs;
mod ledger;
mod lifecycle;
mod locks;
mod pull;
mod push;

pub use config::EngineConfig;
pub use engine::{ChatEngine, SyncHandle};
pub use error::{ChatError, Result};
pub use events::{EngineEvent, MessageFeed};
pub use ledger::CounterDrift;
