//! # deskline-store
//!
//! SQLite-backed persistent cache for the Deskline support-chat engine.
//!
//! Everything here is synchronous: a [`Database`] handle owns the single
//! connection, and one typed helper file per table covers the chat,
//! participant and message rows, the sync metadata on each of them, and
//! the durable outbox queue the sync engine drains.

pub mod chats;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod outbox;
pub mod participants;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
