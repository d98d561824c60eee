// Remote document-store client layer: the trait the engine syncs against,
// plus an in-memory backend for tests and local development.

pub mod client;
pub mod memory;
pub mod path;

pub use client::{ChangeKind, RemoteChange, RemoteError, RemoteStore, RemoteWatch, WatchEvent};
pub use memory::MemoryRemote;
pub use path::{DocPath, ParsedPath};
