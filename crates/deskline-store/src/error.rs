use thiserror::Error;

/// Everything the cache tier can fail with.
///
/// `NotFound` is the only variant callers routinely branch on; the rest is
/// plumbing that the engine wraps into its own error type.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A lookup by key came back empty where a row was required.
    #[error("record not found")]
    NotFound,

    /// Underlying SQLite failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A schema migration step did not apply cleanly.
    #[error("schema migration failed: {0}")]
    Migration(String),

    /// No platform data directory could be resolved for the cache file.
    #[error("no usable application data directory")]
    NoDataDir,

    /// Filesystem trouble around the cache file or its directory.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted id column does not hold a UUID.
    #[error("corrupt id column: {0}")]
    Uuid(#[from] uuid::Error),

    /// A persisted enum tag was not recognised.
    #[error("corrupt column value: {0}")]
    Parse(#[from] deskline_shared::ParseEnumError),

    /// A persisted outbox operation could not be decoded.
    #[error("outbox payload: {0}")]
    OutboxPayload(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
