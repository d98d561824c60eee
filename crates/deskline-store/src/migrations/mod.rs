//! Schema migrations, applied while the database is being opened.
//!
//! SQLite's `user_version` pragma records the revision a cache file is at;
//! every newer step runs exactly once, in order.  The step list is
//! append-only: a released revision never changes, fixes become a new step.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// Ordered schema history.
const STEPS: &[(u32, &str, Step)] = &[(1, "initial schema", v001_initial::up)];

/// Bring the connection's schema up to the newest revision.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let applied: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    for (version, name, step) in STEPS {
        if *version <= applied {
            continue;
        }
        tracing::info!(version, name, "applying schema migration");
        step(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", *version)?;
    }
    Ok(())
}
