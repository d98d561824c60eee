//! Connection handling for the local cache.
//!
//! [`Database`] owns one [`rusqlite::Connection`]; every constructor runs
//! the schema migrations before handing it out, so the rest of the crate
//! can assume the tables exist.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the cache at its platform-default location, e.g.
    /// `~/.local/share/deskline/deskline.db` on Linux.
    pub fn new() -> Result<Self> {
        let dirs = ProjectDirs::from("com", "deskline", "deskline").ok_or(StoreError::NoDataDir)?;
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("deskline.db");
        tracing::info!(path = %db_path.display(), "opening cache database");
        Self::open_at(&db_path)
    }

    /// Open (or create) the cache at an explicit path.  Tests and embeds
    /// with their own directory layout come through here.
    pub fn open_at(path: &Path) -> Result<Self> {
        Self::prepare(Connection::open(path)?)
    }

    /// Open a throwaway in-memory cache.  Every call is an independent
    /// store; the device simulations in the engine tests rely on that.
    pub fn open_in_memory() -> Result<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    /// Direct access to the connection, for transactions and ad hoc
    /// queries the typed helpers do not cover.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Filesystem location of the open cache; `None` for in-memory stores.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_and_migrates_a_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        let db = Database::open_at(&path).unwrap();
        assert!(db.path().is_some());

        // Reopening the same file must not re-run the migrations.
        drop(db);
        Database::open_at(&path).unwrap();
    }

    #[test]
    fn in_memory_databases_are_independent() {
        let a = Database::open_in_memory().unwrap();
        let b = Database::open_in_memory().unwrap();
        a.conn()
            .execute(
                "INSERT INTO chats (id, status, created_at, creator_id, subject) \
                 VALUES ('c1', 'pending', 0, 'u1', 's')",
                [],
            )
            .unwrap();
        let count: i64 = b
            .conn()
            .query_row("SELECT COUNT(*) FROM chats", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
