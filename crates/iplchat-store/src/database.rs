//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees
//! that migrations are run before any other operation.

use std::path::{Path, PathBuf};

use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
///
/// Uses `Mutex` because `rusqlite::Connection` is `Send` but not `Sync`
/// (it contains internal `RefCell`s), so `RwLock` cannot be used. WAL mode
/// is still set for crash safety. The lock also serializes writers, which
/// the engine requires anyway.
pub struct Database {
    conn: std::sync::Mutex<Connection>,
    path: PathBuf,
}

impl Database {
    /// Open (or create) the database at an explicit path and run migrations.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Self::open_raw(path)?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    fn open_raw(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the connection for queries.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Migration("database lock poisoned".into()))?;
        f(&conn)
    }

    /// Checkpoint the WAL into the main file, then run `f` with the database
    /// file quiescent but the connection still open. Used for snapshot copies.
    pub fn with_checkpoint<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Migration("database lock poisoned".into()))?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        f(&self.path)
    }

    /// Close the live connection, run `f` against the database path (which
    /// may move or replace the file), then reopen. The reopen runs the
    /// pragmas and migrations again, so an older snapshot is upgraded on
    /// load. Used for snapshot load/revert.
    pub fn with_file_swapped<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StoreError::Migration("database lock poisoned".into()))?;
        guard.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;

        // Release the file handle while keeping the lock held.
        let placeholder = Connection::open_in_memory()?;
        drop(std::mem::replace(&mut *guard, placeholder));

        let result = f(&self.path);

        // Reopen unconditionally so the engine never ends up without a
        // live-path connection.
        *guard = Self::open_raw(&self.path)?;
        result
    }
}
