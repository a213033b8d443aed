//! The metadata model: file nodes and their hierarchy invariants, the
//! per-user quota ledger, and multipart session bookkeeping, all backed by a
//! single SQLite database.
//!
//! We only have a single SQLite connection which does not allow async calls,
//! so every statement runs briefly under a mutex; no lock is ever held
//! across an await point.

use std::{
    path::Path,
    sync::Arc,
};

use parking_lot::Mutex;
use rusqlite::Connection;

pub mod files;
pub mod quota;
pub mod sessions;
pub mod types;

#[cfg(test)]
mod tests;

const TIERS_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS tiers (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    limit_bytes INTEGER NOT NULL
);
"#;

const USERS_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    tier_id TEXT NOT NULL REFERENCES tiers(id),
    used_bytes INTEGER NOT NULL DEFAULT 0
);
"#;

const FILE_NODES_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS file_nodes (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    parent_id TEXT NULL,
    filename TEXT NOT NULL,
    content_type TEXT NOT NULL,
    size INTEGER NOT NULL,
    is_directory INTEGER NOT NULL,
    is_favorite INTEGER NOT NULL DEFAULT 0,
    is_shared INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    last_modified_at INTEGER NULL,
    deleted_at INTEGER NULL
);
CREATE INDEX IF NOT EXISTS file_nodes_by_parent
    ON file_nodes (owner_id, parent_id);
CREATE UNIQUE INDEX IF NOT EXISTS file_nodes_unique_name
    ON file_nodes (owner_id, IFNULL(parent_id, ''), filename)
    WHERE deleted_at IS NULL;
"#;

const MULTIPART_SESSIONS_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS multipart_sessions (
    id TEXT PRIMARY KEY,
    file_id TEXT NOT NULL,
    upload_id TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    filename TEXT NOT NULL,
    content_type TEXT NOT NULL,
    parent_id TEXT NULL,
    total_size INTEGER NOT NULL,
    last_modified_at INTEGER NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS multipart_sessions_by_expiry
    ON multipart_sessions (expires_at);
"#;

/// Handle to the metadata store, cheap to clone and share across tasks.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let connection = Connection::open(path)?;
        connection.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(connection)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(connection: Connection) -> anyhow::Result<Self> {
        connection.pragma_update(None, "foreign_keys", "ON")?;
        // Schema creation is idempotent, so run it unconditionally.
        connection.execute_batch(TIERS_INIT)?;
        connection.execute_batch(USERS_INIT)?;
        connection.execute_batch(FILE_NODES_INIT)?;
        connection.execute_batch(MULTIPART_SESSIONS_INIT)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(connection)),
        })
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let connection = self.inner.lock();
        f(&connection)
    }

    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut connection = self.inner.lock();
        let tx = connection.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}
