//! persistence layer: a single sqlite connection shared behind a mutex.
//!
//! the spec requires a single open connection serializing all writes; rather
//! than a pool, callers take the mutex, open a transaction, and run one or
//! more store/asset/snapshot operations against it before committing.

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::error::{IoResultExt, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS blobs (
    id   BLOB PRIMARY KEY,
    data BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS partitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT
);

CREATE TABLE IF NOT EXISTS partition_blobs (
    partition_id INTEGER NOT NULL,
    blob_id      BLOB NOT NULL,
    PRIMARY KEY (partition_id, blob_id)
);
CREATE INDEX IF NOT EXISTS partition_blobs_by_blob ON partition_blobs(blob_id);

CREATE TABLE IF NOT EXISTS assets (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    partition_id INTEGER NOT NULL,
    root_json    TEXT
);

CREATE TABLE IF NOT EXISTS asset_labels (
    asset_id INTEGER NOT NULL,
    k        TEXT NOT NULL,
    v        TEXT NOT NULL,
    PRIMARY KEY (asset_id, k)
);

CREATE TABLE IF NOT EXISTS upstreams (
    scheme    TEXT NOT NULL,
    path      TEXT NOT NULL,
    remote_id TEXT NOT NULL,
    asset_id  INTEGER NOT NULL,
    PRIMARY KEY (scheme, path, remote_id)
);
CREATE UNIQUE INDEX IF NOT EXISTS upstreams_by_asset ON upstreams(asset_id);

CREATE TABLE IF NOT EXISTS snapshots (
    id  INTEGER PRIMARY KEY AUTOINCREMENT,
    cid BLOB UNIQUE NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshot_tlds (
    snapshot_id INTEGER NOT NULL,
    name        TEXT NOT NULL,
    root_json   TEXT NOT NULL,
    PRIMARY KEY (snapshot_id, name)
);

CREATE TABLE IF NOT EXISTS commits (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS fs_cache (
    path      TEXT PRIMARY KEY,
    mtime     INTEGER NOT NULL,
    root_json TEXT NOT NULL
);
"#;

/// the maximum size in bytes a single blob may occupy (2^21).
pub const MAX_BLOB_SIZE: u64 = 1 << 21;

/// shared handle to the repository's single sqlite connection.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// open (creating if absent) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).with_path(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").ok();
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// open an in-memory database, used by the void snapshot-identity store
    /// and by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// run `f` against a fresh transaction, committing on `Ok` and rolling
    /// back on `Err`.
    pub async fn transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}
