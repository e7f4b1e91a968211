//! SQLite-backed CRDT persistence.
//!
//! Stores document snapshots and the incremental update log in a single
//! database per vault, kept alongside the vault root (never inside the
//! tracked file tree).

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use super::storage::CrdtStorage;
use super::types::{CrdtUpdate, UpdateOrigin};
use crate::error::{Result, ScionError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    name       TEXT PRIMARY KEY,
    state      BLOB NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS updates (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_name  TEXT NOT NULL,
    data      BLOB NOT NULL,
    origin    TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_updates_doc_id ON updates(doc_name, id);
"#;

/// SQLite-backed CRDT storage, connection behind a mutex.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.conn().execute_batch(SCHEMA)?;
        Ok(storage)
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.conn().execute_batch(SCHEMA)?;
        Ok(storage)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CrdtStorage for SqliteStorage {
    fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn();
        let state = conn
            .query_row(
                "SELECT state FROM documents WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> Result<()> {
        self.conn().execute(
            "INSERT INTO documents (name, state, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(name) DO UPDATE SET state = ?2, updated_at = ?3",
            params![name, state, chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM documents WHERE name = ?1", params![name])?;
        conn.execute("DELETE FROM updates WHERE doc_name = ?1", params![name])?;
        Ok(())
    }

    fn list_docs(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT name FROM documents ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(ScionError::from)
    }

    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO updates (doc_name, data, origin, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![
                name,
                update,
                origin.to_string(),
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_updates_since(&self, name: &str, since_id: i64) -> Result<Vec<CrdtUpdate>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, data, origin, timestamp FROM updates \
             WHERE doc_name = ?1 AND id > ?2 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![name, since_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut updates = Vec::new();
        for row in rows {
            let (id, data, origin, timestamp) = row?;
            updates.push(CrdtUpdate {
                update_id: id,
                doc_name: name.to_string(),
                data,
                timestamp,
                origin: origin.parse().unwrap_or(UpdateOrigin::Remote),
            });
        }
        Ok(updates)
    }

    fn get_latest_update_id(&self, name: &str) -> Result<i64> {
        let conn = self.conn();
        let id: Option<i64> = conn
            .query_row(
                "SELECT MAX(id) FROM updates WHERE doc_name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(id.unwrap_or(0))
    }
}
