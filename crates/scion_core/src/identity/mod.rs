//! Persistent mapping from stable file ids to paths.
//!
//! Backed by a per-vault SQLite database at `.scion/metadata.db` (WAL
//! mode), with a secondary index on content hash and on the current path.
//! Soft-deleted rows stay in the table as tombstones; a deleted file id is
//! never handed out again.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{Result, ScionError};
use crate::manifest::RecoveryManifest;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS file_identities (
    file_id      TEXT PRIMARY KEY,
    vault_name   TEXT NOT NULL,
    current_path TEXT NOT NULL,
    content_hash TEXT,
    last_commit  TEXT,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    deleted_at   INTEGER
);

CREATE INDEX IF NOT EXISTS idx_identities_vault_path
    ON file_identities(vault_name, current_path);
CREATE INDEX IF NOT EXISTS idx_identities_hash
    ON file_identities(content_hash);

CREATE TABLE IF NOT EXISTS path_history (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id    TEXT NOT NULL,
    old_path   TEXT NOT NULL,
    new_path   TEXT NOT NULL,
    changed_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_path_history_file ON path_history(file_id, id);
CREATE INDEX IF NOT EXISTS idx_path_history_old ON path_history(old_path);
"#;

/// One identity row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub file_id: String,
    pub vault_name: String,
    pub current_path: String,
    pub content_hash: Option<String>,
    pub last_commit: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl IdentityRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Per-vault identity database.
pub struct IdentityStore {
    conn: Mutex<Connection>,
    vault: String,
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<IdentityRecord> {
    Ok(IdentityRecord {
        file_id: row.get(0)?,
        vault_name: row.get(1)?,
        current_path: row.get(2)?,
        content_hash: row.get(3)?,
        last_commit: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        deleted_at: row.get(7)?,
    })
}

const RECORD_COLUMNS: &str = "file_id, vault_name, current_path, content_hash, last_commit, \
     created_at, updated_at, deleted_at";

impl IdentityStore {
    /// Open or create the identity database at `db_path`.
    pub fn open(db_path: &Path, vault: &str) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Mutex::new(conn),
            vault: vault.to_string(),
        };
        store.conn().execute_batch(SCHEMA)?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory(vault: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            vault: vault.to_string(),
        };
        store.conn().execute_batch(SCHEMA)?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn vault(&self) -> &str {
        &self.vault
    }

    /// Return the active file id at `path`, creating a record if none
    /// exists. When a record exists, `hash`/`commit` update it in place.
    pub fn ensure_file_id(
        &self,
        path: &str,
        hash: Option<&str>,
        commit: Option<&str>,
    ) -> Result<String> {
        if let Some(record) = self.get_by_path(path)? {
            if hash.is_some() || commit.is_some() {
                self.update(&record.file_id, None, hash, commit)?;
            }
            return Ok(record.file_id);
        }

        let file_id = Uuid::new_v4().to_string();
        let now = now_ts();
        self.conn().execute(
            "INSERT INTO file_identities \
             (file_id, vault_name, current_path, content_hash, last_commit, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![file_id, self.vault, path, hash, commit, now],
        )?;
        Ok(file_id)
    }

    /// Active record by file id (soft-deleted rows excluded).
    pub fn get_by_id(&self, file_id: &str) -> Result<Option<IdentityRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM file_identities \
                     WHERE file_id = ?1 AND deleted_at IS NULL"
                ),
                params![file_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Record by file id including tombstones.
    pub fn get_by_id_any(&self, file_id: &str) -> Result<Option<IdentityRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM file_identities WHERE file_id = ?1"),
                params![file_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Active record currently at `path`.
    pub fn get_by_path(&self, path: &str) -> Result<Option<IdentityRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM file_identities \
                     WHERE vault_name = ?1 AND current_path = ?2 AND deleted_at IS NULL"
                ),
                params![self.vault, path],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// All active records whose content hash equals `hash`.
    pub fn get_by_hash(&self, hash: &str) -> Result<Vec<IdentityRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM file_identities \
             WHERE content_hash = ?1 AND deleted_at IS NULL ORDER BY updated_at DESC"
        ))?;
        let rows = stmt.query_map(params![hash], row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(ScionError::from)
    }

    /// Update mutable fields of a record, bumping `updated_at`.
    ///
    /// When `current_path` changes, the caller must also call
    /// [`record_path_change`] in the same writer-held critical section.
    ///
    /// [`record_path_change`]: IdentityStore::record_path_change
    pub fn update(
        &self,
        file_id: &str,
        current_path: Option<&str>,
        hash: Option<&str>,
        commit: Option<&str>,
    ) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE file_identities SET \
                current_path = COALESCE(?2, current_path), \
                content_hash = COALESCE(?3, content_hash), \
                last_commit  = COALESCE(?4, last_commit), \
                updated_at   = ?5 \
             WHERE file_id = ?1",
            params![file_id, current_path, hash, commit, now_ts()],
        )?;
        if changed == 0 {
            return Err(ScionError::NotFound(format!("file_id '{file_id}'")));
        }
        Ok(())
    }

    /// Append a rename to the path-history log.
    pub fn record_path_change(&self, file_id: &str, old: &str, new: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO path_history (file_id, old_path, new_path, changed_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![file_id, old, new, now_ts()],
        )?;
        Ok(())
    }

    /// Drop a freshly created record after a failed write, so a commit
    /// error leaves no identity row behind. Not part of the normal
    /// lifecycle; deletion of synced files goes through [`soft_delete`].
    ///
    /// [`soft_delete`]: IdentityStore::soft_delete
    pub fn discard(&self, file_id: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM file_identities WHERE file_id = ?1",
            params![file_id],
        )?;
        Ok(())
    }

    /// Tombstone a record. Idempotent.
    pub fn soft_delete(&self, file_id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE file_identities SET deleted_at = ?2, updated_at = ?2 \
             WHERE file_id = ?1 AND deleted_at IS NULL",
            params![file_id, now_ts()],
        )?;
        Ok(())
    }

    /// Historical paths of a file, most recent first, deduplicated.
    pub fn all_previous_paths(&self, file_id: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT old_path FROM path_history WHERE file_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![file_id], |row| row.get::<_, String>(0))?;
        let mut paths: Vec<String> = Vec::new();
        for row in rows {
            let path = row?;
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// Resolve a path against current paths first, then against the rename
    /// log, picking the most recent active owner.
    pub fn find_by_any_path(&self, path: &str) -> Result<Option<IdentityRecord>> {
        if let Some(record) = self.get_by_path(path)? {
            return Ok(Some(record));
        }
        let file_id: Option<String> = {
            let conn = self.conn();
            conn.query_row(
                "SELECT ph.file_id FROM path_history ph \
                 JOIN file_identities fi ON fi.file_id = ph.file_id \
                 WHERE ph.old_path = ?1 AND fi.deleted_at IS NULL \
                 ORDER BY ph.id DESC LIMIT 1",
                params![path],
                |row| row.get(0),
            )
            .optional()?
        };
        match file_id {
            Some(id) => self.get_by_id(&id),
            None => Ok(None),
        }
    }

    /// Every active record, ordered by path.
    pub fn active_records(&self) -> Result<Vec<IdentityRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM file_identities \
             WHERE deleted_at IS NULL ORDER BY current_path"
        ))?;
        let rows = stmt.query_map([], row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(ScionError::from)
    }

    /// Build the disaster-recovery manifest from the active records.
    pub fn recovery_manifest(&self) -> Result<RecoveryManifest> {
        let mut manifest = RecoveryManifest::new(now_ts());
        for record in self.active_records()? {
            manifest.insert(record.file_id, record.current_path, record.created_at);
        }
        Ok(manifest)
    }

    /// Repopulate the identity table from a recovery manifest. Existing
    /// rows with the same file id are replaced; hashes and commits are
    /// re-learned on the next sync of each file.
    pub fn rebuild_from_manifest(&self, manifest: &RecoveryManifest) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = now_ts();
        for (file_id, entry) in &manifest.files {
            tx.execute(
                "INSERT OR REPLACE INTO file_identities \
                 (file_id, vault_name, current_path, content_hash, last_commit, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, NULL, NULL, ?4, ?5)",
                params![file_id, self.vault, entry.path, entry.created_at, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}
