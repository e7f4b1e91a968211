//! Resolution of logical sync operations against a vault.
//!
//! The engine owns the write path: every operation mutates the content
//! store, the identity store, and the disaster-recovery manifest together,
//! inside the caller's writer-held critical section. Reads may observe the
//! state before or after an operation, never in between.

pub mod batch;

use std::sync::Arc;

use tracing::info;

use crate::crdt::applier::{AppliedText, Applier};
use crate::error::{Result, ScionError};
use crate::identity::{IdentityRecord, IdentityStore};
use crate::manifest::RecoveryManifest;
use crate::store::merge::merge;
use crate::store::{sha256_hex, ContentStore, TreeChange};
use crate::vault::{validate_user_path, MANIFEST_PATH};

/// Upper bound on decoded file content accepted from clients.
pub const MAX_CONTENT_BYTES: usize = 10 * 1024 * 1024;

/// Result of a create/modify/sync operation.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub file_id: String,
    pub commit: String,
    pub hash: String,
    pub merged: bool,
    pub has_conflicts: bool,
    /// Present only for conflicting merges: the text with conflict markers,
    /// which is NOT committed.
    pub merged_content: Option<Vec<u8>>,
}

/// Result of an explicit rename.
#[derive(Debug, Clone)]
pub struct RenameOutcome {
    pub file_id: String,
    pub commit: String,
    pub hash: String,
}

/// Result of a delete.
#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub file_id: String,
    pub commit: String,
}

/// Write-path resolver for one vault.
pub struct OperationEngine {
    vault: String,
    store: ContentStore,
    identity: Arc<IdentityStore>,
}

impl OperationEngine {
    pub fn new(store: ContentStore, identity: Arc<IdentityStore>) -> Self {
        let vault = store.vault().to_string();
        Self {
            vault,
            store,
            identity,
        }
    }

    pub fn vault(&self) -> &str {
        &self.vault
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn identity(&self) -> &IdentityStore {
        &self.identity
    }

    fn head(&self) -> Result<String> {
        self.store
            .head()?
            .ok_or_else(|| ScionError::NotFound(format!("head of vault '{}'", self.vault)))
    }

    /// Manifest tree change reflecting the active records plus one pending
    /// mutation applied on top.
    fn manifest_change(
        &self,
        mutate: impl FnOnce(&mut RecoveryManifest),
    ) -> Result<TreeChange> {
        let mut manifest = self.identity.recovery_manifest()?;
        mutate(&mut manifest);
        Ok(TreeChange::Write {
            path: MANIFEST_PATH.to_string(),
            bytes: manifest.to_bytes()?,
        })
    }

    /// Create a new file. Fails if a non-deleted file already exists at
    /// `path`.
    pub fn create(&self, path: &str, bytes: &[u8]) -> Result<SyncOutcome> {
        validate_user_path(path)?;
        if bytes.len() > MAX_CONTENT_BYTES {
            return Err(ScionError::Validation(format!(
                "create: content for '{path}' exceeds {MAX_CONTENT_BYTES} bytes"
            )));
        }
        if self.identity.get_by_path(path)?.is_some() || self.store.tracked(path)? {
            return Err(ScionError::Conflict(format!(
                "create: file already exists at '{path}'"
            )));
        }

        let hash = sha256_hex(bytes);
        let file_id = self.identity.ensure_file_id(path, Some(&hash), None)?;
        let manifest = self.manifest_change(|_| {})?;

        let committed = self.store.commit_changes(
            &[
                TreeChange::Write {
                    path: path.to_string(),
                    bytes: bytes.to_vec(),
                },
                manifest,
            ],
            &format!("sync: create {path}"),
        );
        let commit = match committed {
            Ok(Some(commit)) => commit,
            Ok(None) => self.head()?,
            Err(err) => {
                let _ = self.identity.discard(&file_id);
                return Err(err);
            }
        };

        self.identity
            .update(&file_id, None, Some(&hash), Some(&commit))?;
        info!(vault = %self.vault, path, %commit, "created file");

        Ok(SyncOutcome {
            file_id,
            commit,
            hash,
            merged: false,
            has_conflicts: false,
            merged_content: None,
        })
    }

    /// Modify a file addressed by its stable id.
    pub fn modify(
        &self,
        file_id: &str,
        bytes: &[u8],
        base_commit: Option<&str>,
    ) -> Result<SyncOutcome> {
        let Some(record) = self.identity.get_by_id_any(file_id)? else {
            return Err(ScionError::NotFound(format!("modify: file_id '{file_id}'")));
        };

        if record.is_deleted() {
            // Deleted on the server: the old id stays tombstoned and the
            // content comes back under a fresh identity at the former path.
            info!(vault = %self.vault, path = %record.current_path, "recreating deleted file");
            return self.create(&record.current_path, bytes);
        }

        let path = record.current_path.clone();
        self.resolve_update(&record, &path, bytes, base_commit)
    }

    /// Single-file sync: create when the path is unknown, otherwise the
    /// modify resolution against the record at that path.
    pub fn sync_file(
        &self,
        path: &str,
        bytes: &[u8],
        base_commit: Option<&str>,
    ) -> Result<SyncOutcome> {
        validate_user_path(path)?;

        let record = match self.identity.get_by_path(path)? {
            Some(record) => record,
            None => {
                if !self.store.tracked(path)? {
                    return self.create(path, bytes);
                }
                // Tracked content without an identity row (e.g. a rebuilt
                // store): adopt it under a new id, then resolve normally.
                let file_id = self.identity.ensure_file_id(path, None, None)?;
                self.identity.get_by_id(&file_id)?.ok_or_else(|| {
                    ScionError::NotFound(format!("sync: file_id '{file_id}'"))
                })?
            }
        };

        self.resolve_update(&record, path, bytes, base_commit)
    }

    /// Shared resolution: fast-forward, no-op, or three-way merge.
    fn resolve_update(
        &self,
        record: &IdentityRecord,
        path: &str,
        bytes: &[u8],
        base_commit: Option<&str>,
    ) -> Result<SyncOutcome> {
        if bytes.len() > MAX_CONTENT_BYTES {
            return Err(ScionError::Validation(format!(
                "sync: content for '{path}' exceeds {MAX_CONTENT_BYTES} bytes"
            )));
        }

        let head = self.head()?;
        let file_id = record.file_id.clone();
        let hash = sha256_hex(bytes);

        let Some(server_bytes) = self.store.read_current(path)? else {
            // Identity row without tracked content: fast-forward recreate
            // under the same id.
            let commit = self
                .store
                .put(path, bytes, &format!("sync: restore {path}"))?;
            self.identity
                .update(&file_id, None, Some(&hash), Some(&commit))?;
            return Ok(SyncOutcome {
                file_id,
                commit,
                hash,
                merged: false,
                has_conflicts: false,
                merged_content: None,
            });
        };

        if base_commit == Some(head.as_str()) {
            let commit = self
                .store
                .put(path, bytes, &format!("sync: update {path}"))?;
            self.identity
                .update(&file_id, None, Some(&hash), Some(&commit))?;
            return Ok(SyncOutcome {
                file_id,
                commit,
                hash,
                merged: false,
                has_conflicts: false,
                merged_content: None,
            });
        }

        let server_hash = sha256_hex(&server_bytes);
        if hash == server_hash {
            let commit = record.last_commit.clone().unwrap_or(head);
            return Ok(SyncOutcome {
                file_id,
                commit,
                hash,
                merged: false,
                has_conflicts: false,
                merged_content: None,
            });
        }

        // Divergence: three-way merge. The base is the client's last known
        // snapshot when we still have it, else the server bytes themselves
        // (degenerate merge).
        let previous = self.identity.all_previous_paths(&file_id)?;
        let base = match base_commit {
            Some(base_commit) => self
                .store
                .read_at_with_history(base_commit, path, &previous)?,
            None => None,
        }
        .unwrap_or_else(|| server_bytes.clone());

        let outcome = merge(&base, bytes, &server_bytes);
        if outcome.has_conflicts {
            info!(vault = %self.vault, path, "merge produced conflicts; head unchanged");
            return Ok(SyncOutcome {
                file_id,
                commit: head,
                hash: server_hash,
                merged: true,
                has_conflicts: true,
                merged_content: Some(outcome.content),
            });
        }

        let merged_hash = sha256_hex(&outcome.content);
        if merged_hash == server_hash {
            return Ok(SyncOutcome {
                file_id,
                commit: record.last_commit.clone().unwrap_or(head),
                hash: server_hash,
                merged: true,
                has_conflicts: false,
                merged_content: None,
            });
        }

        let commit = self
            .store
            .put(path, &outcome.content, &format!("sync: merge {path}"))?;
        self.identity
            .update(&file_id, None, Some(&merged_hash), Some(&commit))?;
        info!(vault = %self.vault, path, %commit, "merged divergent edits");

        Ok(SyncOutcome {
            file_id,
            commit,
            hash: merged_hash,
            merged: true,
            has_conflicts: false,
            merged_content: None,
        })
    }

    /// Rename a file, optionally writing new bytes at the new path in the
    /// same commit. The identity record, the path-history log, and the
    /// recovery manifest all move together.
    pub fn rename(
        &self,
        file_id: &str,
        old_path: &str,
        new_path: &str,
        bytes: Option<&[u8]>,
    ) -> Result<RenameOutcome> {
        validate_user_path(new_path)?;
        let Some(record) = self.identity.get_by_id(file_id)? else {
            return Err(ScionError::NotFound(format!("rename: file_id '{file_id}'")));
        };
        if record.current_path != old_path {
            return Err(ScionError::Conflict(format!(
                "rename: recorded path for '{file_id}' is '{}', not '{old_path}'",
                record.current_path
            )));
        }
        if old_path == new_path {
            return Err(ScionError::Validation(format!(
                "rename: old and new path are both '{old_path}'"
            )));
        }
        if self.identity.get_by_path(new_path)?.is_some() || self.store.tracked(new_path)? {
            return Err(ScionError::Conflict(format!(
                "rename: file already exists at '{new_path}'"
            )));
        }
        if !self.store.tracked(old_path)? {
            return Err(ScionError::NotFound(format!("rename: path '{old_path}'")));
        }

        let manifest = self.manifest_change(|m| {
            m.insert(file_id, new_path, record.created_at);
        })?;
        let committed = self.store.commit_changes(
            &[
                TreeChange::Rename {
                    old: old_path.to_string(),
                    new: new_path.to_string(),
                    bytes: bytes.map(|b| b.to_vec()),
                },
                manifest,
            ],
            &format!("sync: rename {old_path} -> {new_path}"),
        )?;
        let commit = match committed {
            Some(commit) => commit,
            None => self.head()?,
        };

        // Path history first, then the record, so the log always explains
        // how a record reached its current path.
        self.identity
            .record_path_change(file_id, old_path, new_path)?;
        let hash = match bytes {
            Some(bytes) => sha256_hex(bytes),
            None => match self.store.read_current(new_path)? {
                Some(content) => sha256_hex(&content),
                None => record.content_hash.clone().unwrap_or_default(),
            },
        };
        self.identity
            .update(file_id, Some(new_path), Some(&hash), Some(&commit))?;
        info!(vault = %self.vault, old_path, new_path, %commit, "renamed file");

        Ok(RenameOutcome {
            file_id: file_id.to_string(),
            commit,
            hash,
        })
    }

    /// Read the committed disaster-recovery manifest out of the vault
    /// history, if one has been written.
    pub fn load_manifest(&self) -> Result<Option<RecoveryManifest>> {
        match self.store.read_current(MANIFEST_PATH)? {
            Some(bytes) => Ok(Some(RecoveryManifest::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Rebuild the identity mapping from the vault history alone. Returns
    /// the number of restored records.
    pub fn rebuild_identity_from_history(&self) -> Result<usize> {
        let Some(manifest) = self.load_manifest()? else {
            return Ok(0);
        };
        self.identity.rebuild_from_manifest(&manifest)?;
        info!(vault = %self.vault, files = manifest.files.len(), "rebuilt identity store from manifest");
        Ok(manifest.files.len())
    }

    /// Soft-delete the identity record and remove the file from the
    /// current snapshot.
    pub fn delete(&self, file_id: &str) -> Result<DeleteOutcome> {
        let Some(record) = self.identity.get_by_id(file_id)? else {
            return Err(ScionError::NotFound(format!("delete: file_id '{file_id}'")));
        };
        let path = record.current_path.clone();

        let manifest = self.manifest_change(|m| {
            m.files.remove(file_id);
        })?;
        let mut changes = vec![manifest];
        if self.store.tracked(&path)? {
            changes.push(TreeChange::Remove { path: path.clone() });
        }
        let committed = self
            .store
            .commit_changes(&changes, &format!("sync: delete {path}"))?;
        let commit = match committed {
            Some(commit) => commit,
            None => self.head()?,
        };

        self.identity.soft_delete(file_id)?;
        info!(vault = %self.vault, path, %commit, "deleted file");

        Ok(DeleteOutcome {
            file_id: file_id.to_string(),
            commit,
        })
    }
}

impl Applier for OperationEngine {
    /// Commit materialized CRDT text with fast-forward semantics: the CRDT
    /// state is already the converged document, so it never merges.
    fn apply_text(&self, file_id: &str, text: &str) -> Result<AppliedText> {
        let Some(record) = self.identity.get_by_id(file_id)? else {
            return Err(ScionError::NotFound(format!(
                "apply-text: file_id '{file_id}'"
            )));
        };
        let path = record.current_path.clone();
        let head = self.head()?;
        let outcome = self.resolve_update(&record, &path, text.as_bytes(), Some(&head))?;
        Ok(AppliedText {
            path,
            commit: outcome.commit,
            hash: outcome.hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine() -> (TempDir, OperationEngine) {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::init(dir.path(), "notes").unwrap();
        let identity = Arc::new(IdentityStore::in_memory("notes").unwrap());
        (dir, OperationEngine::new(store, identity))
    }

    #[test]
    fn create_rejects_duplicate_paths() {
        let (_dir, engine) = engine();
        engine.create("n.md", b"one").unwrap();
        let err = engine.create("n.md", b"two").unwrap_err();
        assert!(matches!(err, ScionError::Conflict(_)));
    }

    #[test]
    fn create_commits_manifest_alongside_content() {
        let (_dir, engine) = engine();
        let outcome = engine.create("n.md", b"hello").unwrap();

        let manifest_bytes = engine
            .store()
            .read_current(MANIFEST_PATH)
            .unwrap()
            .expect("manifest committed");
        let manifest = RecoveryManifest::from_bytes(&manifest_bytes).unwrap();
        assert_eq!(
            manifest.files.get(&outcome.file_id).unwrap().path,
            "n.md"
        );
    }

    #[test]
    fn modify_of_deleted_file_recreates_with_fresh_id() {
        let (_dir, engine) = engine();
        let created = engine.create("n.md", b"v1").unwrap();
        engine.delete(&created.file_id).unwrap();

        let recreated = engine.modify(&created.file_id, b"v2", None).unwrap();
        assert_ne!(recreated.file_id, created.file_id);
        assert!(!recreated.merged);
        assert_eq!(
            engine.store().read_current("n.md").unwrap().unwrap(),
            b"v2"
        );
    }

    #[test]
    fn oversized_content_is_rejected_before_any_write() {
        let (_dir, engine) = engine();
        let created = engine.create("n.md", b"small").unwrap();
        let huge = vec![b'x'; MAX_CONTENT_BYTES + 1];
        let err = engine.modify(&created.file_id, &huge, None).unwrap_err();
        assert!(matches!(err, ScionError::Validation(_)));
        assert_eq!(engine.store().head().unwrap().unwrap(), created.commit);
    }

    #[test]
    fn apply_text_fast_forwards_crdt_state() {
        let (_dir, engine) = engine();
        let created = engine.create("n.md", b"draft").unwrap();
        let applied = engine.apply_text(&created.file_id, "draft, revised").unwrap();
        assert_eq!(applied.path, "n.md");
        assert_ne!(applied.commit, created.commit);
        assert_eq!(
            engine.store().read_current("n.md").unwrap().unwrap(),
            b"draft, revised"
        );
    }
}
