//! Content-addressed, history-preserving storage for a single vault.
//!
//! Each vault is an embedded git repository: user files in the working
//! tree, history in `.git`. All reads go through the committed HEAD tree,
//! never the working directory, so a failed write can never leak
//! half-applied state into a manifest or a download.
//!
//! Commits form a single linear history; the 40-hex commit id is the
//! opaque snapshot identifier handed to clients.

pub mod merge;

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use git2::{Commit, Delta, ObjectType, Oid, Repository, Signature, Sort, Tree, TreeWalkMode, TreeWalkResult};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{Result, ScionError};
use crate::vault::{is_reserved_path, GITIGNORE};

pub use merge::{merge, MergeOutcome};

/// Ignore rules committed at vault init: the identity database and its
/// write-ahead sidecars live inside the vault but are never tracked.
const IGNORE_RULES: &str = ".scion/metadata.db\n.scion/metadata.db-wal\n.scion/metadata.db-shm\n";

const COMMIT_AUTHOR: &str = "scion";
const COMMIT_EMAIL: &str = "scion@localhost";

/// SHA-256 of raw bytes as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// One history entry of a path.
#[derive(Debug, Clone, Serialize)]
pub struct CommitInfo {
    pub commit: String,
    pub message: String,
    pub timestamp: i64,
}

/// One staged change inside an atomic commit.
#[derive(Debug, Clone)]
pub enum TreeChange {
    Write { path: String, bytes: Vec<u8> },
    Remove { path: String },
    Rename {
        old: String,
        new: String,
        bytes: Option<Vec<u8>>,
    },
}

/// Handle on one vault's repository.
pub struct ContentStore {
    repo: Repository,
    dir: PathBuf,
    vault: String,
}

// `git2::Repository` wraps a raw libgit2 pointer and is therefore not
// `Sync` by auto-trait inference. Every caller reaches a `ContentStore`
// only through a `Mutex`-guarded `VaultWriter` (see
// `scion_sync_server::registry`), so concurrent access is already
// serialized and sharing the handle across threads is sound.
unsafe impl Sync for ContentStore {}

impl ContentStore {
    /// Idempotently create the vault repository. A fresh vault gets an
    /// initial commit carrying the ignore rule for reserved metadata files.
    pub fn init(root: &Path, vault: &str) -> Result<Self> {
        let dir = root.join(vault);
        fs::create_dir_all(&dir)?;
        let repo = match Repository::open(&dir) {
            Ok(repo) => repo,
            Err(_) => Repository::init(&dir)?,
        };
        let store = Self {
            repo,
            dir,
            vault: vault.to_string(),
        };
        if store.head()?.is_none() {
            store.commit_changes(
                &[TreeChange::Write {
                    path: GITIGNORE.to_string(),
                    bytes: IGNORE_RULES.as_bytes().to_vec(),
                }],
                "init vault",
            )?;
        }
        Ok(store)
    }

    /// Open an existing vault repository.
    pub fn open(root: &Path, vault: &str) -> Result<Self> {
        let dir = root.join(vault);
        let repo = Repository::open(&dir)
            .map_err(|_| ScionError::NotFound(format!("vault '{vault}'")))?;
        Ok(Self {
            repo,
            dir,
            vault: vault.to_string(),
        })
    }

    pub fn vault(&self) -> &str {
        &self.vault
    }

    /// Latest commit id, or `None` for a vault with no history yet.
    pub fn head(&self) -> Result<Option<String>> {
        Ok(self.head_commit()?.map(|c| c.id().to_string()))
    }

    fn head_commit(&self) -> Result<Option<Commit<'_>>> {
        let Ok(head) = self.repo.head() else {
            return Ok(None);
        };
        match head.target() {
            Some(oid) => Ok(Some(self.repo.find_commit(oid)?)),
            None => Ok(None),
        }
    }

    fn signature(&self) -> Result<Signature<'static>> {
        Ok(Signature::now(COMMIT_AUTHOR, COMMIT_EMAIL)?)
    }

    /// Stage a set of changes and commit them atomically.
    ///
    /// Returns `None` when the staged tree is identical to HEAD's tree
    /// (nothing to commit); the caller keeps the current head in that case.
    pub fn commit_changes(&self, changes: &[TreeChange], message: &str) -> Result<Option<String>> {
        match self.apply_and_commit(changes, message) {
            Ok(commit) => Ok(commit),
            Err(err) => {
                self.restore_index();
                Err(err)
            }
        }
    }

    fn apply_and_commit(&self, changes: &[TreeChange], message: &str) -> Result<Option<String>> {
        let mut index = self.repo.index()?;

        for change in changes {
            match change {
                TreeChange::Write { path, bytes } => {
                    let abs = self.dir.join(path);
                    if let Some(parent) = abs.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&abs, bytes)?;
                    index.add_path(Path::new(path))?;
                }
                TreeChange::Remove { path } => {
                    let abs = self.dir.join(path);
                    if abs.exists() {
                        fs::remove_file(&abs)?;
                    }
                    index.remove_path(Path::new(path))?;
                }
                TreeChange::Rename { old, new, bytes } => {
                    let old_abs = self.dir.join(old);
                    let new_abs = self.dir.join(new);
                    if let Some(parent) = new_abs.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    match bytes {
                        Some(bytes) => {
                            fs::write(&new_abs, bytes)?;
                            if old_abs.exists() {
                                fs::remove_file(&old_abs)?;
                            }
                        }
                        None => {
                            fs::rename(&old_abs, &new_abs)?;
                        }
                    }
                    index.remove_path(Path::new(old))?;
                    index.add_path(Path::new(new))?;
                }
            }
        }

        let tree_id = index.write_tree()?;
        let head = self.head_commit()?;
        if let Some(head_commit) = &head {
            if head_commit.tree_id() == tree_id {
                index.write()?;
                return Ok(None);
            }
        }
        index.write()?;

        let tree = self.repo.find_tree(tree_id)?;
        let sig = self.signature()?;
        let parents: Vec<&Commit<'_>> = head.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(Some(oid.to_string()))
    }

    /// Re-point the index at HEAD's tree after a failed write so a later
    /// commit cannot pick up half-staged entries.
    fn restore_index(&self) {
        let restore = || -> Result<()> {
            if let Some(head) = self.head_commit()? {
                let tree = head.tree()?;
                let mut index = self.repo.index()?;
                index.read_tree(&tree)?;
                index.write()?;
            }
            Ok(())
        };
        if let Err(err) = restore() {
            warn!(vault = %self.vault, "failed to restore index after write error: {err}");
        }
    }

    /// Commit `bytes` at `path`. Unchanged bytes return the current head
    /// without creating a commit.
    pub fn put(&self, path: &str, bytes: &[u8], message: &str) -> Result<String> {
        if let Some(current) = self.read_current(path)? {
            if current == bytes {
                if let Some(head) = self.head()? {
                    return Ok(head);
                }
            }
        }
        let committed = self.commit_changes(
            &[TreeChange::Write {
                path: path.to_string(),
                bytes: bytes.to_vec(),
            }],
            message,
        )?;
        match committed {
            Some(commit) => Ok(commit),
            None => self
                .head()?
                .ok_or_else(|| ScionError::NotFound(format!("head of vault '{}'", self.vault))),
        }
    }

    /// Remove `path` from the snapshot with a delete commit. Returns false
    /// if the path was not tracked.
    pub fn delete(&self, path: &str) -> Result<bool> {
        if !self.tracked(path)? {
            return Ok(false);
        }
        self.commit_changes(
            &[TreeChange::Remove {
                path: path.to_string(),
            }],
            &format!("delete {path}"),
        )?;
        Ok(true)
    }

    /// Rename `old` to `new` in a single commit.
    pub fn move_path(&self, old: &str, new: &str) -> Result<String> {
        if !self.tracked(old)? {
            return Err(ScionError::NotFound(format!("path '{old}'")));
        }
        let committed = self.commit_changes(
            &[TreeChange::Rename {
                old: old.to_string(),
                new: new.to_string(),
                bytes: None,
            }],
            &format!("rename {old} -> {new}"),
        )?;
        match committed {
            Some(commit) => Ok(commit),
            None => self
                .head()?
                .ok_or_else(|| ScionError::NotFound(format!("head of vault '{}'", self.vault))),
        }
    }

    /// Bytes of `path` at HEAD.
    pub fn read_current(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let Some(head) = self.head_commit()? else {
            return Ok(None);
        };
        self.blob_at(&head.tree()?, path)
    }

    /// Bytes of `path` at a historical commit. Unknown commits and paths
    /// absent at that commit both read as `None`.
    pub fn read_at(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let Ok(oid) = Oid::from_str(commit) else {
            return Ok(None);
        };
        let Ok(commit) = self.repo.find_commit(oid) else {
            return Ok(None);
        };
        self.blob_at(&commit.tree()?, path)
    }

    /// Like [`read_at`], but falls back through the file's historical paths
    /// (most recent first) when the current path is absent at that commit.
    pub fn read_at_with_history(
        &self,
        commit: &str,
        current_path: &str,
        previous_paths: &[String],
    ) -> Result<Option<Vec<u8>>> {
        if let Some(bytes) = self.read_at(commit, current_path)? {
            return Ok(Some(bytes));
        }
        for path in previous_paths {
            if let Some(bytes) = self.read_at(commit, path)? {
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }

    fn blob_at(&self, tree: &Tree<'_>, path: &str) -> Result<Option<Vec<u8>>> {
        let Ok(entry) = tree.get_path(Path::new(path)) else {
            return Ok(None);
        };
        if entry.kind() != Some(ObjectType::Blob) {
            return Ok(None);
        }
        let object = entry.to_object(&self.repo)?;
        let blob = object
            .into_blob()
            .map_err(|_| ScionError::NotFound(format!("blob at '{path}'")))?;
        Ok(Some(blob.content().to_vec()))
    }

    /// Whether `path` is a tracked file at HEAD.
    pub fn tracked(&self, path: &str) -> Result<bool> {
        let Some(head) = self.head_commit()? else {
            return Ok(false);
        };
        let tree = head.tree()?;
        match tree.get_path(Path::new(path)) {
            Ok(entry) => Ok(entry.kind() == Some(ObjectType::Blob)),
            Err(_) => Ok(false),
        }
    }

    /// All tracked user paths at HEAD, sorted, excluding reserved paths.
    pub fn list_tracked(&self) -> Result<Vec<String>> {
        let Some(head) = self.head_commit()? else {
            return Ok(Vec::new());
        };
        let tree = head.tree()?;
        let mut paths = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    let path = format!("{root}{name}");
                    if !is_reserved_path(&path) {
                        paths.push(path);
                    }
                }
            }
            TreeWalkResult::Ok
        })?;
        paths.sort();
        Ok(paths)
    }

    /// Commits that changed `path`, newest first. A commit counts when the
    /// blob at `path` differs from the first parent's blob (including
    /// additions and deletions).
    pub fn history(&self, path: &str, limit: usize) -> Result<Vec<CommitInfo>> {
        let Some(head) = self.head_commit()? else {
            return Ok(Vec::new());
        };
        let mut revwalk = self.repo.revwalk()?;
        revwalk.push(head.id())?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;

        let mut entries = Vec::new();
        for oid in revwalk {
            let oid = oid?;
            let commit = self.repo.find_commit(oid)?;
            let blob = commit
                .tree()?
                .get_path(Path::new(path))
                .ok()
                .map(|e| e.id());
            let parent_blob = match commit.parent(0) {
                Ok(parent) => parent
                    .tree()?
                    .get_path(Path::new(path))
                    .ok()
                    .map(|e| e.id()),
                Err(_) => None,
            };
            if blob != parent_blob {
                entries.push(CommitInfo {
                    commit: oid.to_string(),
                    message: commit.message().unwrap_or("").trim_end().to_string(),
                    timestamp: commit.time().seconds(),
                });
                if entries.len() >= limit {
                    break;
                }
            }
        }
        Ok(entries)
    }

    /// Head commit plus the user paths whose bytes differ from their bytes
    /// at `since`. A `since` equal to head yields an empty list; a missing
    /// or unknown `since` yields every tracked path.
    pub fn changed_since(&self, since: Option<&str>) -> Result<(Option<String>, Vec<String>)> {
        let Some(head) = self.head_commit()? else {
            return Ok((None, Vec::new()));
        };
        let head_id = head.id().to_string();

        if let Some(since) = since {
            if since == head_id {
                return Ok((Some(head_id), Vec::new()));
            }
            if let Ok(oid) = Oid::from_str(since) {
                if let Ok(old_commit) = self.repo.find_commit(oid) {
                    let old_tree = old_commit.tree()?;
                    let new_tree = head.tree()?;
                    let diff =
                        self.repo
                            .diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)?;
                    let mut changed = BTreeSet::new();
                    for delta in diff.deltas() {
                        let file = if delta.status() == Delta::Deleted {
                            delta.old_file()
                        } else {
                            delta.new_file()
                        };
                        if let Some(path) = file.path().and_then(|p| p.to_str()) {
                            if !is_reserved_path(path) {
                                changed.insert(path.to_string());
                            }
                        }
                    }
                    return Ok((Some(head_id), changed.into_iter().collect()));
                }
            }
        }

        let all = self.list_tracked()?;
        Ok((Some(head_id), all))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ContentStore) {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::init(dir.path(), "notes").unwrap();
        (dir, store)
    }

    #[test]
    fn init_is_idempotent_and_creates_history() {
        let dir = TempDir::new().unwrap();
        let first = ContentStore::init(dir.path(), "notes").unwrap();
        let head = first.head().unwrap().unwrap();
        assert_eq!(head.len(), 40);

        let second = ContentStore::init(dir.path(), "notes").unwrap();
        assert_eq!(second.head().unwrap().unwrap(), head);
    }

    #[test]
    fn put_and_read_round_trip() {
        let (_dir, store) = store();
        let commit = store.put("n.md", b"hello", "sync: create n.md").unwrap();
        assert_eq!(commit.len(), 40);
        assert_eq!(store.read_current("n.md").unwrap().unwrap(), b"hello");
        assert_eq!(store.head().unwrap().unwrap(), commit);
    }

    #[test]
    fn unchanged_put_does_not_advance_head() {
        let (_dir, store) = store();
        let c1 = store.put("n.md", b"same", "first").unwrap();
        let c2 = store.put("n.md", b"same", "second").unwrap();
        assert_eq!(c1, c2);
        assert_eq!(store.head().unwrap().unwrap(), c1);
    }

    #[test]
    fn history_is_immutable_across_edits() {
        let (_dir, store) = store();
        let c1 = store.put("n.md", b"v1", "one").unwrap();
        let c2 = store.put("n.md", b"v2", "two").unwrap();
        assert_ne!(c1, c2);

        assert_eq!(store.read_at(&c1, "n.md").unwrap().unwrap(), b"v1");
        assert_eq!(store.read_at(&c2, "n.md").unwrap().unwrap(), b"v2");
        // repeated reads of a fixed commit are byte-identical
        assert_eq!(store.read_at(&c1, "n.md").unwrap().unwrap(), b"v1");
    }

    #[test]
    fn read_at_unknown_commit_or_path_is_none() {
        let (_dir, store) = store();
        store.put("n.md", b"x", "one").unwrap();
        assert!(store.read_at("deadbeef", "n.md").unwrap().is_none());
        assert!(store
            .read_at(
                "0000000000000000000000000000000000000000",
                "n.md"
            )
            .unwrap()
            .is_none());
        let head = store.head().unwrap().unwrap();
        assert!(store.read_at(&head, "missing.md").unwrap().is_none());
    }

    #[test]
    fn delete_removes_from_snapshot_but_not_history() {
        let (_dir, store) = store();
        let c1 = store.put("n.md", b"keep", "one").unwrap();
        assert!(store.delete("n.md").unwrap());
        assert!(store.read_current("n.md").unwrap().is_none());
        assert_eq!(store.read_at(&c1, "n.md").unwrap().unwrap(), b"keep");
        assert!(!store.delete("n.md").unwrap());
    }

    #[test]
    fn move_path_preserves_content_and_history() {
        let (_dir, store) = store();
        let c1 = store.put("old.md", b"body", "one").unwrap();
        let c2 = store.move_path("old.md", "new.md").unwrap();
        assert_ne!(c1, c2);
        assert!(store.read_current("old.md").unwrap().is_none());
        assert_eq!(store.read_current("new.md").unwrap().unwrap(), b"body");
        assert_eq!(store.read_at(&c1, "old.md").unwrap().unwrap(), b"body");
    }

    #[test]
    fn read_at_with_history_falls_back_to_old_paths() {
        let (_dir, store) = store();
        let c1 = store.put("old.md", b"body", "one").unwrap();
        store.move_path("old.md", "new.md").unwrap();

        let bytes = store
            .read_at_with_history(&c1, "new.md", &["old.md".to_string()])
            .unwrap();
        assert_eq!(bytes.unwrap(), b"body");
    }

    #[test]
    fn list_tracked_excludes_reserved_paths() {
        let (_dir, store) = store();
        store.put("a.md", b"a", "one").unwrap();
        store
            .commit_changes(
                &[TreeChange::Write {
                    path: ".scion/manifest.json".to_string(),
                    bytes: b"{}".to_vec(),
                }],
                "manifest",
            )
            .unwrap();
        let tracked = store.list_tracked().unwrap();
        assert_eq!(tracked, vec!["a.md".to_string()]);
    }

    #[test]
    fn changed_since_reports_exactly_the_diff() {
        let (_dir, store) = store();
        let c1 = store.put("a.md", b"a", "one").unwrap();
        store.put("b.md", b"b", "two").unwrap();
        store.put("a.md", b"a2", "three").unwrap();
        let head = store.head().unwrap().unwrap();

        let (reported_head, changed) = store.changed_since(Some(&c1)).unwrap();
        assert_eq!(reported_head.unwrap(), head);
        assert_eq!(changed, vec!["a.md".to_string(), "b.md".to_string()]);

        let (_, none) = store.changed_since(Some(&head)).unwrap();
        assert!(none.is_empty());

        let (_, all) = store.changed_since(None).unwrap();
        assert_eq!(all, vec!["a.md".to_string(), "b.md".to_string()]);

        let (_, unknown) = store.changed_since(Some("not-a-commit")).unwrap();
        assert_eq!(unknown, all);
    }

    #[test]
    fn changed_since_includes_deleted_paths() {
        let (_dir, store) = store();
        store.put("a.md", b"a", "one").unwrap();
        let c1 = store.head().unwrap().unwrap();
        store.delete("a.md").unwrap();
        let (_, changed) = store.changed_since(Some(&c1)).unwrap();
        assert_eq!(changed, vec!["a.md".to_string()]);
    }

    #[test]
    fn multi_change_commit_is_atomic() {
        let (_dir, store) = store();
        store.put("a.md", b"a", "one").unwrap();
        let commit = store
            .commit_changes(
                &[
                    TreeChange::Write {
                        path: "b.md".to_string(),
                        bytes: b"b".to_vec(),
                    },
                    TreeChange::Remove {
                        path: "a.md".to_string(),
                    },
                ],
                "swap",
            )
            .unwrap()
            .unwrap();
        assert_eq!(store.head().unwrap().unwrap(), commit);
        assert!(store.read_current("a.md").unwrap().is_none());
        assert_eq!(store.read_current("b.md").unwrap().unwrap(), b"b");
    }

    #[test]
    fn history_lists_changing_commits_newest_first() {
        let (_dir, store) = store();
        let c1 = store.put("n.md", b"v1", "one").unwrap();
        store.put("other.md", b"x", "unrelated").unwrap();
        let c2 = store.put("n.md", b"v2", "two").unwrap();

        let history = store.history("n.md", 50).unwrap();
        let commits: Vec<&str> = history.iter().map(|e| e.commit.as_str()).collect();
        assert_eq!(commits, vec![c2.as_str(), c1.as_str()]);
        assert_eq!(history[0].message, "two");
        assert!(history[0].timestamp >= history[1].timestamp);
    }

    #[test]
    fn history_includes_the_delete_commit() {
        let (_dir, store) = store();
        store.put("n.md", b"v1", "one").unwrap();
        store.delete("n.md").unwrap();
        let history = store.history("n.md", 50).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message, "delete n.md");
    }

    #[test]
    fn history_of_unknown_path_is_empty() {
        let (_dir, store) = store();
        store.put("n.md", b"v1", "one").unwrap();
        assert!(store.history("ghost.md", 50).unwrap().is_empty());
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
