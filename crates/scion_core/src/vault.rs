//! Vault naming rules and per-vault filesystem layout.
//!
//! Every API call starts here: a vault name that fails validation must never
//! touch disk, and a user path that fails validation must never reach the
//! content store.

use std::path::{Path, PathBuf};

use crate::error::{Result, ScionError};

/// Reserved metadata directory inside a vault.
pub const RESERVED_DIR: &str = ".scion";

/// Disaster-recovery manifest, committed into the vault history.
pub const MANIFEST_PATH: &str = ".scion/manifest.json";

/// Identity store database, never tracked in history.
pub const METADATA_DB: &str = ".scion/metadata.db";

/// Version-control metadata directory.
pub const GIT_DIR: &str = ".git";

/// Ignore-rule file committed at vault init.
pub const GITIGNORE: &str = ".gitignore";

const MAX_VAULT_NAME_LEN: usize = 100;

/// Validate a vault name: `^[A-Za-z0-9_\- ]{1,100}$`, forbidding `..`,
/// `/` and `\`.
pub fn validate_vault_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_VAULT_NAME_LEN {
        return Err(ScionError::InvalidVaultName(name.to_string()));
    }
    if name.contains("..") {
        return Err(ScionError::InvalidVaultName(name.to_string()));
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ' ');
    if !ok {
        return Err(ScionError::InvalidVaultName(name.to_string()));
    }
    Ok(())
}

/// Validate a user-supplied relative file path.
///
/// Paths are forward-slash separated, relative, with no `..` components and
/// no reserved prefixes.
pub fn validate_user_path(path: &str) -> Result<()> {
    let invalid = |reason: &str| ScionError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if path.is_empty() {
        return Err(invalid("path is empty"));
    }
    if path.len() > 1024 {
        return Err(invalid("path too long"));
    }
    if path.contains('\\') {
        return Err(invalid("backslash separators are not allowed"));
    }
    if path.starts_with('/') || path.ends_with('/') {
        return Err(invalid("path must be relative"));
    }
    if path.contains('\0') {
        return Err(invalid("NUL byte in path"));
    }
    for component in path.split('/') {
        if component.is_empty() {
            return Err(invalid("empty path component"));
        }
        if component == "." || component == ".." {
            return Err(invalid("path traversal component"));
        }
    }
    if is_reserved_path(path) {
        return Err(invalid("reserved path"));
    }
    Ok(())
}

/// Whether a tracked path belongs to vault metadata rather than user data.
///
/// Reserved paths never appear in manifests or change sets and are never
/// accepted as user paths.
pub fn is_reserved_path(path: &str) -> bool {
    path == GITIGNORE
        || path == RESERVED_DIR
        || path.starts_with(".scion/")
        || path == GIT_DIR
        || path.starts_with(".git/")
}

/// Filesystem layout for the vault tree under a configured root.
#[derive(Debug, Clone)]
pub struct VaultPaths {
    root: PathBuf,
}

impl VaultPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a vault. The name must already be validated.
    pub fn vault_dir(&self, vault: &str) -> PathBuf {
        self.root.join(vault)
    }

    /// Identity store database path for a vault.
    pub fn metadata_db(&self, vault: &str) -> PathBuf {
        self.vault_dir(vault).join(METADATA_DB)
    }

    /// CRDT persistence database, alongside the vault root. Vault names
    /// cannot contain `.`, so this never collides with another vault.
    pub fn crdt_db(&self, vault: &str) -> PathBuf {
        self.root.join(format!("{vault}.crdt.db"))
    }
}
