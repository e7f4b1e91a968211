//! Disaster-recovery manifest kept at `.scion/manifest.json` inside the
//! vault history.
//!
//! The manifest maps every active `file_id` to its current path so the
//! identity mapping can be rebuilt from the vault history alone if the
//! identity database is lost.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Current manifest schema version.
pub const MANIFEST_VERSION: u32 = 1;

/// One file entry in the recovery manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub created_at: i64,
}

/// The serialized recovery document.
///
/// `files` is a sorted map so repeated serialization of the same state is
/// byte-identical, which keeps no-op commits out of the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryManifest {
    pub version: u32,
    pub updated_at: i64,
    pub files: BTreeMap<String, ManifestEntry>,
}

impl RecoveryManifest {
    pub fn new(updated_at: i64) -> Self {
        Self {
            version: MANIFEST_VERSION,
            updated_at,
            files: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, file_id: impl Into<String>, path: impl Into<String>, created_at: i64) {
        self.files.insert(
            file_id.into(),
            ManifestEntry {
                path: path.into(),
                created_at,
            },
        );
    }

    pub fn to_bytes(&self) -> crate::error::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::error::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
