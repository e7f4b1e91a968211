//! Core types for CRDT-based synchronization.

use serde::{Deserialize, Serialize};

/// One file's entry in the per-vault structure CRDT.
///
/// Entries are keyed by `file_id` in the replicated map, so a rename is a
/// plain property update rather than a delete-and-create. Deletion is a
/// tombstone: the entry stays in the map with `deleted = true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureEntry {
    pub path: String,

    /// Entry kind, `"file"` or `"folder"`.
    #[serde(rename = "type", default = "StructureEntry::default_type")]
    pub entry_type: String,

    #[serde(default)]
    pub deleted: bool,

    pub created_at: i64,
    pub modified_at: i64,

    /// SHA-256 of the current bytes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl StructureEntry {
    fn default_type() -> String {
        "file".to_string()
    }

    pub fn file(path: impl Into<String>, now: i64) -> Self {
        Self {
            path: path.into(),
            entry_type: Self::default_type(),
            deleted: false,
            created_at: now,
            modified_at: now,
            hash: None,
        }
    }

    /// Tombstone this entry.
    pub fn mark_deleted(&mut self, now: i64) {
        self.deleted = true;
        self.modified_at = now;
    }
}

/// A persisted CRDT update record.
#[derive(Debug, Clone)]
pub struct CrdtUpdate {
    pub update_id: i64,
    pub doc_name: String,
    pub data: Vec<u8>,
    pub timestamp: i64,
    pub origin: UpdateOrigin,
}

/// Where an update came from, for attribution in the update log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOrigin {
    /// Produced by this server (e.g. materializing an HTTP write).
    Local,
    /// Received from a connected device.
    Remote,
    /// Applied during an initial sync handshake.
    Sync,
}

impl std::fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateOrigin::Local => write!(f, "local"),
            UpdateOrigin::Remote => write!(f, "remote"),
            UpdateOrigin::Sync => write!(f, "sync"),
        }
    }
}

impl std::str::FromStr for UpdateOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(UpdateOrigin::Local),
            "remote" => Ok(UpdateOrigin::Remote),
            "sync" => Ok(UpdateOrigin::Sync),
            _ => Err(format!("unknown update origin: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips_with_type_field() {
        let entry = StructureEntry::file("notes/a.md", 100);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"type\":\"file\""));

        let parsed: StructureEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn tombstone_keeps_path_and_bumps_modified() {
        let mut entry = StructureEntry::file("a.md", 100);
        entry.mark_deleted(200);
        assert!(entry.deleted);
        assert_eq!(entry.path, "a.md");
        assert_eq!(entry.modified_at, 200);
    }

    #[test]
    fn origin_round_trips_through_strings() {
        for origin in [UpdateOrigin::Local, UpdateOrigin::Remote, UpdateOrigin::Sync] {
            let parsed: UpdateOrigin = origin.to_string().parse().unwrap();
            assert_eq!(parsed, origin);
        }
        assert!("peer".parse::<UpdateOrigin>().is_err());
    }
}
