//! Successor lookup for paths that disappeared from a client's view.
//!
//! Given a path missing on the server, tries to find where the file went:
//! by stable file id, by unique content hash, or by the rename log.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identity::IdentityStore;

/// Which signal resolved the rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    FileId,
    HashMatch,
    PathHistory,
}

/// Outcome of a rename probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameDetection {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection_method: Option<DetectionMethod>,
}

impl RenameDetection {
    fn not_found() -> Self {
        Self {
            found: false,
            new_path: None,
            file_id: None,
            detection_method: None,
        }
    }

    fn found(new_path: String, file_id: String, method: DetectionMethod) -> Self {
        Self {
            found: true,
            new_path: Some(new_path),
            file_id: Some(file_id),
            detection_method: Some(method),
        }
    }
}

/// Stateless detector over one vault's identity store.
pub struct RenameDetector<'a> {
    identity: &'a IdentityStore,
}

impl<'a> RenameDetector<'a> {
    pub fn new(identity: &'a IdentityStore) -> Self {
        Self { identity }
    }

    /// Resolution order: file id, then unique hash match, then path
    /// history. An ambiguous hash match (several active files with the
    /// same content) reports not found; callers must treat that as
    /// inconclusive rather than "deleted".
    pub fn detect(
        &self,
        missing_path: &str,
        missing_hash: &str,
        file_id: Option<&str>,
    ) -> Result<RenameDetection> {
        if let Some(id) = file_id {
            if let Some(record) = self.identity.get_by_id(id)? {
                if record.current_path != missing_path {
                    return Ok(RenameDetection::found(
                        record.current_path,
                        record.file_id,
                        DetectionMethod::FileId,
                    ));
                }
            }
        }

        let by_hash: Vec<_> = self
            .identity
            .get_by_hash(missing_hash)?
            .into_iter()
            .filter(|r| r.current_path != missing_path)
            .collect();
        match by_hash.len() {
            1 => {
                let record = by_hash.into_iter().next().unwrap();
                return Ok(RenameDetection::found(
                    record.current_path,
                    record.file_id,
                    DetectionMethod::HashMatch,
                ));
            }
            n if n > 1 => return Ok(RenameDetection::not_found()),
            _ => {}
        }

        if let Some(record) = self.identity.find_by_any_path(missing_path)? {
            if record.current_path != missing_path {
                return Ok(RenameDetection::found(
                    record.current_path,
                    record.file_id,
                    DetectionMethod::PathHistory,
                ));
            }
        }

        Ok(RenameDetection::not_found())
    }
}
