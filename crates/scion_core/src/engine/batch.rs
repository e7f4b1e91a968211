//! Ordered execution of a list of sync operations for one vault.
//!
//! The whole batch runs inside the caller's writer-held critical section,
//! so concurrent batches for the same vault are fully serialized. In
//! atomic mode the first failure stops processing and the reported head is
//! the commit prior to the batch; commits already made by earlier
//! operations in the batch are not reverted.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::engine::{OperationEngine, SyncOutcome, MAX_CONTENT_BYTES};
use crate::error::{Result, ScionError};

/// One operation as it arrives on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct WireOp {
    #[serde(rename = "type")]
    pub op_type: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub old_path: Option<String>,
    /// Base64 of the raw bytes.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub base_commit: Option<String>,
}

/// A validated, decoded operation.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Create {
        path: String,
        bytes: Vec<u8>,
    },
    Modify {
        file_id: String,
        bytes: Vec<u8>,
        base_commit: Option<String>,
    },
    Rename {
        file_id: String,
        old_path: String,
        new_path: String,
        bytes: Option<Vec<u8>>,
    },
    Delete {
        file_id: String,
    },
}

impl WireOp {
    fn require<'a>(&self, field: Option<&'a str>, name: &str, index: usize) -> Result<&'a str> {
        field.ok_or_else(|| {
            ScionError::Validation(format!(
                "op {index} ({}): missing required field '{name}'",
                self.op_type
            ))
        })
    }

    fn decode_content(&self, index: usize) -> Result<Option<Vec<u8>>> {
        let Some(content) = &self.content else {
            return Ok(None);
        };
        let bytes = BASE64.decode(content).map_err(|_| {
            ScionError::Validation(format!("op {index} ({}): content is not valid base64", self.op_type))
        })?;
        if bytes.len() > MAX_CONTENT_BYTES {
            return Err(ScionError::Validation(format!(
                "op {index} ({}): decoded content exceeds {MAX_CONTENT_BYTES} bytes",
                self.op_type
            )));
        }
        Ok(Some(bytes))
    }

    /// Validate and decode. Errors here are validation failures that, in
    /// atomic mode, abort the batch before any further write.
    pub fn parse(&self, index: usize) -> Result<BatchOp> {
        match self.op_type.as_str() {
            "create" => {
                let path = self.require(self.path.as_deref(), "path", index)?;
                let bytes = self.decode_content(index)?.ok_or_else(|| {
                    ScionError::Validation(format!("op {index} (create): missing required field 'content'"))
                })?;
                Ok(BatchOp::Create {
                    path: path.to_string(),
                    bytes,
                })
            }
            "modify" => {
                let file_id = self.require(self.file_id.as_deref(), "file_id", index)?;
                let bytes = self.decode_content(index)?.ok_or_else(|| {
                    ScionError::Validation(format!("op {index} (modify): missing required field 'content'"))
                })?;
                Ok(BatchOp::Modify {
                    file_id: file_id.to_string(),
                    bytes,
                    base_commit: self.base_commit.clone(),
                })
            }
            "rename" => {
                let file_id = self.require(self.file_id.as_deref(), "file_id", index)?;
                let old_path = self.require(self.old_path.as_deref(), "old_path", index)?;
                let new_path = self.require(self.path.as_deref(), "path", index)?;
                Ok(BatchOp::Rename {
                    file_id: file_id.to_string(),
                    old_path: old_path.to_string(),
                    new_path: new_path.to_string(),
                    bytes: self.decode_content(index)?,
                })
            }
            "delete" => {
                let file_id = self.require(self.file_id.as_deref(), "file_id", index)?;
                Ok(BatchOp::Delete {
                    file_id: file_id.to_string(),
                })
            }
            other => Err(ScionError::Validation(format!(
                "op {index}: unknown op type '{other}'"
            ))),
        }
    }
}

/// Per-operation outcome, indexed by position in the request.
#[derive(Debug, Clone, Serialize)]
pub struct OpResult {
    pub index: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_conflicts: Option<bool>,
    /// Base64 of the conflict-marked text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OpResult {
    fn failure(index: usize, error: String) -> Self {
        Self {
            index,
            success: false,
            file_id: None,
            commit: None,
            hash: None,
            merged: None,
            has_conflicts: None,
            merged_content: None,
            error: Some(error),
        }
    }

    fn from_sync(index: usize, outcome: SyncOutcome) -> Self {
        Self {
            index,
            success: true,
            file_id: Some(outcome.file_id),
            commit: Some(outcome.commit),
            hash: Some(outcome.hash),
            merged: Some(outcome.merged),
            has_conflicts: Some(outcome.has_conflicts),
            merged_content: outcome.merged_content.map(|b| BASE64.encode(b)),
            error: None,
        }
    }
}

/// Whole-batch outcome.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub success: bool,
    pub results: Vec<OpResult>,
    pub head_commit: Option<String>,
}

/// Execute operations in array order.
pub struct BatchCoordinator;

impl BatchCoordinator {
    /// Run the batch. `atomic` stops at the first failure and reports the
    /// pre-batch head; otherwise every operation is attempted and results
    /// accumulate.
    pub fn execute(engine: &OperationEngine, ops: &[WireOp], atomic: bool) -> BatchReport {
        let start_commit = engine.store().head().ok().flatten();
        let mut results = Vec::with_capacity(ops.len());
        let mut all_ok = true;

        for (index, op) in ops.iter().enumerate() {
            let attempt = op
                .parse(index)
                .and_then(|parsed| Self::run_op(engine, parsed));
            match attempt {
                Ok(outcome) => results.push(OpResult::from_sync(index, outcome)),
                Err(err) => {
                    results.push(OpResult::failure(index, err.to_string()));
                    all_ok = false;
                    if atomic {
                        return BatchReport {
                            success: false,
                            results,
                            head_commit: start_commit,
                        };
                    }
                }
            }
        }

        let head_commit = engine.store().head().ok().flatten();
        BatchReport {
            success: all_ok,
            results,
            head_commit,
        }
    }

    fn run_op(engine: &OperationEngine, op: BatchOp) -> Result<SyncOutcome> {
        match op {
            BatchOp::Create { path, bytes } => engine.create(&path, &bytes),
            BatchOp::Modify {
                file_id,
                bytes,
                base_commit,
            } => engine.modify(&file_id, &bytes, base_commit.as_deref()),
            BatchOp::Rename {
                file_id,
                old_path,
                new_path,
                bytes,
            } => {
                let outcome = engine.rename(&file_id, &old_path, &new_path, bytes.as_deref())?;
                Ok(SyncOutcome {
                    file_id: outcome.file_id,
                    commit: outcome.commit,
                    hash: outcome.hash,
                    merged: false,
                    has_conflicts: false,
                    merged_content: None,
                })
            }
            BatchOp::Delete { file_id } => {
                let outcome = engine.delete(&file_id)?;
                Ok(SyncOutcome {
                    file_id: outcome.file_id,
                    commit: outcome.commit,
                    hash: String::new(),
                    merged: false,
                    has_conflicts: false,
                    merged_content: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityStore;
    use crate::store::ContentStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine() -> (TempDir, OperationEngine) {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::init(dir.path(), "notes").unwrap();
        let identity = Arc::new(IdentityStore::in_memory("notes").unwrap());
        (dir, OperationEngine::new(store, identity))
    }

    fn create_op(path: &str, content: &str) -> WireOp {
        WireOp {
            op_type: "create".into(),
            path: Some(path.into()),
            file_id: None,
            old_path: None,
            content: Some(BASE64.encode(content)),
            base_commit: None,
        }
    }

    #[test]
    fn ordered_batch_applies_every_op() {
        let (_dir, engine) = engine();
        let ops = vec![create_op("a.md", "a"), create_op("b.md", "b")];
        let report = BatchCoordinator::execute(&engine, &ops, true);

        assert!(report.success);
        assert_eq!(report.results.len(), 2);
        assert!(report.results.iter().all(|r| r.success));
        assert_eq!(
            report.head_commit.as_deref(),
            engine.store().head().unwrap().as_deref()
        );
        assert_eq!(engine.store().read_current("b.md").unwrap().unwrap(), b"b");
    }

    #[test]
    fn atomic_batch_stops_at_first_failure_and_reports_start_commit() {
        let (_dir, engine) = engine();
        let start = engine.store().head().unwrap();

        let ops = vec![
            create_op("a.md", "a"),
            WireOp {
                op_type: "modify".into(),
                path: None,
                file_id: Some("does-not-exist".into()),
                old_path: None,
                content: Some(BASE64.encode("x")),
                base_commit: None,
            },
            create_op("b.md", "b"),
        ];
        let report = BatchCoordinator::execute(&engine, &ops, true);

        assert!(!report.success);
        assert_eq!(report.results.len(), 2);
        assert!(report.results[0].success);
        assert!(!report.results[1].success);
        assert_eq!(report.head_commit, start);
        // The third op was never attempted.
        assert!(engine.store().read_current("b.md").unwrap().is_none());
    }

    #[test]
    fn non_atomic_batch_continues_past_failures() {
        let (_dir, engine) = engine();
        let ops = vec![
            create_op("a.md", "a"),
            WireOp {
                op_type: "delete".into(),
                path: None,
                file_id: Some("missing".into()),
                old_path: None,
                content: None,
                base_commit: None,
            },
            create_op("b.md", "b"),
        ];
        let report = BatchCoordinator::execute(&engine, &ops, false);

        assert!(!report.success);
        assert_eq!(report.results.len(), 3);
        assert!(report.results[0].success);
        assert!(!report.results[1].success);
        assert!(report.results[2].success);
        assert_eq!(engine.store().read_current("b.md").unwrap().unwrap(), b"b");
    }

    #[test]
    fn missing_fields_fail_validation_with_op_index() {
        let op = WireOp {
            op_type: "create".into(),
            path: None,
            file_id: None,
            old_path: None,
            content: None,
            base_commit: None,
        };
        let err = op.parse(3).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("op 3"));
        assert!(msg.contains("path"));
    }

    #[test]
    fn unknown_op_type_fails_validation() {
        let op = WireOp {
            op_type: "upsert".into(),
            path: Some("a.md".into()),
            file_id: None,
            old_path: None,
            content: None,
            base_commit: None,
        };
        let err = op.parse(0).unwrap_err();
        assert!(matches!(err, ScionError::Validation(_)));
        assert!(err.to_string().contains("upsert"));
    }

    #[test]
    fn invalid_base64_fails_validation() {
        let op = WireOp {
            op_type: "create".into(),
            path: Some("a.md".into()),
            file_id: None,
            old_path: None,
            content: Some("%%not-base64%%".into()),
            base_commit: None,
        };
        assert!(matches!(
            op.parse(0).unwrap_err(),
            ScionError::Validation(_)
        ));
    }

    #[test]
    fn batch_rename_and_delete_round_trip() {
        let (_dir, engine) = engine();
        let created = engine.create("old.md", b"body").unwrap();

        let ops = vec![
            WireOp {
                op_type: "rename".into(),
                path: Some("new.md".into()),
                file_id: Some(created.file_id.clone()),
                old_path: Some("old.md".into()),
                content: None,
                base_commit: None,
            },
            WireOp {
                op_type: "delete".into(),
                path: None,
                file_id: Some(created.file_id.clone()),
                old_path: None,
                content: None,
                base_commit: None,
            },
        ];
        let report = BatchCoordinator::execute(&engine, &ops, true);
        assert!(report.success);
        assert!(engine.store().read_current("new.md").unwrap().is_none());
        assert!(engine
            .identity()
            .get_by_id(&created.file_id)
            .unwrap()
            .is_none());
    }
}
