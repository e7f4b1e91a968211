//! Seam between the real-time fan-out and the sync engine.
//!
//! The fan-out layer materializes CRDT text and needs that text committed
//! into the vault history, but must not depend on the engine's concrete
//! types. It consumes this trait; [`OperationEngine`] implements it.
//!
//! [`OperationEngine`]: crate::engine::OperationEngine

use crate::error::Result;

/// Outcome of committing materialized text.
#[derive(Debug, Clone)]
pub struct AppliedText {
    pub path: String,
    pub commit: String,
    pub hash: String,
}

/// Commits materialized CRDT state into durable vault storage.
pub trait Applier: Send + Sync {
    /// Commit the full text of the file identified by `file_id`.
    fn apply_text(&self, file_id: &str, text: &str) -> Result<AppliedText>;
}
