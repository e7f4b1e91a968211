//! Storage abstraction for CRDT persistence.

use super::types::{CrdtUpdate, UpdateOrigin};
use crate::error::Result;

/// Trait for CRDT document storage backends.
///
/// The storage holds two kinds of data per document: a compacted snapshot
/// of the full state, and an append-only log of incremental updates. The
/// log is what lets a joining device receive only the deltas it is
/// missing.
pub trait CrdtStorage: Send + Sync {
    /// Load the full document state, or `None` if the document is unknown.
    fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Overwrite the document snapshot.
    fn save_doc(&self, name: &str, state: &[u8]) -> Result<()>;

    /// Delete a document and its update log.
    fn delete_doc(&self, name: &str) -> Result<()>;

    /// All document names in storage.
    fn list_docs(&self) -> Result<Vec<String>>;

    /// Append an incremental update; returns its log id.
    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> Result<i64>;

    /// Updates with log id greater than `since_id`, in order.
    fn get_updates_since(&self, name: &str, since_id: i64) -> Result<Vec<CrdtUpdate>>;

    /// The full update log for a document.
    fn get_all_updates(&self, name: &str) -> Result<Vec<CrdtUpdate>> {
        self.get_updates_since(name, 0)
    }

    /// Latest log id for a document, 0 when the log is empty.
    fn get_latest_update_id(&self, name: &str) -> Result<i64>;
}
