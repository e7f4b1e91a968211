//! Scion vault sync engine.
//!
//! Per-vault content-addressed storage with linear commit history, a
//! persistent file-identity store that survives renames, a line-oriented
//! three-way merge, and the CRDT documents behind real-time sync. The HTTP
//! and WebSocket surface lives in the `scion_sync_server` crate; this
//! crate is the whole write path beneath it.

pub mod crdt;
pub mod engine;
pub mod error;
pub mod identity;
pub mod manifest;
pub mod rename;
pub mod store;
pub mod vault;

pub use engine::batch::{BatchCoordinator, BatchReport, OpResult, WireOp};
pub use engine::{DeleteOutcome, OperationEngine, RenameOutcome, SyncOutcome, MAX_CONTENT_BYTES};
pub use error::{ErrorKind, Result, ScionError};
pub use identity::{IdentityRecord, IdentityStore};
pub use manifest::{ManifestEntry, RecoveryManifest};
pub use rename::{DetectionMethod, RenameDetection, RenameDetector};
pub use store::{sha256_hex, CommitInfo, ContentStore, MergeOutcome, TreeChange};
pub use vault::{
    is_reserved_path, validate_user_path, validate_vault_name, VaultPaths, MANIFEST_PATH,
};
