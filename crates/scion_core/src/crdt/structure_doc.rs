//! Per-vault structure CRDT.
//!
//! One replicated map per vault, keyed by `file_id`, holding each file's
//! [`StructureEntry`]. Deletion is tombstone-based: entries are marked
//! deleted, never removed, so concurrent edits on other devices cannot
//! resurrect them.

use std::sync::Arc;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Map, MapRef, ReadTxn, StateVector, Transact, Update};

use super::storage::CrdtStorage;
use super::types::{StructureEntry, UpdateOrigin};
use crate::error::{Result, ScionError};

/// Name of the Y.Map holding file entries.
const FILES_MAP_NAME: &str = "files";

/// Storage key for the vault structure document.
pub const STRUCTURE_DOC_NAME: &str = "structure";

/// The replicated file-tree map for one vault.
pub struct StructureDoc {
    doc: Doc,
    files: MapRef,
    storage: Arc<dyn CrdtStorage>,
}

impl StructureDoc {
    /// Create an empty structure document.
    pub fn new(storage: Arc<dyn CrdtStorage>) -> Self {
        let doc = Doc::new();
        let files = doc.get_or_insert_map(FILES_MAP_NAME);
        Self { doc, files, storage }
    }

    /// Load the structure document from storage; missing state loads empty.
    pub fn load(storage: Arc<dyn CrdtStorage>) -> Result<Self> {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            if let Some(state) = storage.load_doc(STRUCTURE_DOC_NAME)? {
                let update = Update::decode_v1(&state)
                    .map_err(|e| ScionError::Crdt(format!("decode snapshot: {e}")))?;
                txn.apply_update(update)
                    .map_err(|e| ScionError::Crdt(format!("apply snapshot: {e}")))?;
            }
            for stored in storage.get_all_updates(STRUCTURE_DOC_NAME)? {
                if let Ok(update) = Update::decode_v1(&stored.data) {
                    let _ = txn.apply_update(update);
                }
            }
        }
        let files = doc.get_or_insert_map(FILES_MAP_NAME);
        Ok(Self { doc, files, storage })
    }

    /// Entry for a file id, tombstones included.
    pub fn get_entry(&self, file_id: &str) -> Option<StructureEntry> {
        let txn = self.doc.transact();
        self.files.get(&txn, file_id).and_then(|value| {
            let json = value.to_string(&txn);
            serde_json::from_str(&json).ok()
        })
    }

    /// Insert or replace an entry, recording the change in the update log.
    pub fn set_entry(&self, file_id: &str, entry: &StructureEntry) -> Result<()> {
        let sv_before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.doc.transact_mut();
            let json = serde_json::to_string(entry)?;
            self.files.insert(&mut txn, file_id, json);
        }
        self.record_update(&sv_before)
    }

    /// Tombstone an entry. A no-op for unknown ids.
    pub fn mark_deleted(&self, file_id: &str, now: i64) -> Result<()> {
        if let Some(mut entry) = self.get_entry(file_id) {
            entry.mark_deleted(now);
            self.set_entry(file_id, &entry)?;
        }
        Ok(())
    }

    /// All entries, tombstones included.
    pub fn entries(&self) -> Vec<(String, StructureEntry)> {
        let txn = self.doc.transact();
        self.files
            .iter(&txn)
            .filter_map(|(key, value)| {
                let json = value.to_string(&txn);
                let entry: StructureEntry = serde_json::from_str(&json).ok()?;
                Some((key.to_string(), entry))
            })
            .collect()
    }

    /// Entries that are not tombstoned.
    pub fn active_entries(&self) -> Vec<(String, StructureEntry)> {
        self.entries()
            .into_iter()
            .filter(|(_, entry)| !entry.deleted)
            .collect()
    }

    pub fn len(&self) -> usize {
        let txn = self.doc.transact();
        self.files.len(&txn) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record_update(&self, sv_before: &StateVector) -> Result<()> {
        let update = {
            let txn = self.doc.transact();
            txn.encode_state_as_update_v1(sv_before)
        };
        if !update.is_empty() {
            self.storage
                .append_update(STRUCTURE_DOC_NAME, &update, UpdateOrigin::Local)?;
        }
        Ok(())
    }

    /// Encode the current state vector for a sync handshake.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the full document state as one update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode only what a peer with `remote_state_vector` is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| ScionError::Crdt(format!("decode state vector: {e}")))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply an update from a peer and persist it to the update log.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<i64> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| ScionError::Crdt(format!("decode update: {e}")))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| ScionError::Crdt(format!("apply update: {e}")))?;
        }
        self.storage
            .append_update(STRUCTURE_DOC_NAME, update, origin)
    }

    /// Persist the compacted full state.
    pub fn save(&self) -> Result<()> {
        let state = self.encode_state_as_update();
        self.storage.save_doc(STRUCTURE_DOC_NAME, &state)
    }
}
