//! Per-file collaborative text CRDT.
//!
//! Each `(vault, file_id)` pair gets one `NoteDoc` wrapping a yrs [`Doc`]
//! with a single Y.Text. Keying by file id rather than path means a rename
//! never touches the text history.

use std::sync::Arc;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use super::storage::CrdtStorage;
use super::types::UpdateOrigin;
use crate::error::{Result, ScionError};

/// Name of the Y.Text holding the file content.
const CONTENT_TEXT_NAME: &str = "content";

/// Storage key for a file's text document.
pub fn note_doc_name(file_id: &str) -> String {
    format!("note/{file_id}")
}

/// A CRDT document for one file's text.
pub struct NoteDoc {
    doc: Doc,
    content: TextRef,
    storage: Arc<dyn CrdtStorage>,
    doc_name: String,
}

impl NoteDoc {
    /// Create an empty document for `file_id`.
    pub fn new(storage: Arc<dyn CrdtStorage>, file_id: &str) -> Self {
        let doc = Doc::new();
        let content = doc.get_or_insert_text(CONTENT_TEXT_NAME);
        Self {
            doc,
            content,
            storage,
            doc_name: note_doc_name(file_id),
        }
    }

    /// Load a document from storage, replaying the snapshot plus any
    /// incremental updates; a missing document loads empty.
    pub fn load(storage: Arc<dyn CrdtStorage>, file_id: &str) -> Result<Self> {
        let doc_name = note_doc_name(file_id);
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            if let Some(state) = storage.load_doc(&doc_name)? {
                let update = Update::decode_v1(&state)
                    .map_err(|e| ScionError::Crdt(format!("decode snapshot: {e}")))?;
                txn.apply_update(update)
                    .map_err(|e| ScionError::Crdt(format!("apply snapshot: {e}")))?;
            }
            for stored in storage.get_all_updates(&doc_name)? {
                if let Ok(update) = Update::decode_v1(&stored.data) {
                    let _ = txn.apply_update(update);
                }
            }
        }
        let content = doc.get_or_insert_text(CONTENT_TEXT_NAME);
        Ok(Self {
            doc,
            content,
            storage,
            doc_name,
        })
    }

    pub fn doc_name(&self) -> &str {
        &self.doc_name
    }

    /// Materialize the full text state.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.content.get_string(&txn)
    }

    /// Set the text using minimal diff operations so unchanged regions keep
    /// their operation ids and still merge with concurrent edits.
    pub fn set_text(&self, new_text: &str) -> Result<()> {
        let (current, sv_before) = {
            let txn = self.doc.transact();
            (self.content.get_string(&txn), txn.state_vector())
        };
        if current == new_text {
            return Ok(());
        }

        let current_chars: Vec<char> = current.chars().collect();
        let new_chars: Vec<char> = new_text.chars().collect();

        let common_prefix = current_chars
            .iter()
            .zip(new_chars.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let remaining_current = current_chars.len() - common_prefix;
        let remaining_new = new_chars.len() - common_prefix;
        let common_suffix = current_chars[common_prefix..]
            .iter()
            .rev()
            .zip(new_chars[common_prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .take(remaining_current.min(remaining_new))
            .count();

        let delete_len = current_chars.len() - common_suffix - common_prefix;
        let insert_end = new_chars.len() - common_suffix;

        {
            let mut txn = self.doc.transact_mut();
            if delete_len > 0 {
                self.content
                    .remove_range(&mut txn, common_prefix as u32, delete_len as u32);
            }
            if insert_end > common_prefix {
                let insert_text: String =
                    new_chars[common_prefix..insert_end].iter().collect();
                self.content
                    .insert(&mut txn, common_prefix as u32, &insert_text);
            }
        }

        self.record_update(&sv_before)
    }

    fn record_update(&self, sv_before: &StateVector) -> Result<()> {
        let update = {
            let txn = self.doc.transact();
            txn.encode_state_as_update_v1(sv_before)
        };
        if !update.is_empty() {
            self.storage
                .append_update(&self.doc_name, &update, UpdateOrigin::Local)?;
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
        self.storage.append_update(&self.doc_name, update, origin)
    }

    /// Persist the compacted full state.
    pub fn save(&self) -> Result<()> {
        let state = self.encode_state_as_update();
        self.storage.save_doc(&self.doc_name, &state)
    }
}
