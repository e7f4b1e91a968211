//! In-memory CRDT storage for tests.

use std::collections::HashMap;
use std::sync::RwLock;

use super::storage::CrdtStorage;
use super::types::{CrdtUpdate, UpdateOrigin};
use crate::error::Result;

#[derive(Debug, Clone)]
struct StoredUpdate {
    id: i64,
    data: Vec<u8>,
    timestamp: i64,
    origin: UpdateOrigin,
}

/// HashMap-backed storage; data is lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    docs: RwLock<HashMap<String, Vec<u8>>>,
    updates: RwLock<HashMap<String, Vec<StoredUpdate>>>,
    next_id: RwLock<i64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_update_id(&self) -> i64 {
        let mut id = self.next_id.write().unwrap_or_else(|e| e.into_inner());
        *id += 1;
        *id
    }
}

impl CrdtStorage for MemoryStorage {
    fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        Ok(docs.get(name).cloned())
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> Result<()> {
        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        docs.insert(name.to_string(), state.to_vec());
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> Result<()> {
        self.docs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        self.updates
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        Ok(())
    }

    fn list_docs(&self) -> Result<Vec<String>> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        Ok(docs.keys().cloned().collect())
    }

    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> Result<i64> {
        let id = self.next_update_id();
        let stored = StoredUpdate {
            id,
            data: update.to_vec(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            origin,
        };
        self.updates
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_default()
            .push(stored);
        Ok(id)
    }

    fn get_updates_since(&self, name: &str, since_id: i64) -> Result<Vec<CrdtUpdate>> {
        let updates = self.updates.read().unwrap_or_else(|e| e.into_inner());
        let doc_updates = updates.get(name).map(|u| u.as_slice()).unwrap_or(&[]);
        Ok(doc_updates
            .iter()
            .filter(|u| u.id > since_id)
            .map(|u| CrdtUpdate {
                update_id: u.id,
                doc_name: name.to_string(),
                data: u.data.clone(),
                timestamp: u.timestamp,
                origin: u.origin,
            })
            .collect())
    }

    fn get_latest_update_id(&self, name: &str) -> Result<i64> {
        let updates = self.updates.read().unwrap_or_else(|e| e.into_inner());
        Ok(updates
            .get(name)
            .and_then(|u| u.last())
            .map(|u| u.id)
            .unwrap_or(0))
    }
}
