//! Process-scoped registry of per-vault resources.
//!
//! Every vault accessed over the API gets one [`VaultHandle`]: a shared
//! identity store, lazily opened CRDT documents, and the writer half
//! (engine + CRDT space) behind an async mutex. That mutex is the vault
//! writer lock of the concurrency model: everything that mutates the
//! content store, the identity store, the recovery manifest, or a CRDT
//! goes through it. Read endpoints open their own short-lived content
//! store view and may run concurrently with a writer.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::info;

use scion_core::crdt::{CrdtStorage, NoteDoc, SqliteStorage, StructureDoc, StructureEntry};
use scion_core::{
    validate_vault_name, ContentStore, IdentityStore, OperationEngine, Result, VaultPaths,
};

/// Lazily opened CRDT documents for one vault.
pub struct CrdtSpace {
    storage: Arc<SqliteStorage>,
    structure: StructureDoc,
    notes: HashMap<String, NoteDoc>,
}

impl CrdtSpace {
    fn open(db_path: &std::path::Path) -> Result<Self> {
        let storage = Arc::new(SqliteStorage::open(db_path)?);
        let structure = StructureDoc::load(Arc::clone(&storage) as Arc<dyn CrdtStorage>)?;
        Ok(Self {
            storage,
            structure,
            notes: HashMap::new(),
        })
    }

    pub fn structure(&self) -> &StructureDoc {
        &self.structure
    }

    /// The text document for a file, loading it from storage on first use.
    pub fn note(&mut self, file_id: &str) -> Result<&NoteDoc> {
        match self.notes.entry(file_id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let doc = NoteDoc::load(
                    Arc::clone(&self.storage) as Arc<dyn CrdtStorage>,
                    file_id,
                )?;
                Ok(entry.insert(doc))
            }
        }
    }

    /// Mirror a committed content change into the file's text CRDT.
    /// Returns the incremental update for fan-out when the text changed.
    pub fn record_content(&mut self, file_id: &str, text: &str) -> Result<Option<Vec<u8>>> {
        let note = self.note(file_id)?;
        if note.text() == text {
            return Ok(None);
        }
        let sv = note.encode_state_vector();
        note.set_text(text)?;
        Ok(Some(note.encode_diff(&sv)?))
    }

    /// Mirror a committed identity change into the structure CRDT.
    /// Returns the incremental update for fan-out when the entry changed.
    pub fn record_structure(
        &mut self,
        file_id: &str,
        path: &str,
        hash: Option<&str>,
        deleted: bool,
    ) -> Result<Option<Vec<u8>>> {
        let now = chrono::Utc::now().timestamp();
        let current = self.structure.get_entry(file_id);
        if let Some(current) = &current {
            let hash_current = hash.is_none() || current.hash.as_deref() == hash;
            if current.path == path && current.deleted == deleted && hash_current {
                return Ok(None);
            }
        }

        let mut entry = current.unwrap_or_else(|| StructureEntry::file(path, now));
        entry.path = path.to_string();
        if let Some(hash) = hash {
            entry.hash = Some(hash.to_string());
        }
        entry.deleted = deleted;
        entry.modified_at = now;

        let sv = self.structure.encode_state_vector();
        self.structure.set_entry(file_id, &entry)?;
        Ok(Some(self.structure.encode_diff(&sv)?))
    }

    /// Full or incremental state of a file's text document, for answering
    /// a sync request.
    pub fn note_state(&mut self, file_id: &str, peer_sv: Option<&[u8]>) -> Result<Vec<u8>> {
        let note = self.note(file_id)?;
        match peer_sv {
            Some(sv) => note.encode_diff(sv),
            None => Ok(note.encode_state_as_update()),
        }
    }

    /// Full or incremental state of the structure document.
    pub fn structure_state(&self, peer_sv: Option<&[u8]>) -> Result<Vec<u8>> {
        match peer_sv {
            Some(sv) => self.structure.encode_diff(sv),
            None => Ok(self.structure.encode_state_as_update()),
        }
    }
}

/// The writer half of a vault, guarded by the vault writer lock.
pub struct VaultWriter {
    pub engine: OperationEngine,
    pub crdt: CrdtSpace,
}

/// Shared per-vault resources.
pub struct VaultHandle {
    pub name: String,
    pub identity: Arc<IdentityStore>,
    pub writer: Mutex<VaultWriter>,
    paths: VaultPaths,
}

impl std::fmt::Debug for VaultHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultHandle").field("name", &self.name).finish()
    }
}

impl VaultHandle {
    /// A fresh read-only view of the content store. Cheap to open; reads
    /// observe either the pre- or post-state of an in-flight write.
    pub fn read_store(&self) -> Result<ContentStore> {
        ContentStore::open(self.paths.root(), &self.name)
    }
}

/// Registry of vault handles, keyed by validated vault name.
pub struct VaultRegistry {
    paths: VaultPaths,
    vaults: RwLock<HashMap<String, Arc<VaultHandle>>>,
}

impl VaultRegistry {
    pub fn new(paths: VaultPaths) -> Self {
        Self {
            paths,
            vaults: RwLock::new(HashMap::new()),
        }
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    /// Get or lazily create the handle for a vault. Validation happens
    /// before any disk access: invalid names never produce state.
    pub async fn get_or_create(&self, vault: &str) -> Result<Arc<VaultHandle>> {
        validate_vault_name(vault)?;

        {
            let vaults = self.vaults.read().await;
            if let Some(handle) = vaults.get(vault) {
                return Ok(Arc::clone(handle));
            }
        }

        let mut vaults = self.vaults.write().await;
        // Double-check after acquiring the write lock.
        if let Some(handle) = vaults.get(vault) {
            return Ok(Arc::clone(handle));
        }

        let store = ContentStore::init(self.paths.root(), vault)?;
        let identity = Arc::new(IdentityStore::open(
            &self.paths.metadata_db(vault),
            vault,
        )?);
        let crdt = CrdtSpace::open(&self.paths.crdt_db(vault))?;
        let engine = OperationEngine::new(store, Arc::clone(&identity));

        let handle = Arc::new(VaultHandle {
            name: vault.to_string(),
            identity,
            writer: Mutex::new(VaultWriter { engine, crdt }),
            paths: self.paths.clone(),
        });
        vaults.insert(vault.to_string(), Arc::clone(&handle));
        info!(vault, "opened vault");

        Ok(handle)
    }
}
