//! Replicated data types for real-time sync.
//!
//! Two documents per vault drive device convergence: a [`NoteDoc`] per
//! file (collaborative text) and one [`StructureDoc`] (the file-tree map
//! with tombstone deletes). Both persist through [`CrdtStorage`].

pub mod applier;
pub mod memory_storage;
pub mod note_doc;
pub mod sqlite_storage;
pub mod storage;
pub mod structure_doc;
pub mod types;

pub use applier::{AppliedText, Applier};
pub use memory_storage::MemoryStorage;
pub use note_doc::{note_doc_name, NoteDoc};
pub use sqlite_storage::SqliteStorage;
pub use storage::CrdtStorage;
pub use structure_doc::{StructureDoc, STRUCTURE_DOC_NAME};
pub use types::{CrdtUpdate, StructureEntry, UpdateOrigin};
