use thiserror::Error;

/// Unified error type for vault sync operations.
#[derive(Debug, Error)]
pub enum ScionError {
    #[error("invalid vault name '{0}'")]
    InvalidVaultName(String),

    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("{0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("crdt error: {0}")]
    Crdt(String),

    #[error("repository error: {0}")]
    Git(#[from] git2::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Coarse classification used by the API surface to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Backend,
}

impl ScionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScionError::InvalidVaultName(_)
            | ScionError::InvalidPath { .. }
            | ScionError::Validation(_) => ErrorKind::Validation,
            ScionError::NotFound(_) => ErrorKind::NotFound,
            ScionError::Conflict(_) => ErrorKind::Conflict,
            ScionError::Crdt(_)
            | ScionError::Git(_)
            | ScionError::Database(_)
            | ScionError::Io(_)
            | ScionError::Serde(_) => ErrorKind::Backend,
        }
    }
}

/// Result type alias for vault sync operations.
pub type Result<T> = std::result::Result<T, ScionError>;
