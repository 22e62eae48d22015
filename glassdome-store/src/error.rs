use thiserror::Error;

/// Store-level error taxonomy. Mirrors mvirt-api's `StoreError`, trimmed
/// to what a single-process in-memory store can actually raise (no
/// `NotLeader` - there is no Raft layer here).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("duplicate id: {0}")]
    DuplicateId(String),
    #[error("version mismatch: expected {expected}, actual {actual}")]
    VersionMismatch { expected: u64, actual: u64 },
    #[error("internal store error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
