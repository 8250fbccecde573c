//!
//! docmirror storage module
//! ------------------------
//! The storage layer emulates a hierarchical filesystem on top of a flat, ordered
//! key-value store. Every uploaded document has exactly one metadata record keyed by
//! its logical path (`a/b/file.pdf`); directories are never stored, they are derived
//! from the keys that share a `dir/` prefix.
//!
//! Layers, leaf-first:
//! - `physical`: byte content addressed by logical path (local directory or memory).
//! - `meta`: transactional ordered KV store with a CRC-framed write-ahead log.
//! - `tree`: directory semantics (stat/list) computed by prefix scans over `meta`.
//! - `record`: the `FileRecord` entity and its pending -> confirmed transition.
//! - `file_storage`: the `FileStorage` facade composing all of the above.

use thiserror::Error;

pub mod paths;
pub mod physical;
pub mod meta;
pub mod tree;
pub mod record;
pub mod file_storage;

pub use file_storage::{Confirmation, FileStorage};
pub use meta::{MetaSettings, MetaStore};
pub use paths::{clean_logical_path, join_logical, normalize_nfc, validate_logical_path};
pub use physical::{LocalDir, MemoryStore, PhysicalInfo, PhysicalStore};
pub use record::{humanize_bytes, FileRecord, DIR_PLACEHOLDER};
pub use tree::{Listing, PathStat};

/// Failures raised by either backing store (metadata log or physical content).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("snapshot codec error: {0}")]
    Snapshot(#[from] bincode::Error),
    #[error("corrupt metadata log: {0}")]
    CorruptLog(String),
}

/// Error taxonomy surfaced by the `FileStorage` facade.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FsError {
    /// Map a physical-store I/O error for `path` onto the taxonomy.
    pub fn from_io(path: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => FsError::PermissionDenied(path.to_string()),
            _ => FsError::Store(StoreError::Io(err)),
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, FsError::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, FsError::AlreadyExists(_)) }
}

impl From<serde_json::Error> for FsError {
    fn from(err: serde_json::Error) -> Self {
        FsError::Store(StoreError::Codec(err))
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_onto_taxonomy() {
        let nf = FsError::from_io("a/b", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(nf.is_not_found());
        let pd = FsError::from_io("a/b", std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(matches!(pd, FsError::PermissionDenied(p) if p == "a/b"));
        let other = FsError::from_io("a/b", std::io::Error::other("disk on fire"));
        assert!(matches!(other, FsError::Store(StoreError::Io(_))));
    }
}
