//! Persisted container inventory for Convoy.
//!
//! This crate provides the storage layer behind reconciliation: the
//! `ContainerRepository` trait, a file-backed `InventoryStore` (one JSON
//! document per container with an embedded blake3 checksum and atomic
//! writes), an in-memory `MemoryRepository`, and `StoreLayout` for the
//! directory structure and format version marker.

pub mod inventory;
pub mod layout;
pub mod memory;

pub use inventory::InventoryStore;
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use memory::MemoryRepository;

use convoy_schema::{ContainerUuid, ManagedContainer, WatcherName};
use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for container '{uuid}': expected {expected}, got {actual}")]
    IntegrityFailure {
        uuid: String,
        expected: String,
        actual: String,
    },
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid store key: {0}")]
    InvalidKey(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Access to persisted `ManagedContainer` rows.
///
/// Writes are always scoped by watcher name, so implementations only need
/// to serialize writes to the same watcher.
pub trait ContainerRepository: Send + Sync {
    fn find_by_watcher(&self, watcher: &WatcherName) -> Result<Vec<ManagedContainer>, StoreError>;

    fn find_by_uuid(&self, uuid: &ContainerUuid) -> Result<Option<ManagedContainer>, StoreError>;

    /// Insert the row, or replace the row with the same uuid.
    fn update_or_create(&self, container: &ManagedContainer) -> Result<(), StoreError>;

    /// Remove a row. Removing an unknown uuid is not an error.
    fn delete_by_uuid(&self, uuid: &ContainerUuid) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<ManagedContainer>, StoreError>;
}

/// Reject names that would escape the inventory directory.
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.len() > 128 {
        return Err(StoreError::InvalidKey(format!(
            "'{key}' must be 1-128 characters"
        )));
    }
    if key.starts_with('.')
        || !key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
    {
        return Err(StoreError::InvalidKey(format!(
            "'{key}' must match [a-zA-Z0-9_.-] and not start with '.'"
        )));
    }
    Ok(())
}
