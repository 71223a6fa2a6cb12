use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of a Convoy store.
///
/// ```text
/// {root}/version
/// {root}/.lock
/// {root}/inventory/{watcher}/{container_uuid}.json
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn inventory_dir(&self) -> PathBuf {
        self.root.join("inventory")
    }

    #[inline]
    pub fn watcher_dir(&self, watcher: &str) -> PathBuf {
        self.inventory_dir().join(watcher)
    }

    #[inline]
    pub fn container_path(&self, watcher: &str, uuid: &str) -> PathBuf {
        self.watcher_dir(watcher).join(format!("{uuid}.json"))
    }

    /// Held by a running daemon so two processes never reconcile the same store.
    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn is_initialized(&self) -> bool {
        self.root.join(VERSION_FILE).exists()
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.inventory_dir())?;

        let version_path = self.root.join(VERSION_FILE);
        if version_path.exists() {
            return self.verify_version();
        }

        let ver = StoreVersion {
            format_version: STORE_FORMAT_VERSION,
        };
        let content = serde_json::to_string_pretty(&ver)?;
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&version_path)
            .map_err(|e| StoreError::Io(e.error))?;
        crate::fsync_dir(&self.root)?;
        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.root.join(VERSION_FILE))?;
        let ver: StoreVersion = serde_json::from_str(&content)?;
        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
