use crate::layout::StoreLayout;
use crate::{fsync_dir, validate_key, ContainerRepository, StoreError};
use convoy_schema::{ContainerUuid, ManagedContainer, WatcherName};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

/// On-disk form of one row.
#[derive(Debug, Serialize, Deserialize)]
struct StoredContainer {
    container: ManagedContainer,
    /// blake3 over the compact JSON of `container`.
    checksum: String,
}

fn checksum_of(container: &ManagedContainer) -> Result<String, StoreError> {
    let json = serde_json::to_string(container)?;
    Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
}

/// Result of a full inventory scan.
#[derive(Debug, Default, Serialize)]
pub struct InventoryReport {
    pub checked: usize,
    pub failed: Vec<(String, String)>,
}

/// File-backed [`ContainerRepository`].
///
/// Every row lives in its own file and is replaced atomically (temp file,
/// fsync, rename, directory fsync). A row whose checksum does not verify is
/// moved aside on the next watcher scan so reconciliation can recreate it.
pub struct InventoryStore {
    layout: StoreLayout,
}

impl InventoryStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    /// Open a store rooted at `root`, creating it on first use.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let layout = StoreLayout::new(root);
        layout.initialize()?;
        Ok(Self::new(layout))
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn read_row(path: &Path) -> Result<ManagedContainer, StoreError> {
        let content = fs::read_to_string(path)?;
        let stored: StoredContainer = serde_json::from_str(&content)?;
        let actual = checksum_of(&stored.container)?;
        if actual != stored.checksum {
            return Err(StoreError::IntegrityFailure {
                uuid: stored.container.uuid.to_string(),
                expected: stored.checksum,
                actual,
            });
        }
        Ok(stored.container)
    }

    fn row_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if entry.file_type()?.is_file() && !name.starts_with('.') && name.ends_with(".json")
            {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    fn watcher_dirs(&self) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.layout.inventory_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    fn locate(&self, uuid: &ContainerUuid) -> Result<Option<PathBuf>, StoreError> {
        validate_key(uuid)?;
        let file = format!("{uuid}.json");
        for dir in self.watcher_dirs()? {
            let candidate = dir.join(&file);
            if candidate.is_file() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    fn quarantine(path: &Path) {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return;
        };
        let target = path.with_file_name(format!(".{name}.corrupt"));
        if let Err(e) = fs::rename(path, &target) {
            warn!("failed to move corrupted row {} aside: {e}", path.display());
        }
    }

    /// Verify every row without modifying anything.
    pub fn verify(&self) -> Result<InventoryReport, StoreError> {
        let mut report = InventoryReport::default();
        for dir in self.watcher_dirs()? {
            for path in Self::row_files(&dir)? {
                report.checked += 1;
                if let Err(e) = Self::read_row(&path) {
                    report
                        .failed
                        .push((path.display().to_string(), e.to_string()));
                }
            }
        }
        Ok(report)
    }
}

impl ContainerRepository for InventoryStore {
    fn find_by_watcher(&self, watcher: &WatcherName) -> Result<Vec<ManagedContainer>, StoreError> {
        validate_key(watcher)?;
        let mut rows = Vec::new();
        for path in Self::row_files(&self.layout.watcher_dir(watcher))? {
            match Self::read_row(&path) {
                Ok(row) => rows.push(row),
                Err(StoreError::Io(e)) => return Err(StoreError::Io(e)),
                Err(e) => {
                    warn!("quarantining corrupted inventory row {}: {e}", path.display());
                    Self::quarantine(&path);
                }
            }
        }
        Ok(rows)
    }

    fn find_by_uuid(&self, uuid: &ContainerUuid) -> Result<Option<ManagedContainer>, StoreError> {
        match self.locate(uuid)? {
            Some(path) => Self::read_row(&path).map(Some),
            None => Ok(None),
        }
    }

    fn update_or_create(&self, container: &ManagedContainer) -> Result<(), StoreError> {
        validate_key(&container.watcher)?;
        validate_key(&container.uuid)?;

        let dir = self.layout.watcher_dir(&container.watcher);
        fs::create_dir_all(&dir)?;
        let dest = self
            .layout
            .container_path(&container.watcher, &container.uuid);

        let stored = StoredContainer {
            container: container.clone(),
            checksum: checksum_of(container)?,
        };
        let content = serde_json::to_string_pretty(&stored)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok(())
    }

    fn delete_by_uuid(&self, uuid: &ContainerUuid) -> Result<(), StoreError> {
        if let Some(path) = self.locate(uuid)? {
            fs::remove_file(&path)?;
            if let Some(dir) = path.parent() {
                fsync_dir(dir)?;
            }
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<ManagedContainer>, StoreError> {
        let mut rows = Vec::new();
        for dir in self.watcher_dirs()? {
            for path in Self::row_files(&dir)? {
                match Self::read_row(&path) {
                    Ok(row) => rows.push(row),
                    Err(e) => warn!("skipping corrupted inventory row {}: {e}", path.display()),
                }
            }
        }
        rows.sort_by(|a, b| (&a.watcher, &a.name).cmp(&(&b.watcher, &b.name)));
        Ok(rows)
    }
}
