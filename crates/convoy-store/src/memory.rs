use crate::{ContainerRepository, StoreError};
use convoy_schema::{ContainerUuid, ManagedContainer, WatcherName};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// In-memory repository with write accounting and failure injection.
#[derive(Default)]
pub struct MemoryRepository {
    rows: Mutex<BTreeMap<ContainerUuid, ManagedContainer>>,
    writes: AtomicUsize,
    /// Number of further writes that succeed before every write fails.
    fail_after: Mutex<Option<usize>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total successful `update_or_create` and `delete_by_uuid` calls.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Let `n` more writes succeed, then fail the rest. `None` clears it.
    pub fn fail_writes_after(&self, n: Option<usize>) {
        if let Ok(mut slot) = self.fail_after.lock() {
            *slot = n;
        }
    }

    fn rows(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<ContainerUuid, ManagedContainer>>, StoreError>
    {
        self.rows
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("mutex poisoned: {e}")))
    }

    fn admit_write(&self) -> Result<(), StoreError> {
        let mut slot = self
            .fail_after
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("mutex poisoned: {e}")))?;
        match slot.as_mut() {
            Some(0) => Err(StoreError::Unavailable("injected write failure".to_owned())),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl ContainerRepository for MemoryRepository {
    fn find_by_watcher(&self, watcher: &WatcherName) -> Result<Vec<ManagedContainer>, StoreError> {
        Ok(self
            .rows()?
            .values()
            .filter(|c| c.watcher == *watcher)
            .cloned()
            .collect())
    }

    fn find_by_uuid(&self, uuid: &ContainerUuid) -> Result<Option<ManagedContainer>, StoreError> {
        Ok(self.rows()?.get(uuid).cloned())
    }

    fn update_or_create(&self, container: &ManagedContainer) -> Result<(), StoreError> {
        self.admit_write()?;
        self.rows()?
            .insert(container.uuid.clone(), container.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete_by_uuid(&self, uuid: &ContainerUuid) -> Result<(), StoreError> {
        self.admit_write()?;
        self.rows()?.remove(uuid);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn list(&self) -> Result<Vec<ManagedContainer>, StoreError> {
        Ok(self.rows()?.values().cloned().collect())
    }
}
