//! Cross-process and cross-task coordination for the watcher daemon.
//!
//! [`InventoryLock`] keeps a second convoy process from writing the same
//! inventory store. [`InFlight`] keeps a watcher instance down to one poll
//! at a time. The Ctrl-C handler turns the first interrupt into a graceful
//! stop of all watchers and the second into an immediate exit.

use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Exclusive claim on an inventory store. The owning pid is written into
/// the lock file so other processes can report who holds it.
#[derive(Debug)]
pub struct InventoryLock {
    file: File,
}

impl InventoryLock {
    fn open(lock_path: &Path) -> Result<File, CoreError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?)
    }

    fn owned(mut file: File) -> Result<Self, CoreError> {
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(Self { file })
    }

    /// Wait until the store is free, then claim it.
    pub fn claim(lock_path: &Path) -> Result<Self, CoreError> {
        let file = Self::open(lock_path)?;
        file.lock_exclusive()
            .map_err(|e| CoreError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, e)))?;
        Self::owned(file)
    }

    /// Claim the store, or `None` when another process holds it.
    pub fn try_claim(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        let file = Self::open(lock_path)?;
        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }
        Self::owned(file).map(Some)
    }

    /// Pid recorded by the last process that claimed the store.
    pub fn holder(lock_path: &Path) -> Option<u32> {
        let mut raw = String::new();
        File::open(lock_path).ok()?.read_to_string(&mut raw).ok()?;
        raw.trim().parse().ok()
    }
}

impl Drop for InventoryLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
    }
}

static STOP_WATCHERS: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C: ask the daemon to deregister its watchers. Second: exit.
pub fn install_signal_handler() {
    let installed = ctrlc::set_handler(|| {
        if STOP_WATCHERS.swap(true, Ordering::SeqCst) {
            std::process::exit(1);
        }
        eprintln!("\nstopping watchers (Ctrl-C again to abort running polls)");
    });
    if let Err(e) = installed {
        warn!("Ctrl-C handler not installed: {e}");
    }
}

pub fn shutdown_requested() -> bool {
    STOP_WATCHERS.load(Ordering::SeqCst)
}

/// Per-instance "a poll is running" flag.
#[derive(Debug, Default, Clone)]
pub struct InFlight(Arc<AtomicBool>);

impl InFlight {
    /// Claim the flag. `None` when a poll is already running.
    pub fn try_begin(&self) -> Option<PollGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PollGuard(Arc::clone(&self.0)))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Clears the in-flight flag when dropped. Moved into the blocking task so
/// the flag outlives a timed-out tick until the work really ends.
#[derive(Debug)]
pub struct PollGuard(Arc<AtomicBool>);

impl Drop for PollGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
