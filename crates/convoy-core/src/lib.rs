//! Watcher engine and reconciliation for Convoy.
//!
//! This crate ties the runtime watchers, the registry chain and the
//! inventory store together into the `WatcherEngine`: one `WatcherInstance`
//! per device capability, each polling on its own timer, each poll
//! reconciled against the persisted rows of its watcher. It also provides
//! the watcher lifecycle state machine, change events, the store lock and
//! the TOML fleet configuration used by the CLI.

pub mod concurrency;
pub mod engine;
pub mod events;
pub mod fleet;
pub mod instance;
pub mod lifecycle;
pub mod reconcile;
pub mod registries;
pub mod vault;

pub use concurrency::{install_signal_handler, shutdown_requested, InFlight, InventoryLock, PollGuard};
pub use engine::{
    EngineOptions, PollOutcome, RegistrationSummary, WatcherEngine, DEFAULT_CHANGE_DEBOUNCE,
};
pub use events::{
    BroadcastSink, ChangeEvent, ChangeKind, EventSink, LogSink, NullSink, RecordingSink,
    WatchEvent,
};
pub use fleet::{DeviceEntry, EngineSection, FleetConfig, VaultSection};
pub use instance::{PollReport, WatcherInstance, WatcherSnapshot};
pub use lifecycle::{validate_transition, WatcherState};
pub use reconcile::{mark_unreachable, reconcile, ReconcileReport, UNREACHABLE_STATUS};
pub use registries::{EnrichReport, RegistrySet};
pub use vault::CommandVault;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("store error: {0}")]
    Store(#[from] convoy_store::StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] convoy_runtime::RuntimeError),
    #[error("registry error: {0}")]
    Registry(#[from] convoy_remote::RegistryError),
    #[error("schema error: {0}")]
    Schema(#[from] convoy_schema::SchemaError),
    /// A repository write failed mid-reconciliation. Rows written before
    /// the failure stay; no deletion was performed.
    #[error("reconciliation of '{watcher}' aborted after {applied} write(s): {source}")]
    Reconciliation {
        watcher: String,
        applied: usize,
        source: convoy_store::StoreError,
    },
    #[error("watcher not found: {0}")]
    WatcherNotFound(String),
    #[error("container not found: {0}")]
    ContainerNotFound(String),
    #[error("watcher '{0}' is stopped")]
    WatcherStopped(String),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("poll of '{key}' timed out after {secs}s")]
    PollTimeout { key: String, secs: u64 },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("worker task failed: {0}")]
    Task(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
