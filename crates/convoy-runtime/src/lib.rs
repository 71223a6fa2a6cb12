//! Runtime-facing layer of Convoy.
//!
//! This crate turns device records into live connections and live
//! connections into container listings: the `ConnectionResolver` validates
//! and decrypts device credentials and opens direct, TLS, Unix-socket or
//! SSH-tunneled transports; `ProviderWatcher` implementations for Docker and
//! Proxmox list remote containers and VMs and execute lifecycle actions.
//! A scriptable `MockWatcher` and host prerequisite checks live here too.

pub mod connection;
pub mod directory;
pub mod docker;
pub mod http;
pub mod mock;
pub mod prereq;
pub mod proxmox;
pub mod tunnel;
pub mod watcher;

pub use connection::{ConnectionOptions, ConnectionPlan, ConnectionResolver};
pub use directory::{DeviceDirectory, StaticDirectory};
pub use http::ApiClient;
pub use mock::MockWatcher;
pub use prereq::{check_tunnel_prereqs, command_exists, format_missing, MissingPrereq};
pub use watcher::{
    select_watcher, ChangeHook, Listing, ProviderWatcher, ProviderWatcherFactory, ScopeFailure,
    WatcherContext, WatcherFactory,
};

use convoy_schema::{ContainerAction, VaultError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Missing or malformed auth material. Retried on the next tick.
    #[error("credential error: {0}")]
    Credential(String),
    /// Timeout, refused connection or broken transport. Retried on the next tick.
    #[error("connectivity error: {0}")]
    Connectivity(String),
    #[error("action '{action}' is not supported for {kind}")]
    UnsupportedAction {
        action: ContainerAction,
        kind: String,
    },
    /// The runtime answered, but not with what we asked for.
    #[error("provider error: {0}")]
    Provider(String),
    #[error("watcher '{0}' has no connection")]
    NotConnected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Errors that mean the transport is gone and the handle should be
    /// rebuilt before the next attempt.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, RuntimeError::Connectivity(_) | RuntimeError::Io(_))
    }
}
