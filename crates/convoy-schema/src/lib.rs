//! Data model for the Convoy discovery and reconciliation engine.
//!
//! This crate defines the types shared by every other layer: identifier
//! newtypes (`DeviceUuid`, `ContainerUuid`, `ProviderId`, `WatcherName`),
//! the read-only `Device` and `DeviceAuth` records, vault-wrapped secrets
//! (`VaultSecret`, `Vault`), the persisted `ManagedContainer` row, image
//! reference parsing (`ImageRef`), and polling interval expressions.

pub mod container;
pub mod device;
pub mod image;
pub mod interval;
pub mod secret;
pub mod types;

pub use container::{
    ContainerAction, ContainerKind, ImageUpdate, ManagedContainer, ObservedContainer,
    ResourceSnapshot,
};
pub use device::{
    Capabilities, Device, DeviceAuth, DockerAuth, DockerMethod, DockerWatchConfig, ProxmoxAuth,
    ProxmoxCredentials, ProxmoxMethod, ProxmoxWatchConfig, SshAuth, SshAuthType, WatcherKind,
};
pub use image::ImageRef;
pub use interval::{parse_interval, DEFAULT_INTERVAL, MAX_INTERVAL};
pub use secret::{PassthroughVault, Secret, Vault, VaultError, VaultSecret};
pub use types::{ContainerUuid, DeviceUuid, ProviderId, WatcherKey, WatcherName};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImage { reference: String, reason: String },
    #[error("invalid interval expression '{expr}': {reason}")]
    InvalidInterval { expr: String, reason: String },
    #[error("unknown container action: {0}")]
    UnknownAction(String),
    #[error("invalid watcher key: {0}")]
    InvalidKey(String),
}
