use crate::types::{ContainerUuid, DeviceUuid, ProviderId, WatcherName};
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerKind {
    Container,
    VirtualMachine,
    LightweightContainer,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKind::Container => write!(f, "container"),
            ContainerKind::VirtualMachine => write!(f, "virtual-machine"),
            ContainerKind::LightweightContainer => write!(f, "lightweight-container"),
        }
    }
}

/// Point-in-time resource usage reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
}

/// Newest image a registry offers for a container's reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUpdate {
    /// Highest newer version tag, or the running tag when only the digest
    /// is compared.
    pub latest_tag: String,
    #[serde(default)]
    pub remote_digest: Option<String>,
    pub available: bool,
}

/// One remote object as returned by a listing. Has no uuid yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedContainer {
    pub provider_id: ProviderId,
    pub kind: ContainerKind,
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub registry: Option<String>,
    pub status: String,
    /// Hypervisor node hosting the object. `None` for Docker.
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub stats: Option<ResourceSnapshot>,
    /// Local digest of the image (`sha256:...`), when the runtime reports it.
    #[serde(default)]
    pub image_digest: Option<String>,
    #[serde(default)]
    pub update: Option<ImageUpdate>,
}

impl ObservedContainer {
    pub fn new(
        provider_id: impl Into<ProviderId>,
        kind: ContainerKind,
        name: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            kind,
            name: name.into(),
            image: None,
            registry: None,
            status: status.into(),
            node: None,
            labels: BTreeMap::new(),
            stats: None,
            image_digest: None,
            update: None,
        }
    }

    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    #[must_use]
    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }
}

/// Persisted inventory row.
///
/// At most one row exists per (`device_uuid`, `watcher`, `provider_id`). The
/// uuid stays stable for as long as the provider id keeps being observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedContainer {
    pub uuid: ContainerUuid,
    pub device_uuid: DeviceUuid,
    pub watcher: WatcherName,
    pub provider_id: ProviderId,
    pub kind: ContainerKind,
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub registry: Option<String>,
    pub status: String,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub stats: Option<ResourceSnapshot>,
    #[serde(default)]
    pub image_digest: Option<String>,
    #[serde(default)]
    pub update: Option<ImageUpdate>,
    pub created_at: String,
    pub updated_at: String,
}

impl ManagedContainer {
    /// Build a new row for a first observation.
    pub fn from_observed(
        device_uuid: DeviceUuid,
        watcher: WatcherName,
        observed: ObservedContainer,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            uuid: ContainerUuid::generate(),
            device_uuid,
            watcher,
            provider_id: observed.provider_id,
            kind: observed.kind,
            name: observed.name,
            image: observed.image,
            registry: observed.registry,
            status: observed.status,
            node: observed.node,
            labels: observed.labels,
            stats: observed.stats,
            image_digest: observed.image_digest,
            update: observed.update,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Whether any mutable field differs from the observation.
    pub fn differs_from(&self, observed: &ObservedContainer) -> bool {
        self.kind != observed.kind
            || self.name != observed.name
            || self.image != observed.image
            || self.registry != observed.registry
            || self.status != observed.status
            || self.node != observed.node
            || self.labels != observed.labels
            || self.stats != observed.stats
            || self.image_digest != observed.image_digest
            || self.update != observed.update
    }

    /// Copy the mutable fields of an observation and bump `updated_at`.
    pub fn apply(&mut self, observed: &ObservedContainer) {
        self.kind = observed.kind;
        self.name.clone_from(&observed.name);
        self.image.clone_from(&observed.image);
        self.registry.clone_from(&observed.registry);
        self.status.clone_from(&observed.status);
        self.node.clone_from(&observed.node);
        self.labels.clone_from(&observed.labels);
        self.stats = observed.stats;
        self.image_digest.clone_from(&observed.image_digest);
        self.update.clone_from(&observed.update);
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }
}

/// Lifecycle actions callers may request on a container or VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
    Shutdown,
    Reboot,
    Pause,
    Unpause,
    Kill,
}

impl ContainerAction {
    pub const ALL: [ContainerAction; 8] = [
        ContainerAction::Start,
        ContainerAction::Stop,
        ContainerAction::Restart,
        ContainerAction::Shutdown,
        ContainerAction::Reboot,
        ContainerAction::Pause,
        ContainerAction::Unpause,
        ContainerAction::Kill,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ContainerAction::Start => "start",
            ContainerAction::Stop => "stop",
            ContainerAction::Restart => "restart",
            ContainerAction::Shutdown => "shutdown",
            ContainerAction::Reboot => "reboot",
            ContainerAction::Pause => "pause",
            ContainerAction::Unpause => "unpause",
            ContainerAction::Kill => "kill",
        }
    }
}

impl fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerAction {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == lower)
            .ok_or_else(|| SchemaError::UnknownAction(s.to_owned()))
    }
}
