use crate::connection::ConnectionResolver;
use crate::directory::DeviceDirectory;
use crate::docker::DockerWatcher;
use crate::proxmox::ProxmoxWatcher;
use crate::RuntimeError;
use convoy_schema::{
    ContainerAction, Device, DeviceUuid, ManagedContainer, ObservedContainer, WatcherKind,
    WatcherName,
};
use std::collections::HashSet;
use std::sync::Arc;

/// Part of a listing that could not be enumerated (a Proxmox node).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeFailure {
    pub scope: String,
    pub reason: String,
}

/// Result of a successful listing.
///
/// Rows whose `node` appears in `failures` were not observed this cycle and
/// must not be treated as gone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Listing {
    pub containers: Vec<ObservedContainer>,
    pub failures: Vec<ScopeFailure>,
}

impl Listing {
    pub fn complete(containers: Vec<ObservedContainer>) -> Self {
        Self {
            containers,
            failures: Vec::new(),
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn failed_scopes(&self) -> HashSet<&str> {
        self.failures.iter().map(|f| f.scope.as_str()).collect()
    }
}

/// Invoked by a provider when the runtime pushes a container change
/// between polls.
pub type ChangeHook = Arc<dyn Fn() + Send + Sync>;

/// Everything a watcher needs to (re)build its connection.
#[derive(Clone)]
pub struct WatcherContext {
    pub device_uuid: DeviceUuid,
    pub name: WatcherName,
    pub directory: Arc<dyn DeviceDirectory>,
    pub resolver: Arc<ConnectionResolver>,
}

/// One runtime kind on one device.
///
/// Implementations are blocking; the engine calls them from worker threads.
pub trait ProviderWatcher: Send + Sync {
    fn name(&self) -> &WatcherName;

    fn kind(&self) -> WatcherKind;

    /// Look up the device, resolve its connection and store the handle.
    fn init_watcher(&self) -> Result<(), RuntimeError>;

    fn is_connected(&self) -> bool;

    /// Enumerate remote objects. A listing that failed as a whole is an
    /// error, never an empty listing.
    fn list_containers(&self) -> Result<Listing, RuntimeError>;

    /// Ask the runtime to perform `action`. Returns once the runtime has
    /// acknowledged the request.
    fn change_container_status(
        &self,
        container: &ManagedContainer,
        action: ContainerAction,
    ) -> Result<(), RuntimeError>;

    /// Drop the connection handle and its transport.
    fn release(&self);

    /// Install the callback for runtime-pushed changes. Providers without
    /// a change feed ignore it.
    fn set_change_hook(&self, _hook: ChangeHook) {}
}

/// Builds the watcher variant for a device capability.
pub trait WatcherFactory: Send + Sync {
    fn create(
        &self,
        device: &Device,
        kind: WatcherKind,
        name: WatcherName,
    ) -> Result<Arc<dyn ProviderWatcher>, RuntimeError>;
}

impl<F> WatcherFactory for F
where
    F: Fn(&Device, WatcherKind, WatcherName) -> Result<Arc<dyn ProviderWatcher>, RuntimeError>
        + Send
        + Sync,
{
    fn create(
        &self,
        device: &Device,
        kind: WatcherKind,
        name: WatcherName,
    ) -> Result<Arc<dyn ProviderWatcher>, RuntimeError> {
        self(device, kind, name)
    }
}

/// Default factory: Docker and Proxmox watchers over real connections.
pub struct ProviderWatcherFactory {
    directory: Arc<dyn DeviceDirectory>,
    resolver: Arc<ConnectionResolver>,
}

impl ProviderWatcherFactory {
    pub fn new(directory: Arc<dyn DeviceDirectory>, resolver: Arc<ConnectionResolver>) -> Self {
        Self {
            directory,
            resolver,
        }
    }
}

impl WatcherFactory for ProviderWatcherFactory {
    fn create(
        &self,
        device: &Device,
        kind: WatcherKind,
        name: WatcherName,
    ) -> Result<Arc<dyn ProviderWatcher>, RuntimeError> {
        let ctx = WatcherContext {
            device_uuid: device.uuid.clone(),
            name,
            directory: Arc::clone(&self.directory),
            resolver: Arc::clone(&self.resolver),
        };
        Ok(select_watcher(kind, ctx))
    }
}

pub fn select_watcher(kind: WatcherKind, ctx: WatcherContext) -> Arc<dyn ProviderWatcher> {
    match kind {
        WatcherKind::Docker => Arc::new(DockerWatcher::new(ctx)),
        WatcherKind::Proxmox => Arc::new(ProxmoxWatcher::new(ctx)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use convoy_schema::{ContainerKind, PassthroughVault};

    fn ctx() -> WatcherContext {
        WatcherContext {
            device_uuid: DeviceUuid::new("d1"),
            name: WatcherName::new("docker-d1"),
            directory: Arc::new(StaticDirectory::new()),
            resolver: Arc::new(ConnectionResolver::new(Arc::new(PassthroughVault))),
        }
    }

    #[test]
    fn select_matches_kind() {
        assert_eq!(select_watcher(WatcherKind::Docker, ctx()).kind(), WatcherKind::Docker);
        assert_eq!(
            select_watcher(WatcherKind::Proxmox, ctx()).kind(),
            WatcherKind::Proxmox
        );
    }

    #[test]
    fn new_watchers_are_not_connected() {
        let w = select_watcher(WatcherKind::Docker, ctx());
        assert!(!w.is_connected());
        assert!(matches!(
            w.list_containers(),
            Err(RuntimeError::NotConnected(_))
        ));
    }

    #[test]
    fn init_for_unknown_device_is_not_found() {
        let w = select_watcher(WatcherKind::Proxmox, ctx());
        assert!(matches!(w.init_watcher(), Err(RuntimeError::NotFound(_))));
        assert!(!w.is_connected());
    }

    #[test]
    fn failed_scopes() {
        let listing = Listing {
            containers: vec![ObservedContainer::new(
                "100",
                ContainerKind::VirtualMachine,
                "vm",
                "running",
            )],
            failures: vec![ScopeFailure {
                scope: "pve2".to_owned(),
                reason: "timeout".to_owned(),
            }],
        };
        assert!(listing.is_partial());
        assert!(listing.failed_scopes().contains("pve2"));
        assert!(!Listing::complete(Vec::new()).is_partial());
    }
}
