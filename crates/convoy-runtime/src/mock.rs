use crate::watcher::{ChangeHook, Listing, ProviderWatcher, ScopeFailure};
use crate::RuntimeError;
use convoy_schema::{
    ContainerAction, ManagedContainer, ObservedContainer, ProviderId, WatcherKind, WatcherName,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default, Clone)]
struct MockState {
    connected: bool,
    containers: Vec<ObservedContainer>,
    failures: Vec<ScopeFailure>,
    init_error: Option<String>,
    list_error: Option<String>,
    list_delay: Duration,
    rejected: Vec<ContainerAction>,
    actions: Vec<(ProviderId, ContainerAction)>,
}

/// Scriptable watcher for engine tests and benchmarks.
pub struct MockWatcher {
    name: WatcherName,
    kind: WatcherKind,
    state: Mutex<MockState>,
    init_calls: AtomicUsize,
    list_calls: AtomicUsize,
    hook: Mutex<Option<ChangeHook>>,
}

impl MockWatcher {
    pub fn new(name: impl Into<WatcherName>, kind: WatcherKind) -> Self {
        Self {
            name: name.into(),
            kind,
            state: Mutex::new(MockState::default()),
            init_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            hook: Mutex::new(None),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut state)
    }

    /// Replace what the next listings return.
    pub fn set_listing(&self, containers: Vec<ObservedContainer>) {
        self.with_state(|s| s.containers = containers);
    }

    /// Report `scope` as unreachable in subsequent listings.
    pub fn set_scope_failures(&self, failures: Vec<ScopeFailure>) {
        self.with_state(|s| s.failures = failures);
    }

    /// Make `init_watcher` fail with a connectivity error, or succeed again.
    pub fn fail_init(&self, reason: Option<&str>) {
        self.with_state(|s| s.init_error = reason.map(str::to_owned));
    }

    /// Make `list_containers` fail with a connectivity error, or succeed again.
    pub fn fail_list(&self, reason: Option<&str>) {
        self.with_state(|s| s.list_error = reason.map(str::to_owned));
    }

    pub fn set_list_delay(&self, delay: Duration) {
        self.with_state(|s| s.list_delay = delay);
    }

    pub fn reject_action(&self, action: ContainerAction) {
        self.with_state(|s| s.rejected.push(action));
    }

    /// Actions received so far, in order.
    pub fn actions(&self) -> Vec<(ProviderId, ContainerAction)> {
        self.with_state(|s| s.actions.clone())
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Behave like a runtime event: call the installed change hook.
    /// Returns false when no hook is installed.
    pub fn emit_change(&self) -> bool {
        let hook = self
            .hook
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        match hook {
            Some(hook) => {
                hook();
                true
            }
            None => false,
        }
    }
}

impl ProviderWatcher for MockWatcher {
    fn name(&self) -> &WatcherName {
        &self.name
    }

    fn kind(&self) -> WatcherKind {
        self.kind
    }

    fn init_watcher(&self) -> Result<(), RuntimeError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        self.with_state(|s| match &s.init_error {
            Some(reason) => {
                s.connected = false;
                Err(RuntimeError::Connectivity(reason.clone()))
            }
            None => {
                s.connected = true;
                Ok(())
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.with_state(|s| s.connected)
    }

    fn list_containers(&self) -> Result<Listing, RuntimeError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.with_state(|s| s.clone());
        if !snapshot.list_delay.is_zero() {
            std::thread::sleep(snapshot.list_delay);
        }
        if !snapshot.connected {
            return Err(RuntimeError::NotConnected(self.name.to_string()));
        }
        if let Some(reason) = snapshot.list_error {
            return Err(RuntimeError::Connectivity(reason));
        }
        Ok(Listing {
            containers: snapshot.containers,
            failures: snapshot.failures,
        })
    }

    fn change_container_status(
        &self,
        container: &ManagedContainer,
        action: ContainerAction,
    ) -> Result<(), RuntimeError> {
        self.with_state(|s| {
            if !s.connected {
                return Err(RuntimeError::NotConnected(self.name.to_string()));
            }
            if s.rejected.contains(&action) {
                return Err(RuntimeError::UnsupportedAction {
                    action,
                    kind: container.kind.to_string(),
                });
            }
            s.actions.push((container.provider_id.clone(), action));
            Ok(())
        })
    }

    fn release(&self) {
        self.with_state(|s| s.connected = false);
    }

    fn set_change_hook(&self, hook: ChangeHook) {
        *self
            .hook
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_schema::{ContainerKind, DeviceUuid};

    fn web() -> ObservedContainer {
        ObservedContainer::new("c-100", ContainerKind::Container, "web", "running")
    }

    #[test]
    fn lists_only_after_init() {
        let w = MockWatcher::new("docker-d1", WatcherKind::Docker);
        w.set_listing(vec![web()]);
        assert!(matches!(
            w.list_containers(),
            Err(RuntimeError::NotConnected(_))
        ));
        w.init_watcher().unwrap();
        assert_eq!(w.list_containers().unwrap().containers.len(), 1);
        assert_eq!(w.list_calls(), 2);
    }

    #[test]
    fn injected_failures() {
        let w = MockWatcher::new("docker-d1", WatcherKind::Docker);
        w.fail_init(Some("refused"));
        assert!(w.init_watcher().is_err());
        assert!(!w.is_connected());
        w.fail_init(None);
        w.init_watcher().unwrap();
        w.fail_list(Some("timeout"));
        assert!(matches!(
            w.list_containers(),
            Err(RuntimeError::Connectivity(_))
        ));
        assert_eq!(w.init_calls(), 2);
    }

    #[test]
    fn records_and_rejects_actions() {
        let w = MockWatcher::new("docker-d1", WatcherKind::Docker);
        w.init_watcher().unwrap();
        w.reject_action(ContainerAction::Kill);
        let row = ManagedContainer::from_observed(
            DeviceUuid::new("d1"),
            WatcherName::new("docker-d1"),
            web(),
        );
        w.change_container_status(&row, ContainerAction::Stop).unwrap();
        assert!(matches!(
            w.change_container_status(&row, ContainerAction::Kill),
            Err(RuntimeError::UnsupportedAction { .. })
        ));
        assert_eq!(
            w.actions(),
            vec![(ProviderId::new("c-100"), ContainerAction::Stop)]
        );
        w.release();
        assert!(!w.is_connected());
    }

    #[test]
    fn change_hook_is_invoked() {
        use std::sync::Arc;
        let w = MockWatcher::new("docker-d1", WatcherKind::Docker);
        assert!(!w.emit_change());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        w.set_change_hook(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(w.emit_change());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
