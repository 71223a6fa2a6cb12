//! One watcher bound to one device capability.

use crate::concurrency::InFlight;
use crate::events::{EventSink, WatchEvent};
use crate::lifecycle::{validate_transition, WatcherState};
use crate::reconcile::{mark_unreachable, reconcile, ReconcileReport};
use crate::registries::{EnrichReport, RegistrySet};
use crate::CoreError;
use convoy_runtime::{ChangeHook, ProviderWatcher};
use convoy_schema::{
    ContainerAction, Device, DeviceUuid, ManagedContainer, WatcherKey, WatcherKind, WatcherName,
};
use convoy_store::ContainerRepository;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of one successful poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollReport {
    pub watcher: WatcherKey,
    pub listed: usize,
    /// Scopes (Proxmox nodes) that could not be listed.
    pub failed_scopes: Vec<String>,
    pub reconcile: ReconcileReport,
    pub enrichment: EnrichReport,
    pub duration_ms: u64,
    pub finished_at: String,
}

/// Point-in-time view of an instance, as returned by `get_state`.
#[derive(Debug, Clone, Serialize)]
pub struct WatcherSnapshot {
    pub key: WatcherKey,
    pub device_uuid: DeviceUuid,
    pub name: WatcherName,
    pub kind: WatcherKind,
    pub state: WatcherState,
    pub interval_secs: u64,
    pub in_flight: bool,
    pub connected: bool,
    pub last_error: Option<String>,
    pub last_poll_at: Option<String>,
    pub last_report: Option<PollReport>,
}

/// Collaborators a poll writes to.
#[derive(Clone)]
pub(crate) struct PollContext {
    pub repository: Arc<dyn ContainerRepository>,
    pub registries: Arc<RegistrySet>,
    pub events: Arc<dyn EventSink>,
}

#[derive(Debug)]
struct Status {
    state: WatcherState,
    last_error: Option<String>,
    last_poll_at: Option<String>,
    last_report: Option<PollReport>,
}

pub struct WatcherInstance {
    key: WatcherKey,
    device: Device,
    kind: WatcherKind,
    interval: Duration,
    watcher: Arc<dyn ProviderWatcher>,
    status: Mutex<Status>,
    in_flight: InFlight,
    timer: Mutex<Option<JoinHandle<()>>>,
    changes: Arc<Notify>,
}

impl WatcherInstance {
    pub fn new(
        device: Device,
        kind: WatcherKind,
        interval: Duration,
        watcher: Arc<dyn ProviderWatcher>,
    ) -> Self {
        Self {
            key: WatcherKey::for_watcher(&device.uuid, watcher.name()),
            device,
            kind,
            interval,
            watcher,
            status: Mutex::new(Status {
                state: WatcherState::Created,
                last_error: None,
                last_poll_at: None,
                last_report: None,
            }),
            in_flight: InFlight::default(),
            timer: Mutex::new(None),
            changes: Arc::new(Notify::new()),
        }
    }

    pub fn key(&self) -> &WatcherKey {
        &self.key
    }

    /// Device record the instance was registered with.
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn kind(&self) -> WatcherKind {
        self.kind
    }

    pub fn name(&self) -> &WatcherName {
        self.watcher.name()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn watcher(&self) -> &Arc<dyn ProviderWatcher> {
        &self.watcher
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Signalled when the runtime reports a change ahead of the next tick.
    pub(crate) fn changes(&self) -> &Notify {
        &self.changes
    }

    /// Hook handed to the provider watcher; wakes the timer.
    pub fn change_hook(&self) -> ChangeHook {
        let changes = Arc::clone(&self.changes);
        Arc::new(move || changes.notify_one())
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn state(&self) -> WatcherState {
        self.status().state
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == WatcherState::Stopped
    }

    pub fn last_error(&self) -> Option<String> {
        self.status().last_error.clone()
    }

    pub fn snapshot(&self) -> WatcherSnapshot {
        let status = self.status();
        WatcherSnapshot {
            key: self.key.clone(),
            device_uuid: self.device.uuid.clone(),
            name: self.watcher.name().clone(),
            kind: self.kind,
            state: status.state,
            interval_secs: self.interval.as_secs(),
            in_flight: self.in_flight.is_set(),
            connected: self.watcher.is_connected(),
            last_error: status.last_error.clone(),
            last_poll_at: status.last_poll_at.clone(),
            last_report: status.last_report.clone(),
        }
    }

    fn transition(&self, to: WatcherState) -> Result<(), CoreError> {
        let mut status = self.status();
        if status.state == WatcherState::Stopped && to != WatcherState::Stopped {
            return Err(CoreError::WatcherStopped(self.key.to_string()));
        }
        validate_transition(status.state, to)?;
        debug!("{}: {} -> {to}", self.key, status.state);
        status.state = to;
        Ok(())
    }

    /// Like `transition`, but a concurrent stop wins silently.
    fn settle(&self, to: WatcherState) -> Result<(), CoreError> {
        match self.transition(to) {
            Err(CoreError::WatcherStopped(_)) => Ok(()),
            other => other,
        }
    }

    fn record_error(&self, err: &CoreError) {
        self.status().last_error = Some(err.to_string());
    }

    /// Initialize the provider watcher. Blocking.
    ///
    /// A failure leaves the instance in `error`; the next poll retries.
    pub fn connect(&self) -> Result<(), CoreError> {
        self.transition(WatcherState::Connecting)?;
        match self.watcher.init_watcher() {
            Ok(()) => {
                self.settle(WatcherState::Watching)?;
                self.status().last_error = None;
                info!("{}: watching every {}s", self.key, self.interval.as_secs());
                Ok(())
            }
            Err(e) => {
                let err = CoreError::from(e);
                warn!("{}: init failed: {err}", self.key);
                self.settle(WatcherState::Error)?;
                self.record_error(&err);
                Err(err)
            }
        }
    }

    /// List, enrich and reconcile once. Blocking; the caller holds the
    /// in-flight guard. `abandoned` is set when the caller stopped waiting.
    pub(crate) fn poll(
        &self,
        ctx: &PollContext,
        abandoned: &AtomicBool,
    ) -> Result<PollReport, CoreError> {
        if self.is_stopped() {
            return Err(CoreError::WatcherStopped(self.key.to_string()));
        }
        let started = Instant::now();
        ctx.events.emit(WatchEvent::PollStarted {
            watcher: self.key.clone(),
        });

        let result = self.poll_once(ctx, abandoned, started);
        let reported_by_caller = abandoned.load(Ordering::Acquire);
        match &result {
            Ok(report) => {
                let mut status = self.status();
                status.last_error = None;
                status.last_poll_at = Some(report.finished_at.clone());
                status.last_report = Some(report.clone());
                drop(status);
                ctx.events.emit(WatchEvent::PollFinished {
                    watcher: self.key.clone(),
                    report: report.clone(),
                });
            }
            Err(CoreError::WatcherStopped(_)) => {}
            Err(_) if reported_by_caller => {}
            Err(e) => {
                self.record_error(e);
                ctx.events.emit(WatchEvent::PollFailed {
                    watcher: self.key.clone(),
                    error: e.to_string(),
                });
            }
        }

        // Deregistered while polling: the connection outlived the stop.
        if self.is_stopped() {
            self.watcher.release();
        }
        result
    }

    fn poll_once(
        &self,
        ctx: &PollContext,
        abandoned: &AtomicBool,
        started: Instant,
    ) -> Result<PollReport, CoreError> {
        if self.state() == WatcherState::Error || !self.watcher.is_connected() {
            self.connect()?;
        }
        self.transition(WatcherState::Polling)?;

        let mut listing = match self.watcher.list_containers() {
            Ok(listing) => listing,
            Err(e) => {
                self.settle(WatcherState::Error)?;
                if self.kind == WatcherKind::Docker {
                    match mark_unreachable(self.watcher.name(), &*ctx.repository, &*ctx.events) {
                        Ok(0) => {}
                        Ok(n) => warn!("{}: marked {n} container(s) unreachable", self.key),
                        Err(mark) => warn!("{}: could not mark containers unreachable: {mark}", self.key),
                    }
                }
                return Err(e.into());
            }
        };

        if abandoned.load(Ordering::Acquire) {
            self.settle(WatcherState::Error)?;
            return Err(CoreError::PollTimeout {
                key: self.key.to_string(),
                secs: started.elapsed().as_secs(),
            });
        }

        let listed = listing.containers.len();
        let failed_scopes: Vec<String> = listing.failures.iter().map(|f| f.scope.clone()).collect();
        let enrichment = ctx
            .registries
            .enrich(&mut listing.containers)
            .inspect_err(|_| {
                let _ = self.settle(WatcherState::Error);
            })?;

        let reconciled = reconcile(
            &self.device.uuid,
            self.watcher.name(),
            listing,
            &*ctx.repository,
            &*ctx.events,
        );
        let reconcile = match reconciled {
            Ok(report) => report,
            Err(e) => {
                self.settle(WatcherState::Error)?;
                return Err(e);
            }
        };
        self.settle(WatcherState::Watching)?;

        Ok(PollReport {
            watcher: self.key.clone(),
            listed,
            failed_scopes,
            reconcile,
            enrichment,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            finished_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Route a lifecycle action to the provider watcher. Blocking.
    pub fn change_status(
        &self,
        container: &ManagedContainer,
        action: ContainerAction,
    ) -> Result<(), CoreError> {
        if self.is_stopped() {
            return Err(CoreError::WatcherStopped(self.key.to_string()));
        }
        if !self.watcher.is_connected() {
            if let Some(_guard) = self.in_flight.try_begin() {
                self.connect()?;
            }
        }
        self.watcher
            .change_container_status(container, action)
            .map_err(CoreError::from)
    }

    /// Failure the caller observed on its own (a timed-out wait).
    pub(crate) fn report_failure(&self, ctx: &PollContext, err: &CoreError) {
        self.record_error(err);
        ctx.events.emit(WatchEvent::PollFailed {
            watcher: self.key.clone(),
            error: err.to_string(),
        });
    }

    pub(crate) fn set_timer(&self, handle: JoinHandle<()>) {
        let mut slot = self
            .timer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if self.is_stopped() {
            handle.abort();
            return;
        }
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Cancel the timer, mark the instance stopped and release the
    /// connection. A running poll finishes and releases it afterwards.
    pub fn stop(&self) {
        if let Some(timer) = self
            .timer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
        if self.transition(WatcherState::Stopped).is_ok() && !self.in_flight.is_set() {
            self.watcher.release();
        }
        info!("{}: stopped", self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use convoy_runtime::MockWatcher;
    use convoy_schema::{ContainerKind, ObservedContainer};
    use convoy_store::MemoryRepository;

    fn instance(mock: &Arc<MockWatcher>) -> WatcherInstance {
        let mut device = Device::new("d1", "10.0.0.5");
        device.capabilities.docker = true;
        WatcherInstance::new(
            device,
            WatcherKind::Docker,
            Duration::from_secs(60),
            Arc::clone(mock) as Arc<dyn ProviderWatcher>,
        )
    }

    fn ctx() -> (PollContext, Arc<MemoryRepository>, Arc<RecordingSink>) {
        let repo = Arc::new(MemoryRepository::new());
        let sink = Arc::new(RecordingSink::new());
        let ctx = PollContext {
            repository: Arc::clone(&repo) as Arc<dyn ContainerRepository>,
            registries: Arc::new(RegistrySet::default()),
            events: Arc::clone(&sink) as Arc<dyn EventSink>,
        };
        (ctx, repo, sink)
    }

    #[test]
    fn key_combines_device_and_watcher() {
        let mock = Arc::new(MockWatcher::new("docker-d1", WatcherKind::Docker));
        assert_eq!(instance(&mock).key().as_str(), "d1:docker-d1");
    }

    #[test]
    fn poll_connects_lazily_and_reconciles() {
        let mock = Arc::new(MockWatcher::new("docker-d1", WatcherKind::Docker));
        mock.set_listing(vec![ObservedContainer::new(
            "c-100",
            ContainerKind::Container,
            "web",
            "running",
        )]);
        let inst = instance(&mock);
        let (ctx, repo, sink) = ctx();

        let report = inst.poll(&ctx, &AtomicBool::new(false)).unwrap();
        assert_eq!(report.reconcile.created, 1);
        assert_eq!(inst.state(), WatcherState::Watching);
        assert_eq!(mock.init_calls(), 1);
        assert_eq!(repo.list().unwrap().len(), 1);
        assert_eq!(sink.polls_started(), 1);
    }

    #[test]
    fn init_failure_leaves_error_state() {
        let mock = Arc::new(MockWatcher::new("docker-d1", WatcherKind::Docker));
        mock.fail_init(Some("connection refused"));
        let inst = instance(&mock);

        assert!(inst.connect().is_err());
        assert_eq!(inst.state(), WatcherState::Error);
        assert!(inst.last_error().unwrap().contains("connection refused"));

        mock.fail_init(None);
        inst.connect().unwrap();
        assert_eq!(inst.state(), WatcherState::Watching);
        assert!(inst.last_error().is_none());
    }

    #[test]
    fn abandoned_poll_does_not_reconcile() {
        let mock = Arc::new(MockWatcher::new("docker-d1", WatcherKind::Docker));
        mock.set_listing(vec![ObservedContainer::new(
            "c-100",
            ContainerKind::Container,
            "web",
            "running",
        )]);
        let inst = instance(&mock);
        let (ctx, repo, sink) = ctx();

        let err = inst.poll(&ctx, &AtomicBool::new(true)).unwrap_err();
        assert!(matches!(err, CoreError::PollTimeout { .. }));
        assert!(repo.list().unwrap().is_empty());
        assert!(!sink
            .events()
            .iter()
            .any(|e| matches!(e, WatchEvent::PollFailed { .. })));
    }

    #[test]
    fn stop_releases_and_blocks_polls() {
        let mock = Arc::new(MockWatcher::new("docker-d1", WatcherKind::Docker));
        let inst = instance(&mock);
        inst.connect().unwrap();
        assert!(mock.is_connected());

        inst.stop();
        assert!(inst.is_stopped());
        assert!(!mock.is_connected());
        let (ctx, _, _) = ctx();
        assert!(matches!(
            inst.poll(&ctx, &AtomicBool::new(false)),
            Err(CoreError::WatcherStopped(_))
        ));
    }

    #[test]
    fn stop_during_poll_defers_release() {
        let mock = Arc::new(MockWatcher::new("docker-d1", WatcherKind::Docker));
        let inst = instance(&mock);
        inst.connect().unwrap();

        let guard = inst.in_flight().try_begin().unwrap();
        inst.stop();
        assert!(mock.is_connected());
        drop(guard);
    }
}
