use crate::events::{EventSink, NullSink};
use crate::instance::{PollContext, PollReport, WatcherInstance, WatcherSnapshot};
use crate::registries::RegistrySet;
use crate::CoreError;
use convoy_runtime::{DeviceDirectory, RuntimeError, WatcherFactory};
use convoy_schema::{
    parse_interval, ContainerAction, ContainerUuid, Device, DeviceUuid, WatcherKey, WatcherKind,
    WatcherName, DEFAULT_INTERVAL, MAX_INTERVAL,
};
use convoy_store::ContainerRepository;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Shortest polling period the engine schedules.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Quiet time after a runtime change before the triggered poll runs.
pub const DEFAULT_CHANGE_DEBOUNCE: Duration = Duration::from_secs(5);

pub struct EngineOptions {
    /// Upper bound on one poll (connect, list, reconcile) and one action.
    pub poll_timeout: Duration,
    /// Period for devices without a usable interval expression.
    pub default_interval: Duration,
    /// Poll right after registration instead of one interval later.
    pub initial_poll: bool,
    /// Delay between a pushed runtime change and the poll it triggers;
    /// further changes inside the window fold into the same poll.
    pub change_debounce: Duration,
    pub events: Arc<dyn EventSink>,
    pub registries: Arc<RegistrySet>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            default_interval: DEFAULT_INTERVAL,
            initial_poll: true,
            change_debounce: DEFAULT_CHANGE_DEBOUNCE,
            events: Arc::new(NullSink),
            registries: Arc::new(RegistrySet::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed(PollReport),
    /// A poll of the same watcher was still running.
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistrationSummary {
    pub devices: usize,
    pub watchers: usize,
    pub failed: usize,
}

/// Owns every watcher instance and drives their polls.
///
/// Must be used from within a multi-threaded tokio runtime: each instance
/// runs a timer task, and polls run on the blocking pool.
pub struct WatcherEngine {
    directory: Arc<dyn DeviceDirectory>,
    factory: Arc<dyn WatcherFactory>,
    ctx: PollContext,
    poll_timeout: Duration,
    default_interval: Duration,
    initial_poll: bool,
    change_debounce: Duration,
    instances: RwLock<HashMap<WatcherKey, Arc<WatcherInstance>>>,
}

impl WatcherEngine {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        factory: Arc<dyn WatcherFactory>,
        repository: Arc<dyn ContainerRepository>,
        options: EngineOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            directory,
            factory,
            ctx: PollContext {
                repository,
                registries: options.registries,
                events: options.events,
            },
            poll_timeout: options.poll_timeout,
            default_interval: options.default_interval.clamp(MIN_INTERVAL, MAX_INTERVAL),
            initial_poll: options.initial_poll,
            change_debounce: options.change_debounce,
            instances: RwLock::new(HashMap::new()),
        })
    }

    pub fn repository(&self) -> &Arc<dyn ContainerRepository> {
        &self.ctx.repository
    }

    pub fn registries(&self) -> &Arc<RegistrySet> {
        &self.ctx.registries
    }

    pub fn directory(&self) -> &Arc<dyn DeviceDirectory> {
        &self.directory
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<WatcherKey, Arc<WatcherInstance>>> {
        self.instances
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<WatcherKey, Arc<WatcherInstance>>> {
        self.instances
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn interval_for(&self, device: &Device, kind: WatcherKind) -> Duration {
        let Some(expr) = device.interval_for(kind) else {
            return self.default_interval;
        };
        match parse_interval(expr) {
            Ok(period) => period.clamp(MIN_INTERVAL, MAX_INTERVAL),
            Err(e) => {
                warn!(
                    "{}: {e}; polling every {}s instead",
                    device.uuid,
                    self.default_interval.as_secs()
                );
                self.default_interval
            }
        }
    }

    /// Create one instance per enabled capability of `device`.
    ///
    /// Idempotent per key: an existing instance is left untouched, use
    /// [`reload_device`](Self::reload_device) to pick up new configuration.
    /// Connection failures leave the instance in `error` and are retried by
    /// its timer; they do not fail the registration.
    pub async fn register_watcher(
        self: &Arc<Self>,
        device: &Device,
    ) -> Result<Vec<WatcherKey>, CoreError> {
        if !device.enabled {
            debug!("{}: device disabled, nothing to watch", device.uuid);
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for kind in device.capabilities.kinds() {
            keys.push(self.register_kind(device, kind).await?);
        }
        Ok(keys)
    }

    /// Replace every instance of `device` after its device or auth record
    /// changed. A disabled device ends up with no instances.
    pub async fn reload_device(
        self: &Arc<Self>,
        device: &Device,
    ) -> Result<Vec<WatcherKey>, CoreError> {
        let removed = self.deregister_device(&device.uuid);
        if removed > 0 {
            info!("{}: configuration changed, recreating {removed} watcher(s)", device.uuid);
        }
        self.register_watcher(device).await
    }

    async fn register_kind(
        self: &Arc<Self>,
        device: &Device,
        kind: WatcherKind,
    ) -> Result<WatcherKey, CoreError> {
        let name = WatcherName::for_device(kind, &device.uuid);
        let key = WatcherKey::for_watcher(&device.uuid, &name);

        if self.get_watcher(&key).is_some() {
            debug!("{key}: already registered");
            return Ok(key);
        }

        let watcher = self.factory.create(device, kind, name)?;
        let instance = Arc::new(WatcherInstance::new(
            device.clone(),
            kind,
            self.interval_for(device, kind),
            watcher,
        ));
        {
            let mut instances = self.write();
            if instances.contains_key(&key) {
                return Ok(key);
            }
            instances.insert(key.clone(), Arc::clone(&instance));
        }
        info!("{key}: registered {kind} watcher");

        instance.watcher().set_change_hook(instance.change_hook());
        self.connect(&instance).await;
        self.spawn_timer(&instance);
        Ok(key)
    }

    /// Initial connection attempt, under the in-flight guard.
    async fn connect(&self, instance: &Arc<WatcherInstance>) {
        let Some(guard) = instance.in_flight().try_begin() else {
            return;
        };
        let inst = Arc::clone(instance);
        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            inst.connect()
        });
        match tokio::time::timeout(self.poll_timeout, task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => debug!("{}: will retry on next tick: {e}", instance.key()),
            Ok(Err(e)) => error!("{}: connect task failed: {e}", instance.key()),
            Err(_) => warn!(
                "{}: connecting took longer than {}s",
                instance.key(),
                self.poll_timeout.as_secs()
            ),
        }
    }

    fn spawn_timer(&self, instance: &Arc<WatcherInstance>) {
        let inst = Arc::clone(instance);
        let ctx = self.ctx.clone();
        let limit = self.poll_timeout;
        let debounce = self.change_debounce;
        let period = instance.interval();
        let now = Instant::now();
        let start = if self.initial_poll {
            now
        } else {
            now.checked_add(period).unwrap_or(now)
        };

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                let pushed = tokio::select! {
                    _ = ticker.tick() => false,
                    () = inst.changes().notified() => true,
                };
                if pushed {
                    tokio::time::sleep(debounce).await;
                    // Changes that arrived while waiting are covered by this poll.
                    let _ = inst.changes().notified().now_or_never();
                    debug!("{}: runtime reported a change, polling early", inst.key());
                }
                if inst.is_stopped() {
                    break;
                }
                match run_poll(&inst, &ctx, limit).await {
                    Ok(PollOutcome::Skipped) => {
                        debug!("{}: previous poll still running, tick skipped", inst.key());
                    }
                    Ok(PollOutcome::Completed(_)) | Err(CoreError::WatcherStopped(_)) => {}
                    Err(e) => debug!("{}: tick failed: {e}", inst.key()),
                }
                if pushed {
                    ticker.reset();
                }
            }
        });
        instance.set_timer(handle);
    }

    /// Register every enabled device of the directory. Per-device failures
    /// are logged and counted.
    pub async fn register_watchers(self: &Arc<Self>) -> Result<RegistrationSummary, CoreError> {
        let devices = self.directory.devices_to_watch()?;
        let mut summary = RegistrationSummary::default();
        for device in &devices {
            summary.devices += 1;
            match self.register_watcher(device).await {
                Ok(keys) => summary.watchers += keys.len(),
                Err(e) => {
                    warn!("{}: registration failed: {e}", device.uuid);
                    summary.failed += 1;
                }
            }
        }
        info!(
            "registered {} watcher(s) for {} device(s), {} failure(s)",
            summary.watchers, summary.devices, summary.failed
        );
        Ok(summary)
    }

    /// Stop and remove one instance. Returns false for unknown keys.
    pub fn deregister_watcher(&self, key: &WatcherKey) -> bool {
        let removed = self.write().remove(key);
        match removed {
            Some(instance) => {
                instance.stop();
                true
            }
            None => {
                debug!("{key}: not registered");
                false
            }
        }
    }

    pub fn deregister_device(&self, device: &DeviceUuid) -> usize {
        let keys: Vec<WatcherKey> = self
            .read()
            .iter()
            .filter(|(_, inst)| inst.device().uuid == *device)
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter().filter(|key| self.deregister_watcher(key)).count()
    }

    pub fn deregister_all(&self) -> usize {
        let drained: Vec<Arc<WatcherInstance>> =
            self.write().drain().map(|(_, inst)| inst).collect();
        for instance in &drained {
            instance.stop();
        }
        if !drained.is_empty() {
            info!("deregistered {} watcher(s)", drained.len());
        }
        drained.len()
    }

    /// Poll now, outside the timer. Skipped when a poll is running.
    pub async fn refresh(&self, key: &WatcherKey) -> Result<PollOutcome, CoreError> {
        let instance = self
            .get_watcher(key)
            .ok_or_else(|| CoreError::WatcherNotFound(key.to_string()))?;
        run_poll(&instance, &self.ctx, self.poll_timeout).await
    }

    /// Perform `action` on a persisted container through the watcher that
    /// owns its row.
    pub async fn change_container_status(
        &self,
        uuid: &ContainerUuid,
        action: ContainerAction,
    ) -> Result<(), CoreError> {
        let container = self
            .ctx
            .repository
            .find_by_uuid(uuid)?
            .ok_or_else(|| CoreError::ContainerNotFound(uuid.to_string()))?;
        let key = WatcherKey::for_watcher(&container.device_uuid, &container.watcher);
        let instance = self
            .get_watcher(&key)
            .ok_or_else(|| CoreError::WatcherNotFound(key.to_string()))?;

        info!("{key}: {action} requested for {} ({})", container.name, container.provider_id);
        let task = tokio::task::spawn_blocking(move || instance.change_status(&container, action));
        match tokio::time::timeout(self.poll_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(CoreError::Task(e.to_string())),
            Err(_) => Err(CoreError::Runtime(RuntimeError::Connectivity(format!(
                "{action} on {key} not acknowledged within {}s",
                self.poll_timeout.as_secs()
            )))),
        }
    }

    pub fn get_watcher(&self, key: &WatcherKey) -> Option<Arc<WatcherInstance>> {
        self.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<WatcherKey> {
        let mut keys: Vec<WatcherKey> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get_state(&self) -> Vec<WatcherSnapshot> {
        let mut state: Vec<WatcherSnapshot> =
            self.read().values().map(|inst| inst.snapshot()).collect();
        state.sort_by(|a, b| a.key.cmp(&b.key));
        state
    }
}

/// One guarded, time-bounded poll on the blocking pool.
///
/// On timeout the blocking work keeps running to completion and keeps the
/// in-flight flag until it ends; it will not reconcile.
async fn run_poll(
    instance: &Arc<WatcherInstance>,
    ctx: &PollContext,
    limit: Duration,
) -> Result<PollOutcome, CoreError> {
    if instance.is_stopped() {
        return Err(CoreError::WatcherStopped(instance.key().to_string()));
    }
    let Some(guard) = instance.in_flight().try_begin() else {
        return Ok(PollOutcome::Skipped);
    };

    let abandoned = Arc::new(AtomicBool::new(false));
    let task = {
        let inst = Arc::clone(instance);
        let ctx = ctx.clone();
        let abandoned = Arc::clone(&abandoned);
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            inst.poll(&ctx, &abandoned)
        })
    };

    match tokio::time::timeout(limit, task).await {
        Ok(Ok(result)) => result.map(PollOutcome::Completed),
        Ok(Err(e)) => Err(CoreError::Task(e.to_string())),
        Err(_) => {
            abandoned.store(true, Ordering::Release);
            let err = CoreError::PollTimeout {
                key: instance.key().to_string(),
                secs: limit.as_secs(),
            };
            warn!("{err}");
            instance.report_failure(ctx, &err);
            Err(err)
        }
    }
}
