//! Docker Engine watcher on top of bollard.
//!
//! The watcher trait is blocking, so every Engine call runs on a shared
//! I/O runtime and is awaited with `block_on`. The engine only calls
//! watchers from blocking worker threads, never from inside a runtime.

use crate::connection::{ConnectionOptions, Endpoint, TlsMaterial, Transport};
use crate::watcher::{ChangeHook, Listing, ProviderWatcher, WatcherContext};
use crate::RuntimeError;
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerStatsResponse, ContainerSummary};
use bollard::query_parameters::{
    EventsOptions, KillContainerOptions, ListContainersOptions, RestartContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use convoy_schema::{
    ContainerAction, ContainerKind, DockerWatchConfig, ManagedContainer, ObservedContainer,
    ResourceSnapshot, WatcherKind, WatcherName,
};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Opt a container in or out regardless of `watch_by_default`.
pub const LABEL_WATCH: &str = "wud.watch";
/// Display name overriding the container name.
pub const LABEL_DISPLAY_NAME: &str = "wud.display.name";

/// Pause before resubscribing to a dropped event stream.
const EVENT_RETRY: Duration = Duration::from_secs(5);

/// Container events that can change a listing.
const WATCHED_EVENTS: &[&str] = &[
    "create", "start", "restart", "stop", "die", "kill", "pause", "unpause", "destroy", "rename",
];

static IO_RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn io_runtime() -> Result<&'static Runtime, RuntimeError> {
    if let Some(rt) = IO_RUNTIME.get() {
        return Ok(rt);
    }
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("convoy-docker")
        .enable_all()
        .build()?;
    // A concurrent initializer may have won; its runtime is kept.
    Ok(IO_RUNTIME.get_or_init(|| rt))
}

/// Whether a container is watched, given its `wud.watch` label.
pub fn is_watched(label: Option<&str>, watch_by_default: bool) -> bool {
    match label.map(str::trim).filter(|l| !l.is_empty()) {
        Some(value) => value.eq_ignore_ascii_case("true"),
        None => watch_by_default,
    }
}

/// Map an Engine API failure onto the runtime error taxonomy.
fn classify(context: &str, err: DockerError) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            401 | 403 => RuntimeError::Credential(format!("{context}: {message}")),
            404 => RuntimeError::NotFound(format!("{context}: {message}")),
            _ => RuntimeError::Provider(format!("{context}: HTTP {status_code}: {message}")),
        },
        e @ (DockerError::JsonDataError { .. } | DockerError::JsonSerdeError { .. }) => {
            RuntimeError::Provider(format!("{context}: {e}"))
        }
        e => RuntimeError::Connectivity(format!("{context}: {e}")),
    }
}

fn snapshot(stats: &ContainerStatsResponse) -> ResourceSnapshot {
    let total = |cpu: Option<&bollard::models::ContainerCpuStats>| {
        cpu.and_then(|c| c.cpu_usage.as_ref())
            .and_then(|u| u.total_usage)
            .unwrap_or(0)
    };
    let system = |cpu: Option<&bollard::models::ContainerCpuStats>| {
        cpu.and_then(|c| c.system_cpu_usage).unwrap_or(0)
    };
    let cpu = stats.cpu_stats.as_ref();
    let precpu = stats.precpu_stats.as_ref();

    let cpu_delta = total(cpu).saturating_sub(total(precpu));
    let system_delta = system(cpu).saturating_sub(system(precpu));
    let cpus = cpu.and_then(|c| c.online_cpus).map_or_else(
        || {
            cpu.and_then(|c| c.cpu_usage.as_ref())
                .and_then(|u| u.percpu_usage.as_ref())
                .map_or(1, Vec::len)
                .max(1) as f64
        },
        f64::from,
    );
    let cpu_percent = if cpu_delta > 0 && system_delta > 0 {
        cpu_delta as f64 / system_delta as f64 * cpus * 100.0
    } else {
        0.0
    };
    let memory = stats.memory_stats.as_ref();
    ResourceSnapshot {
        cpu_percent,
        memory_usage_bytes: memory.and_then(|m| m.usage).unwrap_or(0),
        memory_limit_bytes: memory.and_then(|m| m.limit).unwrap_or(0),
    }
}

/// `registry/repo:tag` without tag or digest.
fn image_repository(image: &str) -> &str {
    let name = image.split('@').next().unwrap_or(image);
    match name.rfind(':') {
        Some(i) if !name[i..].contains('/') => &name[..i],
        _ => name,
    }
}

/// Digest the local image was pulled by, preferring the entry for the
/// container's own repository.
fn local_digest(image: &str, repo_digests: &[String]) -> Option<String> {
    let repo = image_repository(image);
    repo_digests
        .iter()
        .find(|d| d.split_once('@').is_some_and(|(r, _)| r == repo))
        .or_else(|| repo_digests.first())
        .and_then(|d| d.split_once('@'))
        .map(|(_, digest)| digest.to_owned())
}

/// Client TLS files for the duration of the connect call.
fn tls_files(tls: &TlsMaterial) -> Result<tempfile::TempDir, RuntimeError> {
    let dir = tempfile::Builder::new().prefix("convoy-tls-").tempdir()?;
    std::fs::write(dir.path().join("ca.pem"), tls.ca.expose())?;
    std::fs::write(dir.path().join("cert.pem"), tls.cert.expose())?;
    std::fs::write(dir.path().join("key.pem"), tls.key.expose())?;
    Ok(dir)
}

fn connect_docker(options: &ConnectionOptions) -> Result<Docker, RuntimeError> {
    let timeout = options.request_timeout.as_secs().max(1);
    let _enter = io_runtime()?.enter();
    let connected = match (&options.endpoint, &options.tls) {
        (Endpoint::Socket(path), _) => {
            Docker::connect_with_socket(&path.to_string_lossy(), timeout, API_DEFAULT_VERSION)
        }
        (endpoint @ Endpoint::Tcp { .. }, Some(tls)) => {
            let dir = tls_files(tls)?;
            let addr = endpoint.url().unwrap_or_default();
            Docker::connect_with_ssl(
                &addr,
                &dir.path().join("key.pem"),
                &dir.path().join("cert.pem"),
                &dir.path().join("ca.pem"),
                timeout,
                API_DEFAULT_VERSION,
            )
        }
        (endpoint @ Endpoint::Tcp { .. }, None) => {
            let addr = endpoint.url().unwrap_or_default();
            Docker::connect_with_http(&addr, timeout, API_DEFAULT_VERSION)
        }
    };
    connected.map_err(|e| classify(&format!("docker client for {}", options.endpoint), e))
}

/// Background subscription to the Engine's event stream. Aborted on drop.
struct EventFeed(JoinHandle<()>);

impl Drop for EventFeed {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn follow_events(docker: Docker, name: WatcherName, hook: ChangeHook) {
    let filters = HashMap::from([
        ("type".to_owned(), vec!["container".to_owned()]),
        (
            "event".to_owned(),
            WATCHED_EVENTS.iter().map(|e| (*e).to_owned()).collect(),
        ),
    ]);
    loop {
        let mut stream = Box::pin(docker.events(Some(EventsOptions {
            filters: Some(filters.clone()),
            ..Default::default()
        })));
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    debug!(
                        "{name}: docker event {} on {}",
                        event.action.as_deref().unwrap_or("?"),
                        event
                            .actor
                            .as_ref()
                            .and_then(|a| a.id.as_deref())
                            .unwrap_or("?")
                    );
                    hook();
                }
                Err(e) => {
                    warn!("{name}: docker event stream failed: {e}");
                    break;
                }
            }
        }
        tokio::time::sleep(EVENT_RETRY).await;
    }
}

#[derive(Clone)]
struct Session {
    docker: Docker,
    config: DockerWatchConfig,
    /// Local digests by image id.
    digests: Arc<Mutex<HashMap<String, Option<String>>>>,
    _events: Option<Arc<EventFeed>>,
    _transport: Arc<Transport>,
}

impl Session {
    async fn listing(&self, name: &WatcherName) -> Result<Listing, RuntimeError> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: self.config.watch_all,
                ..Default::default()
            }))
            .await
            .map_err(|e| classify("list containers", e))?;
        debug!("{name}: docker returned {} container(s)", summaries.len());

        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            if let Some(observed) = self.observe(name, summary).await {
                containers.push(observed);
            }
        }
        Ok(Listing::complete(containers))
    }

    async fn observe(
        &self,
        name: &WatcherName,
        summary: ContainerSummary,
    ) -> Option<ObservedContainer> {
        let labels: BTreeMap<String, String> =
            summary.labels.unwrap_or_default().into_iter().collect();
        if !is_watched(
            labels.get(LABEL_WATCH).map(String::as_str),
            self.config.watch_by_default,
        ) {
            return None;
        }
        let id = summary.id.unwrap_or_default();
        let display = labels
            .get(LABEL_DISPLAY_NAME)
            .cloned()
            .or_else(|| {
                summary
                    .names
                    .as_ref()
                    .and_then(|n| n.first())
                    .map(|n| n.trim_start_matches('/').to_owned())
            })
            .unwrap_or_else(|| id.chars().take(12).collect());
        let status = summary
            .state
            .map(|s| s.to_string().to_lowercase())
            .unwrap_or_default();

        let mut observed =
            ObservedContainer::new(id.as_str(), ContainerKind::Container, display, status);
        observed.image = summary.image.filter(|i| !i.is_empty());

        if self.config.watch_stats && observed.status == "running" {
            match self.stats(&id).await {
                Ok(stats) => observed.stats = Some(stats),
                Err(e) => warn!("{name}: stats for {} unavailable: {e}", observed.name),
            }
        }
        if self.config.watch_digest {
            if let (Some(image), Some(image_id)) = (observed.image.as_deref(), summary.image_id) {
                observed.image_digest = self.digest(name, image, &image_id).await;
            }
        }
        observed.labels = labels;
        Some(observed)
    }

    async fn stats(&self, id: &str) -> Result<ResourceSnapshot, RuntimeError> {
        let context = format!("stats for {id}");
        let mut stream = Box::pin(self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                ..Default::default()
            }),
        ));
        match stream.next().await {
            Some(Ok(stats)) => Ok(snapshot(&stats)),
            Some(Err(e)) => Err(classify(&context, e)),
            None => Err(RuntimeError::Provider(format!("{context}: empty response"))),
        }
    }

    async fn digest(&self, name: &WatcherName, image: &str, image_id: &str) -> Option<String> {
        if let Some(known) = self.digests.lock().ok()?.get(image_id) {
            return known.clone();
        }
        let digest = match self.docker.inspect_image(image).await {
            Ok(inspect) => local_digest(image, &inspect.repo_digests.unwrap_or_default()),
            Err(e) => {
                warn!("{name}: inspect of {image} failed: {e}");
                return None;
            }
        };
        if let Ok(mut cache) = self.digests.lock() {
            cache.insert(image_id.to_owned(), digest.clone());
        }
        digest
    }

    async fn act(&self, id: &str, action: ContainerAction) -> Result<(), DockerError> {
        let docker = &self.docker;
        match action {
            ContainerAction::Start => {
                docker
                    .start_container(id, None::<StartContainerOptions>)
                    .await
            }
            ContainerAction::Stop | ContainerAction::Shutdown => {
                docker.stop_container(id, None::<StopContainerOptions>).await
            }
            ContainerAction::Restart | ContainerAction::Reboot => {
                docker
                    .restart_container(id, None::<RestartContainerOptions>)
                    .await
            }
            ContainerAction::Pause => docker.pause_container(id).await,
            ContainerAction::Unpause => docker.unpause_container(id).await,
            ContainerAction::Kill => docker.kill_container(id, None::<KillContainerOptions>).await,
        }
    }
}

pub struct DockerWatcher {
    ctx: WatcherContext,
    session: Mutex<Option<Session>>,
    hook: Mutex<Option<ChangeHook>>,
}

impl DockerWatcher {
    pub fn new(ctx: WatcherContext) -> Self {
        Self {
            ctx,
            session: Mutex::new(None),
            hook: Mutex::new(None),
        }
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<Session>>, RuntimeError> {
        self.session
            .lock()
            .map_err(|e| RuntimeError::Provider(format!("mutex poisoned: {e}")))
    }

    fn current(&self) -> Result<Session, RuntimeError> {
        self.slot()?
            .clone()
            .ok_or_else(|| RuntimeError::NotConnected(self.ctx.name.to_string()))
    }

    /// Forget a handle whose transport is gone so the next call reconnects.
    fn forget_if_broken(&self, err: &RuntimeError) {
        if err.is_connectivity() {
            if let Ok(mut slot) = self.slot() {
                if slot.take().is_some() {
                    debug!("{}: dropping broken docker connection", self.ctx.name);
                }
            }
        }
    }

    fn event_feed(&self, docker: &Docker) -> Result<Option<Arc<EventFeed>>, RuntimeError> {
        let hook = self.hook.lock().ok().and_then(|h| h.clone());
        let Some(hook) = hook else {
            debug!("{}: no change hook, docker events ignored", self.ctx.name);
            return Ok(None);
        };
        let task = io_runtime()?.spawn(follow_events(
            docker.clone(),
            self.ctx.name.clone(),
            hook,
        ));
        debug!("{}: following docker events", self.ctx.name);
        Ok(Some(Arc::new(EventFeed(task))))
    }
}

impl ProviderWatcher for DockerWatcher {
    fn name(&self) -> &WatcherName {
        &self.ctx.name
    }

    fn kind(&self) -> WatcherKind {
        WatcherKind::Docker
    }

    fn init_watcher(&self) -> Result<(), RuntimeError> {
        let device = self.ctx.directory.device(&self.ctx.device_uuid)?;
        let auth = self.ctx.directory.device_auth(&self.ctx.device_uuid)?;
        let options = self
            .ctx
            .resolver
            .resolve(&device, &auth, WatcherKind::Docker)?;
        let docker = connect_docker(&options)?;

        let ping = io_runtime()?.block_on(async {
            tokio::time::timeout(options.connect_timeout, docker.ping()).await
        });
        match ping {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(classify("ping", e)),
            Err(_) => {
                return Err(RuntimeError::Connectivity(format!(
                    "ping: no answer from {} within {:?}",
                    options.endpoint, options.connect_timeout
                )))
            }
        }

        info!(
            "{}: connected to docker via {:?} at {}",
            self.ctx.name, auth.docker.method, options.endpoint
        );
        let events = if device.docker.watch_events {
            self.event_feed(&docker)?
        } else {
            None
        };
        *self.slot()? = Some(Session {
            docker,
            config: device.docker,
            digests: Arc::default(),
            _events: events,
            _transport: Arc::new(options.transport),
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.slot().is_ok_and(|s| s.is_some())
    }

    fn list_containers(&self) -> Result<Listing, RuntimeError> {
        let session = self.current()?;
        io_runtime()?
            .block_on(session.listing(&self.ctx.name))
            .inspect_err(|e| self.forget_if_broken(e))
    }

    fn change_container_status(
        &self,
        container: &ManagedContainer,
        action: ContainerAction,
    ) -> Result<(), RuntimeError> {
        let session = self.current()?;
        let id = container.provider_id.as_str();
        match io_runtime()?.block_on(session.act(id, action)) {
            Ok(()) => {}
            // already in the requested state
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => {
                let err = classify(&format!("{action} {id}"), e);
                self.forget_if_broken(&err);
                return Err(err);
            }
        }
        info!(
            "{}: {action} acknowledged for {} ({id})",
            self.ctx.name, container.name
        );
        Ok(())
    }

    fn release(&self) {
        if let Ok(mut slot) = self.slot() {
            if slot.take().is_some() {
                debug!("{}: docker connection released", self.ctx.name);
            }
        }
    }

    fn set_change_hook(&self, hook: ChangeHook) {
        if let Ok(mut slot) = self.hook.lock() {
            *slot = Some(hook);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_label_overrides_default() {
        assert!(is_watched(None, true));
        assert!(!is_watched(None, false));
        assert!(!is_watched(Some("false"), true));
        assert!(is_watched(Some("TRUE"), false));
        assert!(is_watched(Some(""), true));
    }

    #[test]
    fn cpu_percent_from_deltas() {
        let stats: ContainerStatsResponse = serde_json::from_str(
            r#"{
                "cpu_stats": {"cpu_usage": {"total_usage": 300}, "system_cpu_usage": 2000, "online_cpus": 2},
                "precpu_stats": {"cpu_usage": {"total_usage": 100}, "system_cpu_usage": 1000},
                "memory_stats": {"usage": 1048576, "limit": 4194304}
            }"#,
        )
        .unwrap();
        let snap = snapshot(&stats);
        assert!((snap.cpu_percent - 40.0).abs() < f64::EPSILON);
        assert_eq!(snap.memory_usage_bytes, 1_048_576);
        assert_eq!(snap.memory_limit_bytes, 4_194_304);
    }

    #[test]
    fn missing_precpu_yields_zero() {
        let stats: ContainerStatsResponse = serde_json::from_str(r#"{"cpu_stats": {}}"#).unwrap();
        assert!(snapshot(&stats).cpu_percent.abs() < f64::EPSILON);
    }

    #[test]
    fn repository_drops_tag_but_keeps_registry_port() {
        assert_eq!(image_repository("nginx:1.25"), "nginx");
        assert_eq!(image_repository("registry:5000/team/app"), "registry:5000/team/app");
        assert_eq!(image_repository("registry:5000/team/app:2"), "registry:5000/team/app");
        assert_eq!(image_repository("app@sha256:abc"), "app");
    }

    #[test]
    fn local_digest_prefers_own_repository() {
        let digests = vec![
            "mirror.local/nginx@sha256:aaa".to_owned(),
            "nginx@sha256:bbb".to_owned(),
        ];
        assert_eq!(local_digest("nginx:1.25", &digests).as_deref(), Some("sha256:bbb"));
        assert_eq!(
            local_digest("other:1", &digests).as_deref(),
            Some("sha256:aaa")
        );
        assert_eq!(local_digest("nginx", &[]), None);
    }

    #[test]
    fn error_statuses_are_classified() {
        let server = |status_code| DockerError::DockerResponseServerError {
            status_code,
            message: "nope".to_owned(),
        };
        assert!(matches!(classify("x", server(401)), RuntimeError::Credential(_)));
        assert!(matches!(classify("x", server(404)), RuntimeError::NotFound(_)));
        let err = classify("list", server(500));
        assert!(matches!(err, RuntimeError::Provider(_)));
        assert!(err.to_string().contains("HTTP 500: nope"));
    }
}
