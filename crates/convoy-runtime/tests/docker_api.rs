//! Docker watcher against a fake Engine API reached over plain TCP.

mod common;

use common::FakeApi;
use convoy_runtime::{
    select_watcher, ConnectionResolver, ProviderWatcher, RuntimeError, StaticDirectory,
    WatcherContext,
};
use convoy_schema::{
    ContainerAction, ContainerKind, Device, DeviceAuth, DeviceUuid, DockerAuth, DockerMethod,
    ManagedContainer, ObservedContainer, PassthroughVault, WatcherKind, WatcherName,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CONTAINERS: &str = r#"[
  {"Id": "c-100", "Names": ["/web"], "Image": "nginx:1.25", "State": "running",
   "Labels": {"com.example.team": "ops"}},
  {"Id": "c-200", "Names": ["/db"], "Image": "postgres:16", "State": "exited",
   "Labels": {"wud.display.name": "Primary DB"}},
  {"Id": "c-300", "Names": ["/sidecar"], "Image": "busybox", "State": "running",
   "Labels": {"wud.watch": "false"}}
]"#;

fn watcher(api: &FakeApi, configure: impl FnOnce(&mut Device)) -> Arc<dyn ProviderWatcher> {
    let mut device = Device::new("d1", "127.0.0.1");
    device.capabilities.docker = true;
    configure(&mut device);
    let auth = DeviceAuth {
        docker: DockerAuth {
            method: DockerMethod::Tcp,
            port: Some(api.port),
            ..DockerAuth::default()
        },
        ..DeviceAuth::default()
    };
    let ctx = WatcherContext {
        device_uuid: DeviceUuid::new("d1"),
        name: WatcherName::new("docker-d1"),
        directory: Arc::new(StaticDirectory::with_devices([(device, auth)])),
        resolver: Arc::new(ConnectionResolver::new(Arc::new(PassthroughVault))),
    };
    select_watcher(WatcherKind::Docker, ctx)
}

fn api() -> FakeApi {
    let api = FakeApi::start();
    api.route("GET", "/_ping", 200, "OK");
    api.route("GET", "/containers/json", 200, CONTAINERS);
    api
}

fn row(provider_id: &str) -> ManagedContainer {
    ManagedContainer::from_observed(
        DeviceUuid::new("d1"),
        WatcherName::new("docker-d1"),
        ObservedContainer::new(provider_id, ContainerKind::Container, "web", "running"),
    )
}

#[test]
fn init_pings_the_daemon() {
    let api = api();
    let w = watcher(&api, |_| {});
    w.init_watcher().unwrap();
    assert!(w.is_connected());
    assert_eq!(api.requests_to("GET", "/_ping").len(), 1);
}

#[test]
fn listing_filters_and_names() {
    let api = api();
    let w = watcher(&api, |_| {});
    w.init_watcher().unwrap();
    let listing = w.list_containers().unwrap();

    assert!(!listing.is_partial());
    let ids: Vec<&str> = listing.containers.iter().map(|c| c.provider_id.as_str()).collect();
    assert_eq!(ids, vec!["c-100", "c-200"]);

    let web = &listing.containers[0];
    assert_eq!(web.name, "web");
    assert_eq!(web.status, "running");
    assert_eq!(web.image.as_deref(), Some("nginx:1.25"));
    assert_eq!(web.kind, ContainerKind::Container);
    assert_eq!(web.labels.get("com.example.team").map(String::as_str), Some("ops"));
    assert_eq!(listing.containers[1].name, "Primary DB");

    let list_req = &api.requests_to("GET", "/containers/json")[0];
    assert!(list_req.url.contains("all=true"), "{}", list_req.url);
}

#[test]
fn watch_by_default_off_keeps_only_opted_in() {
    let api = api();
    api.route(
        "GET",
        "/containers/json",
        200,
        r#"[{"Id": "a", "Names": ["/a"], "State": "running", "Labels": {"wud.watch": "true"}},
            {"Id": "b", "Names": ["/b"], "State": "running", "Labels": {}}]"#,
    );
    let w = watcher(&api, |d| {
        d.docker.watch_by_default = false;
        d.docker.watch_all = false;
    });
    w.init_watcher().unwrap();
    let listing = w.list_containers().unwrap();
    assert_eq!(listing.containers.len(), 1);
    assert_eq!(listing.containers[0].provider_id, "a");
    assert!(api.requests_to("GET", "/containers/json")[0]
        .url
        .contains("all=false"));
}

#[test]
fn stats_are_collected_for_running_containers() {
    let api = api();
    api.route(
        "GET",
        "/containers/c-100/stats",
        200,
        r#"{"cpu_stats": {"cpu_usage": {"total_usage": 300}, "system_cpu_usage": 2000, "online_cpus": 1},
            "precpu_stats": {"cpu_usage": {"total_usage": 100}, "system_cpu_usage": 1000},
            "memory_stats": {"usage": 100, "limit": 1000}}"#,
    );
    let w = watcher(&api, |d| d.docker.watch_stats = true);
    w.init_watcher().unwrap();
    let listing = w.list_containers().unwrap();

    let web = &listing.containers[0];
    let stats = web.stats.expect("stats for running container");
    assert!((stats.cpu_percent - 20.0).abs() < 1e-9);
    assert_eq!(stats.memory_limit_bytes, 1000);
    // exited container: no stats request
    assert!(listing.containers[1].stats.is_none());
    assert!(api.requests_to("GET", "/containers/c-200/stats").is_empty());
}

#[test]
fn server_error_fails_the_whole_listing() {
    let api = api();
    api.route("GET", "/containers/json", 500, r#"{"message":"daemon busy"}"#);
    let w = watcher(&api, |_| {});
    w.init_watcher().unwrap();
    let err = w.list_containers().unwrap_err();
    assert!(matches!(err, RuntimeError::Provider(_)), "{err}");
    assert!(err.to_string().contains("daemon busy"));
}

#[test]
fn actions_map_to_engine_endpoints() {
    let api = api();
    api.route("POST", "/containers/c-100/stop", 204, "");
    api.route("POST", "/containers/c-100/restart", 204, "");
    api.route("POST", "/containers/c-100/start", 304, "");
    let w = watcher(&api, |_| {});
    w.init_watcher().unwrap();

    let c = row("c-100");
    w.change_container_status(&c, ContainerAction::Shutdown).unwrap();
    w.change_container_status(&c, ContainerAction::Reboot).unwrap();
    // already running
    w.change_container_status(&c, ContainerAction::Start).unwrap();

    assert_eq!(
        api.paths("POST"),
        vec![
            "/containers/c-100/stop",
            "/containers/c-100/restart",
            "/containers/c-100/start"
        ]
    );
}

#[test]
fn action_on_vanished_container_is_not_found() {
    let api = api();
    let w = watcher(&api, |_| {});
    w.init_watcher().unwrap();
    assert!(matches!(
        w.change_container_status(&row("gone"), ContainerAction::Kill),
        Err(RuntimeError::NotFound(_))
    ));
}

#[test]
fn failed_ping_fails_init() {
    // No /_ping route: the fake answers 404.
    let api = FakeApi::start();
    let w = watcher(&api, |_| {});
    assert!(w.init_watcher().is_err());
    assert!(!w.is_connected());
}

#[test]
fn digests_are_read_once_per_image() {
    let api = api();
    api.route(
        "GET",
        "/containers/json",
        200,
        r#"[{"Id": "c-100", "Names": ["/web"], "Image": "nginx:1.25", "ImageID": "sha256:img1", "State": "running"}]"#,
    );
    api.route(
        "GET",
        "/images/nginx:1.25/json",
        200,
        r#"{"Id": "sha256:img1", "RepoDigests": ["nginx@sha256:0123abcd"]}"#,
    );
    let w = watcher(&api, |d| d.docker.watch_digest = true);
    w.init_watcher().unwrap();

    let first = w.list_containers().unwrap();
    let second = w.list_containers().unwrap();
    assert_eq!(
        first.containers[0].image_digest.as_deref(),
        Some("sha256:0123abcd")
    );
    assert_eq!(first.containers[0].image_digest, second.containers[0].image_digest);
    assert_eq!(api.requests_to("GET", "/images/").len(), 1);
}

#[test]
fn digests_are_skipped_unless_enabled() {
    let api = api();
    let w = watcher(&api, |_| {});
    w.init_watcher().unwrap();
    let listing = w.list_containers().unwrap();
    assert!(listing.containers[0].image_digest.is_none());
    assert!(api.requests_to("GET", "/images/").is_empty());
}

#[test]
fn engine_events_trigger_the_change_hook() {
    let api = api();
    api.route(
        "GET",
        "/events",
        200,
        "{\"Type\":\"container\",\"Action\":\"die\",\"Actor\":{\"ID\":\"c-100\",\"Attributes\":{}},\"time\":1}\n",
    );
    let w = watcher(&api, |d| d.docker.watch_events = true);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    w.set_change_hook(Arc::new(move || {
        seen.fetch_add(1, Ordering::SeqCst);
    }));
    w.init_watcher().unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    while calls.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(calls.load(Ordering::SeqCst) >= 1);
    let subscribe = &api.requests_to("GET", "/events")[0];
    assert!(subscribe.url.contains("filters="), "{}", subscribe.url);
    w.release();
}

#[test]
fn events_are_not_followed_unless_enabled() {
    let api = api();
    let w = watcher(&api, |_| {});
    w.set_change_hook(Arc::new(|| {}));
    w.init_watcher().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert!(api.requests_to("GET", "/events").is_empty());
}
