pub mod action;
pub mod doctor;
pub mod list;
pub mod poll;
pub mod registries;
pub mod run;
pub mod watchers;

use convoy_core::{CoreError, EventSink, FleetConfig, InventoryLock, WatcherEngine};
use convoy_runtime::{DeviceDirectory, ProviderWatcherFactory, WatcherFactory};
use convoy_schema::{DockerMethod, ProxmoxMethod, SshAuth, SshAuthType};
use convoy_store::{ContainerRepository, InventoryStore, StoreLayout};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

pub const DEFAULT_STORE: &str = "~/.local/share/convoy";

/// Flags shared by every command.
#[derive(Debug, Clone)]
pub struct Globals {
    pub config: PathBuf,
    pub store: Option<String>,
    pub json: bool,
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Watcher lifecycle states.
pub fn colorize_state(state: &str) -> String {
    use console::Style;
    match state {
        "watching" => Style::new().green().apply_to(state).to_string(),
        "polling" => Style::new().cyan().bold().apply_to(state).to_string(),
        "connecting" => Style::new().yellow().apply_to(state).to_string(),
        "error" => Style::new().red().bold().apply_to(state).to_string(),
        "stopped" => Style::new().dim().apply_to(state).to_string(),
        other => other.to_owned(),
    }
}

/// Container statuses as reported by the runtimes.
pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "running" => Style::new().green().apply_to(status).to_string(),
        "paused" | "restarting" => Style::new().yellow().apply_to(status).to_string(),
        "exited" | "stopped" | "dead" => Style::new().dim().apply_to(status).to_string(),
        "unreachable" => Style::new().red().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn config_error(err: CoreError) -> String {
    match err {
        CoreError::Config(msg) => format!("config error: {msg}"),
        other => format!("config error: {other}"),
    }
}

/// Load the fleet file. Commands that can work without one get an empty
/// fleet when the file does not exist.
pub fn load_fleet(path: &Path, required: bool) -> Result<FleetConfig, String> {
    if !required && !path.exists() {
        debug!("{} not found, using an empty fleet", path.display());
        return Ok(FleetConfig::default());
    }
    FleetConfig::load(path).map_err(config_error)
}

/// `--store`, then `CONVOY_STORE`, then `engine.store`, then the default.
pub fn store_path(globals: &Globals, fleet: &FleetConfig) -> PathBuf {
    if let Some(flag) = &globals.store {
        return expand_tilde(flag);
    }
    if let Ok(env) = std::env::var("CONVOY_STORE") {
        if !env.trim().is_empty() {
            return expand_tilde(&env);
        }
    }
    if let Some(configured) = &fleet.engine.store {
        return expand_tilde(&configured.to_string_lossy());
    }
    expand_tilde(DEFAULT_STORE)
}

pub fn open_store(path: &Path) -> Result<Arc<InventoryStore>, String> {
    InventoryStore::open(path)
        .map(Arc::new)
        .map_err(|e| format!("store error: {e}"))
}

/// Exclusive lock held while a command writes the inventory.
pub fn lock_store(path: &Path) -> Result<InventoryLock, String> {
    let lock_file = StoreLayout::new(path).lock_file();
    match InventoryLock::try_claim(&lock_file) {
        Ok(Some(lock)) => Ok(lock),
        Ok(None) => Err(match InventoryLock::holder(&lock_file) {
            Some(pid) => format!(
                "store lock: {} is in use by convoy process {pid}",
                path.display()
            ),
            None => format!(
                "store lock: {} is in use by another convoy process",
                path.display()
            ),
        }),
        Err(e) => Err(format!("store lock: {e}")),
    }
}

/// Wire the fleet's directory, vault, resolver and registries into an
/// engine persisting to `store`.
pub fn build_engine(
    fleet: &FleetConfig,
    store: Arc<InventoryStore>,
    events: Arc<dyn EventSink>,
    initial_poll: bool,
) -> Result<Arc<WatcherEngine>, String> {
    let vault = fleet.vault().map_err(config_error)?;
    let registries = fleet.registry_set(vault.as_ref()).map_err(config_error)?;
    let directory: Arc<dyn DeviceDirectory> = Arc::new(fleet.directory());
    let resolver = Arc::new(fleet.resolver(vault));
    let factory: Arc<dyn WatcherFactory> =
        Arc::new(ProviderWatcherFactory::new(Arc::clone(&directory), resolver));

    let mut options = fleet.engine_options().map_err(config_error)?;
    options.initial_poll = initial_poll;
    options.events = events;
    options.registries = Arc::new(registries);

    let repository: Arc<dyn ContainerRepository> = store;
    Ok(WatcherEngine::new(directory, factory, repository, options))
}

fn needs_sshpass(ssh: Option<&SshAuth>) -> bool {
    ssh.is_some_and(|s| s.auth_type == SshAuthType::Password || s.key_passphrase.is_some())
}

/// Whether any enabled device is reached over ssh, and whether one of them
/// authenticates with a password or passphrase.
pub fn tunnel_requirements(fleet: &FleetConfig) -> Option<bool> {
    let mut tunnels = false;
    let mut password = false;
    for entry in fleet.devices.iter().filter(|d| d.device.enabled) {
        let caps = &entry.device.capabilities;
        if caps.docker && entry.auth.docker.method == DockerMethod::Tunnel {
            tunnels = true;
            password |= needs_sshpass(entry.auth.docker_ssh());
        }
        if caps.proxmox && entry.auth.proxmox.method == ProxmoxMethod::Tunnel {
            tunnels = true;
            password |= needs_sshpass(entry.auth.ssh.as_ref());
        }
    }
    tunnels.then_some(password)
}

/// Fail early when tunneled devices need tools the host lacks.
pub fn ensure_prereqs(fleet: &FleetConfig) -> Result<(), String> {
    if std::env::var("CONVOY_SKIP_PREREQS").as_deref() == Ok("1") {
        return Ok(());
    }
    let Some(password_auth) = tunnel_requirements(fleet) else {
        return Ok(());
    };
    let missing = convoy_runtime::check_tunnel_prereqs(password_auth);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(convoy_runtime::format_missing(&missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TUNNELED: &str = r#"
[[devices]]
uuid = "d1"
ip = "10.0.0.5"
capabilities = { docker = true }

[devices.auth.ssh]
user = "root"
auth_type = "password"
password = { ciphertext = "pw", vault_id = "main" }

[[devices]]
uuid = "d2"
ip = "10.0.0.6"
capabilities = { proxmox = true }
"#;

    fn globals(store: Option<&str>) -> Globals {
        Globals {
            config: PathBuf::from("convoy.toml"),
            store: store.map(str::to_owned),
            json: false,
        }
    }

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn colorize_keeps_the_word() {
        for state in ["watching", "polling", "connecting", "error", "stopped"] {
            assert!(colorize_state(state).contains(state));
        }
        assert_eq!(colorize_state("created"), "created");
        assert!(colorize_status("unreachable").contains("unreachable"));
        assert_eq!(colorize_status("migrating"), "migrating");
    }

    #[test]
    fn exit_codes_are_distinct() {
        assert_ne!(EXIT_SUCCESS, EXIT_FAILURE);
        assert_ne!(EXIT_FAILURE, EXIT_CONFIG_ERROR);
        assert_ne!(EXIT_CONFIG_ERROR, EXIT_STORE_ERROR);
    }

    #[test]
    fn store_flag_wins_over_config() {
        let mut fleet = FleetConfig::default();
        fleet.engine.store = Some(PathBuf::from("/srv/convoy"));
        assert_eq!(
            store_path(&globals(Some("/tmp/flag")), &fleet),
            PathBuf::from("/tmp/flag")
        );
    }

    #[test]
    fn missing_optional_fleet_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = load_fleet(&dir.path().join("absent.toml"), false).unwrap();
        assert!(fleet.devices.is_empty());
        let err = load_fleet(&dir.path().join("absent.toml"), true).unwrap_err();
        assert!(err.starts_with("config error:"), "{err}");
    }

    #[test]
    fn tunnel_requirements_detect_password_auth() {
        let fleet = FleetConfig::parse(TUNNELED).unwrap();
        assert_eq!(tunnel_requirements(&fleet), Some(true));
        assert_eq!(tunnel_requirements(&FleetConfig::default()), None);
    }

    #[test]
    fn lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        StoreLayout::new(dir.path()).initialize().unwrap();
        let _held = lock_store(dir.path()).unwrap();
        let err = lock_store(dir.path()).unwrap_err();
        assert!(err.starts_with("store lock:"), "{err}");
    }

    #[test]
    fn spinner_finishes() {
        let pb = spinner("polling...");
        spin_ok(&pb, "done");
        let pb = spinner("polling...");
        spin_fail(&pb, "failed");
    }
}
