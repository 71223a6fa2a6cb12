//! Fleet configuration file: engine settings, vault, devices, registries.

use crate::engine::{EngineOptions, DEFAULT_CHANGE_DEBOUNCE, DEFAULT_POLL_TIMEOUT};
use crate::registries::RegistrySet;
use crate::vault::CommandVault;
use crate::CoreError;
use convoy_remote::RegistryConfig;
use convoy_runtime::{ConnectionResolver, StaticDirectory};
use convoy_schema::{parse_interval, Device, DeviceAuth, DeviceUuid, PassthroughVault, Vault};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn default_poll_timeout() -> u64 {
    DEFAULT_POLL_TIMEOUT.as_secs()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_change_debounce() -> u64 {
    DEFAULT_CHANGE_DEBOUNCE.as_secs()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Interval for devices that configure none.
    #[serde(default)]
    pub default_interval: Option<String>,
    /// Seconds between a runtime event and the poll it triggers.
    #[serde(default = "default_change_debounce")]
    pub change_debounce_secs: u64,
    /// Ask registries whether newer images exist for watched containers.
    #[serde(default)]
    pub check_updates: bool,
    #[serde(default)]
    pub store: Option<PathBuf>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            poll_timeout_secs: default_poll_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            default_interval: None,
            change_debounce_secs: default_change_debounce(),
            check_updates: false,
            store: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSection {
    /// Decryption command; secrets are stored in clear when empty.
    #[serde(default)]
    pub command: Vec<String>,
}

/// A device together with its credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    #[serde(flatten)]
    pub device: Device,
    #[serde(default)]
    pub auth: DeviceAuth,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub vault: VaultSection,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub registries: Vec<RegistryConfig>,
}

impl FleetConfig {
    pub fn parse(content: &str) -> Result<Self, CoreError> {
        let config: Self =
            toml::from_str(content).map_err(|e| CoreError::Config(format!("invalid fleet file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.engine.poll_timeout_secs == 0 {
            return Err(CoreError::Config(
                "engine.poll_timeout_secs must be positive".to_owned(),
            ));
        }
        if let Some(expr) = &self.engine.default_interval {
            parse_interval(expr)?;
        }
        let mut seen = HashSet::new();
        for entry in &self.devices {
            if entry.device.uuid.is_empty() {
                return Err(CoreError::Config("device without uuid".to_owned()));
            }
            if !seen.insert(entry.device.uuid.clone()) {
                return Err(CoreError::Config(format!(
                    "device '{}' is listed twice",
                    entry.device.uuid
                )));
            }
        }
        Ok(())
    }

    pub fn device(&self, uuid: &DeviceUuid) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.device.uuid == *uuid)
    }

    pub fn vault(&self) -> Result<Arc<dyn Vault>, CoreError> {
        if self.vault.command.is_empty() {
            Ok(Arc::new(PassthroughVault))
        } else {
            Ok(Arc::new(CommandVault::new(self.vault.command.clone())?))
        }
    }

    pub fn directory(&self) -> StaticDirectory {
        StaticDirectory::with_devices(
            self.devices
                .iter()
                .map(|d| (d.device.clone(), d.auth.clone())),
        )
    }

    pub fn resolver(&self, vault: Arc<dyn Vault>) -> ConnectionResolver {
        ConnectionResolver::new(vault).with_timeouts(
            Duration::from_secs(self.engine.connect_timeout_secs),
            Duration::from_secs(self.engine.request_timeout_secs),
        )
    }

    /// Validate and decrypt the configured registries into a chain.
    pub fn registry_set(&self, vault: &dyn Vault) -> Result<RegistrySet, CoreError> {
        Ok(RegistrySet::from_configs(
            &self.registries,
            vault,
            Duration::from_secs(self.engine.request_timeout_secs),
        )?
        .with_update_checks(self.engine.check_updates))
    }

    /// Engine options from `[engine]`; events and registries are defaults.
    pub fn engine_options(&self) -> Result<EngineOptions, CoreError> {
        let mut options = EngineOptions {
            poll_timeout: Duration::from_secs(self.engine.poll_timeout_secs),
            change_debounce: Duration::from_secs(self.engine.change_debounce_secs),
            ..EngineOptions::default()
        };
        if let Some(expr) = &self.engine.default_interval {
            options.default_interval = parse_interval(expr)?;
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_runtime::DeviceDirectory;
    use convoy_schema::{DockerMethod, ProxmoxCredentials, WatcherKind};

    const FLEET: &str = r#"
[engine]
poll_timeout_secs = 20
default_interval = "2m"
check_updates = true

[[devices]]
uuid = "d1"
ip = "10.0.0.5"
capabilities = { docker = true, proxmox = true }

[devices.docker]
interval = "30s"
watch_stats = true

[devices.auth.docker]
method = "tcp"

[devices.auth.proxmox]
ignore_ssl_errors = true
credentials = { type = "token", token_id = "root@pam!convoy", secret = { ciphertext = "s3cret", vault_id = "main" } }

[[devices]]
uuid = "d2"
ip = "10.0.0.6"
enabled = false

[[registries]]
name = "ghcr"
provider = "ghcr"

[registries.credentials]
username = { ciphertext = "bot", vault_id = "main" }
token = { ciphertext = "ghp_x", vault_id = "main" }
"#;

    #[test]
    fn parses_full_fleet() {
        let fleet = FleetConfig::parse(FLEET).unwrap();
        assert_eq!(fleet.engine.poll_timeout_secs, 20);
        assert_eq!(fleet.engine.connect_timeout_secs, 10);
        assert_eq!(fleet.engine.change_debounce_secs, 5);
        assert!(fleet.engine.check_updates);
        assert_eq!(fleet.devices.len(), 2);

        let d1 = fleet.device(&DeviceUuid::new("d1")).unwrap();
        assert_eq!(
            d1.device.capabilities.kinds(),
            vec![WatcherKind::Docker, WatcherKind::Proxmox]
        );
        assert!(d1.device.docker.watch_stats);
        assert!(d1.device.docker.watch_all);
        assert_eq!(d1.auth.docker.method, DockerMethod::Tcp);
        assert!(matches!(
            d1.auth.proxmox.credentials,
            Some(ProxmoxCredentials::Token { .. })
        ));
        assert!(!fleet.devices[1].device.enabled);
        assert_eq!(fleet.registries[0].credentials.len(), 2);
    }

    #[test]
    fn engine_options_follow_config() {
        let fleet = FleetConfig::parse(FLEET).unwrap();
        let options = fleet.engine_options().unwrap();
        assert_eq!(options.poll_timeout, Duration::from_secs(20));
        assert_eq!(options.default_interval, Duration::from_secs(120));
    }

    #[test]
    fn directory_watches_enabled_devices() {
        let fleet = FleetConfig::parse(FLEET).unwrap();
        let directory = fleet.directory();
        let watched = directory.devices_to_watch().unwrap();
        assert_eq!(watched.len(), 1);
        assert_eq!(watched[0].uuid, "d1");
    }

    #[test]
    fn registries_build_a_chain() {
        let fleet = FleetConfig::parse(FLEET).unwrap();
        let vault = fleet.vault().unwrap();
        let set = fleet.registry_set(&*vault).unwrap();
        assert_eq!(set.current().unwrap().names(), vec!["ghcr", "hub"]);
        assert!(set.checks_updates());
    }

    #[test]
    fn rejects_duplicate_devices() {
        let err = FleetConfig::parse(
            "[[devices]]\nuuid = \"d1\"\nip = \"a\"\n[[devices]]\nuuid = \"d1\"\nip = \"b\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn rejects_bad_default_interval() {
        assert!(FleetConfig::parse("[engine]\ndefault_interval = \"soon\"\n").is_err());
    }

    #[test]
    fn empty_file_is_an_empty_fleet() {
        let fleet = FleetConfig::parse("").unwrap();
        assert!(fleet.devices.is_empty());
        assert_eq!(fleet.engine, EngineSection::default());
    }
}
