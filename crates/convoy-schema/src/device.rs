//! Device and device-auth records consumed read-only by the engine.

use crate::secret::VaultSecret;
use crate::types::DeviceUuid;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Runtime kind a watcher talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherKind {
    Docker,
    Proxmox,
}

impl WatcherKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WatcherKind::Docker => "docker",
            WatcherKind::Proxmox => "proxmox",
        }
    }
}

impl fmt::Display for WatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub docker: bool,
    #[serde(default)]
    pub proxmox: bool,
}

impl Capabilities {
    /// Enabled runtime kinds, in registration order.
    pub fn kinds(&self) -> Vec<WatcherKind> {
        let mut kinds = Vec::new();
        if self.docker {
            kinds.push(WatcherKind::Docker);
        }
        if self.proxmox {
            kinds.push(WatcherKind::Proxmox);
        }
        kinds
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerWatchConfig {
    /// Polling interval expression (`"*/5 * * * *"`, `"30s"`, ...).
    #[serde(default)]
    pub interval: Option<String>,
    /// List stopped containers as well as running ones.
    #[serde(default = "default_true")]
    pub watch_all: bool,
    /// Watch containers that carry no `wud.watch` label.
    #[serde(default = "default_true")]
    pub watch_by_default: bool,
    #[serde(default)]
    pub watch_stats: bool,
    /// Poll shortly after the daemon reports a container lifecycle event.
    #[serde(default)]
    pub watch_events: bool,
    /// Record the local image digest of containers running non-version tags.
    #[serde(default)]
    pub watch_digest: bool,
}

impl Default for DockerWatchConfig {
    fn default() -> Self {
        Self {
            interval: None,
            watch_all: true,
            watch_by_default: true,
            watch_stats: false,
            watch_events: false,
            watch_digest: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxmoxWatchConfig {
    #[serde(default)]
    pub interval: Option<String>,
    /// Report guest CPU and memory usage. Usage changes on every poll, so
    /// each poll rewrites every running guest while this is on.
    #[serde(default)]
    pub watch_stats: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub uuid: DeviceUuid,
    pub ip: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub docker: DockerWatchConfig,
    #[serde(default)]
    pub proxmox: ProxmoxWatchConfig,
}

impl Device {
    pub fn new(uuid: impl Into<DeviceUuid>, ip: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            ip: ip.into(),
            enabled: true,
            capabilities: Capabilities::default(),
            docker: DockerWatchConfig::default(),
            proxmox: ProxmoxWatchConfig::default(),
        }
    }

    /// Configured interval expression for one runtime kind, if any.
    pub fn interval_for(&self, kind: WatcherKind) -> Option<&str> {
        match kind {
            WatcherKind::Docker => self.docker.interval.as_deref(),
            WatcherKind::Proxmox => self.proxmox.interval.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SshAuthType {
    #[default]
    Key,
    Password,
    /// Rely on the ssh agent or the default identities of the host.
    Passwordless,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshAuth {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub auth_type: SshAuthType,
    #[serde(default)]
    pub password: Option<VaultSecret>,
    #[serde(default)]
    pub private_key: Option<VaultSecret>,
    #[serde(default)]
    pub key_passphrase: Option<VaultSecret>,
    #[serde(default)]
    pub force_ipv4: bool,
    #[serde(default)]
    pub force_ipv6: bool,
}

impl Default for SshAuth {
    fn default() -> Self {
        Self {
            user: None,
            port: default_ssh_port(),
            auth_type: SshAuthType::default(),
            password: None,
            private_key: None,
            key_passphrase: None,
            force_ipv4: false,
            force_ipv6: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DockerMethod {
    /// Unix socket on the host running the engine.
    Socket,
    Tcp,
    Tls,
    #[default]
    Tunnel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerAuth {
    #[serde(default)]
    pub method: DockerMethod,
    #[serde(default)]
    pub socket_path: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub ca: Option<VaultSecret>,
    #[serde(default)]
    pub cert: Option<VaultSecret>,
    #[serde(default)]
    pub key: Option<VaultSecret>,
    /// Tunnel credentials that replace the device-level ssh section.
    #[serde(default)]
    pub ssh: Option<SshAuth>,
}

impl DockerAuth {
    pub const DEFAULT_SOCKET: &'static str = "/var/run/docker.sock";

    pub fn socket_path(&self) -> &str {
        self.socket_path.as_deref().unwrap_or(Self::DEFAULT_SOCKET)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.method {
            DockerMethod::Tls => 2376,
            _ => 2375,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxmoxMethod {
    #[default]
    Direct,
    Tunnel,
}

fn default_realm() -> String {
    "pam".to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProxmoxCredentials {
    /// API token, `USER@REALM!TOKENID` plus its secret.
    Token {
        token_id: String,
        secret: VaultSecret,
    },
    Password {
        user: String,
        #[serde(default = "default_realm")]
        realm: String,
        password: VaultSecret,
    },
}

fn default_proxmox_port() -> u16 {
    8006
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxmoxAuth {
    #[serde(default)]
    pub method: ProxmoxMethod,
    #[serde(default = "default_proxmox_port")]
    pub port: u16,
    #[serde(default)]
    pub credentials: Option<ProxmoxCredentials>,
    #[serde(default)]
    pub ignore_ssl_errors: bool,
}

impl Default for ProxmoxAuth {
    fn default() -> Self {
        Self {
            method: ProxmoxMethod::default(),
            port: default_proxmox_port(),
            credentials: None,
            ignore_ssl_errors: false,
        }
    }
}

/// Per-device credential bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAuth {
    #[serde(default)]
    pub ssh: Option<SshAuth>,
    #[serde(default)]
    pub docker: DockerAuth,
    #[serde(default)]
    pub proxmox: ProxmoxAuth,
}

impl DeviceAuth {
    /// SSH credentials used to tunnel to the docker daemon: the docker
    /// override when present, the device-level section otherwise.
    pub fn docker_ssh(&self) -> Option<&SshAuth> {
        self.docker.ssh.as_ref().or(self.ssh.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_kinds_order() {
        let caps = Capabilities {
            docker: true,
            proxmox: true,
        };
        assert_eq!(caps.kinds(), vec![WatcherKind::Docker, WatcherKind::Proxmox]);
        assert!(Capabilities::default().kinds().is_empty());
    }

    #[test]
    fn device_defaults_from_minimal_toml() {
        let device: Device = toml::from_str(
            r#"
uuid = "d1"
ip = "10.0.0.5"
[capabilities]
docker = true
"#,
        )
        .unwrap();
        assert!(device.enabled);
        assert!(device.docker.watch_all);
        assert!(device.docker.watch_by_default);
        assert!(!device.docker.watch_stats);
        assert!(!device.docker.watch_digest);
        assert!(!device.proxmox.watch_stats);
        assert_eq!(device.interval_for(WatcherKind::Docker), None);
    }

    #[test]
    fn docker_ports_follow_method() {
        let mut auth = DockerAuth {
            method: DockerMethod::Tcp,
            ..DockerAuth::default()
        };
        assert_eq!(auth.port(), 2375);
        auth.method = DockerMethod::Tls;
        assert_eq!(auth.port(), 2376);
        auth.port = Some(12376);
        assert_eq!(auth.port(), 12376);
        assert_eq!(auth.socket_path(), "/var/run/docker.sock");
    }

    #[test]
    fn docker_ssh_override_wins() {
        let auth = DeviceAuth {
            ssh: Some(SshAuth {
                user: Some("root".to_owned()),
                ..SshAuth::default()
            }),
            docker: DockerAuth {
                ssh: Some(SshAuth {
                    user: Some("deploy".to_owned()),
                    ..SshAuth::default()
                }),
                ..DockerAuth::default()
            },
            ..DeviceAuth::default()
        };
        assert_eq!(auth.docker_ssh().unwrap().user.as_deref(), Some("deploy"));
    }

    #[test]
    fn proxmox_credentials_tagged() {
        let auth: ProxmoxAuth = toml::from_str(
            r#"
[credentials]
type = "password"
user = "root"
password = { ciphertext = "x", vault_id = "default" }
"#,
        )
        .unwrap();
        assert_eq!(auth.port, 8006);
        match auth.credentials.unwrap() {
            ProxmoxCredentials::Password { user, realm, .. } => {
                assert_eq!(user, "root");
                assert_eq!(realm, "pam");
            }
            ProxmoxCredentials::Token { .. } => panic!("expected password credentials"),
        }
    }
}
