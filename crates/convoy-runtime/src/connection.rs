//! Connection Resolver: device + device-auth → concrete connection options.
//!
//! Resolution runs in two phases. [`ConnectionResolver::plan`] validates the
//! auth record for the requested runtime and decrypts every secret it needs,
//! without touching the network, so missing material is always reported as
//! [`RuntimeError::Credential`] before any handshake is attempted.
//! [`ConnectionResolver::open`] then starts the transport (an SSH local
//! forward, when the plan needs one) and bounds the handshake by the connect
//! timeout.

use crate::tunnel::SshTunnel;
use crate::RuntimeError;
use convoy_schema::{
    Device, DeviceAuth, DockerMethod, ProxmoxCredentials, ProxmoxMethod, Secret, SshAuth,
    SshAuthType, Vault, VaultSecret, WatcherKind,
};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// PEM client material for TCP+TLS.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub ca: Secret,
    pub cert: Secret,
    pub key: Secret,
}

/// Credentials presented to the runtime API itself.
#[derive(Debug, Clone)]
pub enum ApiAuth {
    None,
    ProxmoxToken { token_id: String, secret: Secret },
    /// `username` is `user@realm`.
    ProxmoxPassword { username: String, password: Secret },
}

#[derive(Debug, Clone)]
pub enum SshCredential {
    /// ssh agent or default identities of the engine host.
    Agent,
    Key {
        key: Secret,
        passphrase: Option<Secret>,
    },
    Password(Secret),
}

/// Remote end of an SSH local forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Forward {
    /// Unix socket path on the device.
    Socket(String),
    /// TCP port on the device's loopback interface.
    Port(u16),
}

#[derive(Debug, Clone)]
pub struct TunnelPlan {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub credential: SshCredential,
    pub forward: Forward,
    pub force_ipv4: bool,
    pub force_ipv6: bool,
}

#[derive(Debug, Clone)]
pub enum TransportPlan {
    Direct { host: String, port: u16 },
    /// Unix socket on the engine host.
    Socket(PathBuf),
    Tunnel(TunnelPlan),
}

/// Validated, decrypted connection parameters. Opening them is the only
/// step that touches the network.
#[derive(Debug, Clone)]
pub struct ConnectionPlan {
    pub target: WatcherKind,
    pub https: bool,
    pub transport: TransportPlan,
    pub tls: Option<TlsMaterial>,
    pub auth: ApiAuth,
    pub accept_invalid_certs: bool,
}

/// Where the runtime client connects once the transport is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16, https: bool },
    /// Unix socket on the engine host: the runtime's own, or the local end
    /// of a tunnel.
    Socket(PathBuf),
}

impl Endpoint {
    /// `scheme://host:port`. Sockets have no URL.
    pub fn url(&self) -> Option<String> {
        match self {
            Endpoint::Tcp { host, port, https } => {
                let scheme = if *https { "https" } else { "http" };
                Some(format!("{scheme}://{}:{port}", url_host(host)))
            }
            Endpoint::Socket(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port, https } => {
                let scheme = if *https { "https" } else { "http" };
                write!(f, "{scheme}://{}:{port}", url_host(host))
            }
            Endpoint::Socket(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Live transport backing a connection. Dropping it tears the transport down.
#[derive(Debug)]
pub enum Transport {
    Direct,
    Tunnel(SshTunnel),
}

#[derive(Debug)]
pub struct ConnectionOptions {
    pub target: WatcherKind,
    pub endpoint: Endpoint,
    pub tls: Option<TlsMaterial>,
    pub auth: ApiAuth,
    pub accept_invalid_certs: bool,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub transport: Transport,
}

pub struct ConnectionResolver {
    vault: Arc<dyn Vault>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl ConnectionResolver {
    pub fn new(vault: Arc<dyn Vault>) -> Self {
        Self {
            vault,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn resolve(
        &self,
        device: &Device,
        auth: &DeviceAuth,
        target: WatcherKind,
    ) -> Result<ConnectionOptions, RuntimeError> {
        let plan = self.plan(device, auth, target)?;
        self.open(plan)
    }

    /// Validate and decrypt. Never touches the network.
    pub fn plan(
        &self,
        device: &Device,
        auth: &DeviceAuth,
        target: WatcherKind,
    ) -> Result<ConnectionPlan, RuntimeError> {
        debug!("planning {target} connection for device {}", device.uuid);
        match target {
            WatcherKind::Docker => self.plan_docker(device, auth),
            WatcherKind::Proxmox => self.plan_proxmox(device, auth),
        }
    }

    fn plan_docker(&self, device: &Device, auth: &DeviceAuth) -> Result<ConnectionPlan, RuntimeError> {
        let docker = &auth.docker;
        let (https, transport, tls) = match docker.method {
            DockerMethod::Socket => (
                false,
                TransportPlan::Socket(PathBuf::from(docker.socket_path())),
                None,
            ),
            DockerMethod::Tcp => (
                false,
                TransportPlan::Direct {
                    host: device.ip.clone(),
                    port: docker.port(),
                },
                None,
            ),
            DockerMethod::Tls => {
                let tls = TlsMaterial {
                    ca: self.require(docker.ca.as_ref(), "docker TLS CA certificate")?,
                    cert: self.require(docker.cert.as_ref(), "docker TLS client certificate")?,
                    key: self.require(docker.key.as_ref(), "docker TLS client key")?,
                };
                (
                    true,
                    TransportPlan::Direct {
                        host: device.ip.clone(),
                        port: docker.port(),
                    },
                    Some(tls),
                )
            }
            DockerMethod::Tunnel => {
                let forward = Forward::Socket(docker.socket_path().to_owned());
                (
                    false,
                    TransportPlan::Tunnel(self.plan_tunnel(device, auth.docker_ssh(), forward)?),
                    None,
                )
            }
        };
        Ok(ConnectionPlan {
            target: WatcherKind::Docker,
            https,
            transport,
            tls,
            auth: ApiAuth::None,
            accept_invalid_certs: false,
        })
    }

    fn plan_proxmox(
        &self,
        device: &Device,
        auth: &DeviceAuth,
    ) -> Result<ConnectionPlan, RuntimeError> {
        let proxmox = &auth.proxmox;
        let api_auth = match &proxmox.credentials {
            None => {
                return Err(RuntimeError::Credential(format!(
                    "device {}: proxmox requires an API token or a user and password",
                    device.uuid
                )))
            }
            Some(ProxmoxCredentials::Token { token_id, secret }) => {
                if token_id.trim().is_empty() {
                    return Err(RuntimeError::Credential(format!(
                        "device {}: proxmox token id is empty",
                        device.uuid
                    )));
                }
                ApiAuth::ProxmoxToken {
                    token_id: token_id.clone(),
                    secret: self.decrypt_non_empty(secret, "proxmox token secret")?,
                }
            }
            Some(ProxmoxCredentials::Password {
                user,
                realm,
                password,
            }) => {
                if user.trim().is_empty() {
                    return Err(RuntimeError::Credential(format!(
                        "device {}: proxmox user is empty",
                        device.uuid
                    )));
                }
                let username = if user.contains('@') {
                    user.clone()
                } else {
                    format!("{user}@{realm}")
                };
                ApiAuth::ProxmoxPassword {
                    username,
                    password: self.decrypt_non_empty(password, "proxmox password")?,
                }
            }
        };

        let transport = match proxmox.method {
            ProxmoxMethod::Direct => TransportPlan::Direct {
                host: device.ip.clone(),
                port: proxmox.port,
            },
            ProxmoxMethod::Tunnel => TransportPlan::Tunnel(self.plan_tunnel(
                device,
                auth.ssh.as_ref(),
                Forward::Port(proxmox.port),
            )?),
        };
        Ok(ConnectionPlan {
            target: WatcherKind::Proxmox,
            https: true,
            transport,
            tls: None,
            auth: api_auth,
            accept_invalid_certs: proxmox.ignore_ssl_errors,
        })
    }

    fn plan_tunnel(
        &self,
        device: &Device,
        ssh: Option<&SshAuth>,
        forward: Forward,
    ) -> Result<TunnelPlan, RuntimeError> {
        let ssh = ssh.ok_or_else(|| {
            RuntimeError::Credential(format!(
                "device {}: tunnel connection without ssh credentials",
                device.uuid
            ))
        })?;
        let user = ssh
            .user
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                RuntimeError::Credential(format!("device {}: ssh user is missing", device.uuid))
            })?;
        if ssh.force_ipv4 && ssh.force_ipv6 {
            return Err(RuntimeError::Credential(format!(
                "device {}: force_ipv4 and force_ipv6 are mutually exclusive",
                device.uuid
            )));
        }

        let credential = match ssh.auth_type {
            SshAuthType::Passwordless => SshCredential::Agent,
            SshAuthType::Key => {
                let key = self.require(ssh.private_key.as_ref(), "ssh private key")?;
                let passphrase = ssh
                    .key_passphrase
                    .as_ref()
                    .map(|p| self.vault.decrypt(p))
                    .transpose()?
                    .filter(|p| !p.is_empty());
                SshCredential::Key { key, passphrase }
            }
            SshAuthType::Password => {
                SshCredential::Password(self.require(ssh.password.as_ref(), "ssh password")?)
            }
        };

        Ok(TunnelPlan {
            host: device.ip.clone(),
            user: user.to_owned(),
            port: ssh.port,
            credential,
            forward,
            force_ipv4: ssh.force_ipv4,
            force_ipv6: ssh.force_ipv6,
        })
    }

    fn require(&self, secret: Option<&VaultSecret>, what: &str) -> Result<Secret, RuntimeError> {
        let secret =
            secret.ok_or_else(|| RuntimeError::Credential(format!("{what} is missing")))?;
        self.decrypt_non_empty(secret, what)
    }

    fn decrypt_non_empty(&self, secret: &VaultSecret, what: &str) -> Result<Secret, RuntimeError> {
        let plain = self.vault.decrypt(secret)?;
        if plain.is_empty() {
            return Err(RuntimeError::Credential(format!("{what} is empty")));
        }
        Ok(plain)
    }

    /// Start the planned transport and settle the endpoint.
    pub fn open(&self, plan: ConnectionPlan) -> Result<ConnectionOptions, RuntimeError> {
        let (endpoint, transport) = match &plan.transport {
            TransportPlan::Direct { host, port } => (
                Endpoint::Tcp {
                    host: host.clone(),
                    port: *port,
                    https: plan.https,
                },
                Transport::Direct,
            ),
            TransportPlan::Socket(path) => (Endpoint::Socket(path.clone()), Transport::Direct),
            TransportPlan::Tunnel(tunnel) => {
                let tunnel = SshTunnel::open(tunnel, self.connect_timeout)?;
                (tunnel.endpoint(plan.https), Transport::Tunnel(tunnel))
            }
        };
        debug!("{} endpoint: {endpoint}", plan.target);
        Ok(ConnectionOptions {
            target: plan.target,
            endpoint,
            tls: plan.tls,
            auth: plan.auth,
            accept_invalid_certs: plan.accept_invalid_certs,
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            transport,
        })
    }
}

/// Bracket IPv6 literals for use in a URL authority.
fn url_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_schema::{DockerAuth, PassthroughVault, ProxmoxAuth, VaultError};

    fn resolver() -> ConnectionResolver {
        ConnectionResolver::new(Arc::new(PassthroughVault))
    }

    fn secret(v: &str) -> VaultSecret {
        VaultSecret::new(v, "default")
    }

    fn device() -> Device {
        Device::new("d1", "192.0.2.10")
    }

    fn tunnel_auth(ssh: SshAuth) -> DeviceAuth {
        DeviceAuth {
            ssh: Some(ssh),
            ..DeviceAuth::default()
        }
    }

    #[test]
    fn tunnel_without_key_is_a_credential_error() {
        let auth = tunnel_auth(SshAuth {
            user: Some("root".to_owned()),
            ..SshAuth::default()
        });
        let err = resolver()
            .resolve(&device(), &auth, WatcherKind::Docker)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Credential(_)), "{err}");
    }

    #[test]
    fn tunnel_without_password_is_a_credential_error() {
        let auth = tunnel_auth(SshAuth {
            user: Some("root".to_owned()),
            auth_type: SshAuthType::Password,
            ..SshAuth::default()
        });
        assert!(matches!(
            resolver().resolve(&device(), &auth, WatcherKind::Docker),
            Err(RuntimeError::Credential(_))
        ));
    }

    #[test]
    fn tunnel_without_ssh_section_is_a_credential_error() {
        assert!(matches!(
            resolver().plan(&device(), &DeviceAuth::default(), WatcherKind::Docker),
            Err(RuntimeError::Credential(_))
        ));
    }

    #[test]
    fn docker_ssh_override_is_used_for_the_tunnel() {
        let auth = DeviceAuth {
            docker: DockerAuth {
                ssh: Some(SshAuth {
                    user: Some("deploy".to_owned()),
                    auth_type: SshAuthType::Passwordless,
                    ..SshAuth::default()
                }),
                ..DockerAuth::default()
            },
            ..DeviceAuth::default()
        };
        let plan = resolver().plan(&device(), &auth, WatcherKind::Docker).unwrap();
        match plan.transport {
            TransportPlan::Tunnel(t) => {
                assert_eq!(t.user, "deploy");
                assert_eq!(t.forward, Forward::Socket("/var/run/docker.sock".to_owned()));
                assert!(matches!(t.credential, SshCredential::Agent));
            }
            other => panic!("expected tunnel, got {other:?}"),
        }
    }

    #[test]
    fn tls_requires_the_full_triplet() {
        let mut auth = DeviceAuth {
            docker: DockerAuth {
                method: DockerMethod::Tls,
                ca: Some(secret("ca")),
                cert: Some(secret("cert")),
                ..DockerAuth::default()
            },
            ..DeviceAuth::default()
        };
        let err = resolver()
            .plan(&device(), &auth, WatcherKind::Docker)
            .unwrap_err();
        assert!(err.to_string().contains("client key"), "{err}");

        auth.docker.key = Some(secret("key"));
        let plan = resolver().plan(&device(), &auth, WatcherKind::Docker).unwrap();
        assert!(plan.https);
        assert!(plan.tls.is_some());
    }

    #[test]
    fn tcp_builds_plain_url() {
        let auth = DeviceAuth {
            docker: DockerAuth {
                method: DockerMethod::Tcp,
                ..DockerAuth::default()
            },
            ..DeviceAuth::default()
        };
        let opts = resolver()
            .resolve(&device(), &auth, WatcherKind::Docker)
            .unwrap();
        assert_eq!(opts.endpoint.url().as_deref(), Some("http://192.0.2.10:2375"));
        assert!(matches!(opts.transport, Transport::Direct));
    }

    #[test]
    fn socket_method_connects_to_the_socket_itself() {
        let auth = DeviceAuth {
            docker: DockerAuth {
                method: DockerMethod::Socket,
                socket_path: Some("/run/user/1000/docker.sock".to_owned()),
                ..DockerAuth::default()
            },
            ..DeviceAuth::default()
        };
        let opts = resolver()
            .resolve(&device(), &auth, WatcherKind::Docker)
            .unwrap();
        assert_eq!(
            opts.endpoint,
            Endpoint::Socket(PathBuf::from("/run/user/1000/docker.sock"))
        );
        assert_eq!(opts.endpoint.url(), None);
        assert_eq!(opts.endpoint.to_string(), "unix:///run/user/1000/docker.sock");
        assert!(matches!(opts.transport, Transport::Direct));
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        assert_eq!(url_host("fd00::5"), "[fd00::5]");
        assert_eq!(url_host("10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn proxmox_requires_credentials() {
        let err = resolver()
            .plan(&device(), &DeviceAuth::default(), WatcherKind::Proxmox)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Credential(_)));
    }

    #[test]
    fn proxmox_password_user_gets_realm() {
        let auth = DeviceAuth {
            proxmox: ProxmoxAuth {
                credentials: Some(ProxmoxCredentials::Password {
                    user: "root".to_owned(),
                    realm: "pam".to_owned(),
                    password: secret("pw"),
                }),
                ignore_ssl_errors: true,
                ..ProxmoxAuth::default()
            },
            ..DeviceAuth::default()
        };
        let opts = resolver()
            .resolve(&device(), &auth, WatcherKind::Proxmox)
            .unwrap();
        assert_eq!(opts.endpoint.url().as_deref(), Some("https://192.0.2.10:8006"));
        assert!(opts.accept_invalid_certs);
        match opts.auth {
            ApiAuth::ProxmoxPassword { username, .. } => assert_eq!(username, "root@pam"),
            other => panic!("unexpected {other:?}"),
        }
    }

    struct DenyVault;

    impl Vault for DenyVault {
        fn decrypt(&self, secret: &VaultSecret) -> Result<Secret, VaultError> {
            Err(VaultError::Decrypt {
                vault_id: secret.vault_id.clone(),
                reason: "sealed".to_owned(),
            })
        }
    }

    #[test]
    fn vault_failures_propagate() {
        let auth = DeviceAuth {
            proxmox: ProxmoxAuth {
                credentials: Some(ProxmoxCredentials::Token {
                    token_id: "root@pam!convoy".to_owned(),
                    secret: secret("x"),
                }),
                ..ProxmoxAuth::default()
            },
            ..DeviceAuth::default()
        };
        let resolver = ConnectionResolver::new(Arc::new(DenyVault));
        assert!(matches!(
            resolver.plan(&device(), &auth, WatcherKind::Proxmox),
            Err(RuntimeError::Vault(_))
        ));
    }
}
