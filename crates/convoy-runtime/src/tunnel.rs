//! SSH local forwards to a device.
//!
//! A remote Unix socket (the Docker API) is forwarded to a socket inside a
//! private directory on the engine host; a remote TCP port (Proxmox) is
//! forwarded to a loopback port.

use crate::connection::{Endpoint, Forward, SshCredential, TunnelPlan};
use crate::RuntimeError;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::{NamedTempFile, TempDir};
use tracing::debug;

const READY_POLL: Duration = Duration::from_millis(100);
const LOCAL_SOCKET: &str = "docker.sock";

/// Reserve a free loopback port. The port is released again before use;
/// a race with another process is reported as a connectivity error by
/// ssh (`ExitOnForwardFailure`).
fn free_local_port() -> Result<u16, RuntimeError> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Directory only the engine user can enter, holding a forwarded socket.
fn private_socket_dir() -> Result<TempDir, RuntimeError> {
    // TempDir is created with mode 0700.
    Ok(tempfile::Builder::new().prefix("convoy-tunnel-").tempdir()?)
}

/// Local end of a forward.
#[derive(Debug)]
enum LocalEnd {
    Port(u16),
    /// The socket goes away with its directory.
    Socket { _dir: TempDir, path: PathBuf },
}

impl LocalEnd {
    fn for_forward(forward: &Forward) -> Result<Self, RuntimeError> {
        match forward {
            Forward::Port(_) => Ok(LocalEnd::Port(free_local_port()?)),
            Forward::Socket(_) => {
                let dir = private_socket_dir()?;
                let path = dir.path().join(LOCAL_SOCKET);
                Ok(LocalEnd::Socket { _dir: dir, path })
            }
        }
    }

    /// `ssh -L` listen spec.
    fn spec(&self) -> String {
        match self {
            LocalEnd::Port(port) => format!("127.0.0.1:{port}"),
            LocalEnd::Socket { path, .. } => path.display().to_string(),
        }
    }

    fn accepts(&self) -> bool {
        match self {
            LocalEnd::Port(port) => {
                let addr = SocketAddr::from(([127, 0, 0, 1], *port));
                TcpStream::connect_timeout(&addr, READY_POLL).is_ok()
            }
            LocalEnd::Socket { path, .. } => UnixStream::connect(path).is_ok(),
        }
    }
}

/// `ssh -N -L` child process forwarding a local endpoint to the device.
#[derive(Debug)]
pub struct SshTunnel {
    child: Child,
    local: LocalEnd,
    /// Private key material; removed from disk on drop.
    _key_file: Option<NamedTempFile>,
}

impl SshTunnel {
    pub fn open(plan: &TunnelPlan, timeout: Duration) -> Result<Self, RuntimeError> {
        let local = LocalEnd::for_forward(&plan.forward)?;

        let key_file = match &plan.credential {
            SshCredential::Key { key, .. } => Some(write_key_file(key.expose())?),
            _ => None,
        };
        let key_path = key_file.as_ref().map(NamedTempFile::path);
        let args = ssh_args(plan, &local.spec(), key_path, timeout);

        let mut cmd = match &plan.credential {
            SshCredential::Password(password) => {
                let mut c = Command::new("sshpass");
                c.arg("-e").arg("ssh").env("SSHPASS", password.expose());
                c
            }
            SshCredential::Key {
                passphrase: Some(passphrase),
                ..
            } => {
                let mut c = Command::new("sshpass");
                c.args(["-e", "-P", "passphrase", "ssh"])
                    .env("SSHPASS", passphrase.expose());
                c
            }
            _ => Command::new("ssh"),
        };
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!(
            "opening ssh tunnel to {}@{}:{} on {}",
            plan.user,
            plan.host,
            plan.port,
            local.spec()
        );
        let child = cmd.spawn().map_err(|e| {
            RuntimeError::Connectivity(format!(
                "failed to start ssh for {}: {e}",
                plan.host
            ))
        })?;

        let mut tunnel = Self {
            child,
            local,
            _key_file: key_file,
        };
        tunnel.wait_ready(&plan.host, timeout)?;
        Ok(tunnel)
    }

    fn wait_ready(&mut self, host: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(status) = self.child.try_wait()? {
                let mut stderr = String::new();
                if let Some(mut pipe) = self.child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr);
                }
                return Err(RuntimeError::Connectivity(format!(
                    "ssh to {host} exited with {status}: {}",
                    stderr.trim()
                )));
            }
            if self.local.accepts() {
                debug!("ssh tunnel to {host} ready on {}", self.local.spec());
                return Ok(());
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.stop();
                return Err(RuntimeError::Connectivity(format!(
                    "ssh tunnel to {host} not ready after {}s",
                    timeout.as_secs()
                )));
            }
            thread::sleep(READY_POLL);
        }
    }

    /// Where clients reach the forwarded service.
    pub fn endpoint(&self, https: bool) -> Endpoint {
        match &self.local {
            LocalEnd::Port(port) => Endpoint::Tcp {
                host: "127.0.0.1".to_owned(),
                port: *port,
                https,
            },
            LocalEnd::Socket { path, .. } => Endpoint::Socket(path.clone()),
        }
    }

    fn stop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn write_key_file(key: &str) -> Result<NamedTempFile, RuntimeError> {
    // NamedTempFile is created with mode 0600.
    let mut file = tempfile::Builder::new().prefix("convoy-key-").tempfile()?;
    file.write_all(key.as_bytes())?;
    if !key.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(file)
}

/// Arguments passed to `ssh` to forward `local` (a loopback `host:port`
/// or a socket path) to the remote end of the plan.
pub fn ssh_args(
    plan: &TunnelPlan,
    local: &str,
    key_path: Option<&Path>,
    timeout: Duration,
) -> Vec<String> {
    let forward = match &plan.forward {
        Forward::Socket(path) => format!("{local}:{path}"),
        Forward::Port(port) => format!("{local}:127.0.0.1:{port}"),
    };
    let mut args: Vec<String> = vec![
        "-N".into(),
        "-o".into(),
        "StrictHostKeyChecking=accept-new".into(),
        "-o".into(),
        "ExitOnForwardFailure=yes".into(),
        "-o".into(),
        "ServerAliveInterval=30".into(),
        "-o".into(),
        format!("ConnectTimeout={}", timeout.as_secs().max(1)),
        "-p".into(),
        plan.port.to_string(),
        "-L".into(),
        forward,
    ];
    if matches!(plan.forward, Forward::Socket(_)) {
        args.extend(["-o".into(), "StreamLocalBindUnlink=yes".into()]);
    }
    match &plan.credential {
        SshCredential::Agent => {
            args.extend(["-o".into(), "BatchMode=yes".into()]);
        }
        SshCredential::Key { passphrase, .. } => {
            if let Some(path) = key_path {
                args.extend([
                    "-i".into(),
                    path.display().to_string(),
                    "-o".into(),
                    "IdentitiesOnly=yes".into(),
                ]);
            }
            if passphrase.is_none() {
                args.extend(["-o".into(), "BatchMode=yes".into()]);
            }
        }
        SshCredential::Password(_) => {
            args.extend([
                "-o".into(),
                "PreferredAuthentications=password,keyboard-interactive".into(),
                "-o".into(),
                "PubkeyAuthentication=no".into(),
            ]);
        }
    }
    if plan.force_ipv4 {
        args.push("-4".into());
    } else if plan.force_ipv6 {
        args.push("-6".into());
    }
    args.push(format!("{}@{}", plan.user, plan.host));
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_schema::Secret;

    fn plan(credential: SshCredential, forward: Forward) -> TunnelPlan {
        TunnelPlan {
            host: "192.0.2.10".to_owned(),
            user: "root".to_owned(),
            port: 2222,
            credential,
            forward,
            force_ipv4: true,
            force_ipv6: false,
        }
    }

    #[test]
    fn key_tunnel_args() {
        let p = plan(
            SshCredential::Key {
                key: Secret::new("KEY"),
                passphrase: None,
            },
            Forward::Socket("/var/run/docker.sock".to_owned()),
        );
        let args = ssh_args(
            &p,
            "/tmp/convoy-tunnel-x/docker.sock",
            Some(Path::new("/tmp/k")),
            Duration::from_secs(10),
        );
        let joined = args.join(" ");
        assert!(joined.starts_with("-N "));
        assert!(joined.contains("-L /tmp/convoy-tunnel-x/docker.sock:/var/run/docker.sock"));
        assert!(joined.contains("StreamLocalBindUnlink=yes"));
        assert!(joined.contains("-i /tmp/k"));
        assert!(joined.contains("BatchMode=yes"));
        assert!(joined.contains("ConnectTimeout=10"));
        assert!(joined.contains("-p 2222"));
        assert!(args.contains(&"-4".to_owned()));
        assert_eq!(args.last().map(String::as_str), Some("root@192.0.2.10"));
    }

    #[test]
    fn password_tunnel_never_uses_batch_mode() {
        let p = plan(
            SshCredential::Password(Secret::new("pw")),
            Forward::Port(8006),
        );
        let args = ssh_args(&p, "127.0.0.1:40001", None, Duration::from_secs(5));
        let joined = args.join(" ");
        assert!(joined.contains("-L 127.0.0.1:40001:127.0.0.1:8006"));
        assert!(!joined.contains("BatchMode"));
        assert!(!joined.contains("StreamLocalBindUnlink"));
        assert!(!joined.contains("pw"));
    }

    #[test]
    fn docker_forwards_land_on_a_private_socket() {
        use std::os::unix::fs::PermissionsExt;
        let local = LocalEnd::for_forward(&Forward::Socket("/var/run/docker.sock".to_owned()))
            .unwrap();
        let LocalEnd::Socket { path, .. } = &local else {
            panic!("expected a socket, got {local:?}");
        };
        let dir = path.parent().unwrap();
        let mode = std::fs::metadata(dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert!(!local.accepts());
        assert_eq!(local.spec(), path.display().to_string());
    }

    #[test]
    fn socket_directory_is_removed_with_the_forward() {
        let local = LocalEnd::for_forward(&Forward::Socket("/run/docker.sock".to_owned()))
            .unwrap();
        let LocalEnd::Socket { path, .. } = &local else {
            panic!("expected a socket");
        };
        let dir = path.parent().unwrap().to_path_buf();
        assert!(dir.exists());
        drop(local);
        assert!(!dir.exists());
    }

    #[test]
    fn key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let f = write_key_file("-----BEGIN KEY-----").unwrap();
        let mode = std::fs::metadata(f.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let content = std::fs::read_to_string(f.path()).unwrap();
        assert!(content.ends_with('\n'));
    }
}
