use std::fmt;
use std::process::Command;

/// A host tool the tunnel transport needs, with install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

pub fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Tools used by SSH-tunneled connections. `sshpass` only matters for
/// password and passphrase authentication.
pub fn check_tunnel_prereqs(password_auth: bool) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !command_exists("ssh") {
        missing.push(MissingPrereq {
            name: "ssh",
            purpose: "tunneled docker and proxmox connections",
            install_hint: "apt install openssh-client | dnf install openssh-clients | pacman -S openssh",
        });
    }

    if password_auth && !command_exists("sshpass") {
        missing.push(MissingPrereq {
            name: "sshpass",
            purpose: "password and key-passphrase ssh authentication",
            install_hint: "apt install sshpass | dnf install sshpass | pacman -S sshpass",
        });
    }

    missing
}

pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nConvoy needs these tools to reach devices over ssh.");
    msg
}
