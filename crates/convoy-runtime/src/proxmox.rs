//! Proxmox VE watcher: QEMU virtual machines and LXC containers of every
//! cluster node.

use crate::connection::ApiAuth;
use crate::http::{check, ApiClient};
use crate::watcher::{Listing, ProviderWatcher, ScopeFailure, WatcherContext};
use crate::RuntimeError;
use convoy_schema::{
    ContainerAction, ContainerKind, ManagedContainer, ObservedContainer, ResourceSnapshot,
    WatcherKind, WatcherName,
};
use serde::{Deserialize, Deserializer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const API: &str = "/api2/json";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    node: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GuestEntry {
    #[serde(deserialize_with = "string_or_number")]
    vmid: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    template: Option<serde_json::Value>,
    #[serde(default)]
    cpu: Option<f64>,
    #[serde(default)]
    mem: Option<u64>,
    #[serde(default)]
    maxmem: Option<u64>,
}

impl GuestEntry {
    fn is_template(&self) -> bool {
        match &self.template {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::Number(n)) => n.as_u64() == Some(1),
            Some(serde_json::Value::String(s)) => s == "1",
            _ => false,
        }
    }

    fn into_observed(self, node: &str, kind: ContainerKind, stats: bool) -> ObservedContainer {
        let name = self
            .name
            .filter(|n| !n.is_empty() && n != "unknown")
            .unwrap_or_else(|| "unknown".to_owned());
        let status = self
            .status
            .map_or_else(|| "unknown".to_owned(), |s| s.to_lowercase());
        let mut observed = ObservedContainer::new(self.vmid, kind, name, status).on_node(node);
        if !stats {
            return observed;
        }
        if let (Some(cpu), Some(mem), Some(maxmem)) = (self.cpu, self.mem, self.maxmem) {
            observed.stats = Some(ResourceSnapshot {
                cpu_percent: cpu * 100.0,
                memory_usage_bytes: mem,
                memory_limit_bytes: maxmem,
            });
        }
        observed
    }
}

/// Proxmox reports LXC vmids as strings on some versions.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Num(n) => n.to_string(),
        Raw::Str(s) => s,
    })
}

#[derive(Debug, Deserialize)]
struct Ticket {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

fn guest_path(kind: ContainerKind) -> Option<&'static str> {
    match kind {
        ContainerKind::VirtualMachine => Some("qemu"),
        ContainerKind::LightweightContainer => Some("lxc"),
        ContainerKind::Container => None,
    }
}

/// Proxmox status endpoint for an action, if the guest kind supports it.
pub fn action_verb(action: ContainerAction, kind: ContainerKind) -> Option<&'static str> {
    let vm = kind == ContainerKind::VirtualMachine;
    match action {
        ContainerAction::Start => Some("start"),
        ContainerAction::Stop => Some("stop"),
        ContainerAction::Shutdown => Some("shutdown"),
        ContainerAction::Restart | ContainerAction::Reboot => Some("reboot"),
        ContainerAction::Pause if vm => Some("suspend"),
        ContainerAction::Unpause if vm => Some("resume"),
        ContainerAction::Pause | ContainerAction::Unpause | ContainerAction::Kill => None,
    }
}

pub struct ProxmoxWatcher {
    ctx: WatcherContext,
    client: Mutex<Option<Arc<ApiClient>>>,
    watch_stats: AtomicBool,
}

impl ProxmoxWatcher {
    pub fn new(ctx: WatcherContext) -> Self {
        Self {
            ctx,
            client: Mutex::new(None),
            watch_stats: AtomicBool::new(false),
        }
    }

    /// Watcher bound to an already authenticated client.
    pub fn connected(ctx: WatcherContext, client: ApiClient) -> Self {
        Self {
            ctx,
            client: Mutex::new(Some(Arc::new(client))),
            watch_stats: AtomicBool::new(false),
        }
    }

    pub fn with_stats(self, on: bool) -> Self {
        self.watch_stats.store(on, Ordering::Relaxed);
        self
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<Arc<ApiClient>>>, RuntimeError> {
        self.client
            .lock()
            .map_err(|e| RuntimeError::Provider(format!("mutex poisoned: {e}")))
    }

    fn current(&self) -> Result<Arc<ApiClient>, RuntimeError> {
        self.slot()?
            .clone()
            .ok_or_else(|| RuntimeError::NotConnected(self.ctx.name.to_string()))
    }

    /// Broken transports and expired tickets both need a fresh init.
    fn forget_if_stale(&self, err: &RuntimeError) {
        if err.is_connectivity() || matches!(err, RuntimeError::Credential(_)) {
            if let Ok(mut slot) = self.slot() {
                if slot.take().is_some() {
                    debug!("{}: dropping proxmox session", self.ctx.name);
                }
            }
        }
    }

    /// Attach API credentials to `client`: the token header, or a ticket
    /// cookie plus CSRF token obtained with the password.
    pub fn login(client: &mut ApiClient, auth: &ApiAuth) -> Result<(), RuntimeError> {
        match auth {
            ApiAuth::ProxmoxToken { token_id, secret } => {
                client.set_header(
                    "Authorization",
                    format!("PVEAPIToken={token_id}={}", secret.expose()),
                );
            }
            ApiAuth::ProxmoxPassword { username, password } => {
                let path = format!("{API}/access/ticket");
                let resp = check(
                    &path,
                    client.post_form(
                        &path,
                        &[("username", username.as_str()), ("password", password.expose())],
                    )?,
                )?;
                let ticket: Envelope<Ticket> = serde_json::from_str(&resp.body).map_err(|e| {
                    RuntimeError::Credential(format!("proxmox ticket response: {e}"))
                })?;
                client.set_header("Cookie", format!("PVEAuthCookie={}", ticket.data.ticket));
                client.set_header("CSRFPreventionToken", ticket.data.csrf_token);
            }
            ApiAuth::None => {
                return Err(RuntimeError::Credential(
                    "proxmox connection without API credentials".to_owned(),
                ))
            }
        }
        Ok(())
    }

    fn list_node(
        client: &ApiClient,
        node: &str,
        stats: bool,
        out: &mut Vec<ObservedContainer>,
    ) -> Result<(), RuntimeError> {
        for (segment, kind) in [
            ("qemu", ContainerKind::VirtualMachine),
            ("lxc", ContainerKind::LightweightContainer),
        ] {
            let guests: Envelope<Vec<GuestEntry>> =
                client.get_json(&format!("{API}/nodes/{node}/{segment}"), &[])?;
            out.extend(
                guests
                    .data
                    .into_iter()
                    .filter(|g| !g.is_template())
                    .map(|g| g.into_observed(node, kind, stats)),
            );
        }
        Ok(())
    }

    fn list(&self, client: &ApiClient) -> Result<Listing, RuntimeError> {
        let nodes: Envelope<Vec<NodeEntry>> = client.get_json(&format!("{API}/nodes"), &[])?;
        let total = nodes.data.len();
        let stats = self.watch_stats.load(Ordering::Relaxed);
        let mut listing = Listing::default();

        for node in nodes.data {
            if node.status.as_deref() == Some("offline") {
                warn!("{}: node {} is offline", self.ctx.name, node.node);
                listing.failures.push(ScopeFailure {
                    scope: node.node,
                    reason: "node offline".to_owned(),
                });
                continue;
            }
            let before = listing.containers.len();
            if let Err(e) = Self::list_node(client, &node.node, stats, &mut listing.containers) {
                warn!("{}: listing node {} failed: {e}", self.ctx.name, node.node);
                listing.failures.push(ScopeFailure {
                    scope: node.node,
                    reason: e.to_string(),
                });
                continue;
            }
            debug!(
                "{}: node {} has {} guest(s)",
                self.ctx.name,
                node.node,
                listing.containers.len() - before
            );
        }

        if total > 0 && listing.failures.len() == total {
            let reasons: Vec<String> = listing
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.scope, f.reason))
                .collect();
            return Err(RuntimeError::Connectivity(format!(
                "all {total} proxmox node(s) failed ({})",
                reasons.join("; ")
            )));
        }
        Ok(listing)
    }
}

impl ProviderWatcher for ProxmoxWatcher {
    fn name(&self) -> &WatcherName {
        &self.ctx.name
    }

    fn kind(&self) -> WatcherKind {
        WatcherKind::Proxmox
    }

    fn init_watcher(&self) -> Result<(), RuntimeError> {
        let device = self.ctx.directory.device(&self.ctx.device_uuid)?;
        let auth = self.ctx.directory.device_auth(&self.ctx.device_uuid)?;
        let options = self
            .ctx
            .resolver
            .resolve(&device, &auth, WatcherKind::Proxmox)?;
        self.watch_stats
            .store(device.proxmox.watch_stats, Ordering::Relaxed);
        let api_auth = options.auth.clone();
        let mut client = ApiClient::connect(options)?;
        Self::login(&mut client, &api_auth)?;

        let path = format!("{API}/version");
        check(&path, client.get(&path, &[])?)?;
        info!(
            "{}: connected to proxmox via {:?} at {}",
            self.ctx.name,
            auth.proxmox.method,
            client.base_url()
        );
        *self.slot()? = Some(Arc::new(client));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.slot().is_ok_and(|s| s.is_some())
    }

    fn list_containers(&self) -> Result<Listing, RuntimeError> {
        let client = self.current()?;
        self.list(&client).inspect_err(|e| self.forget_if_stale(e))
    }

    fn change_container_status(
        &self,
        container: &ManagedContainer,
        action: ContainerAction,
    ) -> Result<(), RuntimeError> {
        let unsupported = || RuntimeError::UnsupportedAction {
            action,
            kind: container.kind.to_string(),
        };
        let segment = guest_path(container.kind).ok_or_else(unsupported)?;
        let verb = action_verb(action, container.kind).ok_or_else(unsupported)?;
        let node = container.node.as_deref().ok_or_else(|| {
            RuntimeError::Provider(format!("{} has no recorded node", container.name))
        })?;

        let client = self.current()?;
        let path = format!(
            "{API}/nodes/{node}/{segment}/{}/status/{verb}",
            container.provider_id
        );
        check(&path, client.post(&path).inspect_err(|e| self.forget_if_stale(e))?)?;
        info!(
            "{}: {action} ({verb}) acknowledged for {} on {node}",
            self.ctx.name, container.name
        );
        Ok(())
    }

    fn release(&self) {
        if let Ok(mut slot) = self.slot() {
            if slot.take().is_some() {
                debug!("{}: proxmox connection released", self.ctx.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_mapping() {
        let vm = ContainerKind::VirtualMachine;
        let lxc = ContainerKind::LightweightContainer;
        assert_eq!(action_verb(ContainerAction::Restart, vm), Some("reboot"));
        assert_eq!(action_verb(ContainerAction::Reboot, lxc), Some("reboot"));
        assert_eq!(action_verb(ContainerAction::Shutdown, lxc), Some("shutdown"));
        assert_eq!(action_verb(ContainerAction::Pause, vm), Some("suspend"));
        assert_eq!(action_verb(ContainerAction::Unpause, vm), Some("resume"));
        assert_eq!(action_verb(ContainerAction::Pause, lxc), None);
        assert_eq!(action_verb(ContainerAction::Kill, vm), None);
    }

    #[test]
    fn guest_entries_accept_string_vmids() {
        let guests: Envelope<Vec<GuestEntry>> = serde_json::from_str(
            r#"{"data": [
                {"vmid": 100, "name": "web", "status": "running", "cpu": 0.25, "mem": 512, "maxmem": 1024},
                {"vmid": "101", "name": "db", "status": "STOPPED"},
                {"vmid": 9000, "name": "tpl", "status": "stopped", "template": 1}
            ]}"#,
        )
        .unwrap();
        let observed: Vec<ObservedContainer> = guests
            .data
            .into_iter()
            .filter(|g| !g.is_template())
            .map(|g| g.into_observed("pve1", ContainerKind::VirtualMachine, true))
            .collect();
        assert_eq!(observed.len(), 2);
        assert_eq!(observed[0].provider_id, "100");
        assert_eq!(observed[0].node.as_deref(), Some("pve1"));
        assert!((observed[0].stats.unwrap().cpu_percent - 25.0).abs() < f64::EPSILON);
        assert_eq!(observed[1].provider_id, "101");
        assert_eq!(observed[1].status, "stopped");
        assert!(observed[1].stats.is_none());
    }

    #[test]
    fn unnamed_guest_is_unknown() {
        let g: GuestEntry = serde_json::from_str(r#"{"vmid": 5}"#).unwrap();
        let o = g.into_observed("n", ContainerKind::LightweightContainer, true);
        assert_eq!(o.name, "unknown");
        assert_eq!(o.status, "unknown");
    }

    #[test]
    fn usage_is_left_out_unless_requested() {
        let g: GuestEntry = serde_json::from_str(
            r#"{"vmid": 7, "name": "web", "status": "running", "cpu": 0.5, "mem": 1, "maxmem": 2}"#,
        )
        .unwrap();
        assert!(g.into_observed("n", ContainerKind::VirtualMachine, false).stats.is_none());
    }
}
