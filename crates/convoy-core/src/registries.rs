//! Hot-reloadable registry chain and per-poll image enrichment.

use crate::CoreError;
use convoy_remote::{RegistryChain, RegistryConfig};
use convoy_schema::{ImageUpdate, ObservedContainer, Vault};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichReport {
    pub classified: usize,
    /// Containers recorded without registry metadata.
    pub unenriched: usize,
    pub auth_failures: usize,
    /// Registry lookups for newer images, one per distinct reference.
    pub update_checks: usize,
    pub update_failures: usize,
}

/// The active registry chain. Readers take a snapshot; `reload` swaps in a
/// chain that was validated completely beforehand.
pub struct RegistrySet {
    chain: RwLock<Arc<RegistryChain>>,
    timeout: Duration,
    check_updates: bool,
}

impl Default for RegistrySet {
    fn default() -> Self {
        Self::new(RegistryChain::hub_only(DEFAULT_REGISTRY_TIMEOUT))
    }
}

impl RegistrySet {
    pub fn new(chain: RegistryChain) -> Self {
        Self {
            chain: RwLock::new(Arc::new(chain)),
            timeout: DEFAULT_REGISTRY_TIMEOUT,
            check_updates: false,
        }
    }

    pub fn from_configs(
        configs: &[RegistryConfig],
        vault: &dyn Vault,
        timeout: Duration,
    ) -> Result<Self, CoreError> {
        let chain = RegistryChain::from_configs(configs, vault, timeout)?;
        Ok(Self {
            chain: RwLock::new(Arc::new(chain)),
            timeout,
            check_updates: false,
        })
    }

    /// Also look up newer images for every enriched container.
    #[must_use]
    pub fn with_update_checks(mut self, on: bool) -> Self {
        self.check_updates = on;
        self
    }

    pub fn checks_updates(&self) -> bool {
        self.check_updates
    }

    pub fn current(&self) -> Result<Arc<RegistryChain>, CoreError> {
        self.chain
            .read()
            .map(|c| Arc::clone(&c))
            .map_err(|e| CoreError::Config(format!("registry lock poisoned: {e}")))
    }

    /// Replace the chain. The running chain stays untouched when any
    /// config is invalid.
    pub fn reload(&self, configs: &[RegistryConfig], vault: &dyn Vault) -> Result<(), CoreError> {
        let chain = RegistryChain::from_configs(configs, vault, self.timeout)?;
        let names = chain.names().join(", ");
        let mut slot = self
            .chain
            .write()
            .map_err(|e| CoreError::Config(format!("registry lock poisoned: {e}")))?;
        *slot = Arc::new(chain);
        info!("registry chain reloaded: {names}");
        Ok(())
    }

    /// Record the registry of every container with an image.
    ///
    /// Classification is offline. Providers with credentials are
    /// authenticated once per call; when that fails their containers are
    /// recorded without a registry. With update checks on, each distinct
    /// reference is looked up once per call; a failed lookup leaves
    /// `update` empty.
    pub fn enrich(&self, containers: &mut [ObservedContainer]) -> Result<EnrichReport, CoreError> {
        let chain = self.current()?;
        let mut report = EnrichReport::default();
        let mut authenticated: HashMap<String, bool> = HashMap::new();
        let mut updates: HashMap<(String, Option<String>), Option<ImageUpdate>> = HashMap::new();

        for container in containers.iter_mut() {
            let Some(image) = container.image.as_deref() else {
                continue;
            };
            let classification = match chain.classify(image) {
                Ok(c) => c,
                Err(e) => {
                    warn!("{}: cannot classify image '{image}': {e}", container.name);
                    container.registry = None;
                    report.unenriched += 1;
                    continue;
                }
            };

            let usable = match chain.get(&classification.provider) {
                Some(provider) if provider.has_credentials() => {
                    if let Some(ok) = authenticated.get(&classification.provider) {
                        *ok
                    } else {
                        let ok = match chain.authenticate(image) {
                            Ok(_) => true,
                            Err(e) => {
                                warn!(
                                    "registry '{}' rejected its credentials: {e}",
                                    classification.provider
                                );
                                report.auth_failures += 1;
                                false
                            }
                        };
                        authenticated.insert(classification.provider.clone(), ok);
                        ok
                    }
                }
                _ => true,
            };

            if usable {
                debug!(
                    "{}: {image} -> {} ({})",
                    container.name, classification.provider, classification.normalized
                );
                container.registry = Some(classification.provider);
                report.classified += 1;
                if self.check_updates {
                    let key = (classification.normalized, container.image_digest.clone());
                    let update = updates
                        .entry(key)
                        .or_insert_with_key(|(reference, digest)| {
                            report.update_checks += 1;
                            match chain.check_update(reference, digest.as_deref()) {
                                Ok(update) => update,
                                Err(e) => {
                                    warn!("{reference}: update check failed: {e}");
                                    report.update_failures += 1;
                                    None
                                }
                            }
                        })
                        .clone();
                    container.update = update;
                }
            } else {
                container.registry = None;
                container.update = None;
                report.unenriched += 1;
            }
        }
        Ok(report)
    }
}
