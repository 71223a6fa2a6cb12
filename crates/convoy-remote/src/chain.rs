use crate::config::{RegistryConfig, RegistryKind};
use crate::providers::{HubRegistry, VendorRegistry};
use crate::{AuthHeaders, RegistryError, RegistryProvider};
use convoy_schema::{ImageRef, ImageUpdate, Vault};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::info;

/// Outcome of matching one image reference against the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub provider: String,
    pub kind: RegistryKind,
    pub normalized: String,
}

/// Ordered registry providers. The first match wins and the last member
/// always matches, so every reference resolves to exactly one provider.
pub struct RegistryChain {
    providers: Vec<Box<dyn RegistryProvider>>,
    default: Box<dyn RegistryProvider>,
}

impl RegistryChain {
    /// Chain with no configured registries: Docker Hub only.
    pub fn hub_only(timeout: Duration) -> Self {
        Self::new(Vec::new(), Box::new(HubRegistry::anonymous(timeout)))
    }

    pub fn new(
        providers: Vec<Box<dyn RegistryProvider>>,
        default: Box<dyn RegistryProvider>,
    ) -> Self {
        Self { providers, default }
    }

    /// Validate, decrypt and order configured registries.
    ///
    /// Custom registries come first, vendors follow in configuration order,
    /// Docker Hub (configured or anonymous) closes the chain. Any invalid
    /// entry fails the whole chain.
    pub fn from_configs(
        configs: &[RegistryConfig],
        vault: &dyn Vault,
        timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let mut names = HashSet::new();
        for config in configs {
            if !names.insert(config.name.as_str()) {
                return Err(RegistryError::Config(format!(
                    "duplicate registry name '{}'",
                    config.name
                )));
            }
        }

        let hubs: Vec<&RegistryConfig> = configs
            .iter()
            .filter(|c| c.provider == RegistryKind::Hub)
            .collect();
        let default: Box<dyn RegistryProvider> = match hubs.as_slice() {
            [] => Box::new(HubRegistry::anonymous(timeout)),
            [hub] => Box::new(HubRegistry::from_config(hub, vault, timeout)?),
            _ => {
                return Err(RegistryError::Config(
                    "at most one hub registry may be configured".to_owned(),
                ))
            }
        };

        let mut custom = Vec::new();
        let mut vendors = Vec::new();
        for config in configs.iter().filter(|c| c.provider != RegistryKind::Hub) {
            let provider: Box<dyn RegistryProvider> =
                Box::new(VendorRegistry::from_config(config, vault, timeout)?);
            if config.provider == RegistryKind::Custom {
                custom.push(provider);
            } else {
                vendors.push(provider);
            }
        }
        custom.extend(vendors);

        info!(
            "registry chain: {} configured provider(s) + {}",
            custom.len(),
            default.name()
        );
        Ok(Self::new(custom, default))
    }

    pub fn resolve(&self, image: &ImageRef) -> &dyn RegistryProvider {
        self.providers
            .iter()
            .find(|p| p.matches(image))
            .map_or(&*self.default, |p| &**p)
    }

    /// Parse and classify without any network access.
    pub fn classify(&self, reference: &str) -> Result<Classification, RegistryError> {
        let image = ImageRef::parse(reference)?;
        let provider = self.resolve(&image);
        Ok(Classification {
            provider: provider.name().to_owned(),
            kind: provider.kind(),
            normalized: provider.normalize(&image).to_string(),
        })
    }

    pub fn authenticate(&self, reference: &str) -> Result<AuthHeaders, RegistryError> {
        let image = ImageRef::parse(reference)?;
        let provider = self.resolve(&image);
        provider.authenticate(&provider.normalize(&image))
    }

    /// Authenticate for the repository of `reference` and ask its registry
    /// for a newer image. See [`crate::update::check_update`].
    pub fn check_update(
        &self,
        reference: &str,
        local_digest: Option<&str>,
    ) -> Result<Option<ImageUpdate>, RegistryError> {
        let image = ImageRef::parse(reference)?;
        let provider = self.resolve(&image);
        let normalized = provider.normalize(&image);
        let auth = provider.authenticate(&normalized)?;
        crate::update::check_update(provider, &normalized, local_digest, &auth)
    }

    /// Provider names in evaluation order, default last.
    pub fn names(&self) -> Vec<&str> {
        self.providers
            .iter()
            .map(|p| p.name())
            .chain(std::iter::once(self.default.name()))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn RegistryProvider> {
        self.providers
            .iter()
            .map(|p| &**p)
            .chain(std::iter::once(&*self.default))
            .find(|p| p.name() == name)
    }
}
