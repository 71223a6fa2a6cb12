//! Registry provider chain for classifying and authenticating container images.
//!
//! An ordered `RegistryChain` of `RegistryProvider`s decides which registry an
//! image reference belongs to (custom registries first, then cloud vendors by
//! hostname, then Docker Hub, which matches everything), rewrites the
//! reference into a fully qualified form, and exchanges configured credentials
//! for HTTP authorization headers over the registry v2 token protocol.

pub mod chain;
pub mod config;
pub mod http;
pub mod providers;
pub mod update;

pub use chain::{Classification, RegistryChain};
pub use config::{RegistryConfig, RegistryKind};
pub use providers::{HubRegistry, VendorRegistry};
pub use update::{check_update, TagVersion};

use crate::http::TokenClient;
use convoy_schema::{ImageRef, SchemaError, VaultError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Bad or rejected registry configuration. Watch cycles treat this as
    /// "record the container without registry metadata".
    #[error("registry config error: {0}")]
    Config(String),
    #[error("registry HTTP error: {0}")]
    Http(String),
    #[error("unknown registry provider: {0}")]
    UnknownProvider(String),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Image(#[from] SchemaError),
}

/// HTTP headers to present to a registry API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthHeaders(Vec<(String, String)>);

impl AuthHeaders {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn bearer(token: &str) -> Self {
        Self(vec![("Authorization".to_owned(), format!("Bearer {token}"))])
    }

    pub fn basic(encoded: &str) -> Self {
        Self(vec![("Authorization".to_owned(), format!("Basic {encoded}"))])
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One registry component of the chain.
pub trait RegistryProvider: Send + Sync {
    /// Configured name, recorded on containers as their registry.
    fn name(&self) -> &str;

    fn kind(&self) -> RegistryKind;

    fn matches(&self, image: &ImageRef) -> bool;

    /// Fully qualified `registry/repository:tag` form.
    fn normalize(&self, image: &ImageRef) -> ImageRef;

    /// Whether credentials were configured. Anonymous providers cannot fail
    /// credential validation.
    fn has_credentials(&self) -> bool;

    fn authenticate(&self, image: &ImageRef) -> Result<AuthHeaders, RegistryError>;

    /// Base URL of the v2 API serving `image`.
    fn api_base(&self, image: &ImageRef) -> String;

    fn client(&self) -> &TokenClient;

    /// Tags published for the repository of `image`.
    fn tags(&self, image: &ImageRef, auth: &AuthHeaders) -> Result<Vec<String>, RegistryError> {
        let image = self.normalize(image);
        self.client()
            .list_tags(&self.api_base(&image), &image.repository, auth)
    }

    /// Digest the registry currently serves for the tag of `image`.
    fn manifest_digest(
        &self,
        image: &ImageRef,
        auth: &AuthHeaders,
    ) -> Result<String, RegistryError> {
        let image = self.normalize(image);
        self.client().manifest_digest(
            &self.api_base(&image),
            &image.repository,
            image.tag_or_default(),
            auth,
        )
    }
}
