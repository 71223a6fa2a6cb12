use crate::config::{RegistryConfig, RegistryKind};
use crate::http::{BasicCredentials, TokenClient};
use crate::{AuthHeaders, RegistryError, RegistryProvider};
use convoy_schema::image::DOCKER_HUB_DOMAIN;
use convoy_schema::{ImageRef, Secret, Vault};
use std::time::Duration;
use tracing::debug;

const HUB_TOKEN_REALM: &str = "https://auth.docker.io/token";
const HUB_TOKEN_SERVICE: &str = "registry.docker.io";
const HUB_API_BASE: &str = "https://registry-1.docker.io";

fn is_hub_domain(domain: &str) -> bool {
    matches!(
        domain,
        "docker.io" | "index.docker.io" | "registry-1.docker.io"
    )
}

/// Docker Hub, the unconditional last member of every chain.
///
/// References without a registry are Hub references; single-component
/// repositories live under `library/`. References that name some other
/// registry nobody configured are still accepted and authenticated
/// anonymously against that registry.
pub struct HubRegistry {
    name: String,
    credentials: Option<BasicCredentials>,
    token_realm: String,
    registry_api: String,
    client: TokenClient,
}

impl HubRegistry {
    pub fn anonymous(timeout: Duration) -> Self {
        Self {
            name: "hub".to_owned(),
            credentials: None,
            token_realm: HUB_TOKEN_REALM.to_owned(),
            registry_api: HUB_API_BASE.to_owned(),
            client: TokenClient::new(timeout),
        }
    }

    pub fn from_config(
        config: &RegistryConfig,
        vault: &dyn Vault,
        timeout: Duration,
    ) -> Result<Self, RegistryError> {
        config.validate()?;
        let credentials = decrypt_basic(config, vault)?;
        Ok(Self {
            name: config.name.clone(),
            credentials,
            token_realm: HUB_TOKEN_REALM.to_owned(),
            registry_api: HUB_API_BASE.to_owned(),
            client: TokenClient::new(timeout),
        })
    }

    /// Point token requests somewhere other than `auth.docker.io`.
    #[must_use]
    pub fn with_token_realm(mut self, realm: impl Into<String>) -> Self {
        self.token_realm = realm.into();
        self
    }

    /// Serve tag and manifest requests from somewhere other than
    /// `registry-1.docker.io`.
    #[must_use]
    pub fn with_registry_api(mut self, base: impl Into<String>) -> Self {
        self.registry_api = base.into();
        self
    }
}

impl RegistryProvider for HubRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RegistryKind {
        RegistryKind::Hub
    }

    fn matches(&self, _image: &ImageRef) -> bool {
        true
    }

    fn normalize(&self, image: &ImageRef) -> ImageRef {
        let domain = image.domain();
        if !is_hub_domain(domain) {
            return image.qualified(domain);
        }
        let mut normalized = image.qualified(DOCKER_HUB_DOMAIN);
        if !normalized.repository.contains('/') {
            normalized.repository = format!("library/{}", normalized.repository);
        }
        normalized
    }

    fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    fn authenticate(&self, image: &ImageRef) -> Result<AuthHeaders, RegistryError> {
        let normalized = self.normalize(image);
        if !is_hub_domain(normalized.domain()) {
            let base = format!("https://{}", normalized.domain());
            return self.client.authenticate(&base, &normalized.repository, None);
        }
        let scope = format!("repository:{}:pull", normalized.repository);
        let token = self.client.fetch_token(
            &self.token_realm,
            Some(HUB_TOKEN_SERVICE),
            &scope,
            self.credentials.as_ref(),
        )?;
        Ok(AuthHeaders::bearer(&token))
    }

    fn api_base(&self, image: &ImageRef) -> String {
        let domain = image.domain();
        if is_hub_domain(domain) {
            self.registry_api.clone()
        } else {
            format!("https://{domain}")
        }
    }

    fn client(&self) -> &TokenClient {
        &self.client
    }
}

/// Custom registries and cloud/forge vendors.
///
/// All of them speak the distribution token protocol; they differ in how
/// they are matched and which configured fields become Basic credentials.
pub struct VendorRegistry {
    name: String,
    kind: RegistryKind,
    host: Option<String>,
    api_base: Option<String>,
    credentials: Option<BasicCredentials>,
    /// ECR authorization token, already `base64(AWS:password)`.
    ecr_token: Option<Secret>,
    client: TokenClient,
}

impl VendorRegistry {
    pub fn from_config(
        config: &RegistryConfig,
        vault: &dyn Vault,
        timeout: Duration,
    ) -> Result<Self, RegistryError> {
        config.validate()?;
        if config.provider == RegistryKind::Hub {
            return Err(RegistryError::Config(format!(
                "registry '{}': hub is the default provider, not a vendor",
                config.name
            )));
        }

        let mut credentials = decrypt_basic(config, vault)?;
        let mut ecr_token = None;
        match config.provider {
            RegistryKind::Gcr => {
                if let Some(key) = config.credentials.get("service_account_key") {
                    credentials = Some(BasicCredentials::new("_json_key", vault.decrypt(key)?));
                }
            }
            RegistryKind::Ecr => {
                if let Some(token) = config.credentials.get("authorization_token") {
                    ecr_token = Some(vault.decrypt(token)?);
                }
            }
            _ => {}
        }

        Ok(Self {
            name: config.name.clone(),
            kind: config.provider,
            host: config.host(),
            api_base: config.api_base(),
            credentials,
            ecr_token,
            client: TokenClient::new(timeout),
        })
    }

    fn api_base_for(&self, domain: &str) -> String {
        match (&self.host, &self.api_base) {
            (Some(host), Some(base)) if host == domain => base.clone(),
            _ => format!("https://{domain}"),
        }
    }
}

impl RegistryProvider for VendorRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RegistryKind {
        self.kind
    }

    fn matches(&self, image: &ImageRef) -> bool {
        self.kind.matches_host(image.domain(), self.host.as_deref())
    }

    fn normalize(&self, image: &ImageRef) -> ImageRef {
        image.qualified(image.domain())
    }

    fn has_credentials(&self) -> bool {
        self.credentials.is_some() || self.ecr_token.is_some()
    }

    fn authenticate(&self, image: &ImageRef) -> Result<AuthHeaders, RegistryError> {
        let domain = image.domain();
        if self.kind == RegistryKind::Ecr && domain != "public.ecr.aws" {
            let token = self.ecr_token.as_ref().ok_or_else(|| {
                RegistryError::Config(format!("registry '{}': no ECR authorization token", self.name))
            })?;
            return Ok(AuthHeaders::basic(token.expose()));
        }
        let base = self.api_base_for(domain);
        debug!("authenticating {image} against {base} as '{}'", self.name);
        self.client
            .authenticate(&base, &image.repository, self.credentials.as_ref())
    }

    fn api_base(&self, image: &ImageRef) -> String {
        self.api_base_for(image.domain())
    }

    fn client(&self) -> &TokenClient {
        &self.client
    }
}

fn decrypt_basic(
    config: &RegistryConfig,
    vault: &dyn Vault,
) -> Result<Option<BasicCredentials>, RegistryError> {
    let Some((user_field, pass_field)) = config.provider.basic_fields() else {
        return Ok(None);
    };
    match (
        config.credentials.get(user_field),
        config.credentials.get(pass_field),
    ) {
        (Some(user), Some(pass)) => Ok(Some(BasicCredentials::new(
            vault.decrypt(user)?.expose(),
            vault.decrypt(pass)?,
        ))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_schema::{PassthroughVault, VaultSecret};

    const T: Duration = Duration::from_secs(2);

    fn img(s: &str) -> ImageRef {
        ImageRef::parse(s).unwrap()
    }

    #[test]
    fn hub_normalizes_official_images() {
        let hub = HubRegistry::anonymous(T);
        assert_eq!(
            hub.normalize(&img("nginx")).to_string(),
            "docker.io/library/nginx:latest"
        );
        assert_eq!(
            hub.normalize(&img("linuxserver/sonarr:4")).to_string(),
            "docker.io/linuxserver/sonarr:4"
        );
        assert_eq!(
            hub.normalize(&img("index.docker.io/redis:7")).to_string(),
            "docker.io/library/redis:7"
        );
    }

    #[test]
    fn hub_keeps_foreign_domains() {
        let hub = HubRegistry::anonymous(T);
        assert!(hub.matches(&img("reg.example.com/app")));
        assert_eq!(
            hub.normalize(&img("reg.example.com/app")).to_string(),
            "reg.example.com/app:latest"
        );
    }

    #[test]
    fn acr_decrypts_client_credentials() {
        let cfg = RegistryConfig::new("acr", RegistryKind::Acr)
            .with_credential("client_id", VaultSecret::new("app-id", "default"))
            .with_credential("client_secret", VaultSecret::new("s3cret", "default"));
        let acr = VendorRegistry::from_config(&cfg, &PassthroughVault, T).unwrap();
        assert!(acr.has_credentials());
        assert!(acr.matches(&img("team.azurecr.io/api:1")));
        assert!(!acr.matches(&img("ghcr.io/org/api:1")));
    }

    #[test]
    fn gcr_uses_json_key_user() {
        let cfg = RegistryConfig::new("gcr", RegistryKind::Gcr)
            .with_credential("service_account_key", VaultSecret::new("{}", "default"));
        let gcr = VendorRegistry::from_config(&cfg, &PassthroughVault, T).unwrap();
        assert_eq!(
            gcr.credentials.as_ref().map(|c| c.username.as_str()),
            Some("_json_key")
        );
    }

    #[test]
    fn private_ecr_presents_authorization_token() {
        let cfg = RegistryConfig::new("ecr", RegistryKind::Ecr)
            .with_credential("authorization_token", VaultSecret::new("QVdTOnB3", "default"));
        let ecr = VendorRegistry::from_config(&cfg, &PassthroughVault, T).unwrap();
        let headers = ecr
            .authenticate(&img("123456789012.dkr.ecr.eu-west-1.amazonaws.com/api:1"))
            .unwrap();
        assert_eq!(headers.get("Authorization"), Some("Basic QVdTOnB3"));
    }

    #[test]
    fn hub_config_is_not_a_vendor() {
        let cfg = RegistryConfig::new("hub", RegistryKind::Hub);
        assert!(VendorRegistry::from_config(&cfg, &PassthroughVault, T).is_err());
    }
}
