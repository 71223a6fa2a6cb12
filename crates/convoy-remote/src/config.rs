use crate::RegistryError;
use convoy_schema::VaultSecret;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Registry vendors the chain knows how to match and authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    Hub,
    Custom,
    Ghcr,
    Gcr,
    Acr,
    Ecr,
    Quay,
    Lscr,
    Gitlab,
    Gitea,
    Forgejo,
}

impl RegistryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RegistryKind::Hub => "hub",
            RegistryKind::Custom => "custom",
            RegistryKind::Ghcr => "ghcr",
            RegistryKind::Gcr => "gcr",
            RegistryKind::Acr => "acr",
            RegistryKind::Ecr => "ecr",
            RegistryKind::Quay => "quay",
            RegistryKind::Lscr => "lscr",
            RegistryKind::Gitlab => "gitlab",
            RegistryKind::Gitea => "gitea",
            RegistryKind::Forgejo => "forgejo",
        }
    }

    /// Credential fields this kind accepts.
    pub fn allowed_fields(self) -> &'static [&'static str] {
        match self {
            RegistryKind::Hub | RegistryKind::Custom => &["username", "password"],
            RegistryKind::Ghcr
            | RegistryKind::Quay
            | RegistryKind::Gitlab
            | RegistryKind::Gitea
            | RegistryKind::Forgejo => &["username", "token"],
            RegistryKind::Gcr => &["service_account_key"],
            RegistryKind::Acr => &["client_id", "client_secret"],
            RegistryKind::Ecr => &["authorization_token"],
            RegistryKind::Lscr => &[],
        }
    }

    /// Credential fields that must be present.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            RegistryKind::Acr => &["client_id", "client_secret"],
            RegistryKind::Ecr => &["authorization_token"],
            RegistryKind::Gitlab | RegistryKind::Gitea | RegistryKind::Forgejo => {
                &["username", "token"]
            }
            _ => &[],
        }
    }

    /// Field pairs used as Basic credentials at the token endpoint. When
    /// one half is configured the other must be too.
    pub fn basic_fields(self) -> Option<(&'static str, &'static str)> {
        match self {
            RegistryKind::Hub | RegistryKind::Custom => Some(("username", "password")),
            RegistryKind::Ghcr
            | RegistryKind::Quay
            | RegistryKind::Gitlab
            | RegistryKind::Gitea
            | RegistryKind::Forgejo => Some(("username", "token")),
            RegistryKind::Acr => Some(("client_id", "client_secret")),
            RegistryKind::Gcr | RegistryKind::Ecr | RegistryKind::Lscr => None,
        }
    }

    pub fn requires_url(self) -> bool {
        matches!(
            self,
            RegistryKind::Custom | RegistryKind::Gitea | RegistryKind::Forgejo
        )
    }

    /// Whether an image hosted on `host` belongs to this vendor. `configured`
    /// is the host taken from the registry's `url`, when set.
    pub fn matches_host(self, host: &str, configured: Option<&str>) -> bool {
        if let Some(configured) = configured {
            if host == configured {
                return true;
            }
        }
        match self {
            RegistryKind::Hub => true,
            RegistryKind::Custom | RegistryKind::Gitea | RegistryKind::Forgejo => false,
            RegistryKind::Ghcr => host == "ghcr.io",
            RegistryKind::Gcr => {
                host == "gcr.io" || host.ends_with(".gcr.io") || host.ends_with("-docker.pkg.dev")
            }
            RegistryKind::Acr => configured.is_none() && host.ends_with(".azurecr.io"),
            RegistryKind::Ecr => {
                configured.is_none()
                    && ((host.contains(".dkr.ecr.") && host.ends_with(".amazonaws.com"))
                        || host == "public.ecr.aws")
            }
            RegistryKind::Quay => host == "quay.io",
            RegistryKind::Lscr => host == "lscr.io",
            RegistryKind::Gitlab => configured.is_none() && host == "registry.gitlab.com",
        }
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub name: String,
    pub provider: RegistryKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub credentials: BTreeMap<String, VaultSecret>,
}

impl RegistryConfig {
    pub fn new(name: impl Into<String>, provider: RegistryKind) -> Self {
        Self {
            name: name.into(),
            provider,
            url: None,
            credentials: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_credential(mut self, field: &str, secret: VaultSecret) -> Self {
        self.credentials.insert(field.to_owned(), secret);
        self
    }

    /// Host part of `url`, lowercased.
    pub fn host(&self) -> Option<String> {
        self.url.as_deref().and_then(host_of)
    }

    /// Base URL of the registry API, from `url` when configured.
    pub fn api_base(&self) -> Option<String> {
        let url = self.url.as_deref()?.trim().trim_end_matches('/');
        if url.starts_with("http://") || url.starts_with("https://") {
            Some(url.to_owned())
        } else {
            Some(format!("https://{url}"))
        }
    }

    /// Check required and paired fields without decrypting anything.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let kind = self.provider;
        let err = |msg: String| RegistryError::Config(format!("registry '{}': {msg}", self.name));

        if self.name.trim().is_empty() {
            return Err(RegistryError::Config("registry name must not be empty".to_owned()));
        }
        if kind.requires_url() && self.url.is_none() {
            return Err(err(format!("provider '{kind}' requires a url")));
        }
        if self.url.is_some() && self.host().is_none() {
            return Err(err(format!(
                "invalid url '{}'",
                self.url.as_deref().unwrap_or_default()
            )));
        }

        let allowed = kind.allowed_fields();
        if let Some(unknown) = self
            .credentials
            .keys()
            .find(|k| !allowed.contains(&k.as_str()))
        {
            return Err(err(format!(
                "unknown credential field '{unknown}' for provider '{kind}' (expected one of: {})",
                allowed.join(", ")
            )));
        }
        for field in kind.required_fields() {
            if !self.credentials.contains_key(*field) {
                return Err(err(format!("missing required credential '{field}'")));
            }
        }
        if let Some((user, pass)) = kind.basic_fields() {
            match (
                self.credentials.contains_key(user),
                self.credentials.contains_key(pass),
            ) {
                (true, false) => return Err(err(format!("'{user}' given without '{pass}'"))),
                (false, true) => return Err(err(format!("'{pass}' given without '{user}'"))),
                _ => {}
            }
        }
        Ok(())
    }
}

/// Extract `host[:port]` from a URL or bare host string.
pub(crate) fn host_of(url: &str) -> Option<String> {
    let rest = url
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = rest.split('/').next()?.to_ascii_lowercase();
    if host.is_empty() || host.contains(char::is_whitespace) || host.contains('@') {
        None
    } else {
        Some(host)
    }
}
