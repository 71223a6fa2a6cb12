use crate::{AuthHeaders, RegistryError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use convoy_schema::Secret;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Manifest media types accepted when resolving a tag to its digest.
/// Index types come first so multi-platform tags resolve to the digest the
/// engine records locally.
const MANIFEST_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.v2+json";

/// Tag list pages followed before giving up on a repository.
const MAX_TAG_PAGES: usize = 20;

/// Authentication challenge announced by `GET /v2/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// The registry answered without asking for credentials.
    Open,
    Basic {
        realm: Option<String>,
    },
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

/// Parse a `WWW-Authenticate` header value.
pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, rest) = header.split_once(char::is_whitespace).unwrap_or((header, ""));
    let params = parse_params(rest);
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" => Some(Challenge::Bearer {
            realm: params.get("realm")?.clone(),
            service: params.get("service").cloned(),
            scope: params.get("scope").cloned(),
        }),
        "basic" => Some(Challenge::Basic {
            realm: params.get("realm").cloned(),
        }),
        _ => None,
    }
}

/// `key="quoted, value",key2=bare` parameter lists.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    other => value.push(other),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
            value = value.trim().to_owned();
        }
        params.insert(key, value);
    }
    params
}

/// Username and decrypted password presented to a token endpoint.
#[derive(Debug, Clone)]
pub struct BasicCredentials {
    pub username: String,
    pub password: Secret,
}

impl BasicCredentials {
    pub fn new(username: impl Into<String>, password: Secret) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }

    pub fn encode(&self) -> String {
        STANDARD.encode(format!("{}:{}", self.username, self.password.expose()))
    }
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Target of a `Link: <...>; rel="next"` header, resolved against `api_base`.
pub fn next_page(api_base: &str, link: &str) -> Option<String> {
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.replace(' ', "").contains("rel=\"next\"") {
            return None;
        }
        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        if target.starts_with('/') {
            Some(format!("{api_base}{target}"))
        } else {
            Some(target.to_owned())
        }
    })
}

fn denied(url: &str, code: u16) -> RegistryError {
    match code {
        401 | 403 => RegistryError::Config(format!("access to {url} denied")),
        code => RegistryError::Http(format!("HTTP {code} for {url}")),
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Registry v2 token protocol client.
#[derive(Clone)]
pub struct TokenClient {
    agent: ureq::Agent,
}

impl TokenClient {
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
        }
    }

    /// Ask the registry which authentication scheme it wants.
    pub fn challenge(&self, api_base: &str) -> Result<Challenge, RegistryError> {
        let url = format!("{api_base}/v2/");
        debug!("GET {url}");
        let resp = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| RegistryError::Http(format!("{url}: {e}")))?;
        match resp.status().as_u16() {
            200 => Ok(Challenge::Open),
            401 => {
                let header = resp
                    .headers()
                    .get("www-authenticate")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        RegistryError::Http(format!("{url}: 401 without WWW-Authenticate"))
                    })?;
                parse_challenge(header).ok_or_else(|| {
                    RegistryError::Http(format!("{url}: unsupported challenge '{header}'"))
                })
            }
            code => Err(RegistryError::Http(format!("HTTP {code} for {url}"))),
        }
    }

    /// Exchange (optional) Basic credentials for a bearer token at `realm`.
    pub fn fetch_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: &str,
        credentials: Option<&BasicCredentials>,
    ) -> Result<String, RegistryError> {
        debug!("GET {realm} (scope {scope})");
        let mut req = self.agent.get(realm).query("scope", scope);
        if let Some(service) = service {
            req = req.query("service", service);
        }
        if let Some(creds) = credentials {
            req = req.header("Authorization", &format!("Basic {}", creds.encode()));
        }
        let mut resp = req
            .call()
            .map_err(|e| RegistryError::Http(format!("{realm}: {e}")))?;

        match resp.status().as_u16() {
            200 => {}
            401 | 403 if credentials.is_some() => {
                return Err(RegistryError::Config(format!(
                    "credentials rejected by {realm}"
                )));
            }
            401 | 403 => {
                return Err(RegistryError::Config(format!(
                    "{realm} refused anonymous access; configure credentials"
                )));
            }
            code => return Err(RegistryError::Http(format!("HTTP {code} for {realm}"))),
        }

        let body = resp
            .body_mut()
            .read_to_string()
            .map_err(|e| RegistryError::Http(format!("{realm}: {e}")))?;
        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| RegistryError::Http(format!("{realm}: invalid token response: {e}")))?;
        parsed
            .token
            .or(parsed.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RegistryError::Http(format!("{realm}: token response has no token")))
    }

    /// Verify Basic credentials directly against `GET /v2/`.
    pub fn verify_basic(
        &self,
        api_base: &str,
        credentials: &BasicCredentials,
    ) -> Result<(), RegistryError> {
        let url = format!("{api_base}/v2/");
        let resp = self
            .agent
            .get(&url)
            .header("Authorization", &format!("Basic {}", credentials.encode()))
            .call()
            .map_err(|e| RegistryError::Http(format!("{url}: {e}")))?;
        match resp.status().as_u16() {
            200 => Ok(()),
            401 | 403 => Err(RegistryError::Config(format!(
                "credentials rejected by {url}"
            ))),
            code => Err(RegistryError::Http(format!("HTTP {code} for {url}"))),
        }
    }

    /// Every tag of `repository`, following `Link` pagination.
    pub fn list_tags(
        &self,
        api_base: &str,
        repository: &str,
        auth: &AuthHeaders,
    ) -> Result<Vec<String>, RegistryError> {
        let mut url = format!("{api_base}/v2/{repository}/tags/list");
        let mut tags = Vec::new();
        for _ in 0..MAX_TAG_PAGES {
            debug!("GET {url}");
            let mut req = self.agent.get(&url);
            for (name, value) in auth.iter() {
                req = req.header(name, value);
            }
            let mut resp = req
                .call()
                .map_err(|e| RegistryError::Http(format!("{url}: {e}")))?;
            let code = resp.status().as_u16();
            if code != 200 {
                return Err(denied(&url, code));
            }
            let next = resp
                .headers()
                .get("link")
                .and_then(|v| v.to_str().ok())
                .and_then(|link| next_page(api_base, link));
            let body = resp
                .body_mut()
                .read_to_string()
                .map_err(|e| RegistryError::Http(format!("{url}: {e}")))?;
            let page: TagList = serde_json::from_str(&body)
                .map_err(|e| RegistryError::Http(format!("{url}: invalid tag list: {e}")))?;
            tags.extend(page.tags.unwrap_or_default());
            match next {
                Some(next) => url = next,
                None => return Ok(tags),
            }
        }
        warn!("{repository}: tag list truncated after {MAX_TAG_PAGES} pages");
        Ok(tags)
    }

    /// Content digest the registry serves for `repository:reference`.
    pub fn manifest_digest(
        &self,
        api_base: &str,
        repository: &str,
        reference: &str,
        auth: &AuthHeaders,
    ) -> Result<String, RegistryError> {
        let url = format!("{api_base}/v2/{repository}/manifests/{reference}");
        debug!("HEAD {url}");
        let mut req = self.agent.head(&url).header("Accept", MANIFEST_TYPES);
        for (name, value) in auth.iter() {
            req = req.header(name, value);
        }
        let resp = req
            .call()
            .map_err(|e| RegistryError::Http(format!("{url}: {e}")))?;
        let code = resp.status().as_u16();
        if code != 200 {
            return Err(denied(&url, code));
        }
        resp.headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| RegistryError::Http(format!("{url}: no Docker-Content-Digest header")))
    }

    /// Full flow: fetch the challenge of the registry, then answer its challenge for a pull
    /// on `repository`.
    pub fn authenticate(
        &self,
        api_base: &str,
        repository: &str,
        credentials: Option<&BasicCredentials>,
    ) -> Result<AuthHeaders, RegistryError> {
        match self.challenge(api_base)? {
            Challenge::Open => Ok(AuthHeaders::none()),
            Challenge::Basic { .. } => {
                let creds = credentials.ok_or_else(|| {
                    RegistryError::Config(format!("{api_base} requires Basic credentials"))
                })?;
                self.verify_basic(api_base, creds)?;
                Ok(AuthHeaders::basic(&creds.encode()))
            }
            Challenge::Bearer { realm, service, .. } => {
                let scope = format!("repository:{repository}:pull");
                let token = self.fetch_token(&realm, service.as_deref(), &scope, credentials)?;
                Ok(AuthHeaders::bearer(&token))
            }
        }
    }
}
