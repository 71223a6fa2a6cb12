//! Container image reference parsing.
//!
//! Follows the distribution reference grammar closely enough for
//! classification: the first path component is a registry domain only when
//! it contains a `.` or a `:`, or is exactly `localhost`.

use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DOCKER_HUB_DOMAIN: &str = "docker.io";
pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self, SchemaError> {
        let invalid = |reason: &str| SchemaError::InvalidImage {
            reference: reference.to_owned(),
            reason: reason.to_owned(),
        };

        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty reference"));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }

        let (name_tag, digest) = match trimmed.split_once('@') {
            Some((n, d)) if d.contains(':') => (n, Some(d.to_owned())),
            Some(_) => return Err(invalid("digest must be algorithm:hex")),
            None => (trimmed, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones are ports.
        let last_slash = name_tag.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                let tag = &name_tag[split + 1..];
                if tag.is_empty() {
                    return Err(invalid("empty tag"));
                }
                (&name_tag[..split], Some(tag.to_owned()))
            }
            None => (name_tag, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_ascii_lowercase()), rest)
            }
            _ => (None, name),
        };

        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(invalid("empty repository path component"));
        }

        Ok(Self {
            registry,
            repository: repository.to_owned(),
            tag,
            digest,
        })
    }

    /// Registry host, `docker.io` when the reference names none.
    pub fn domain(&self) -> &str {
        self.registry.as_deref().unwrap_or(DOCKER_HUB_DOMAIN)
    }

    pub fn tag_or_default(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// Fully qualified form with registry and tag filled in.
    #[must_use]
    pub fn qualified(&self, registry: &str) -> Self {
        Self {
            registry: Some(registry.to_owned()),
            repository: self.repository.clone(),
            tag: Some(self.tag_or_default().to_owned()),
            digest: self.digest.clone(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref registry) = self.registry {
            write!(f, "{registry}/")?;
        }
        f.write_str(&self.repository)?;
        if let Some(ref tag) = self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(ref digest) = self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name() {
        let r = ImageRef::parse("nginx").unwrap();
        assert_eq!(r.registry, None);
        assert_eq!(r.repository, "nginx");
        assert_eq!(r.tag, None);
        assert_eq!(r.domain(), "docker.io");
        assert_eq!(r.tag_or_default(), "latest");
    }

    #[test]
    fn user_repository_is_not_a_domain() {
        let r = ImageRef::parse("linuxserver/sonarr:4.0").unwrap();
        assert_eq!(r.registry, None);
        assert_eq!(r.repository, "linuxserver/sonarr");
        assert_eq!(r.tag.as_deref(), Some("4.0"));
    }

    #[test]
    fn registry_with_port_and_tag() {
        let r = ImageRef::parse("registry.local:5000/team/app:v2").unwrap();
        assert_eq!(r.registry.as_deref(), Some("registry.local:5000"));
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag.as_deref(), Some("v2"));
    }

    #[test]
    fn localhost_is_a_domain() {
        let r = ImageRef::parse("localhost/app").unwrap();
        assert_eq!(r.registry.as_deref(), Some("localhost"));
    }

    #[test]
    fn digest_is_preserved() {
        let r = ImageRef::parse("ghcr.io/org/tool@sha256:abcd").unwrap();
        assert_eq!(r.registry.as_deref(), Some("ghcr.io"));
        assert_eq!(r.digest.as_deref(), Some("sha256:abcd"));
        assert_eq!(r.to_string(), "ghcr.io/org/tool@sha256:abcd");
    }

    #[test]
    fn qualified_fills_registry_and_tag() {
        let r = ImageRef::parse("redis").unwrap().qualified("docker.io");
        assert_eq!(r.to_string(), "docker.io/redis:latest");
    }

    #[test]
    fn rejects_malformed() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("nginx:").is_err());
        assert!(ImageRef::parse("a//b").is_err());
        assert!(ImageRef::parse("nginx@latest").is_err());
    }
}
