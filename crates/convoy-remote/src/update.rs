//! Update detection: newer version tags, or a moved digest for tags that
//! are not versions (`latest`, `stable`, ...).

use crate::{AuthHeaders, RegistryError, RegistryProvider};
use convoy_schema::{ImageRef, ImageUpdate};
use semver::Version;
use std::cmp::Ordering;
use tracing::debug;

/// A tag read as a version: `1`, `1.25`, `v2.3.1`, `1.25-alpine`.
///
/// Two tags are comparable only when they have the same number of numeric
/// components and the same suffix, so `1.25-alpine` never upgrades to
/// `1.26` and `1.25` never to a date tag like `20240101`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagVersion {
    pub version: Version,
    pub components: usize,
    pub suffix: String,
}

impl TagVersion {
    pub fn parse(tag: &str) -> Option<Self> {
        let bare = tag.strip_prefix('v').unwrap_or(tag);
        let (numbers, suffix) = bare.split_once('-').unwrap_or((bare, ""));
        let parts: Vec<u64> = numbers
            .split('.')
            .map(|p| {
                if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
                    None
                } else {
                    p.parse().ok()
                }
            })
            .collect::<Option<_>>()?;
        if parts.is_empty() || parts.len() > 3 {
            return None;
        }
        let at = |i: usize| parts.get(i).copied().unwrap_or(0);
        Some(Self {
            version: Version::new(at(0), at(1), at(2)),
            components: parts.len(),
            suffix: suffix.to_owned(),
        })
    }

    pub fn is_comparable(&self, other: &Self) -> bool {
        self.components == other.components && self.suffix == other.suffix
    }
}

/// Highest tag in `tags` that is a newer, comparable version of `current`.
pub fn newest_tag<'a>(current: &TagVersion, tags: &'a [String]) -> Option<&'a str> {
    tags.iter()
        .filter_map(|t| TagVersion::parse(t).map(|v| (t.as_str(), v)))
        .filter(|(_, v)| v.is_comparable(current) && v.version > current.version)
        .max_by(|(a, va), (b, vb)| match va.version.cmp(&vb.version) {
            // `v1.2` and `1.2` are the same version; prefer the shorter spelling.
            Ordering::Equal => b.len().cmp(&a.len()),
            other => other,
        })
        .map(|(t, _)| t)
}

/// Ask `provider` whether a newer image exists for `image`.
///
/// Version tags are compared against the tag list. Other tags are compared
/// by digest, which needs `local_digest`. Pinned references and non-version
/// tags without a local digest give `None`.
pub fn check_update(
    provider: &dyn RegistryProvider,
    image: &ImageRef,
    local_digest: Option<&str>,
    auth: &AuthHeaders,
) -> Result<Option<ImageUpdate>, RegistryError> {
    if image.digest.is_some() {
        return Ok(None);
    }
    let tag = image.tag_or_default();

    if let Some(current) = TagVersion::parse(tag) {
        let tags = provider.tags(image, auth)?;
        let newest = newest_tag(&current, &tags);
        debug!("{image}: {} tag(s), newest {newest:?}", tags.len());
        return Ok(Some(ImageUpdate {
            latest_tag: newest.unwrap_or(tag).to_owned(),
            remote_digest: None,
            available: newest.is_some(),
        }));
    }

    let Some(local) = local_digest else {
        return Ok(None);
    };
    let remote = provider.manifest_digest(image, auth)?;
    Ok(Some(ImageUpdate {
        latest_tag: tag.to_owned(),
        available: remote != local,
        remote_digest: Some(remote),
    }))
}
