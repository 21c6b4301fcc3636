//! Registry-wide construction options (component J, §6.3 of the option surface).
//!
//! Every field here is read-mostly after [`crate::registry::Registry`] construction; there
//! are no runtime mutators because backend implementations are free to snapshot these values
//! into their own `Repository`/`BlobStore`/`ManifestStore` types however is cheapest for
//! them (eg behind an `Arc`).
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::cache::{DescriptorCache, NoopCache};

/// An allow/deny regex pair. `is_allowed` returns `true` when either no allow regex is
/// configured or it matches, AND no deny regex is configured or it does not match -- deny
/// always wins over allow.
#[derive(Clone, Default)]
pub struct AllowDeny {
    pub allow: Option<Regex>,
    pub deny: Option<Regex>,
}

impl AllowDeny {
    pub fn is_allowed(&self, candidate: &str) -> bool {
        let allowed = self.allow.as_ref().map(|re| re.is_match(candidate)).unwrap_or(true);
        let denied = self.deny.as_ref().map(|re| re.is_match(candidate)).unwrap_or(false);
        allowed && !denied
    }
}

static DEFAULT_URL_ALLOW: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?://").unwrap());

/// A platform tuple used to restrict image-index existence validation to a subset of
/// platforms (§4.F, image-index image-existence check).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlatformTuple {
    pub architecture: String,
    pub os: String,
}

/// Image-index validation policy: whether to require that every referenced child manifest
/// already exists in the store, and if so, whether to restrict that requirement to a subset
/// of platforms.
#[derive(Clone, Default)]
pub struct ValidateImageIndexes {
    pub images_exist: bool,
    pub image_platforms: Vec<PlatformTuple>,
}

/// Construction-time options for [`crate::registry::Registry`]: delete/resumable-digest/
/// redirect toggles, manifest URL and media-type allow/deny policy, image-index validation,
/// tag-lookup concurrency, and the descriptor cache provider.
#[derive(Clone)]
pub struct Options {
    pub delete_enabled: bool,
    pub resumable_digest_enabled: bool,
    pub redirect_enabled: bool,

    pub manifest_urls: AllowDeny,
    pub manifest_config_media_types: AllowDeny,
    pub manifest_layer_media_types: AllowDeny,

    pub validate_image_indexes: ValidateImageIndexes,

    pub tag_lookup_concurrency_limit: usize,

    pub descriptor_cache: Arc<dyn DescriptorCache>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            delete_enabled: true,
            resumable_digest_enabled: true,
            redirect_enabled: false,
            manifest_urls: AllowDeny {
                allow: Some(DEFAULT_URL_ALLOW.clone()),
                deny: None,
            },
            manifest_config_media_types: AllowDeny::default(),
            manifest_layer_media_types: AllowDeny::default(),
            validate_image_indexes: ValidateImageIndexes::default(),
            tag_lookup_concurrency_limit: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            descriptor_cache: Arc::new(NoopCache),
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("delete_enabled", &self.delete_enabled)
            .field("resumable_digest_enabled", &self.resumable_digest_enabled)
            .field("redirect_enabled", &self.redirect_enabled)
            .field("tag_lookup_concurrency_limit", &self.tag_lookup_concurrency_limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allow_deny_defaults_to_allowed() {
        let ad = AllowDeny::default();
        assert!(ad.is_allowed("anything"));
    }

    #[test]
    fn deny_wins_over_allow() {
        let ad = AllowDeny {
            allow: Some(Regex::new(".*").unwrap()),
            deny: Some(Regex::new("^bad$").unwrap()),
        };
        assert!(ad.is_allowed("fine"));
        assert!(!ad.is_allowed("bad"));
    }

    #[test]
    fn allow_regex_restricts() {
        let ad = AllowDeny {
            allow: Some(Regex::new("^application/vnd\\.oci\\..*").unwrap()),
            deny: None,
        };
        assert!(ad.is_allowed("application/vnd.oci.image.layer.v1.tar"));
        assert!(!ad.is_allowed("application/vnd.docker.distribution.manifest.v1+json"));
    }
}
