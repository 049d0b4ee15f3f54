//! Asset manifest: the URLs that must be in the static partition after install.

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

/// Build-time list of assets to pre-cache, split into the offline shell
/// (`core`) and blog imagery (`images`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetManifest {
    pub core: Vec<String>,
    pub images: Vec<String>,
}

impl Default for AssetManifest {
    fn default() -> Self {
        Self {
            core: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/offline.html".to_string(),
                "/assets/css/styles.css".to_string(),
                "/assets/js/blog-display.js".to_string(),
            ],
            images: vec![
                "/assets/images/blog/default-blog-image.svg".to_string(),
                "/assets/images/blog/ppc-trends.jpg".to_string(),
                "/assets/images/blog/roi-calculation.jpg".to_string(),
                "/assets/images/blog/google-ads-optimization.jpg".to_string(),
            ],
        }
    }
}

/// Manifest entries resolved against the site origin.
#[derive(Debug, Clone, Default)]
pub struct ResolvedManifest {
    /// Absolute URLs, first occurrence order, no duplicates.
    pub urls: Vec<Url>,
    /// Entries that could not be parsed, with the parse error.
    pub rejected: Vec<(String, String)>,
}

impl AssetManifest {
    /// Core entries followed by image entries.
    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.core.iter().chain(self.images.iter()).map(String::as_str)
    }

    /// Total number of raw entries, duplicates included.
    pub fn len(&self) -> usize {
        self.core.len() + self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve every entry against `origin`.
    ///
    /// Duplicates collapse to their first occurrence and unparsable entries
    /// are set aside; neither aborts resolution.
    pub fn resolve(&self, origin: &Url) -> ResolvedManifest {
        let mut seen = HashSet::new();
        let mut resolved = ResolvedManifest::default();

        for entry in self.entries() {
            match origin.join(entry) {
                Ok(mut url) => {
                    url.set_fragment(None);
                    if seen.insert(url.as_str().to_string()) {
                        resolved.urls.push(url);
                    }
                }
                Err(e) => {
                    warn!(entry, error = %e, "Skipping invalid manifest entry");
                    resolved.rejected.push((entry.to_string(), e.to_string()));
                }
            }
        }

        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Url {
        Url::parse("https://mpdigital.com/").unwrap()
    }

    #[test]
    fn test_default_manifest_shape() {
        let manifest = AssetManifest::default();
        assert_eq!(manifest.core.len(), 5);
        assert_eq!(manifest.images.len(), 4);
        assert!(manifest.entries().any(|e| e == "/offline.html"));
    }

    #[test]
    fn test_resolve_deduplicates_in_order() {
        let manifest = AssetManifest {
            core: vec![
                "./index.html".into(),
                "/index.html".into(),
                "/assets/css/styles.css".into(),
            ],
            images: vec![
                "/assets/images/blog/ppc-trends.jpg".into(),
                "./assets/images/blog/ppc-trends.jpg".into(),
            ],
        };

        let resolved = manifest.resolve(&origin());
        let urls: Vec<&str> = resolved.urls.iter().map(Url::as_str).collect();
        assert_eq!(
            urls,
            vec![
                "https://mpdigital.com/index.html",
                "https://mpdigital.com/assets/css/styles.css",
                "https://mpdigital.com/assets/images/blog/ppc-trends.jpg",
            ]
        );
        assert!(resolved.rejected.is_empty());
    }

    #[test]
    fn test_resolve_keeps_query_versions_distinct() {
        let manifest = AssetManifest {
            core: vec![],
            images: vec![
                "/assets/images/blog/default-blog-image.svg?v=1.1.6".into(),
                "/assets/images/blog/default-blog-image.svg".into(),
            ],
        };
        assert_eq!(manifest.resolve(&origin()).urls.len(), 2);
    }

    #[test]
    fn test_resolve_rejects_garbage_without_failing() {
        let manifest = AssetManifest {
            core: vec!["http://[::1".into(), "/blog.html".into()],
            images: vec![],
        };
        let resolved = manifest.resolve(&origin());
        assert_eq!(resolved.urls.len(), 1);
        assert_eq!(resolved.rejected.len(), 1);
    }

    #[test]
    fn test_cross_origin_entries_stay_absolute() {
        let manifest = AssetManifest {
            core: vec![
                "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.0.0/css/all.min.css".into(),
            ],
            images: vec![],
        };
        let resolved = manifest.resolve(&origin());
        assert_eq!(resolved.urls[0].host_str(), Some("cdnjs.cloudflare.com"));
    }
}
