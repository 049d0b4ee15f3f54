//! Worker configuration
//!
//! Everything the worker needs is passed in through [`WorkerConfig`]; the
//! partition names are derived from `version` once, in [`CacheNames`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::manifest::AssetManifest;
use crate::ServiceWorkerError;

/// Semantic role of a cache partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionRole {
    /// Pre-cached manifest assets and cache-first fills.
    Static,
    /// Runtime API responses and prefetched assets, age-tagged.
    Dynamic,
    /// Offline page and placeholder image.
    Offline,
}

impl PartitionRole {
    pub const ALL: [PartitionRole; 3] = [Self::Static, Self::Dynamic, Self::Offline];

    /// Name prefix; the version tag follows.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Static => "static-cache",
            Self::Dynamic => "dynamic-cache",
            Self::Offline => "offline-cache",
        }
    }
}

/// The three current partition names for one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
    pub static_cache: String,
    pub dynamic_cache: String,
    pub offline_cache: String,
}

impl CacheNames {
    /// Compute names from a version tag.
    pub fn for_version(version: &str) -> Self {
        let name = |role: PartitionRole| format!("{}-{}", role.prefix(), version);
        Self {
            static_cache: name(PartitionRole::Static),
            dynamic_cache: name(PartitionRole::Dynamic),
            offline_cache: name(PartitionRole::Offline),
        }
    }

    /// Name for a role.
    pub fn name(&self, role: PartitionRole) -> &str {
        match role {
            PartitionRole::Static => &self.static_cache,
            PartitionRole::Dynamic => &self.dynamic_cache,
            PartitionRole::Offline => &self.offline_cache,
        }
    }

    /// All three names.
    pub fn all(&self) -> [&str; 3] {
        [
            self.static_cache.as_str(),
            self.dynamic_cache.as_str(),
            self.offline_cache.as_str(),
        ]
    }

    /// Whether `name` is one of the current partitions.
    pub fn is_current(&self, name: &str) -> bool {
        self.all().contains(&name)
    }
}

/// Strategy for same-origin static content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StaticStrategy {
    /// Cached copy first, background refresh on hit.
    #[default]
    CacheFirst,
    /// Cached copy first, network always issued and always refreshes.
    StaleWhileRevalidate,
}

/// Push notification presentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub title: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    /// Page opened (or focused) on notification click.
    pub target_url: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            title: "MP Digital Blog".to_string(),
            icon: "/assets/notification-icon.png".to_string(),
            badge: "/assets/notification-badge.png".to_string(),
            vibrate: vec![100, 50, 100],
            target_url: "/".to_string(),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Version tag embedded in every partition name.
    pub version: String,

    /// Site origin; relative URLs resolve against it.
    pub origin: Url,

    /// Assets pre-cached at install.
    pub manifest: AssetManifest,

    /// Assets warmed into the dynamic partition during idle time.
    pub prefetch: Vec<String>,

    /// Path fragments that mark API requests.
    pub api_markers: Vec<String>,

    /// Network-first deadline.
    pub network_timeout_ms: u64,

    /// How long a dynamic entry may stand in for a failed API call.
    pub api_cache_duration_ms: u64,

    /// Dynamic entries older than this are evicted.
    pub max_cache_age_ms: u64,

    /// Strategy for non-API GETs.
    pub static_strategy: StaticStrategy,

    /// Offline page served for failed navigations.
    pub offline_page: String,

    /// Image served for failed image requests.
    pub placeholder_image: String,

    /// Attempts per manifest asset during install (1 = no retries).
    pub install_retry: u32,

    /// Per-partition entry quota; writes beyond it fail.
    pub max_entries_per_partition: Option<usize>,

    /// Push notification presentation.
    pub notification: NotificationConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            version: "1.1.7".to_string(),
            origin: Url::parse("https://mpdigital.com/").expect("static origin URL is valid"),
            manifest: AssetManifest::default(),
            prefetch: vec![
                "/assets/images/hero-banner.jpg".to_string(),
                "/assets/fonts/main-font.woff2".to_string(),
            ],
            api_markers: vec!["/api/".to_string(), "/graphql".to_string()],
            network_timeout_ms: 5_000,
            api_cache_duration_ms: 60 * 60 * 1000,     // 1 hour
            max_cache_age_ms: 7 * 24 * 60 * 60 * 1000, // 7 days
            static_strategy: StaticStrategy::CacheFirst,
            offline_page: "/offline.html".to_string(),
            placeholder_image: "/assets/images/blog/default-blog-image.svg".to_string(),
            install_retry: 1,
            max_entries_per_partition: None,
            notification: NotificationConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Default config for another origin.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    /// Parse from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self, ServiceWorkerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ServiceWorkerError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file and validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServiceWorkerError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ServiceWorkerError::ConfigError(format!("{}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        if self.version.trim().is_empty() {
            return Err(ServiceWorkerError::ConfigError(
                "version must not be empty".to_string(),
            ));
        }
        if !matches!(self.origin.scheme(), "http" | "https") || self.origin.host().is_none() {
            return Err(ServiceWorkerError::ConfigError(format!(
                "origin must be an absolute http(s) URL: {}",
                self.origin
            )));
        }
        if self.network_timeout_ms == 0 {
            return Err(ServiceWorkerError::ConfigError(
                "network_timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_cache_age_ms == 0 {
            return Err(ServiceWorkerError::ConfigError(
                "max_cache_age_ms must be positive".to_string(),
            ));
        }
        if self.api_cache_duration_ms > self.max_cache_age_ms {
            return Err(ServiceWorkerError::ConfigError(
                "api_cache_duration_ms exceeds max_cache_age_ms".to_string(),
            ));
        }
        if self.api_markers.iter().any(|m| m.is_empty()) {
            return Err(ServiceWorkerError::ConfigError(
                "api_markers must not contain empty strings".to_string(),
            ));
        }
        self.resolve(&self.offline_page)?;
        self.resolve(&self.placeholder_image)?;
        self.resolve(&self.notification.target_url)?;
        Ok(())
    }

    /// Partition names for this version.
    pub fn cache_names(&self) -> CacheNames {
        CacheNames::for_version(&self.version)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn api_cache_duration(&self) -> Duration {
        Duration::from_millis(self.api_cache_duration_ms)
    }

    pub fn max_cache_age(&self) -> Duration {
        Duration::from_millis(self.max_cache_age_ms)
    }

    /// Periodic cleanup runs at half the max age.
    pub fn cleanup_interval(&self) -> Duration {
        self.max_cache_age() / 2
    }

    /// Resolve a site-relative URL.
    pub fn resolve(&self, path: &str) -> Result<Url, ServiceWorkerError> {
        self.origin
            .join(path)
            .map_err(|e| ServiceWorkerError::ConfigError(format!("{}: {}", path, e)))
    }

    /// Whether `url` belongs to the site origin.
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }
}
