//! Cache partitions and the storage that holds them.
//!
//! ```text
//! CacheStorage
//!     └── Cache (partition, e.g. "static-cache-1.1.7")
//!             └── URL → CacheEntry
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use http::{HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use sitecache_net::{Request, Response, ResponseType};
use tokio::sync::RwLock;
use url::Url;

use crate::ServiceWorkerError;

/// Header injected into dynamic entries to track their age.
pub const FETCHED_ON_HEADER: &str = "sw-fetched-on";

/// Storage shared between a worker, its background tasks, and the host.
pub type SharedCacheStorage = Arc<RwLock<CacheStorage>>;

/// Wrap storage for sharing.
pub fn shared(storage: CacheStorage) -> SharedCacheStorage {
    Arc::new(RwLock::new(storage))
}

/// Lookup key for a URL: the URL without its fragment.
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// Copy of `response` carrying a `sw-fetched-on` stamp.
pub fn stamp_fetched_on(response: Response, now: DateTime<Utc>) -> Response {
    match HeaderValue::from_str(&now.to_rfc3339()) {
        Ok(value) => response.with_header(HeaderName::from_static(FETCHED_ON_HEADER), value),
        Err(_) => response,
    }
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: Url,

    /// Request method (always GET).
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers, lowercase names.
    pub headers: HashMap<String, String>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Bytes,

    /// Written at (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a response for storage under `url`.
    pub fn from_response(url: Url, response: &Response) -> Self {
        let mut headers: HashMap<String, String> = HashMap::new();
        for (name, value) in response.headers.iter() {
            let Ok(value) = value.to_str() else { continue };
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        Self {
            url,
            method: "GET".to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body().clone(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild a response from this entry.
    pub fn to_response(&self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let mut response = Response::new(self.url.clone(), status, self.body.clone())
            .with_type(ResponseType::Basic);
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                response.headers.insert(name, value);
            }
        }
        response
    }

    /// Parsed `sw-fetched-on` stamp, if any.
    pub fn fetched_on(&self) -> Option<DateTime<Utc>> {
        self.headers
            .get(FETCHED_ON_HEADER)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Age relative to `now`; stamps from the future count as zero.
    /// `None` when the entry was never stamped.
    pub fn age_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        let fetched = self.fetched_on()?;
        Some(
            now.signed_duration_since(fetched)
                .to_std()
                .unwrap_or(Duration::ZERO),
        )
    }
}

mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// A cache partition.
#[derive(Debug, Default)]
pub struct Cache {
    /// Partition name.
    pub name: String,

    /// Cached entries by key.
    entries: HashMap<String, CacheEntry>,

    /// Entry quota.
    max_entries: Option<usize>,
}

impl Cache {
    /// Create a new partition.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
            max_entries: None,
        }
    }

    /// Match a URL.
    pub fn match_url(&self, url: &Url) -> Option<&CacheEntry> {
        self.entries.get(&cache_key(url))
    }

    /// Match a request. Only GETs can ever match.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        if !request.is_get() {
            return None;
        }
        self.match_url(&request.url)
    }

    /// Store a response for a request.
    pub fn put(
        &mut self,
        request: &Request,
        response: &Response,
    ) -> Result<(), ServiceWorkerError> {
        if !request.is_get() {
            return Err(ServiceWorkerError::CacheError(format!(
                "refusing to cache {} {}",
                request.method, request.url
            )));
        }
        self.put_url(&request.url, response)
    }

    /// Store a response under a URL (implied GET).
    pub fn put_url(&mut self, url: &Url, response: &Response) -> Result<(), ServiceWorkerError> {
        if !response.is_cacheable() {
            return Err(ServiceWorkerError::CacheError(format!(
                "response for {} is not cacheable (status {}, {:?})",
                url, response.status, response.response_type
            )));
        }

        let key = cache_key(url);
        if let Some(max) = self.max_entries {
            if !self.entries.contains_key(&key) && self.entries.len() >= max {
                return Err(ServiceWorkerError::CacheError(format!(
                    "quota exceeded for {} ({} entries)",
                    self.name, max
                )));
            }
        }

        let entry = CacheEntry::from_response(url.clone(), response);
        self.entries.insert(key, entry);
        Ok(())
    }

    /// Insert a prepared entry (snapshot restore).
    pub(crate) fn insert_entry(&mut self, entry: CacheEntry) {
        self.entries.insert(cache_key(&entry.url), entry);
    }

    /// Delete entry.
    pub fn delete(&mut self, url: &Url) -> bool {
        self.entries.remove(&cache_key(url)).is_some()
    }

    /// Drop every entry for which `keep` returns false. Returns how many went.
    pub fn retain(&mut self, mut keep: impl FnMut(&CacheEntry) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| keep(entry));
        before - self.entries.len()
    }

    /// All entries.
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Get all keys (URLs), sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_max_entries(&mut self, max_entries: Option<usize>) {
        self.max_entries = max_entries;
    }
}

/// Cache storage (caches global).
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
    quota: Option<usize>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage whose partitions cap at `max_entries` each.
    pub fn with_quota(max_entries: Option<usize>) -> Self {
        Self {
            caches: HashMap::new(),
            quota: max_entries,
        }
    }

    /// Open a partition and cap it at `max_entries`. Other partitions keep
    /// their own quota.
    pub fn open_with_quota(&mut self, name: &str, max_entries: Option<usize>) -> &mut Cache {
        let cache = self.open(name);
        cache.set_max_entries(max_entries);
        cache
    }

    /// Open a partition (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        let quota = self.quota;
        self.caches.entry(name.to_string()).or_insert_with(|| {
            let mut cache = Cache::new(name);
            cache.set_max_entries(quota);
            cache
        })
    }

    /// Borrow a partition without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Mutably borrow a partition without creating it.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Cache> {
        self.caches.get_mut(name)
    }

    /// Check if a partition exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a partition.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// All partition names, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.caches.keys().map(|s| s.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    /// Entries across all partitions.
    pub fn total_entries(&self) -> usize {
        self.caches.values().map(Cache::len).sum()
    }

    pub(crate) fn partitions(&self) -> impl Iterator<Item = &Cache> {
        self.caches.values()
    }
}
