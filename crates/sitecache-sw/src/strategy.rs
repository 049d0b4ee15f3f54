//! Caching strategies.
//!
//! Cache writes that happen after a response is already on its way back are
//! registered on the [`FetchEvent`] with `wait_until`, never left untracked.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::StatusCode;
use sitecache_common::with_timeout;
use sitecache_net::{Fetcher, NetError, Request, Response};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{stamp_fetched_on, CacheEntry, SharedCacheStorage};
use crate::config::{CacheNames, WorkerConfig};
use crate::event::FetchEvent;
use crate::router::{RequestClass, Strategy};
use crate::ServiceWorkerError;

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Current cache entry.
    Cache,
    /// Live network.
    Network,
    /// Dynamic entry used because the network failed or was too slow.
    StaleCache,
    /// Offline page from the offline partition.
    OfflinePage,
    /// Placeholder image from the offline partition.
    Placeholder,
    /// Generated 503.
    Synthetic,
}

/// A response plus its provenance.
#[derive(Debug, Clone)]
pub struct ServedResponse {
    pub response: Response,
    pub source: ResponseSource,
}

impl ServedResponse {
    pub fn new(response: Response, source: ResponseSource) -> Self {
        Self { response, source }
    }

    /// Served from any partition rather than the live network.
    pub fn is_from_cache(&self) -> bool {
        !matches!(self.source, ResponseSource::Network | ResponseSource::Synthetic)
    }
}

/// The 503 returned for API calls with no usable fallback.
pub fn network_error_response(url: Url) -> Response {
    let body = serde_json::json!({ "error": "Network error" }).to_string();
    Response::new(url, StatusCode::SERVICE_UNAVAILABLE, body).with_content_type("application/json")
}

/// Write a response into an existing partition, logging instead of failing.
///
/// Never creates the partition: a write that outlives its worker must not
/// bring back a partition that activation already deleted.
pub(crate) async fn store(
    caches: &SharedCacheStorage,
    partition: &str,
    request: &Request,
    response: &Response,
) -> bool {
    let mut caches = caches.write().await;
    let Some(cache) = caches.get_mut(partition) else {
        debug!(cache = partition, url = %request.url, "Partition is gone, dropping write");
        return false;
    };
    match cache.put(request, response) {
        Ok(()) => {
            debug!(cache = partition, url = %request.url, "Cached response");
            true
        }
        Err(e) => {
            warn!(cache = partition, url = %request.url, error = %e, "Cache write failed");
            false
        }
    }
}

/// Whether a stamped dynamic entry may stand in for a failed API call.
fn within_window(entry: &CacheEntry, now: DateTime<Utc>, window: Duration) -> bool {
    matches!(entry.age_at(now), Some(age) if age < window)
}

/// Runs the strategy the router picked.
#[derive(Clone)]
pub struct StrategyExecutor {
    caches: SharedCacheStorage,
    fetcher: Arc<dyn Fetcher>,
    names: CacheNames,
    network_timeout: Duration,
    api_cache_duration: Duration,
    offline_page: Url,
    placeholder_image: Url,
}

impl StrategyExecutor {
    pub fn new(
        config: &WorkerConfig,
        caches: SharedCacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        Ok(Self {
            caches,
            fetcher,
            names: config.cache_names(),
            network_timeout: config.network_timeout(),
            api_cache_duration: config.api_cache_duration(),
            offline_page: config.resolve(&config.offline_page)?,
            placeholder_image: config.resolve(&config.placeholder_image)?,
        })
    }

    /// Serve `event.request` with `strategy`.
    pub async fn execute(
        &self,
        strategy: Strategy,
        class: RequestClass,
        event: &mut FetchEvent,
    ) -> Result<ServedResponse, ServiceWorkerError> {
        match strategy {
            Strategy::CacheFirst => self.cache_first(class, event).await,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(class, event).await,
            Strategy::NetworkFirst => self.network_first(event).await,
            Strategy::NetworkOnly => self.network_only(class, event).await,
        }
    }

    async fn lookup(&self, partition: &str, request: &Request) -> Option<Response> {
        let caches = self.caches.read().await;
        caches
            .get(partition)
            .and_then(|cache| cache.match_request(request))
            .map(|entry| entry.to_response())
    }

    /// Cached copy if present, refreshed in the background; otherwise network,
    /// then offline fallback.
    async fn cache_first(
        &self,
        class: RequestClass,
        event: &mut FetchEvent,
    ) -> Result<ServedResponse, ServiceWorkerError> {
        let request = event.request.clone();
        let partition = self.names.static_cache.clone();

        if let Some(cached) = self.lookup(&partition, &request).await {
            debug!(url = %request.url, "Cache HIT");
            let caches = self.caches.clone();
            let fetcher = self.fetcher.clone();
            event.wait_until(async move {
                match fetcher.fetch(&request).await {
                    Ok(fresh) if fresh.is_cacheable() => {
                        if store(&caches, &partition, &request, &fresh).await {
                            debug!(url = %request.url, "Cache updated");
                        }
                    }
                    Ok(fresh) => {
                        debug!(
                            url = %request.url,
                            status = %fresh.status,
                            "Revalidation response not cacheable"
                        );
                    }
                    Err(e) => {
                        warn!(url = %request.url, error = %e, "Background revalidation failed");
                    }
                }
            });
            return Ok(ServedResponse::new(cached, ResponseSource::Cache));
        }

        debug!(url = %request.url, "Cache MISS");
        match self.fetcher.fetch(&request).await {
            Ok(response) => {
                if response.is_cacheable() {
                    let caches = self.caches.clone();
                    let copy = response.clone();
                    event.wait_until(async move {
                        store(&caches, &partition, &request, &copy).await;
                    });
                }
                Ok(ServedResponse::new(response, ResponseSource::Network))
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Fetch failed");
                self.offline_fallback(&request, class, e.to_string()).await
            }
        }
    }

    /// The network request is always issued and always refreshes the cache;
    /// a cached copy, when present, answers first.
    async fn stale_while_revalidate(
        &self,
        class: RequestClass,
        event: &mut FetchEvent,
    ) -> Result<ServedResponse, ServiceWorkerError> {
        let request = event.request.clone();
        let partition = self.names.static_cache.clone();
        let cached = self.lookup(&partition, &request).await;

        let rx = self.spawn_fetch_and_store(event, partition, false);

        if let Some(cached) = cached {
            debug!(url = %request.url, "Cache HIT, revalidating");
            return Ok(ServedResponse::new(cached, ResponseSource::Cache));
        }

        debug!(url = %request.url, "Cache MISS, awaiting network");
        let failure = match rx.await {
            Ok(Ok(response)) => return Ok(ServedResponse::new(response, ResponseSource::Network)),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "network task ended without a result".to_string(),
        };
        warn!(url = %request.url, error = %failure, "Fetch failed");
        self.offline_fallback(&request, class, failure).await
    }

    /// Race the network against the deadline; fall back to a fresh-enough
    /// dynamic entry, then to a synthetic 503.
    async fn network_first(
        &self,
        event: &mut FetchEvent,
    ) -> Result<ServedResponse, ServiceWorkerError> {
        let request = event.request.clone();
        let partition = self.names.dynamic_cache.clone();
        let rx = self.spawn_fetch_and_store(event, partition.clone(), true);

        let failure = match with_timeout(self.network_timeout, || rx).await {
            Ok(Ok(Ok(response))) => {
                return Ok(ServedResponse::new(response, ResponseSource::Network));
            }
            Ok(Ok(Err(e))) => e.to_string(),
            Ok(Err(_)) => "network task ended without a result".to_string(),
            Err(e) => e.to_string(),
        };
        warn!(url = %request.url, error = %failure, "API request failed, trying cache");

        let now = Utc::now();
        let fallback = {
            let caches = self.caches.read().await;
            caches
                .get(&partition)
                .and_then(|cache| cache.match_request(&request))
                .filter(|entry| within_window(entry, now, self.api_cache_duration))
                .map(|entry| entry.to_response())
        };

        match fallback {
            Some(response) => {
                debug!(url = %request.url, "Serving cached API response");
                Ok(ServedResponse::new(response, ResponseSource::StaleCache))
            }
            None => Ok(ServedResponse::new(
                network_error_response(request.url.clone()),
                ResponseSource::Synthetic,
            )),
        }
    }

    /// Network, then offline fallback. Nothing is cached.
    async fn network_only(
        &self,
        class: RequestClass,
        event: &mut FetchEvent,
    ) -> Result<ServedResponse, ServiceWorkerError> {
        match self.fetcher.fetch(&event.request).await {
            Ok(response) => Ok(ServedResponse::new(response, ResponseSource::Network)),
            Err(e) => {
                warn!(url = %event.request.url, error = %e, "Fetch failed");
                self.offline_fallback(&event.request, class, e.to_string()).await
            }
        }
    }

    /// Issue the fetch as extended work. The response goes to the returned
    /// receiver first; a cacheable copy is written afterwards, so a caller that
    /// stopped waiting still gets the cache refreshed.
    fn spawn_fetch_and_store(
        &self,
        event: &mut FetchEvent,
        partition: String,
        stamp: bool,
    ) -> oneshot::Receiver<Result<Response, NetError>> {
        let (tx, rx) = oneshot::channel();
        let request = event.request.clone();
        let caches = self.caches.clone();
        let fetcher = self.fetcher.clone();

        event.wait_until(async move {
            match fetcher.fetch(&request).await {
                Ok(response) => {
                    let to_store = response.is_cacheable().then(|| {
                        if stamp {
                            stamp_fetched_on(response.clone(), Utc::now())
                        } else {
                            response.clone()
                        }
                    });
                    // receiver is gone once the deadline passed
                    let _ = tx.send(Ok(response));
                    if let Some(copy) = to_store {
                        store(&caches, &partition, &request, &copy).await;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                }
            }
        });

        rx
    }

    /// Last resort for a request nothing else could answer.
    pub async fn offline_fallback(
        &self,
        request: &Request,
        class: RequestClass,
        cause: String,
    ) -> Result<ServedResponse, ServiceWorkerError> {
        let caches = self.caches.read().await;
        let offline = caches.get(&self.names.offline_cache);

        if class == RequestClass::Image || request.accepts("image") {
            if let Some(entry) = offline.and_then(|c| c.match_url(&self.placeholder_image)) {
                debug!(url = %request.url, "Serving placeholder image");
                return Ok(ServedResponse::new(entry.to_response(), ResponseSource::Placeholder));
            }
        }

        if class == RequestClass::Navigation || request.accepts("text/html") {
            if let Some(entry) = offline.and_then(|c| c.match_url(&self.offline_page)) {
                debug!(url = %request.url, "Serving offline page");
                return Ok(ServedResponse::new(entry.to_response(), ResponseSource::OfflinePage));
            }
        }

        Err(ServiceWorkerError::NetworkError(format!(
            "{}: {}",
            request.url, cause
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_network_error_response() {
        let response =
            network_error_response(Url::parse("https://mpdigital.com/api/posts").unwrap());
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.text().unwrap(), r#"{"error":"Network error"}"#);
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert!(!response.is_cacheable());
    }

    #[test]
    fn test_served_from_cache() {
        let u = Url::parse("https://mpdigital.com/offline.html").unwrap();
        let offline = Response::new(u.clone(), StatusCode::OK, "offline");
        let served = ServedResponse::new(offline, ResponseSource::OfflinePage);
        assert!(served.is_from_cache());
        let served = ServedResponse::new(network_error_response(u), ResponseSource::Synthetic);
        assert!(!served.is_from_cache());
    }

    #[test]
    fn test_api_window_is_exclusive() {
        let fetched = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let u = Url::parse("https://mpdigital.com/api/posts").unwrap();
        let stamped = stamp_fetched_on(Response::new(u.clone(), StatusCode::OK, "[]"), fetched);
        let entry = CacheEntry::from_response(u.clone(), &stamped);
        let window = Duration::from_millis(3_600_000);

        let just_inside = fetched + chrono::Duration::milliseconds(3_599_999);
        assert!(within_window(&entry, just_inside, window));
        let at_limit = fetched + chrono::Duration::milliseconds(3_600_000);
        assert!(!within_window(&entry, at_limit, window));

        let plain = Response::new(u.clone(), StatusCode::OK, "[]");
        let unstamped = CacheEntry::from_response(u, &plain);
        assert!(!within_window(&unstamped, just_inside, window));
    }

    #[tokio::test]
    async fn test_store_never_creates_partition() {
        let caches = crate::cache::shared(crate::CacheStorage::new());
        let u = Url::parse("https://mpdigital.com/assets/js/extra.js").unwrap();
        let request = Request::get(u.clone());
        let response = Response::new(u, StatusCode::OK, "x");

        assert!(!store(&caches, "static-cache-1.1.6", &request, &response).await);
        assert!(!caches.read().await.has("static-cache-1.1.6"));

        caches.write().await.open("static-cache-1.1.7");
        assert!(store(&caches, "static-cache-1.1.7", &request, &response).await);
    }
}
