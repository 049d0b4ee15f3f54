//! The offline worker: one versioned instance of the caching layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use sitecache_common::{retry_with_backoff, RetryConfig};
use sitecache_net::{Fetcher, Request, Response};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{stamp_fetched_on, SharedCacheStorage};
use crate::config::{CacheNames, WorkerConfig};
use crate::event::{ExtendableEvent, FetchEvent};
use crate::gc::{self, CleanupTask};
use crate::lifecycle::{ServiceWorkerId, WorkerState};
use crate::message::{parse_message, InboundMessage, WorkerMessage};
use crate::push::{build_notification, Notification};
use crate::router::{Route, Router};
use crate::strategy::{store, ServedResponse, StrategyExecutor};
use crate::ServiceWorkerError;

/// Sync tag for replaying requests that failed while offline.
pub const SYNC_FAILED_REQUESTS: &str = "sync-failed-requests";

/// What the worker did with a fetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Not intercepted; the host should go to the network itself.
    Passthrough,
    /// Answered by the worker.
    Respond(ServedResponse),
}

/// Outcome of precaching during install.
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    /// URLs now in a partition.
    pub cached: Vec<Url>,
    /// URLs that could not be cached, with the reason.
    pub failed: Vec<(Url, String)>,
    /// Manifest entries that did not resolve to a URL, with the parse error.
    pub rejected: Vec<(String, String)>,
}

impl InstallReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.rejected.is_empty()
    }
}

/// A worker instance bound to one configuration version.
pub struct OfflineWorker {
    id: ServiceWorkerId,
    config: WorkerConfig,
    names: CacheNames,
    caches: SharedCacheStorage,
    fetcher: Arc<dyn Fetcher>,
    router: Router,
    strategies: StrategyExecutor,
    offline_urls: [Url; 2],
    state: watch::Sender<WorkerState>,
    notifications: AtomicU64,
}

impl std::fmt::Debug for OfflineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineWorker")
            .field("id", &self.id)
            .field("version", &self.config.version)
            .field("state", &self.state())
            .finish()
    }
}

impl OfflineWorker {
    /// Create a worker in the `Parsed` state.
    pub fn new(
        config: WorkerConfig,
        caches: SharedCacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        let strategies = StrategyExecutor::new(&config, caches.clone(), fetcher.clone())?;
        let offline_urls = [
            config.resolve(&config.offline_page)?,
            config.resolve(&config.placeholder_image)?,
        ];
        let (state, _) = watch::channel(WorkerState::Parsed);

        Ok(Self {
            id: ServiceWorkerId::next(),
            names: config.cache_names(),
            router: Router::new(&config),
            config,
            caches,
            fetcher,
            strategies,
            offline_urls,
            state,
            notifications: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn cache_names(&self) -> &CacheNames {
        &self.names
    }

    pub fn caches(&self) -> SharedCacheStorage {
        self.caches.clone()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn transition(&self, next: WorkerState) -> Result<(), ServiceWorkerError> {
        let mut from = WorkerState::Parsed;
        let changed = self.state.send_if_modified(|state| {
            from = *state;
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if !changed {
            return Err(ServiceWorkerError::StateError(format!(
                "{} cannot go from {} to {}",
                self.id, from, next
            )));
        }
        debug!(worker = %self.id, %from, to = %next, "State change");
        Ok(())
    }

    /// Precache the manifest into the static partition and the offline assets
    /// into the offline partition. Individual asset failures are reported,
    /// never fatal.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        self.transition(WorkerState::Installing)?;
        info!(worker = %self.id, version = %self.config.version, "Installing");

        self.open_partitions(&[
            self.names.static_cache.as_str(),
            self.names.offline_cache.as_str(),
        ])
        .await;

        let resolved = self.config.manifest.resolve(&self.config.origin);
        let mut report = InstallReport {
            rejected: resolved.rejected,
            ..Default::default()
        };

        self.precache(&self.names.static_cache, &resolved.urls, &mut report)
            .await;
        self.precache(&self.names.offline_cache, &self.offline_urls, &mut report)
            .await;

        if !report.failed.is_empty() {
            warn!(
                worker = %self.id,
                failed = report.failed.len(),
                cached = report.cached.len(),
                "Some assets failed to cache"
            );
        }

        self.transition(WorkerState::Installed)?;
        info!(worker = %self.id, cached = report.cached.len(), "Installed");
        Ok(report)
    }

    async fn precache(&self, partition: &str, urls: &[Url], report: &mut InstallReport) {
        let retry = RetryConfig::attempts(self.config.install_retry);
        let fetcher = &self.fetcher;

        let fetches = urls.iter().map(|url| {
            let retry = &retry;
            async move {
                let request = Request::get(url.clone());
                let result = {
                    let request = &request;
                    retry_with_backoff(retry, || async move {
                        match fetcher.fetch(request).await {
                            Ok(response) if response.is_cacheable() => Ok(response),
                            Ok(response) => Err(ServiceWorkerError::NetworkError(format!(
                                "status {} ({:?})",
                                response.status, response.response_type
                            ))),
                            Err(e) => Err(ServiceWorkerError::NetworkError(e.to_string())),
                        }
                    })
                    .await
                };
                (request, result)
            }
        });

        for (request, result) in join_all(fetches).await {
            match result {
                Ok(response) => {
                    if store(&self.caches, partition, &request, &response).await {
                        debug!(url = %request.url, cache = partition, "Cached asset");
                        report.cached.push(request.url);
                    } else {
                        report
                            .failed
                            .push((request.url, "cache write failed".to_string()));
                    }
                }
                Err(e) => {
                    warn!(url = %request.url, error = %e, "Failed to cache asset");
                    report.failed.push((request.url, e.to_string()));
                }
            }
        }
    }

    /// Delete every partition not belonging to this version and start serving.
    /// Returns the deleted partition names.
    pub async fn activate(&self) -> Result<Vec<String>, ServiceWorkerError> {
        self.transition(WorkerState::Activating)?;
        let deleted = gc::delete_stale_partitions(&self.caches, &self.names).await;
        self.open_partitions(&self.names.all()).await;
        self.transition(WorkerState::Activated)?;
        info!(
            worker = %self.id,
            version = %self.config.version,
            deleted = deleted.len(),
            "Activated"
        );
        Ok(deleted)
    }

    /// Create this version's partitions with its quota. Partitions of other
    /// versions are left as they are.
    async fn open_partitions(&self, names: &[&str]) {
        let mut caches = self.caches.write().await;
        for name in names {
            caches.open_with_quota(name, self.config.max_entries_per_partition);
        }
    }

    /// Take over partitions installed by an earlier process, without
    /// fetching anything. Fails if this version was never installed.
    pub async fn resume(&self) -> Result<(), ServiceWorkerError> {
        if !self.caches.read().await.has(&self.names.static_cache) {
            return Err(ServiceWorkerError::NotFound(format!(
                "{} is not installed",
                self.names.static_cache
            )));
        }
        self.open_partitions(&self.names.all()).await;
        for next in [
            WorkerState::Installing,
            WorkerState::Installed,
            WorkerState::Activating,
            WorkerState::Activated,
        ] {
            self.transition(next)?;
        }
        info!(worker = %self.id, version = %self.config.version, "Resumed from existing caches");
        Ok(())
    }

    /// Retire the worker. Safe to call in any state.
    pub fn mark_redundant(&self) {
        if self.transition(WorkerState::Redundant).is_ok() {
            info!(worker = %self.id, "Worker is redundant");
        }
    }

    /// Serve an intercepted request. Background cache work is registered on
    /// `event`; the host settles it after using the response.
    pub async fn handle_fetch(
        &self,
        event: &mut FetchEvent,
    ) -> Result<FetchOutcome, ServiceWorkerError> {
        if !self.state().is_active() {
            return Err(ServiceWorkerError::StateError(format!(
                "{} is {}, not serving fetches",
                self.id,
                self.state()
            )));
        }

        match self.router.route(&event.request) {
            Route::Passthrough => {
                debug!(method = %event.request.method, url = %event.request.url, "Passing through");
                Ok(FetchOutcome::Passthrough)
            }
            Route::Handle { class, strategy } => {
                debug!(url = %event.request.url, ?class, ?strategy, "Handling fetch");
                self.strategies
                    .execute(strategy, class, event)
                    .await
                    .map(FetchOutcome::Respond)
            }
        }
    }

    /// Parse a page message. Returns the message if it is one this worker acts on.
    pub fn handle_message(&self, json: &str) -> Result<Option<WorkerMessage>, ServiceWorkerError> {
        match parse_message(json)? {
            InboundMessage::Known(message) => {
                debug!(worker = %self.id, ?message, "Message received");
                Ok(Some(message))
            }
            InboundMessage::Unknown(_) => Ok(None),
        }
    }

    /// Turn a push payload into a notification.
    pub fn handle_push(&self, payload: &str) -> Notification {
        let key = self.notifications.fetch_add(1, Ordering::Relaxed) + 1;
        build_notification(&self.config.notification, payload, key, Utc::now())
    }

    /// Handle a background sync. Returns whether the tag was recognized.
    pub fn handle_sync(&self, tag: &str, event: &mut ExtendableEvent) -> bool {
        if tag != SYNC_FAILED_REQUESTS {
            debug!(tag, "Ignoring unknown sync tag");
            return false;
        }
        let worker = self.id;
        event.wait_until(async move {
            // nothing is queued while offline, so there is nothing to replay
            debug!(%worker, "Failed-request sync complete");
        });
        true
    }

    /// Warm the configured prefetch URLs into the dynamic partition, stamped
    /// so they age out. Returns how many were stored.
    pub async fn prefetch(&self) -> usize {
        let mut urls = Vec::new();
        for entry in &self.config.prefetch {
            match self.config.resolve(entry) {
                Ok(url) => urls.push(url),
                Err(e) => warn!(entry = %entry, error = %e, "Skipping prefetch entry"),
            }
        }

        let fetches = urls.into_iter().map(|url| async move {
            let request = Request::get(url);
            let result = self.fetcher.fetch(&request).await;
            (request, result)
        });

        let mut stored = 0;
        for (request, result) in join_all(fetches).await {
            match result {
                Ok(response) if response.is_cacheable() => {
                    let stamped = stamp_fetched_on(response, Utc::now());
                    if store(&self.caches, &self.names.dynamic_cache, &request, &stamped).await {
                        stored += 1;
                    }
                }
                Ok(response) => {
                    debug!(
                        url = %request.url,
                        status = %response.status,
                        "Prefetch response not cacheable"
                    );
                }
                Err(e) => warn!(url = %request.url, error = %e, "Prefetch failed"),
            }
        }
        debug!(stored, "Prefetch finished");
        stored
    }

    /// Fetch through this worker's network, bypassing every cache.
    pub async fn fetch_network(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        self.fetcher
            .fetch(request)
            .await
            .map_err(|e| ServiceWorkerError::NetworkError(format!("{}: {}", request.url, e)))
    }

    /// Remove expired stamped entries now.
    pub async fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Utc::now()).await
    }

    /// Remove entries that are expired as of `now`.
    pub async fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        gc::cleanup_expired(
            &self.caches,
            &[self.names.dynamic_cache.as_str()],
            self.config.max_cache_age(),
            now,
        )
        .await
    }

    /// Start the periodic cleanup timer.
    pub fn spawn_periodic_cleanup(&self) -> CleanupTask {
        gc::spawn_periodic_cleanup(
            self.caches.clone(),
            vec![self.names.dynamic_cache.clone()],
            self.config.max_cache_age(),
            self.config.cleanup_interval(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{shared, CacheStorage};
    use async_trait::async_trait;
    use http::StatusCode;
    use sitecache_net::NetError;

    /// Serves every URL with a 200 except those ending in `missing`.
    struct SiteFetcher;

    #[async_trait]
    impl Fetcher for SiteFetcher {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            if request.url.path().ends_with("missing") {
                return Err(NetError::Offline(request.url.to_string()));
            }
            Ok(Response::new(request.url.clone(), StatusCode::OK, request.url.path().to_string()))
        }
    }

    fn worker(config: WorkerConfig) -> OfflineWorker {
        OfflineWorker::new(config, shared(CacheStorage::new()), Arc::new(SiteFetcher)).unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle_order_is_enforced() {
        let worker = worker(WorkerConfig::default());
        assert!(matches!(worker.activate().await, Err(ServiceWorkerError::StateError(_))));

        let mut states = worker.subscribe();
        worker.install().await.unwrap();
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), WorkerState::Installed);

        assert!(worker.install().await.is_err());
        worker.activate().await.unwrap();
        assert!(worker.state().is_active());

        worker.mark_redundant();
        assert!(worker.state().is_redundant());
    }

    #[tokio::test]
    async fn test_install_reports_partial_failure() {
        let mut config = WorkerConfig::default();
        config.manifest.images.push("/assets/images/missing".to_string());
        let worker = worker(config);

        let report = worker.install().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(!report.is_complete());
        // 5 core + 4 images + offline page + placeholder
        assert_eq!(report.cached.len(), 11);
        assert_eq!(worker.state(), WorkerState::Installed);
    }

    #[tokio::test]
    async fn test_resume_requires_installed_partitions() {
        let caches = shared(CacheStorage::new());
        let first =
            OfflineWorker::new(WorkerConfig::default(), caches.clone(), Arc::new(SiteFetcher))
                .unwrap();
        assert!(matches!(first.resume().await, Err(ServiceWorkerError::NotFound(_))));

        first.install().await.unwrap();
        let second =
            OfflineWorker::new(WorkerConfig::default(), caches, Arc::new(SiteFetcher)).unwrap();
        second.resume().await.unwrap();
        assert!(second.state().is_active());
    }

    #[tokio::test]
    async fn test_fetch_requires_activation() {
        let worker = worker(WorkerConfig::default());
        let home = Url::parse("https://mpdigital.com/").unwrap();
        let mut event = FetchEvent::new(Request::get(home));
        assert!(matches!(
            worker.handle_fetch(&mut event).await,
            Err(ServiceWorkerError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_prefetch_stamps_dynamic_entries() {
        let worker = worker(WorkerConfig::default());
        worker.install().await.unwrap();
        worker.activate().await.unwrap();
        assert_eq!(worker.prefetch().await, 2);

        let caches = worker.caches();
        let caches = caches.read().await;
        let dynamic = caches.get("dynamic-cache-1.1.7").unwrap();
        assert_eq!(dynamic.len(), 2);
        assert!(dynamic.entries().all(|e| e.fetched_on().is_some()));
    }

    #[test]
    fn test_push_keys_increase() {
        let worker = worker(WorkerConfig::default());
        assert_eq!(worker.handle_push("a").data.primary_key, 1);
        assert_eq!(worker.handle_push("b").data.primary_key, 2);
    }

    #[tokio::test]
    async fn test_sync_tags() {
        let worker = worker(WorkerConfig::default());
        let mut event = ExtendableEvent::new("sync");
        assert!(worker.handle_sync(SYNC_FAILED_REQUESTS, &mut event));
        assert!(!worker.handle_sync("sync-analytics", &mut event));
        assert_eq!(event.settle().await, 1);
    }

    #[test]
    fn test_handle_message() {
        let worker = worker(WorkerConfig::default());
        assert_eq!(
            worker.handle_message(r#"{"type":"SKIP_WAITING"}"#).unwrap(),
            Some(WorkerMessage::SkipWaiting)
        );
        assert_eq!(worker.handle_message(r#"{"type":"PING"}"#).unwrap(), None);
        assert!(worker.handle_message("{").is_err());
    }
}
