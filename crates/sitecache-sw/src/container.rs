//! The host side: registration, clients, and event dispatch.

use std::sync::Arc;

use sitecache_net::{Fetcher, Request};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::SharedCacheStorage;
use crate::clients::{Client, Clients};
use crate::config::WorkerConfig;
use crate::event::{ExtendableEvent, FetchEvent};
use crate::gc::CleanupTask;
use crate::lifecycle::{ServiceWorkerId, WorkerState};
use crate::message::WorkerMessage;
use crate::push::Notification;
use crate::strategy::{ResponseSource, ServedResponse};
use crate::worker::{FetchOutcome, InstallReport, OfflineWorker};
use crate::{ServiceWorkerError, ServiceWorkerEvent};

/// The site's registration.
#[derive(Debug)]
struct Registration {
    scope: Url,
    installing: Option<Arc<OfflineWorker>>,
    waiting: Option<Arc<OfflineWorker>>,
    active: Option<Arc<OfflineWorker>>,
}

impl Registration {
    fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }
}

/// Snapshot of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationInfo {
    pub scope: Url,
    pub installing: Option<(ServiceWorkerId, WorkerState)>,
    pub waiting: Option<(ServiceWorkerId, WorkerState)>,
    pub active: Option<(ServiceWorkerId, WorkerState)>,
}

fn describe(worker: &Option<Arc<OfflineWorker>>) -> Option<(ServiceWorkerId, WorkerState)> {
    worker.as_ref().map(|w| (w.id(), w.state()))
}

/// Settle tasks of fetch events, plus the work already reaped from them.
#[derive(Default)]
struct Background {
    tasks: JoinSet<usize>,
    settled: usize,
}

impl Background {
    /// Collect finished tasks so the set only holds running ones.
    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            self.record(result);
        }
    }

    fn record(&mut self, result: Result<usize, tokio::task::JoinError>) {
        match result {
            Ok(completed) => self.settled += completed,
            Err(e) => warn!(error = %e, "Fetch event task failed"),
        }
    }
}

/// Hosts workers for one site.
pub struct ServiceWorkerContainer {
    fetcher: Arc<dyn Fetcher>,

    /// Cache storage.
    caches: SharedCacheStorage,

    registration: RwLock<Option<Registration>>,

    /// Clients.
    clients: Arc<RwLock<Clients>>,

    cleanup: Mutex<Option<CleanupTask>>,

    /// Fetch events still finishing their extended work.
    background: Mutex<Background>,

    /// Event sender for page-visible signals.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(
        caches: SharedCacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                fetcher,
                caches,
                registration: RwLock::new(None),
                clients: Arc::new(RwLock::new(Clients::new())),
                cleanup: Mutex::new(None),
                background: Mutex::new(Background::default()),
                event_tx,
            },
            event_rx,
        )
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker: &OfflineWorker) {
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id: worker.id(),
            state: worker.state(),
        });
    }

    pub fn caches(&self) -> SharedCacheStorage {
        self.caches.clone()
    }

    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        self.clients.clone()
    }

    /// Register and install a worker for `config`.
    ///
    /// The new worker waits if an older one still controls open clients;
    /// otherwise it activates right away.
    pub async fn register(
        &self,
        config: WorkerConfig,
    ) -> Result<InstallReport, ServiceWorkerError> {
        let scope = config.origin.clone();
        let worker = Arc::new(
            OfflineWorker::new(config, self.caches.clone(), self.fetcher.clone())
                .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?,
        );

        {
            let mut registration = self.registration.write().await;
            let registration = registration.get_or_insert_with(|| Registration::new(scope.clone()));
            if registration.scope != scope {
                return Err(ServiceWorkerError::RegistrationFailed(format!(
                    "scope {} is already registered, not {}",
                    registration.scope, scope
                )));
            }
            if registration.installing.is_some() {
                return Err(ServiceWorkerError::RegistrationFailed(
                    "another worker is installing".to_string(),
                ));
            }
            registration.installing = Some(worker.clone());
        }
        info!(worker = %worker.id(), scope = %scope, "Registering worker");
        self.emit(ServiceWorkerEvent::UpdateFound {
            scope: scope.clone(),
            worker_id: worker.id(),
        });

        let installed = worker.install().await;
        self.emit_state(&worker);

        let report = {
            let mut guard = self.registration.write().await;
            let Some(registration) = guard.as_mut() else {
                worker.mark_redundant();
                return Err(ServiceWorkerError::RegistrationFailed(
                    "unregistered during install".to_string(),
                ));
            };
            registration.installing = None;

            match installed {
                Ok(report) => {
                    if let Some(replaced) = registration.waiting.replace(worker.clone()) {
                        replaced.mark_redundant();
                        self.emit_state(&replaced);
                    }
                    report
                }
                Err(e) => {
                    worker.mark_redundant();
                    self.emit_state(&worker);
                    return Err(ServiceWorkerError::RegistrationFailed(e.to_string()));
                }
            }
        };

        let has_active = self.active_worker().await.is_some();
        let has_clients = !self.clients.read().await.is_empty();
        if !has_active || !has_clients {
            self.activate_waiting().await?;
        } else {
            info!(worker = %worker.id(), "New version waiting");
            self.emit(ServiceWorkerEvent::UpdateAvailable {
                scope,
                worker_id: worker.id(),
            });
        }

        Ok(report)
    }

    /// Make an already-installed version active again, e.g. after a host
    /// restart with caches loaded from a snapshot.
    pub async fn resume(
        &self,
        config: WorkerConfig,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let scope = config.origin.clone();
        let worker = Arc::new(OfflineWorker::new(
            config,
            self.caches.clone(),
            self.fetcher.clone(),
        )?);
        worker.resume().await?;

        {
            let mut guard = self.registration.write().await;
            let registration = guard.get_or_insert_with(|| Registration::new(scope.clone()));
            if registration.scope != scope {
                return Err(ServiceWorkerError::RegistrationFailed(format!(
                    "scope {} is already registered, not {}",
                    registration.scope, scope
                )));
            }
            if let Some(old) = registration.active.replace(worker.clone()) {
                old.mark_redundant();
                self.emit_state(&old);
            }
        }
        self.emit_state(&worker);
        self.clients.write().await.claim(worker.id());
        *self.cleanup.lock().await = Some(worker.spawn_periodic_cleanup());
        Ok(worker.id())
    }

    /// Promote the waiting worker: retire the old one, drop obsolete
    /// partitions, claim every client, and restart periodic cleanup.
    pub async fn activate_waiting(&self) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let mut guard = self.registration.write().await;
        let registration = guard
            .as_mut()
            .ok_or_else(|| ServiceWorkerError::NotFound("no registration".to_string()))?;
        let worker = registration
            .waiting
            .take()
            .ok_or_else(|| ServiceWorkerError::StateError("no waiting worker".to_string()))?;

        if let Err(e) = worker.activate().await {
            worker.mark_redundant();
            self.emit_state(&worker);
            return Err(e);
        }
        if let Some(old) = registration.active.replace(worker.clone()) {
            old.mark_redundant();
            self.emit_state(&old);
        }
        drop(guard);
        self.emit_state(&worker);

        let changed = self.clients.write().await.claim(worker.id());
        for client_id in changed {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id,
                worker_id: worker.id(),
            });
        }

        *self.cleanup.lock().await = Some(worker.spawn_periodic_cleanup());
        Ok(worker.id())
    }

    /// Activate the waiting worker without waiting for clients to close.
    pub async fn skip_waiting(&self) -> Result<ServiceWorkerId, ServiceWorkerError> {
        self.activate_waiting().await
    }

    /// Deliver a JSON message from a page, addressed to the waiting worker if
    /// there is one, otherwise to the active worker.
    pub async fn post_message(&self, json: &str) -> Result<(), ServiceWorkerError> {
        let (target, is_waiting) = {
            let guard = self.registration.read().await;
            let registration = guard
                .as_ref()
                .ok_or_else(|| ServiceWorkerError::NotFound("no registration".to_string()))?;
            match (&registration.waiting, &registration.active) {
                (Some(waiting), _) => (waiting.clone(), true),
                (None, Some(active)) => (active.clone(), false),
                (None, None) => {
                    return Err(ServiceWorkerError::StateError(
                        "no worker to receive messages".to_string(),
                    ))
                }
            }
        };

        match target.handle_message(json)? {
            Some(WorkerMessage::SkipWaiting) if is_waiting => {
                self.skip_waiting().await?;
            }
            Some(WorkerMessage::SkipWaiting) => {
                debug!(worker = %target.id(), "Already active, skip-waiting ignored");
            }
            None => {}
        }
        Ok(())
    }

    pub async fn active_worker(&self) -> Option<Arc<OfflineWorker>> {
        self.registration
            .read()
            .await
            .as_ref()
            .and_then(|r| r.active.clone())
    }

    pub async fn waiting_worker(&self) -> Option<Arc<OfflineWorker>> {
        self.registration
            .read()
            .await
            .as_ref()
            .and_then(|r| r.waiting.clone())
    }

    async fn require_active(&self) -> Result<Arc<OfflineWorker>, ServiceWorkerError> {
        self.active_worker()
            .await
            .ok_or_else(|| ServiceWorkerError::StateError("no active worker".to_string()))
    }

    /// Fetch `request` as the page would: through the active worker when
    /// there is one, straight to the network otherwise.
    pub async fn fetch(&self, request: Request) -> Result<ServedResponse, ServiceWorkerError> {
        self.dispatch_fetch(FetchEvent::new(request)).await
    }

    /// [`fetch`](Self::fetch) on behalf of a specific client.
    pub async fn fetch_from(
        &self,
        client_id: &str,
        request: Request,
    ) -> Result<ServedResponse, ServiceWorkerError> {
        self.dispatch_fetch(FetchEvent::new(request).with_client(client_id))
            .await
    }

    async fn dispatch_fetch(
        &self,
        mut event: FetchEvent,
    ) -> Result<ServedResponse, ServiceWorkerError> {
        let Some(worker) = self.active_worker().await else {
            return self.network(&event.request).await;
        };

        let outcome = worker.handle_fetch(&mut event).await;
        let request = event.request.clone();
        if event.pending() > 0 {
            let mut background = self.background.lock().await;
            background.reap();
            background.tasks.spawn(event.into_lifetime().settle());
        }

        match outcome? {
            FetchOutcome::Respond(served) => Ok(served),
            FetchOutcome::Passthrough => self.network(&request).await,
        }
    }

    async fn network(&self, request: &Request) -> Result<ServedResponse, ServiceWorkerError> {
        self.fetcher
            .fetch(request)
            .await
            .map(|response| ServedResponse::new(response, ResponseSource::Network))
            .map_err(|e| ServiceWorkerError::NetworkError(format!("{}: {}", request.url, e)))
    }

    /// Wait until every fetch event's extended work has finished.
    /// Returns how many background tasks completed since the last call.
    pub async fn wait_idle(&self) -> usize {
        let mut drained = Background::default();
        loop {
            let pending = std::mem::take(&mut self.background.lock().await.tasks);
            if pending.is_empty() {
                break;
            }
            drained.tasks = pending;
            while let Some(result) = drained.tasks.join_next().await {
                drained.record(result);
            }
        }
        let reaped = std::mem::take(&mut self.background.lock().await.settled);
        drained.settled + reaped
    }

    /// Fetch events whose extended work has not been collected yet.
    pub async fn background_tasks(&self) -> usize {
        self.background.lock().await.tasks.len()
    }

    /// Start tracking an open page. It is controlled by the active worker, if any.
    pub async fn attach_client(&self, url: Url) -> String {
        let controller = self.active_worker().await.map(|w| w.id());
        let mut client = Client::window(url);
        client.controller = controller;
        let id = client.id.clone();
        self.clients.write().await.add(client);
        debug!(client = %id, "Client attached");
        id
    }

    /// Stop tracking a page. When the last page goes away a waiting worker
    /// takes over.
    pub async fn detach_client(&self, client_id: &str) -> Result<bool, ServiceWorkerError> {
        let (removed, now_empty) = {
            let mut clients = self.clients.write().await;
            let removed = clients.remove(client_id).is_some();
            (removed, clients.is_empty())
        };

        if removed && now_empty && self.waiting_worker().await.is_some() {
            info!("Last client closed, activating waiting worker");
            self.activate_waiting().await?;
        }
        Ok(removed)
    }

    /// Deliver a push payload to the active worker and show the notification.
    pub async fn push(&self, payload: &str) -> Result<Notification, ServiceWorkerError> {
        let worker = self.require_active().await?;
        let notification = worker.handle_push(payload);
        info!(title = %notification.title, "Showing notification");
        self.emit(ServiceWorkerEvent::NotificationShown {
            notification: notification.clone(),
        });
        Ok(notification)
    }

    /// Handle a click on a notification: focus a window already showing the
    /// target page, or open one. Returns the client ID.
    pub async fn notification_click(
        &self,
        notification: &Notification,
    ) -> Result<String, ServiceWorkerError> {
        let worker = self.require_active().await?;
        let target = worker.config().resolve(&worker.config().notification.target_url)?;
        debug!(key = notification.data.primary_key, "Notification closed");

        let mut clients = self.clients.write().await;
        if let Some(id) = clients.find_by_url(&target).map(|c| c.id.clone()) {
            clients.focus(&id)?;
            drop(clients);
            self.emit(ServiceWorkerEvent::ClientFocused { client_id: id.clone() });
            return Ok(id);
        }

        let client = clients.open_window(target.clone(), Some(worker.id()));
        drop(clients);
        info!(client = %client.id, url = %target, "Opened window");
        self.emit(ServiceWorkerEvent::WindowOpened {
            client_id: client.id.clone(),
            url: target,
        });
        Ok(client.id)
    }

    /// Fire a background sync. Returns whether the tag was recognized.
    pub async fn sync(&self, tag: &str) -> Result<bool, ServiceWorkerError> {
        let worker = self.require_active().await?;
        let mut event = ExtendableEvent::new("sync");
        let handled = worker.handle_sync(tag, &mut event);
        event.settle().await;
        Ok(handled)
    }

    /// Warm the active worker's prefetch list.
    pub async fn prefetch(&self) -> Result<usize, ServiceWorkerError> {
        Ok(self.require_active().await?.prefetch().await)
    }

    /// Run expired-entry cleanup once.
    pub async fn cleanup(&self) -> Result<usize, ServiceWorkerError> {
        Ok(self.require_active().await?.cleanup_expired().await)
    }

    pub async fn registration(&self) -> Option<RegistrationInfo> {
        self.registration.read().await.as_ref().map(|r| RegistrationInfo {
            scope: r.scope.clone(),
            installing: describe(&r.installing),
            waiting: describe(&r.waiting),
            active: describe(&r.active),
        })
    }

    /// Remove the registration. Caches are left in place.
    pub async fn unregister(&self) -> bool {
        let Some(registration) = self.registration.write().await.take() else {
            return false;
        };

        if let Some(task) = self.cleanup.lock().await.take() {
            task.stop();
        }

        for worker in [registration.installing, registration.waiting, registration.active]
            .into_iter()
            .flatten()
        {
            worker.mark_redundant();
            self.emit_state(&worker);
            self.clients.write().await.release(worker.id());
        }
        info!(scope = %registration.scope, "Unregistered");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{shared, CacheStorage};
    use async_trait::async_trait;
    use http::StatusCode;
    use sitecache_net::{NetError, Response};

    struct EchoFetcher;

    #[async_trait]
    impl Fetcher for EchoFetcher {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            Ok(Response::new(request.url.clone(), StatusCode::OK, request.url.path().to_string()))
        }
    }

    fn container() -> (ServiceWorkerContainer, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        ServiceWorkerContainer::new(shared(CacheStorage::new()), Arc::new(EchoFetcher))
    }

    #[tokio::test]
    async fn test_first_registration_activates() {
        let (container, mut events) = container();
        container.register(WorkerConfig::default()).await.unwrap();

        let info = container.registration().await.unwrap();
        assert_eq!(info.active.map(|(_, s)| s), Some(WorkerState::Activated));
        assert!(info.waiting.is_none());

        assert!(matches!(events.recv().await, Some(ServiceWorkerEvent::UpdateFound { .. })));
    }

    #[tokio::test]
    async fn test_uncontrolled_fetch_goes_to_network() {
        let (container, _events) = container();
        let served = container
            .fetch(Request::get(Url::parse("https://mpdigital.com/index.html").unwrap()))
            .await
            .unwrap();
        assert_eq!(served.source, ResponseSource::Network);
        assert!(container.caches().read().await.keys().is_empty());
    }

    #[tokio::test]
    async fn test_notification_click_focuses_then_opens() {
        let (container, _events) = container();
        container.register(WorkerConfig::default()).await.unwrap();
        let notification = container.push("hello").await.unwrap();

        let opened = container.notification_click(&notification).await.unwrap();
        let focused = container.notification_click(&notification).await.unwrap();
        assert_eq!(opened, focused);
        assert_eq!(container.clients().read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_resume_after_restart() {
        let caches = shared(CacheStorage::new());
        {
            let (first, _events) =
                ServiceWorkerContainer::new(caches.clone(), Arc::new(EchoFetcher));
            first.register(WorkerConfig::default()).await.unwrap();
        }

        let (second, _events) = ServiceWorkerContainer::new(caches, Arc::new(EchoFetcher));
        second.resume(WorkerConfig::default()).await.unwrap();
        let served = second
            .fetch(Request::get(Url::parse("https://mpdigital.com/index.html").unwrap()))
            .await
            .unwrap();
        assert_eq!(served.source, ResponseSource::Cache);
    }

    #[tokio::test]
    async fn test_unregister() {
        let (container, _events) = container();
        container.register(WorkerConfig::default()).await.unwrap();
        let worker = container.active_worker().await.unwrap();

        assert!(container.unregister().await);
        assert!(worker.state().is_redundant());
        assert!(container.registration().await.is_none());
        assert!(!container.unregister().await);
    }
}
