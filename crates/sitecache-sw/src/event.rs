//! Extendable events: background work that must finish before the host
//! considers an event done.

use std::future::Future;

use sitecache_net::Request;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Lifetime-extension registry for one event.
///
/// Work passed to [`wait_until`](Self::wait_until) starts immediately on the
/// runtime; [`settle`](Self::settle) waits for all of it. Dropping the event
/// without settling aborts outstanding work.
#[derive(Debug)]
pub struct ExtendableEvent {
    kind: &'static str,
    tasks: JoinSet<()>,
}

impl ExtendableEvent {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            tasks: JoinSet::new(),
        }
    }

    /// Event kind ("install", "fetch", "sync", ...).
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Keep the event alive until `work` completes.
    pub fn wait_until<F>(&mut self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(work);
    }

    /// Registered work not yet joined.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for all registered work. Returns how many tasks ran to completion.
    pub async fn settle(mut self) -> usize {
        let mut completed = 0;
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(()) => completed += 1,
                Err(e) => warn!(event = self.kind, error = %e, "Extended work failed"),
            }
        }
        debug!(event = self.kind, completed, "Event settled");
        completed
    }
}

/// A fetch event.
#[derive(Debug)]
pub struct FetchEvent {
    /// The intercepted request.
    pub request: Request,

    /// Client that issued it.
    pub client_id: Option<String>,

    lifetime: ExtendableEvent,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
            lifetime: ExtendableEvent::new("fetch"),
        }
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Keep the event alive until `work` completes.
    pub fn wait_until<F>(&mut self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.lifetime.wait_until(work);
    }

    /// Registered work not yet joined.
    pub fn pending(&self) -> usize {
        self.lifetime.pending()
    }

    /// Hand over the lifetime so the host can settle it after responding.
    pub fn into_lifetime(self) -> ExtendableEvent {
        self.lifetime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use url::Url;

    #[tokio::test]
    async fn test_settle_waits_for_work() {
        let done = Arc::new(AtomicUsize::new(0));
        let mut event = ExtendableEvent::new("install");

        for delay in [5u64, 15, 1] {
            let done = done.clone();
            event.wait_until(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(event.pending(), 3);

        assert_eq!(event.settle().await, 3);
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_panicking_work_does_not_poison_settle() {
        let mut event = ExtendableEvent::new("fetch");
        event.wait_until(async { panic!("cache write blew up") });
        event.wait_until(async {});
        assert_eq!(event.settle().await, 1);
    }

    #[tokio::test]
    async fn test_fetch_event_lifetime() {
        let request = sitecache_net::Request::get(Url::parse("https://mpdigital.com/").unwrap());
        let mut event = FetchEvent::new(request).with_client("client-1");
        event.wait_until(async {});
        assert_eq!(event.client_id.as_deref(), Some("client-1"));
        assert_eq!(event.pending(), 1);
        assert_eq!(event.into_lifetime().settle().await, 1);
    }
}
