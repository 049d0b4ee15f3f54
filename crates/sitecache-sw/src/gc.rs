//! Cache garbage collection: obsolete partitions on activation, expired
//! stamped entries on a timer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::SharedCacheStorage;
use crate::config::CacheNames;

/// Delete every partition whose name is not one of `current`.
/// Returns the deleted names, sorted.
pub async fn delete_stale_partitions(
    caches: &SharedCacheStorage,
    current: &CacheNames,
) -> Vec<String> {
    let mut caches = caches.write().await;
    let stale: Vec<String> = caches
        .keys()
        .into_iter()
        .filter(|name| !current.is_current(name))
        .map(str::to_string)
        .collect();

    for name in &stale {
        caches.delete(name);
        info!(cache = %name, "Deleting old cache");
    }
    stale
}

/// Remove entries in `partitions` whose `sw-fetched-on` stamp is older than
/// `max_age` at `now`. Unstamped entries are kept. Returns how many went.
pub async fn cleanup_expired(
    caches: &SharedCacheStorage,
    partitions: &[&str],
    max_age: Duration,
    now: DateTime<Utc>,
) -> usize {
    let mut caches = caches.write().await;
    let mut removed = 0;
    for name in partitions {
        let Some(cache) = caches.get_mut(name) else {
            continue;
        };
        let count = cache.retain(|entry| match entry.age_at(now) {
            Some(age) => age <= max_age,
            None => true,
        });
        if count > 0 {
            debug!(cache = %name, removed = count, "Expired entries removed");
        }
        removed += count;
    }
    if removed > 0 {
        info!(removed, "Cache cleanup finished");
    }
    removed
}

/// Handle for the periodic cleanup task. Dropping it stops the task.
#[derive(Debug)]
pub struct CleanupTask {
    handle: JoinHandle<()>,
}

impl CleanupTask {
    /// Stop the task.
    pub fn stop(self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Run [`cleanup_expired`] over `partitions` every `interval`.
pub fn spawn_periodic_cleanup(
    caches: SharedCacheStorage,
    partitions: Vec<String>,
    max_age: Duration,
    interval: Duration,
) -> CleanupTask {
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            let names: Vec<&str> = partitions.iter().map(String::as_str).collect();
            cleanup_expired(&caches, &names, max_age, Utc::now()).await;
        }
    });
    debug!(interval_secs = interval.as_secs(), "Periodic cache cleanup scheduled");
    CleanupTask { handle }
}
