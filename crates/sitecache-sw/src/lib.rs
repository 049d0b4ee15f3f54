//! # sitecache offline worker
//!
//! Offline caching and request-serving layer for a content site.
//!
//! ## Features
//!
//! - **Versioned partitions**: `static-cache-{v}`, `dynamic-cache-{v}`, `offline-cache-{v}`
//! - **Lifecycle**: install (precache), activate (drop old versions), skip-waiting
//! - **Routing**: API, navigation, image, static, and cross-origin requests
//! - **Strategies**: cache-first, stale-while-revalidate, network-first with deadline
//! - **Offline fallback**: offline page for navigations, placeholder for images
//! - **Cleanup**: periodic expiry of stamped dynamic entries
//! - **Push**: notifications and notification clicks
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     │
//!     ├── Registration (scope = site origin)
//!     │       ├── installing (OfflineWorker)
//!     │       ├── waiting (OfflineWorker)
//!     │       └── active (OfflineWorker)
//!     │                 ├── Router
//!     │                 └── StrategyExecutor ──→ Fetcher
//!     │
//!     ├── Clients
//!     └── CacheStorage
//!             └── Cache (partition)
//!                     └── URL → CacheEntry
//! ```

use sitecache_common::SiteCacheError;
use thiserror::Error;
use url::Url;

pub mod cache;
pub mod clients;
pub mod config;
pub mod container;
pub mod event;
pub mod gc;
pub mod lifecycle;
pub mod manifest;
pub mod message;
pub mod push;
pub mod router;
mod snapshot;
pub mod strategy;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheStorage, SharedCacheStorage, FETCHED_ON_HEADER};
pub use clients::{Client, ClientType, Clients};
pub use config::{CacheNames, NotificationConfig, PartitionRole, StaticStrategy, WorkerConfig};
pub use container::{RegistrationInfo, ServiceWorkerContainer};
pub use event::{ExtendableEvent, FetchEvent};
pub use lifecycle::{ServiceWorkerId, WorkerState};
pub use manifest::AssetManifest;
pub use message::WorkerMessage;
pub use push::Notification;
pub use router::{RequestClass, Route, Router, Strategy};
pub use strategy::{ResponseSource, ServedResponse};
pub use worker::{FetchOutcome, InstallReport, OfflineWorker, SYNC_FAILED_REQUESTS};

/// Errors that can occur in worker operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Message error: {0}")]
    MessageError(String),
}

impl From<SiteCacheError> for ServiceWorkerError {
    fn from(err: SiteCacheError) -> Self {
        match err {
            SiteCacheError::Network { .. } | SiteCacheError::Timeout(_) => {
                Self::NetworkError(err.to_string())
            }
            SiteCacheError::Config { .. } => Self::ConfigError(err.to_string()),
            SiteCacheError::NotFound(what) => Self::NotFound(what),
            SiteCacheError::Cache { .. } | SiteCacheError::Io(_) => {
                Self::CacheError(err.to_string())
            }
        }
    }
}

/// Signals delivered to the page.
#[derive(Debug, Clone)]
pub enum ServiceWorkerEvent {
    /// A new worker started installing.
    UpdateFound { scope: Url, worker_id: ServiceWorkerId },
    /// A new worker is waiting while an older one controls pages.
    UpdateAvailable { scope: Url, worker_id: ServiceWorkerId },
    /// A worker changed state.
    StateChange {
        worker_id: ServiceWorkerId,
        state: WorkerState,
    },
    /// A client is now controlled by a different worker.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
    /// A notification was displayed.
    NotificationShown { notification: Notification },
    /// A window was opened in response to a notification click.
    WindowOpened { client_id: String, url: Url },
    /// An existing window was focused in response to a notification click.
    ClientFocused { client_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_conversion() {
        let err: ServiceWorkerError = SiteCacheError::Timeout(Duration::from_secs(5)).into();
        assert!(matches!(err, ServiceWorkerError::NetworkError(_)));

        let err: ServiceWorkerError = SiteCacheError::cache("quota").into();
        assert!(matches!(err, ServiceWorkerError::CacheError(_)));

        let err: ServiceWorkerError = SiteCacheError::NotFound("offline.html".into()).into();
        assert_eq!(err.to_string(), "Not found: offline.html");
    }
}
