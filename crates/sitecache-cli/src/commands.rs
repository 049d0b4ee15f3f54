//! Command implementations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sitecache_net::{LoaderConfig, Request, ResourceLoader};
use sitecache_sw::cache::shared;
use sitecache_sw::{CacheStorage, ServiceWorkerContainer, ServiceWorkerEvent, WorkerConfig};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

use crate::args::{FetchArgs, InstallArgs, PushArgs};

/// A container wired to the real network and the on-disk snapshot.
pub struct Host {
    config: WorkerConfig,
    store: PathBuf,
    container: ServiceWorkerContainer,
    events: UnboundedReceiver<ServiceWorkerEvent>,
}

impl Host {
    pub async fn open(config: WorkerConfig, store: PathBuf) -> Result<Self> {
        let storage = CacheStorage::load(&store, config.max_entries_per_partition)
            .await
            .with_context(|| format!("loading cache snapshot {}", store.display()))?;
        let loader = ResourceLoader::new(LoaderConfig::for_origin(config.origin.clone()))
            .context("building HTTP client")?;
        let (container, events) = ServiceWorkerContainer::new(shared(storage), Arc::new(loader));

        Ok(Self {
            config,
            store,
            container,
            events,
        })
    }

    async fn resume(&self) -> Result<()> {
        self.container
            .resume(self.config.clone())
            .await
            .with_context(|| {
                format!(
                    "version {} is not installed; run `sitecache install` first",
                    self.config.version
                )
            })?;
        Ok(())
    }

    /// Wait for background cache writes, then persist.
    async fn finish(mut self, save: bool) -> Result<()> {
        self.container.wait_idle().await;
        while let Ok(event) = self.events.try_recv() {
            debug!(?event, "Worker event");
        }
        if save {
            let caches = self.container.caches();
            let caches = caches.read().await;
            caches
                .save(&self.store)
                .await
                .with_context(|| format!("saving cache snapshot {}", self.store.display()))?;
        }
        Ok(())
    }
}

pub async fn install(host: Host, args: InstallArgs) -> Result<()> {
    let report = host
        .container
        .register(host.config.clone())
        .await
        .context("installing worker")?;

    println!(
        "Installed {} for {}: {} cached, {} failed",
        host.config.version,
        host.config.origin,
        report.cached.len(),
        report.failed.len()
    );
    for (url, reason) in &report.failed {
        println!("  failed   {url}: {reason}");
    }
    for (entry, reason) in &report.rejected {
        println!("  rejected {entry}: {reason}");
    }

    if !args.no_prefetch {
        let stored = host.container.prefetch().await?;
        println!("Prefetched {stored} of {}", host.config.prefetch.len());
    }

    host.finish(true).await
}

pub async fn fetch(host: Host, args: FetchArgs) -> Result<()> {
    host.resume().await?;

    let url = host
        .config
        .origin
        .join(&args.url)
        .with_context(|| format!("invalid URL {}", args.url))?;
    let mut request = if args.navigate {
        Request::navigate(url)
    } else {
        Request::get(url)
    };
    if let Some(accept) = &args.accept {
        request = request.accept(accept);
    }

    let served = host.container.fetch(request).await?;
    let response = &served.response;
    println!(
        "{} {:?} {} {} bytes",
        response.status.as_u16(),
        served.source,
        response.header("content-type").unwrap_or("-"),
        response.body().len()
    );
    if args.body {
        println!("{}", String::from_utf8_lossy(response.body()));
    }

    host.finish(true).await
}

pub async fn cleanup(host: Host) -> Result<()> {
    host.resume().await?;
    let removed = host.container.cleanup().await?;
    println!("Removed {removed} expired entries");
    host.finish(true).await
}

pub async fn status(host: Host) -> Result<()> {
    let names = host.config.cache_names();
    {
        let caches = host.container.caches();
        let caches = caches.read().await;
        let keys = caches.keys();
        if keys.is_empty() {
            println!("No partitions in {}", host.store.display());
        }
        for name in keys {
            let count = caches.get(name).map(|c| c.len()).unwrap_or(0);
            let marker = if names.is_current(name) { "current" } else { "stale" };
            println!("{name:<28} {count:>6}  {marker}");
        }
    }
    host.finish(false).await
}

pub async fn push(host: Host, args: PushArgs) -> Result<()> {
    host.resume().await?;

    let notification = host.container.push(&args.text).await?;
    println!("{}", serde_json::to_string_pretty(&notification)?);

    if args.click {
        let client = host.container.notification_click(&notification).await?;
        println!("Notification clicked, client {client}");
    }

    host.finish(false).await
}
