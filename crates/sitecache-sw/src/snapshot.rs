//! JSON snapshots of [`CacheStorage`], so partitions survive a host restart.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sitecache_common::SiteCacheError;
use tracing::{debug, info};

use crate::cache::{CacheEntry, CacheStorage};

const SNAPSHOT_FORMAT: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    format: u32,
    partitions: Vec<PartitionSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PartitionSnapshot {
    name: String,
    entries: Vec<CacheEntry>,
}

impl CacheStorage {
    /// Serialize every partition.
    pub fn to_snapshot_json(&self) -> Result<String, SiteCacheError> {
        let mut partitions: Vec<PartitionSnapshot> = self
            .partitions()
            .map(|cache| PartitionSnapshot {
                name: cache.name.clone(),
                entries: cache.entries().cloned().collect(),
            })
            .collect();
        partitions.sort_by(|a, b| a.name.cmp(&b.name));

        serde_json::to_string_pretty(&Snapshot {
            format: SNAPSHOT_FORMAT,
            partitions,
        })
        .map_err(|e| SiteCacheError::cache_with_source("encoding snapshot", e))
    }

    /// Rebuild storage from a snapshot.
    pub fn from_snapshot_json(json: &str, quota: Option<usize>) -> Result<Self, SiteCacheError> {
        let snapshot: Snapshot = serde_json::from_str(json)
            .map_err(|e| SiteCacheError::cache_with_source("decoding snapshot", e))?;
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(SiteCacheError::cache(format!(
                "unsupported snapshot format {}",
                snapshot.format
            )));
        }

        let mut storage = CacheStorage::with_quota(quota);
        for partition in snapshot.partitions {
            let cache = storage.open(&partition.name);
            for entry in partition.entries {
                cache.insert_entry(entry);
            }
        }
        Ok(storage)
    }

    /// Write a snapshot file.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), SiteCacheError> {
        let path = path.as_ref();
        let json = self.to_snapshot_json()?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        info!(path = %path.display(), entries = self.total_entries(), "Cache snapshot saved");
        Ok(())
    }

    /// Read a snapshot file; a missing file yields empty storage.
    pub async fn load(
        path: impl AsRef<Path>,
        quota: Option<usize>,
    ) -> Result<Self, SiteCacheError> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(json) => {
                let storage = Self::from_snapshot_json(&json, quota)?;
                debug!(
                    path = %path.display(),
                    entries = storage.total_entries(),
                    "Cache snapshot loaded"
                );
                Ok(storage)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::with_quota(quota)),
            Err(e) => Err(e.into()),
        }
    }
}
