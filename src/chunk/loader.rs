//! On-demand partition loading with coalescing, retries and fallback.

use ahash::AHashMap;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::manifest::{sha256_hex, ChunkManifest};
use super::retry::RetryPolicy;
use super::source::ChunkSource;
use crate::entry::{parse_catalog_bytes, ConfigEntry};
use crate::error::PartitionLoadError;
use crate::index::DomainIndex;

type SharedLoad = Shared<BoxFuture<'static, bool>>;

/// Observable state of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionStatus {
    /// Not in the manifest
    Unknown,
    /// In the manifest, never fetched
    Unloaded,
    /// Fetch in flight
    Loading,
    /// Merged into the index
    Loaded,
    /// Fetch and fallback both failed; the next request retries
    Failed,
}

enum Slot {
    Loading(SharedLoad),
    Loaded,
    Failed,
}

enum FallbackSlot {
    Idle,
    Loading(SharedLoad),
    Loaded,
}

/// Counters reported by [`ChunkLoader::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// Fetch attempts made against the source
    pub fetches: u64,
    /// Partition loads that exhausted their retries
    pub failures: u64,
    /// Full-catalog fallback loads started
    pub fallbacks: u64,
    pub loaded_partitions: usize,
}

/// Loads catalog partitions into a [`DomainIndex`] on demand.
///
/// Concurrent requests for the same partition share one in-flight load.
pub struct ChunkLoader {
    manifest: ChunkManifest,
    source: Arc<dyn ChunkSource>,
    index: Arc<DomainIndex>,
    retry: RetryPolicy,
    slots: Mutex<AHashMap<String, Slot>>,
    fallback: Mutex<FallbackSlot>,
    fetches: AtomicU64,
    failures: AtomicU64,
    fallbacks: AtomicU64,
}

impl ChunkLoader {
    pub fn new(
        manifest: ChunkManifest,
        source: Arc<dyn ChunkSource>,
        index: Arc<DomainIndex>,
        retry: RetryPolicy,
    ) -> Self {
        log::debug!(
            "Chunk loader covering {} domains in {} partitions",
            manifest.domain_count(),
            manifest.len()
        );
        Self {
            manifest,
            source,
            index,
            retry,
            slots: Mutex::new(AHashMap::new()),
            fallback: Mutex::new(FallbackSlot::Idle),
            fetches: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn manifest(&self) -> &ChunkManifest {
        &self.manifest
    }

    pub fn index(&self) -> &Arc<DomainIndex> {
        &self.index
    }

    /// Make sure the entries for `domain` are indexed.
    ///
    /// Returns `false` only for domains no partition covers, or when both the
    /// partition and the full catalog could not be loaded.
    pub async fn ensure_loaded(self: &Arc<Self>, domain: &str) -> bool {
        if self.index.contains(domain) {
            return true;
        }
        let name = match self.manifest.partition_for(domain) {
            Some(name) => name.to_string(),
            None => return false,
        };
        self.load(name).await
    }

    /// Load the partitions owning `domains`, concurrently.
    ///
    /// Returns how many of the domains' partitions ended up loaded.
    pub async fn preload<S: AsRef<str>>(self: &Arc<Self>, domains: &[S]) -> usize {
        let mut names: Vec<String> = domains
            .iter()
            .filter(|d| !self.index.contains(d.as_ref()))
            .filter_map(|d| self.manifest.partition_for(d.as_ref()))
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();

        let results = join_all(names.into_iter().map(|name| self.load(name))).await;
        results.into_iter().filter(|ok| *ok).count()
    }

    /// Load the full catalog and mark every partition loaded.
    pub async fn load_full_catalog(self: &Arc<Self>) -> bool {
        Arc::clone(self).load_fallback().await
    }

    /// Current state of a partition.
    pub fn status(&self, partition: &str) -> PartitionStatus {
        if self.manifest.partition(partition).is_none() {
            return PartitionStatus::Unknown;
        }
        match self.slots.lock().get(partition) {
            None => PartitionStatus::Unloaded,
            Some(Slot::Loading(_)) => PartitionStatus::Loading,
            Some(Slot::Loaded) => PartitionStatus::Loaded,
            Some(Slot::Failed) => PartitionStatus::Failed,
        }
    }

    /// State of the partition owning `domain`.
    pub fn status_for_domain(&self, domain: &str) -> PartitionStatus {
        match self.manifest.partition_for(domain) {
            Some(name) => self.status(name),
            None => PartitionStatus::Unknown,
        }
    }

    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            fetches: self.fetches.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            loaded_partitions: self
                .slots
                .lock()
                .values()
                .filter(|s| matches!(s, Slot::Loaded))
                .count(),
        }
    }

    /// Join the in-flight load for a partition or start one.
    async fn load(self: &Arc<Self>, name: String) -> bool {
        let pending = {
            let mut slots = self.slots.lock();
            let in_flight = match slots.get(&name) {
                Some(Slot::Loaded) => return true,
                Some(Slot::Loading(pending)) => Some(pending.clone()),
                Some(Slot::Failed) | None => None,
            };
            match in_flight {
                Some(pending) => pending,
                None => {
                    let pending = Arc::clone(self)
                        .load_partition(name.clone())
                        .boxed()
                        .shared();
                    slots.insert(name, Slot::Loading(pending.clone()));
                    pending
                }
            }
        };
        pending.await
    }

    async fn load_partition(self: Arc<Self>, name: String) -> bool {
        let (locator, checksum) = match self.manifest.partition(&name) {
            Some(info) => (info.source.clone(), info.sha256.clone()),
            None => return false,
        };

        let start = Instant::now();
        match self.fetch_with_retry(&locator, checksum.as_deref()).await {
            Ok(entries) => {
                let count = entries.len();
                self.index.build(entries);
                self.slots.lock().insert(name.clone(), Slot::Loaded);
                log::info!(
                    "Loaded partition {} ({} entries) in {:?}",
                    name,
                    count,
                    start.elapsed()
                );
                true
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("{}; falling back to the full catalog", e);

                let loaded = Arc::clone(&self).load_fallback().await;
                if !loaded {
                    self.slots.lock().insert(name.clone(), Slot::Failed);
                    log::error!("Partition {} unavailable after {:?}", name, start.elapsed());
                }
                loaded
            }
        }
    }

    async fn load_fallback(self: Arc<Self>) -> bool {
        let pending = {
            let mut slot = self.fallback.lock();
            let in_flight = match &*slot {
                FallbackSlot::Loaded => return true,
                FallbackSlot::Loading(pending) => Some(pending.clone()),
                FallbackSlot::Idle => None,
            };
            match in_flight {
                Some(pending) => pending,
                None => {
                    let pending = Arc::clone(&self).run_fallback().boxed().shared();
                    *slot = FallbackSlot::Loading(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    async fn run_fallback(self: Arc<Self>) -> bool {
        let locator = match self.manifest.fallback() {
            Some(locator) => locator.to_string(),
            None => {
                log::error!("Manifest has no full catalog fallback");
                *self.fallback.lock() = FallbackSlot::Idle;
                return false;
            }
        };

        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        match self.fetch_with_retry(&locator, None).await {
            Ok(entries) => {
                let count = entries.len();
                self.index.build(entries);
                {
                    let mut slots = self.slots.lock();
                    for name in self.manifest.partition_names() {
                        slots.insert(name.to_string(), Slot::Loaded);
                    }
                }
                *self.fallback.lock() = FallbackSlot::Loaded;
                log::info!(
                    "Loaded full catalog ({} entries) in {:?}",
                    count,
                    start.elapsed()
                );
                true
            }
            Err(e) => {
                log::error!("Full catalog unavailable: {}", e);
                *self.fallback.lock() = FallbackSlot::Idle;
                false
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        locator: &str,
        checksum: Option<&str>,
    ) -> Result<Vec<ConfigEntry>, PartitionLoadError> {
        let attempts = self.retry.attempts();
        for attempt in 0..attempts {
            match self.fetch_once(locator, checksum).await {
                Ok(entries) => return Ok(entries),
                Err(e) => {
                    log::warn!("Attempt {}/{} failed: {}", attempt + 1, attempts, e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.retry.delay_after(attempt)).await;
                    }
                }
            }
        }
        Err(PartitionLoadError::Exhausted {
            locator: locator.to_string(),
            attempts,
        })
    }

    async fn fetch_once(
        &self,
        locator: &str,
        checksum: Option<&str>,
    ) -> Result<Vec<ConfigEntry>, PartitionLoadError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let data = self.source.fetch(locator).await?;

        if let Some(expected) = checksum {
            if !sha256_hex(&data).eq_ignore_ascii_case(expected) {
                return Err(PartitionLoadError::ChecksumMismatch {
                    locator: locator.to_string(),
                });
            }
        }

        parse_catalog_bytes(&data).map_err(|e| PartitionLoadError::Parse {
            locator: locator.to_string(),
            reason: e.to_string(),
        })
    }
}
