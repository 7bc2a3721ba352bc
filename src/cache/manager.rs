//! Read-through cache manager.
//!
//! Lookup order for [`AnalysisCache::get`]:
//!
//! 1. Cache backend. Backend errors and undecodable bytes count as a miss.
//! 2. On a hit, the freshness policy decides: `Fresh` is returned as-is,
//!    `StaleGrace` is returned while a background refresh is scheduled,
//!    `Expired` falls through to step 3.
//! 3. On a miss, the caller joins the single-flight ticket for the key. The
//!    admitted computation calls the source, writes the result back to the
//!    backend and hands it to every waiter.
//!
//! Invalidation bumps a sequence number and records it for the key. A
//! computation admitted before that point still answers its waiters but
//! does not write its result into the backend.
//!
//! A copy written by a refresh carries the time it was cached, and its TTL
//! runs from there. Reloading an old entry from the store therefore yields a
//! fresh copy instead of one that is expired on arrival.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::backend::{CacheBackend, CacheWrite};
use super::freshness::{Freshness, FreshnessPolicy};
use super::singleflight::SingleFlight;
use crate::analysis::{AnalysisEntry, AnalysisKey};
use crate::error::{AnalyzerError, Result};
use crate::metrics;
use crate::source::AnalysisSource;
use crate::store::AnalysisStore;

/// Prefix for every key written to the cache backend.
pub const DEFAULT_KEY_PREFIX: &str = "news_analyzer:analysis";

/// Upper bound on one refresh, source call and write-back included.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// How a read was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    /// Served from cache past its TTL; a background refresh was scheduled.
    Stale,
    /// Computed (or joined a computation) because the cache had nothing usable.
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Stale => "stale",
            Self::Miss => "miss",
        }
    }
}

/// An entry together with how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead {
    pub entry: AnalysisEntry,
    pub status: CacheStatus,
}

/// Bytes layout of a cached copy.
#[derive(Debug, Serialize, Deserialize)]
struct CachedEntry<E> {
    entry: E,
    /// Set by refreshes. Write-through copies keep their own `computed_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cached_at: Option<DateTime<Utc>>,
}

/// A refresh result whose cache write is flushed with the rest of a batch.
struct PendingWrite {
    key: AnalysisKey,
    entry: AnalysisEntry,
    admitted_at: u64,
}

type PendingWrites = mpsc::UnboundedSender<PendingWrite>;

#[derive(Debug, Clone, Copy)]
struct InvalidationMark {
    seq: u64,
    at: Instant,
}

struct Inner {
    backend: Arc<dyn CacheBackend>,
    store: Arc<dyn AnalysisStore>,
    source: Arc<dyn AnalysisSource>,
    flights: SingleFlight<AnalysisEntry>,
    policy: FreshnessPolicy,
    refresh_timeout: Duration,
    key_prefix: String,
    invalidation_seq: AtomicU64,
    invalidations: DashMap<String, InvalidationMark>,
    background: TaskTracker,
}

/// Read-through cache over a backend, a durable store and a computation
/// source. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct AnalysisCache {
    inner: Arc<Inner>,
}

/// Builder for [`AnalysisCache`].
pub struct AnalysisCacheBuilder {
    backend: Arc<dyn CacheBackend>,
    store: Arc<dyn AnalysisStore>,
    source: Arc<dyn AnalysisSource>,
    policy: FreshnessPolicy,
    refresh_timeout: Duration,
    key_prefix: String,
}

impl AnalysisCacheBuilder {
    pub fn policy(mut self, policy: FreshnessPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn build(self) -> AnalysisCache {
        AnalysisCache {
            inner: Arc::new(Inner {
                backend: self.backend,
                store: self.store,
                source: self.source,
                flights: SingleFlight::new(),
                policy: self.policy,
                refresh_timeout: self.refresh_timeout,
                key_prefix: self.key_prefix,
                invalidation_seq: AtomicU64::new(0),
                invalidations: DashMap::new(),
                background: TaskTracker::new(),
            }),
        }
    }
}

impl AnalysisCache {
    pub fn builder(
        backend: Arc<dyn CacheBackend>,
        store: Arc<dyn AnalysisStore>,
        source: Arc<dyn AnalysisSource>,
    ) -> AnalysisCacheBuilder {
        AnalysisCacheBuilder {
            backend,
            store,
            source,
            policy: FreshnessPolicy::default(),
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    /// Number of keys with a refresh in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.flights.in_flight()
    }

    /// Fetch the analysis for `key`, computing it on a miss.
    pub async fn get(&self, key: &AnalysisKey) -> Result<AnalysisEntry> {
        self.read(key).await.map(|read| read.entry)
    }

    /// Like [`get`](Self::get) but also reports whether the value came from
    /// the cache.
    pub async fn read(&self, key: &AnalysisKey) -> Result<CacheRead> {
        let cached = self.lookup(key).await;
        self.resolve(key, cached, None).await
    }

    /// [`get`](Self::get) bounded by a caller deadline.
    ///
    /// On expiry the caller gets `Timeout`; the computation it joined keeps
    /// running and still populates the cache.
    pub async fn get_with_deadline(
        &self,
        key: &AnalysisKey,
        deadline: Duration,
    ) -> Result<AnalysisEntry> {
        self.read_with_deadline(key, deadline)
            .await
            .map(|read| read.entry)
    }

    pub async fn read_with_deadline(
        &self,
        key: &AnalysisKey,
        deadline: Duration,
    ) -> Result<CacheRead> {
        match tokio::time::timeout(deadline, self.read(key)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(key = %key, deadline_ms = deadline.as_millis() as u64, "read deadline elapsed");
                Err(AnalyzerError::Timeout {
                    key: key.to_string(),
                    after: deadline,
                })
            }
        }
    }

    /// Fetch several analyses with one backend read and at most one backend
    /// write.
    ///
    /// Results line up with `keys`. Misses are resolved concurrently, each
    /// through its own single-flight ticket. Refreshes admitted here hand
    /// their results to one flush task that writes them back together.
    pub async fn get_many(&self, keys: &[AnalysisKey]) -> Vec<Result<AnalysisEntry>> {
        let cache_keys: Vec<String> = keys.iter().map(|key| self.cache_key(key)).collect();

        let raw = match self.inner.backend.get_many(&cache_keys).await {
            Ok(values) if values.len() == keys.len() => values,
            Ok(values) => {
                warn!(
                    expected = keys.len(),
                    got = values.len(),
                    "cache backend returned a short batch, treating as misses"
                );
                vec![None; keys.len()]
            }
            Err(e) => {
                warn!(error = %e, "cache batch read failed, treating as misses");
                metrics::record_backend_error("get_many");
                vec![None; keys.len()]
            }
        };

        let (pending, collected) = mpsc::unbounded_channel();
        let flush = self
            .inner
            .background
            .spawn(self.clone().flush_pending(collected));

        let reads = keys.iter().zip(raw).map(|(key, bytes)| {
            let cached = bytes.and_then(|bytes| self.decode(key, &bytes));
            let pending = pending.clone();
            async move {
                self.resolve(key, cached, Some(pending))
                    .await
                    .map(|read| read.entry)
            }
        });
        let results = join_all(reads).await;

        // The flush ends once every sender, including the refreshes', is gone.
        drop(pending);
        if let Err(e) = flush.await {
            error!(error = %e, "batch cache flush task failed");
        }
        results
    }

    /// Drop the cached entry for `key`. Never touches the durable store.
    ///
    /// Any refresh admitted before this call is detached and will not write
    /// its result back. Invalidating an absent key succeeds.
    pub async fn invalidate(&self, key: &AnalysisKey) -> Result<()> {
        self.mark_invalidated(key);

        let cache_key = self.cache_key(key);
        if let Err(e) = self.inner.backend.delete(&cache_key).await {
            warn!(key = %key, error = %e, "cache invalidation failed");
            metrics::record_backend_error("delete");
            return Err(match e {
                AnalyzerError::BackendUnavailable(_) => e,
                other => AnalyzerError::BackendUnavailable(other.to_string()),
            });
        }
        debug!(key = %key, "cache entry invalidated");
        Ok(())
    }

    /// Write-through: save to the durable store, then replace the cached copy.
    pub async fn put(&self, entry: AnalysisEntry) -> Result<AnalysisEntry> {
        self.inner.store.save(&entry).await?;
        if let Err(e) = self.invalidate(&entry.key).await {
            // The set below overwrites the old value anyway.
            debug!(key = %entry.key, error = %e, "invalidate before write-through failed");
        }
        self.store_cached(&self.cache_key(&entry.key), &entry, None).await;
        info!(key = %entry.key, "analysis saved");
        Ok(entry)
    }

    /// Newest analyses straight from the durable store. Bypasses the cache.
    pub async fn latest(&self, limit: usize) -> Result<Vec<AnalysisEntry>> {
        self.inner.store.latest(limit).await
    }

    /// Remove invalidation marks no running refresh can still observe.
    pub fn prune_invalidations(&self) -> usize {
        let horizon = self.inner.refresh_timeout;
        let before = self.inner.invalidations.len();
        self.inner
            .invalidations
            .retain(|_, mark| mark.at.elapsed() <= horizon);
        before.saturating_sub(self.inner.invalidations.len())
    }

    /// Wait for background and in-flight refreshes to finish.
    pub async fn drain(&self) {
        self.inner.background.close();
        self.inner.background.wait().await;
        self.inner.flights.drain().await;
    }

    fn cache_key(&self, key: &AnalysisKey) -> String {
        format!("{}:{}", self.inner.key_prefix, key)
    }

    async fn lookup(&self, key: &AnalysisKey) -> Option<CachedEntry<AnalysisEntry>> {
        match self.inner.backend.get(&self.cache_key(key)).await {
            Ok(Some(bytes)) => self.decode(key, &bytes),
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed, falling back to store");
                metrics::record_backend_error("get");
                None
            }
        }
    }

    fn decode(&self, key: &AnalysisKey, bytes: &[u8]) -> Option<CachedEntry<AnalysisEntry>> {
        match serde_json::from_slice::<CachedEntry<AnalysisEntry>>(bytes) {
            Ok(cached) if cached.entry.key == *key => Some(cached),
            Ok(cached) => {
                warn!(key = %key, found = %cached.entry.key, "cached entry has a different key, ignoring");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "undecodable cache entry, ignoring");
                None
            }
        }
    }

    async fn resolve(
        &self,
        key: &AnalysisKey,
        cached: Option<CachedEntry<AnalysisEntry>>,
        pending: Option<PendingWrites>,
    ) -> Result<CacheRead> {
        if let Some(CachedEntry { entry, cached_at }) = cached {
            match self
                .inner
                .policy
                .classify_cached(&entry, cached_at, Utc::now())
            {
                Freshness::Fresh => {
                    debug!(key = %key, "cache hit");
                    return Ok(self.served(entry, CacheStatus::Hit));
                }
                Freshness::StaleGrace => {
                    debug!(key = %key, "stale cache hit, refreshing in background");
                    self.refresh_in_background(key);
                    return Ok(self.served(entry, CacheStatus::Stale));
                }
                Freshness::Expired => debug!(key = %key, "cached entry expired"),
            }
        } else {
            debug!(key = %key, "cache miss");
        }

        let entry = self.refresh(key, pending).await?;
        Ok(self.served(entry, CacheStatus::Miss))
    }

    fn served(&self, entry: AnalysisEntry, status: CacheStatus) -> CacheRead {
        metrics::record_lookup(status.as_str());
        CacheRead { entry, status }
    }

    /// Join or start the single refresh for `key`.
    ///
    /// With `pending`, an admitted refresh queues its cache write there
    /// instead of writing it itself.
    async fn refresh(
        &self,
        key: &AnalysisKey,
        pending: Option<PendingWrites>,
    ) -> Result<AnalysisEntry> {
        let cache = self.clone();
        let owned = key.clone();
        let result = self
            .inner
            .flights
            .run(key.as_str(), move || {
                let admitted_at = cache.inner.invalidation_seq.load(Ordering::SeqCst);
                cache.compute_and_store(owned, admitted_at, pending)
            })
            .await;
        metrics::set_in_flight(self.inner.flights.in_flight());
        result
    }

    fn refresh_in_background(&self, key: &AnalysisKey) {
        if self.inner.flights.is_in_flight(key.as_str()) {
            debug!(key = %key, "refresh already in flight");
            return;
        }
        let cache = self.clone();
        let key = key.clone();
        self.inner.background.spawn(async move {
            match cache.refresh(&key, None).await {
                Ok(_) => info!(key = %key, "background refresh completed"),
                Err(e) => error!(key = %key, error = %e, "background refresh failed"),
            }
        });
    }

    /// Body of one admitted refresh. Runs on the single-flight task.
    async fn compute_and_store(
        self,
        key: AnalysisKey,
        admitted_at: u64,
        pending: Option<PendingWrites>,
    ) -> Result<AnalysisEntry> {
        let start = Instant::now();
        let timeout = self.inner.refresh_timeout;
        metrics::set_in_flight(self.inner.flights.in_flight());

        let work = async {
            let entry = self.inner.source.compute(&key).await?;
            let queued = pending.is_some_and(|pending| {
                pending
                    .send(PendingWrite {
                        key: key.clone(),
                        entry: entry.clone(),
                        admitted_at,
                    })
                    .is_ok()
            });
            if !queued {
                self.write_back(&key, &entry, admitted_at).await;
            }
            Ok::<_, AnalyzerError>(entry)
        };
        let outcome = match tokio::time::timeout(timeout, work).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AnalyzerError::computation(
                key.as_str(),
                format!("refresh exceeded {}s", timeout.as_secs_f64()),
            )),
        };

        metrics::record_refresh(outcome.is_ok(), start);
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &outcome {
            Ok(_) => info!(key = %key, elapsed_ms, "refresh completed"),
            Err(AnalyzerError::NotFound(_)) => debug!(key = %key, "no analysis in store"),
            Err(e) => warn!(key = %key, elapsed_ms, error = %e, "refresh failed"),
        }
        outcome
    }

    async fn write_back(&self, key: &AnalysisKey, entry: &AnalysisEntry, admitted_at: u64) {
        if self.invalidated_since(key, admitted_at) {
            debug!(key = %key, "key invalidated during refresh, skipping cache write");
            return;
        }

        let cache_key = self.cache_key(key);
        self.store_cached(&cache_key, entry, Some(Utc::now())).await;
        self.retract_if_invalidated(key, &cache_key, admitted_at).await;
    }

    /// Collect the write-backs of one batch read and write them in one call.
    async fn flush_pending(self, mut collected: mpsc::UnboundedReceiver<PendingWrite>) {
        let mut batch = Vec::new();
        while let Some(write) = collected.recv().await {
            if self.invalidated_since(&write.key, write.admitted_at) {
                debug!(key = %write.key, "key invalidated during refresh, skipping cache write");
                continue;
            }
            batch.push(write);
        }
        if batch.is_empty() {
            return;
        }

        let cached_at = Utc::now();
        let mut writes: Vec<CacheWrite> = Vec::with_capacity(batch.len());
        let mut written = Vec::with_capacity(batch.len());
        for write in batch {
            match self.encode(&write.entry, Some(cached_at)) {
                Ok(bytes) => {
                    let ttl_hint = self.inner.policy.retention(&write.entry);
                    writes.push((self.cache_key(&write.key), bytes, ttl_hint));
                    written.push(write);
                }
                Err(e) => warn!(key = %write.key, error = %e, "failed to encode entry for cache"),
            }
        }

        let count = writes.len();
        if let Err(e) = self.inner.backend.set_many(writes).await {
            warn!(count, error = %e, "batch cache write failed");
            metrics::record_backend_error("set_many");
            return;
        }
        debug!(count, "batch cache write completed");

        for write in written {
            let cache_key = self.cache_key(&write.key);
            self.retract_if_invalidated(&write.key, &cache_key, write.admitted_at)
                .await;
        }
    }

    /// Invalidated while the write was in progress: take it back out.
    async fn retract_if_invalidated(&self, key: &AnalysisKey, cache_key: &str, admitted_at: u64) {
        if !self.invalidated_since(key, admitted_at) {
            return;
        }
        if let Err(e) = self.inner.backend.delete(cache_key).await {
            warn!(key = %key, error = %e, "failed to retract cache write");
            metrics::record_backend_error("delete");
        }
    }

    fn encode(&self, entry: &AnalysisEntry, cached_at: Option<DateTime<Utc>>) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&CachedEntry { entry, cached_at })?)
    }

    async fn store_cached(
        &self,
        cache_key: &str,
        entry: &AnalysisEntry,
        cached_at: Option<DateTime<Utc>>,
    ) {
        let bytes = match self.encode(entry, cached_at) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "failed to encode entry for cache");
                return;
            }
        };
        let ttl_hint = self.inner.policy.retention(entry);
        if let Err(e) = self.inner.backend.set(cache_key, bytes, ttl_hint).await {
            warn!(key = %entry.key, error = %e, "cache write failed");
            metrics::record_backend_error("set");
        }
    }

    fn mark_invalidated(&self, key: &AnalysisKey) {
        let seq = self.inner.invalidation_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.invalidations.insert(
            key.to_string(),
            InvalidationMark {
                seq,
                at: Instant::now(),
            },
        );
        if self.inner.flights.forget(key.as_str()) {
            debug!(key = %key, "detached in-flight refresh");
        }
    }

    fn invalidated_since(&self, key: &AnalysisKey, admitted_at: u64) -> bool {
        self.inner
            .invalidations
            .get(key.as_str())
            .is_some_and(|mark| mark.seq > admitted_at)
    }
}
