//! # Keyed TTL cache
//!
//! `TtlCache<T>` answers `get_or_fetch(key, options, fetch)`:
//!
//! - **Fresh hit**: an entry younger than `ttl_ms` is returned without calling `fetch`.
//! - **Single-flight**: while a fetch for `key` is in flight, every other caller awaits
//!   that same fetch and observes the same result or the same error.
//! - **Stale fallback**: a failed refetch may return the previous value (flagged stale)
//!   when the category policy allows it and the value is younger than `max_stale_age_ms`.
//! - **Durable mirror**: successful and stale-fallback results of persisted categories
//!   are written to a [`DurableStore`] and rehydrated on the next start.
//!
//! The cache never invents data: a miss with no usable fallback surfaces the fetch
//! error unchanged.

pub mod durable;
pub mod policy;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{FailureKind, Result, SdkError};
use crate::metrics;

pub use durable::{DurableStore, FileStore, MemoryStore};
pub use policy::{CacheCategory, CacheOptions};

/// Entries older than this are swept when the in-memory map is full, whatever their TTL.
pub const EVICTION_AGE_MS: u64 = 60 * 60 * 1000;

/// Default ceiling on the age of entries rehydrated from durable storage.
pub const DEFAULT_DURABLE_MAX_AGE_MS: u64 = 24 * 60 * 60 * 1000;

/// Prefix of every durable storage key written by the SDK.
pub const STORAGE_PREFIX: &str = "dollar_route_cache";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub fetched_at_ms: u64,
    pub ttl_ms: u64,
    /// Set only by a failed refetch that fell back to this entry; cleared by the next success.
    pub is_stale: bool,
}

impl<T> CacheEntry<T> {
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.fetched_at_ms)
    }
}

/// Only the header of a persisted entry, for eviction ordering.
#[derive(Deserialize)]
struct PersistedHeader {
    fetched_at_ms: u64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_served: AtomicU64,
    deduplicated: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_served: u64,
    pub deduplicated: u64,
    pub entries: usize,
    pub in_flight: usize,
}

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Builder-style configuration for a [`TtlCache`].
#[derive(Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub durable_max_age_ms: u64,
    pub store: Option<Arc<dyn DurableStore>>,
    pub clock: Clock,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            durable_max_age_ms: DEFAULT_DURABLE_MAX_AGE_MS,
            store: None,
            clock: Clock::system(),
        }
    }
}

/// TTL cache for one category of values.
///
/// Cloning is cheap and clones share state.
pub struct TtlCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TtlCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    category: CacheCategory,
    entries: DashMap<String, CacheEntry<T>>,
    // At most one in-flight fetch per key; inserted through the entry API so the
    // check-and-insert is atomic.
    pending: DashMap<String, SharedFetch<T>>,
    last_failure: DashMap<String, FailureKind>,
    store: Option<Arc<dyn DurableStore>>,
    clock: Clock,
    max_entries: usize,
    durable_max_age_ms: u64,
    counters: CacheCounters,
}

impl<T> TtlCache<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub fn new(category: CacheCategory, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                category,
                entries: DashMap::new(),
                pending: DashMap::new(),
                last_failure: DashMap::new(),
                store: config.store,
                clock: config.clock,
                max_entries: config.max_entries.max(1),
                durable_max_age_ms: config.durable_max_age_ms,
                counters: CacheCounters::default(),
            }),
        }
    }

    pub fn category(&self) -> CacheCategory {
        self.inner.category
    }

    /// Return the cached value for `key`, or run `fetch` (at most once concurrently).
    ///
    /// `fetch` is only invoked by the caller that starts a new fetch; callers that
    /// find one in flight drop their closure unused.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, options: &CacheOptions, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let inner = &self.inner;
        if !inner.entries.contains_key(key) {
            inner.rehydrate(key).await;
        }

        let now = inner.clock.now_ms();
        if let Some(entry) = inner.entries.get(key) {
            if entry.age_ms(now) < options.ttl_ms {
                inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                metrics::increment_cache_hit(inner.category.as_str());
                debug!("cache hit {}:{} (age {}ms)", inner.category, key, entry.age_ms(now));
                return Ok(entry.data.clone());
            }
        }

        let shared = match inner.pending.entry(key.to_string()) {
            Entry::Occupied(in_flight) => {
                inner.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
                metrics::increment_cache_dedup(inner.category.as_str());
                debug!("joining in-flight fetch for {}:{}", inner.category, key);
                in_flight.get().clone()
            }
            Entry::Vacant(slot) => {
                inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                metrics::increment_cache_miss(inner.category.as_str());
                let fut = fetch();
                let owner = Arc::clone(inner);
                let owned_key = key.to_string();
                let options = options.clone();
                let task: SharedFetch<T> = async move {
                    let outcome = fut.await;
                    let settled = owner.settle(&owned_key, &options, outcome).await;
                    owner.pending.remove(&owned_key);
                    settled
                }
                .boxed()
                .shared();
                slot.insert(task.clone());
                task
            }
        };

        shared.await
    }

    pub fn peek(&self, key: &str) -> Option<CacheEntry<T>> {
        self.inner.entries.get(key).map(|e| e.value().clone())
    }

    /// Whether the value currently held for `key` was served as a stale fallback.
    pub fn is_stale(&self, key: &str) -> bool {
        self.inner
            .entries
            .get(key)
            .map_or(false, |e| e.is_stale)
    }

    /// Failure class of the most recent failed fetch for `key`, if the last attempt failed.
    pub fn last_failure_kind(&self, key: &str) -> Option<FailureKind> {
        self.inner.last_failure.get(key).map(|k| *k)
    }

    /// Insert a value as if it had just been fetched.
    pub async fn seed(&self, key: &str, options: &CacheOptions, data: T) {
        let _ = self.inner.settle(key, options, Ok(data)).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.inner.entries.remove(key);
        self.inner.last_failure.remove(key);
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.remove(&self.inner.storage_key(key)).await {
                warn!("failed to remove {} from durable storage: {}", key, e);
            }
        }
    }

    /// Remove every entry whose key contains `pattern`.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let before = self.inner.entries.len();
        self.inner.entries.retain(|k, _| !k.contains(pattern));
        self.inner.last_failure.retain(|k, _| !k.contains(pattern));
        let removed = before.saturating_sub(self.inner.entries.len());

        if let Some(store) = &self.inner.store {
            for (storage_key, key) in self.inner.stored_keys().await {
                if key.contains(pattern) {
                    if let Err(e) = store.remove(&storage_key).await {
                        warn!("failed to remove {} from durable storage: {}", storage_key, e);
                    }
                }
            }
        }
        debug!("invalidated {} {} entries matching {:?}", removed, self.inner.category, pattern);
        removed
    }

    pub async fn clear(&self) {
        self.inner.entries.clear();
        self.inner.last_failure.clear();
        if let Some(store) = &self.inner.store {
            for (storage_key, _) in self.inner.stored_keys().await {
                if let Err(e) = store.remove(&storage_key).await {
                    warn!("failed to remove {} from durable storage: {}", storage_key, e);
                }
            }
        }
        metrics::set_cache_size(self.inner.category.as_str(), 0.0);
    }

    /// Rehydrate every persisted entry of this category, purging ones past the durable ceiling.
    pub async fn load_persisted(&self) -> usize {
        let mut loaded = 0;
        for (_, key) in self.inner.stored_keys().await {
            if self.inner.rehydrate(&key).await {
                loaded += 1;
            }
        }
        loaded
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            stale_served: c.stale_served.load(Ordering::Relaxed),
            deduplicated: c.deduplicated.load(Ordering::Relaxed),
            entries: self.inner.entries.len(),
            in_flight: self.inner.pending.len(),
        }
    }
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn storage_key(&self, key: &str) -> String {
        format!("{}:{}:{}", STORAGE_PREFIX, self.category.as_str(), key)
    }

    fn storage_prefix(&self) -> String {
        format!("{}:{}:", STORAGE_PREFIX, self.category.as_str())
    }

    /// (storage key, cache key) pairs of this category present in durable storage.
    async fn stored_keys(&self) -> Vec<(String, String)> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        let prefix = self.storage_prefix();
        match store.keys().await {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|k| {
                    let key = k.strip_prefix(&prefix)?.to_string();
                    Some((k, key))
                })
                .collect(),
            Err(e) => {
                warn!("failed to list durable {} keys: {}", self.category, e);
                Vec::new()
            }
        }
    }

    async fn settle(&self, key: &str, options: &CacheOptions, outcome: Result<T>) -> Result<T> {
        let now = self.clock.now_ms();
        match outcome {
            Ok(data) => {
                self.last_failure.remove(key);
                if !self.entries.contains_key(key) {
                    self.evict_if_full(now);
                }
                let entry = CacheEntry {
                    data: data.clone(),
                    fetched_at_ms: now,
                    ttl_ms: options.ttl_ms,
                    is_stale: false,
                };
                if options.persist {
                    self.persist(key, &entry).await;
                }
                self.entries.insert(key.to_string(), entry);
                metrics::set_cache_size(self.category.as_str(), self.entries.len() as f64);
                Ok(data)
            }
            Err(err) => {
                self.last_failure.insert(key.to_string(), err.kind());
                if !options.permits_fallback(&err) {
                    return Err(err);
                }
                // The guard must not be held across the persist await below.
                let fallback = self.entries.get_mut(key).and_then(|mut entry| {
                    if entry.age_ms(now) < options.max_stale_age_ms {
                        entry.is_stale = true;
                        Some(entry.clone())
                    } else {
                        None
                    }
                });
                match fallback {
                    Some(entry) => {
                        warn!(
                            "serving stale {}:{} (age {}ms) after {} failure: {}",
                            self.category,
                            key,
                            entry.age_ms(now),
                            err.kind().as_str(),
                            err
                        );
                        self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
                        metrics::increment_cache_stale_served(self.category.as_str(), err.kind().as_str());
                        if options.persist {
                            self.persist(key, &entry).await;
                        }
                        Ok(entry.data)
                    }
                    None => Err(err),
                }
            }
        }
    }

    fn evict_if_full(&self, now: u64) {
        if self.entries.len() < self.max_entries {
            return;
        }
        let before = self.entries.len();
        self.entries.retain(|_, e| e.age_ms(now) < EVICTION_AGE_MS);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("evicted {} {} entries older than 1h (size: {})", removed, self.category, self.entries.len());
        }
    }

    /// Load `key` from durable storage if present and young enough. Returns whether it was loaded.
    async fn rehydrate(&self, key: &str) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        let storage_key = self.storage_key(key);
        let raw = match store.get(&storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return false,
            Err(e) => {
                warn!("durable read of {} failed: {}", storage_key, e);
                return false;
            }
        };
        let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("dropping undecodable durable entry {}: {}", storage_key, e);
                let _ = store.remove(&storage_key).await;
                return false;
            }
        };
        let now = self.clock.now_ms();
        if entry.age_ms(now) > self.durable_max_age_ms {
            debug!("purging durable entry {} (age {}ms)", storage_key, entry.age_ms(now));
            let _ = store.remove(&storage_key).await;
            return false;
        }
        // A concurrent fetch may have landed meanwhile; keep the newer value.
        self.entries
            .entry(key.to_string())
            .and_modify(|current| {
                if current.fetched_at_ms < entry.fetched_at_ms {
                    *current = entry.clone();
                }
            })
            .or_insert_with(|| entry.clone());
        true
    }

    async fn persist(&self, key: &str, entry: &CacheEntry<T>) {
        let Some(store) = &self.store else {
            return;
        };
        let raw = match serde_json::to_string(entry) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("cannot serialize {}:{} for durable storage: {}", self.category, key, e);
                return;
            }
        };
        let storage_key = self.storage_key(key);
        match store.set(&storage_key, &raw).await {
            Ok(()) => {}
            Err(SdkError::QuotaExceeded) => {
                let evicted = self.evict_oldest_quarter(store.as_ref()).await;
                warn!("durable storage full, evicted {} oldest entries", evicted);
                if let Err(e) = store.set(&storage_key, &raw).await {
                    warn!("durable write of {} failed after eviction: {}", storage_key, e);
                }
            }
            Err(e) => warn!("durable write of {} failed: {}", storage_key, e),
        }
    }

    /// Remove the oldest 25% of SDK entries from durable storage (all categories).
    async fn evict_oldest_quarter(&self, store: &dyn DurableStore) -> usize {
        let keys = match store.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("cannot list durable keys for eviction: {}", e);
                return 0;
            }
        };
        let mut aged = Vec::new();
        for k in keys.into_iter().filter(|k| k.starts_with(STORAGE_PREFIX)) {
            let fetched_at = match store.get(&k).await {
                Ok(Some(raw)) => serde_json::from_str::<PersistedHeader>(&raw)
                    .map(|h| h.fetched_at_ms)
                    .unwrap_or(0),
                _ => 0,
            };
            aged.push((fetched_at, k));
        }
        aged.sort();
        let to_remove = (aged.len() + 3) / 4;
        let mut removed = 0;
        for (_, k) in aged.into_iter().take(to_remove) {
            if store.remove(&k).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }
}
