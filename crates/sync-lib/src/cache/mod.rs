//! Versioned, TTL-bound data cache with de-duplicated refreshes
//!
//! [`SyncCache`] stores JSON values keyed by a logical name. Reads are served
//! from the cache while entries are fresh; otherwise the caller-supplied fetch
//! runs. Concurrent refreshes of one key share a single in-flight fetch.
//!
//! Local writes made with [`SyncCache::set_local`] mark the entry dirty. A
//! later refresh that brings back a different value does not overwrite it:
//! a [`DataConflict`] is published instead and the refresh fails with
//! [`Error::Conflict`].

mod conflict;
mod entry;

#[cfg(test)]
mod tests;

pub use conflict::{newer_revision, ConflictResolver, ResolvedFrom, Resolution};
pub use entry::{checksum, remote_timestamp, CacheConfig, CacheEntry, EvictionPolicy};

use crate::error::{Error, Result};
use crate::events::{EventBus, Subscription};
use crate::models::{ConflictResolution, DataConflict, Revision};
use crate::observability::EngineMetrics;
use crate::storage::TieredStorage;
use chrono::{DateTime, Utc};
use conflict::ResolverRegistry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

type SharedSync = Shared<BoxFuture<'static, Result<Value>>>;
type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Pushed to key subscribers after every stored update
#[derive(Debug, Clone)]
pub struct CacheUpdate {
    pub key: String,
    pub value: Value,
    pub version: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub stale_entries: usize,
    pub dirty_entries: usize,
    pub syncing_keys: usize,
    pub auto_sync_keys: usize,
    pub average_age_ms: u64,
    pub hits: u64,
    pub misses: u64,
    /// Percentage in `0.0..=100.0`
    pub hit_rate: f64,
    pub total_bytes: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    value: Value,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    dirty: bool,
}

struct AutoSyncTask {
    fetcher: Fetcher,
    interval: Duration,
    handle: JoinHandle<()>,
}

struct CacheInner {
    config: CacheConfig,
    entries: DashMap<String, CacheEntry>,
    in_flight: DashMap<String, SharedSync>,
    auto_sync: Mutex<HashMap<String, AutoSyncTask>>,
    resolvers: ResolverRegistry,
    updates: EventBus<String, CacheUpdate>,
    conflicts: EventBus<(), DataConflict>,
    storage: Option<Arc<TieredStorage>>,
    seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    metrics: EngineMetrics,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        for (_, task) in self.auto_sync.lock().drain() {
            task.handle.abort();
        }
    }
}

/// Namespace of persisted cache entries inside a shared [`TieredStorage`]
pub const STORAGE_NAMESPACE: &str = "cache";

/// Keyed data cache. Clones share the same entries.
#[derive(Clone)]
pub struct SyncCache {
    inner: Arc<CacheInner>,
}

impl Default for SyncCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl SyncCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::build(config, None)
    }

    /// Mirror entries into `storage` so they survive a restart.
    ///
    /// Entries live in the [`STORAGE_NAMESPACE`] scope of `storage`, which
    /// `clear` and `load_persisted` never leave.
    pub fn with_storage(config: CacheConfig, storage: Arc<TieredStorage>) -> Self {
        Self::build(config, Some(Arc::new(storage.scoped(STORAGE_NAMESPACE))))
    }

    fn build(config: CacheConfig, storage: Option<Arc<TieredStorage>>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                entries: DashMap::new(),
                in_flight: DashMap::new(),
                auto_sync: Mutex::new(HashMap::new()),
                resolvers: ResolverRegistry::default(),
                updates: EventBus::new(),
                conflicts: EventBus::new(),
                storage,
                seq: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                metrics: EngineMetrics::new(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Cached value for `key` if fresh, otherwise the result of a sync.
    pub async fn get<T, F, Fut>(&self, key: &str, fetch: F, force_refresh: bool) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if !force_refresh {
            let fresh = self
                .inner
                .entries
                .get(key)
                .filter(|entry| entry.is_fresh())
                .map(|entry| entry.value.clone());
            if let Some(value) = fresh {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                self.inner.metrics.inc_cache_hits();
                return Ok(serde_json::from_value(value)?);
            }
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            self.inner.metrics.inc_cache_misses();
        }
        self.sync(key, fetch).await
    }

    /// Fetch and store a fresh value for `key`.
    ///
    /// Joins an in-flight sync for the same key instead of fetching again. On
    /// failure the previous entry is left untouched.
    pub async fn sync<T, F, Fut>(&self, key: &str, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let fetch_value = move || -> BoxFuture<'static, Result<Value>> {
            async move {
                let data = fetch().await?;
                Ok(serde_json::to_value(data)?)
            }
            .boxed()
        };
        let value = self.sync_value(key, fetch_value).await?;
        Ok(serde_json::from_value(value)?)
    }

    fn sync_value<F>(&self, key: &str, fetch: F) -> SharedSync
    where
        F: FnOnce() -> BoxFuture<'static, Result<Value>> + Send + 'static,
    {
        match self.inner.in_flight.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                debug!(key = %key, "Joining in-flight sync");
                existing.get().clone()
            }
            Entry::Vacant(slot) => {
                let inner = Arc::clone(&self.inner);
                let task_key = key.to_string();
                let handle = tokio::spawn(async move {
                    let result = inner.run_sync(&task_key, fetch).await;
                    inner.in_flight.remove(&task_key);
                    result
                });

                let failed_key = key.to_string();
                let shared = handle
                    .map(move |joined| {
                        joined.unwrap_or_else(|e| {
                            Err(Error::SyncFailed {
                                key: failed_key,
                                reason: e.to_string(),
                            })
                        })
                    })
                    .boxed()
                    .shared();
                slot.insert(shared.clone());
                shared
            }
        }
    }

    /// Store `value` as confirmed data.
    ///
    /// The version is `version` when given and greater than the current one,
    /// otherwise the current version plus one.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, version: Option<u64>) -> Result<u64> {
        let value = serde_json::to_value(value)?;
        self.inner.store(key, value, version, false)
    }

    /// Record a local write the server has not confirmed yet
    pub fn set_local<T: Serialize>(&self, key: &str, value: &T) -> Result<u64> {
        let value = serde_json::to_value(value)?;
        self.inner.store(key, value, None, true)
    }

    /// Mark `key` stale so the next `get` refreshes it
    pub fn invalidate(&self, key: &str) -> bool {
        match self.inner.entries.get_mut(key) {
            Some(mut entry) => {
                entry.stale = true;
                true
            }
            None => false,
        }
    }

    /// Mark every key matching the regular expression stale
    pub fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        let re = Regex::new(pattern)
            .map_err(|e| Error::Operation(format!("invalid key pattern '{}': {}", pattern, e)))?;
        let mut count = 0;
        for mut entry in self.inner.entries.iter_mut() {
            if re.is_match(entry.key()) {
                entry.stale = true;
                count += 1;
            }
        }
        debug!(pattern = %pattern, count = count, "Invalidated cache entries");
        Ok(count)
    }

    pub fn remove(&self, key: &str) -> bool {
        let removed = self.inner.entries.remove(key).is_some();
        self.inner.unpersist(key);
        self.inner.metrics.set_cache_entries(self.inner.entries.len());
        removed
    }

    pub fn clear(&self) {
        self.inner.entries.clear();
        if let Some(storage) = &self.inner.storage {
            for key in storage.keys() {
                if let Err(e) = storage.remove(&key) {
                    warn!(key = %key, error = %e, "Failed to remove persisted cache entry");
                }
            }
        }
        self.inner.metrics.set_cache_entries(0);
    }

    /// Watch stored updates of `key`.
    ///
    /// Updates that do not deserialize into `T` are skipped.
    pub fn subscribe<T, F>(&self, key: &str, callback: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.inner
            .updates
            .subscribe(key.to_string(), move |update: &CacheUpdate| {
                if let Ok(value) = serde_json::from_value::<T>(update.value.clone()) {
                    callback(&value);
                }
            })
    }

    /// Watch conflicts detected during syncs
    pub fn subscribe_conflicts<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DataConflict) + Send + Sync + 'static,
    {
        self.inner.conflicts.subscribe((), callback)
    }

    /// Register a resolver for keys matching `pattern` (substring or regex)
    pub fn register_conflict_resolver<F>(&self, pattern: &str, resolver: F)
    where
        F: Fn(&Revision, &Revision) -> Value + Send + Sync + 'static,
    {
        self.inner.resolvers.register(pattern, Arc::new(resolver));
    }

    /// Pick the value to keep for `key`.
    ///
    /// The first registered resolver matching `key` decides; without one the
    /// newer revision wins and ties go to remote.
    pub fn resolve_conflict(&self, key: &str, local: &Revision, remote: &Revision) -> Value {
        self.resolution_for(key, local, remote).value
    }

    /// Like [`resolve_conflict`](Self::resolve_conflict), reporting which side won
    pub fn resolution_for(&self, key: &str, local: &Revision, remote: &Revision) -> Resolution {
        let resolution = self.inner.resolvers.resolve(key, local, remote);
        if resolution.tie {
            self.inner.metrics.inc_timestamp_ties();
            debug!(key = %key, "Conflict timestamps tied, keeping remote");
        }
        resolution
    }

    /// Refresh `key` every `period` in the background until stopped
    pub fn setup_auto_sync<T, F, Fut>(&self, key: &str, fetch: F, period: Duration)
    where
        T: Serialize + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let fetcher: Fetcher = Arc::new(move || {
            let pending = fetch();
            async move {
                let data = pending.await?;
                Ok(serde_json::to_value(data)?)
            }
            .boxed()
        });

        self.stop_auto_sync(key);

        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let task_key = key.to_string();
        let task_fetcher = Arc::clone(&fetcher);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let cache = SyncCache { inner };
                let fetch = Arc::clone(&task_fetcher);
                if let Err(e) = cache.sync_value(&task_key, move || fetch()).await {
                    debug!(key = %task_key, error = %e, "Auto-sync refresh failed");
                }
            }
        });

        self.inner.auto_sync.lock().insert(
            key.to_string(),
            AutoSyncTask {
                fetcher,
                interval: period,
                handle,
            },
        );
        info!(key = %key, interval_ms = period.as_millis() as u64, "Auto-sync enabled");
    }

    pub fn stop_auto_sync(&self, key: &str) -> bool {
        match self.inner.auto_sync.lock().remove(key) {
            Some(task) => {
                task.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn auto_sync_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.auto_sync.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn auto_sync_interval(&self, key: &str) -> Option<Duration> {
        self.inner.auto_sync.lock().get(key).map(|task| task.interval)
    }

    /// Refresh every auto-sync key once, in key order.
    ///
    /// Returns the keys that failed with their errors.
    pub async fn resync_all(&self) -> Vec<(String, Error)> {
        let mut tasks: Vec<(String, Fetcher)> = self
            .inner
            .auto_sync
            .lock()
            .iter()
            .map(|(key, task)| (key.clone(), Arc::clone(&task.fetcher)))
            .collect();
        tasks.sort_by(|a, b| a.0.cmp(&b.0));

        let mut failures = Vec::new();
        for (key, fetcher) in tasks {
            if let Err(e) = self.sync_value(&key, move || fetcher()).await {
                failures.push((key, e));
            }
        }
        failures
    }

    /// Remove entries whose TTL has elapsed. Dirty entries are kept.
    pub fn cleanup_expired(&self) -> usize {
        let expired: Vec<String> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.is_expired() && !entry.dirty)
            .map(|entry| entry.key().clone())
            .collect();

        for key in &expired {
            self.inner.entries.remove(key);
            self.inner.unpersist(key);
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "Removed expired cache entries");
            self.inner.metrics.set_cache_entries(self.inner.entries.len());
        }
        expired.len()
    }

    /// Periodic expired-entry sweep
    pub async fn run_cleanup(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.inner.config.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.inner.config.cleanup_interval.as_secs(),
            "Starting cache cleanup loop"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cleanup_expired();
                }
                _ = shutdown.recv() => {
                    info!("Cache cleanup loop received shutdown signal");
                    break;
                }
            }
        }
    }

    /// Snapshot of the entry for `key`, fresh or not
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.inner.entries.get(key).map(|entry| entry.clone())
    }

    /// Cached value for `key` without fetching, fresh or not
    pub fn peek<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.inner.entries.get(key)?.value.clone();
        serde_json::from_value(value).ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn is_syncing(&self, key: &str) -> bool {
        self.inner.in_flight.contains_key(key)
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            syncing_keys: self.inner.in_flight.len(),
            auto_sync_keys: self.inner.auto_sync.lock().len(),
            ..CacheStats::default()
        };

        let mut total_age = Duration::ZERO;
        for entry in self.inner.entries.iter() {
            stats.total_entries += 1;
            stats.total_bytes += entry.size;
            total_age += entry.age();
            if !entry.is_fresh() {
                stats.stale_entries += 1;
            }
            if entry.dirty {
                stats.dirty_entries += 1;
            }
        }
        if stats.total_entries > 0 {
            stats.average_age_ms = (total_age / stats.total_entries as u32).as_millis() as u64;
        }
        let lookups = stats.hits + stats.misses;
        if lookups > 0 {
            stats.hit_rate = stats.hits as f64 / lookups as f64 * 100.0;
        }
        stats
    }

    /// Restore entries persisted by an earlier process, skipping expired ones
    pub fn load_persisted(&self) -> usize {
        let Some(storage) = &self.inner.storage else {
            return 0;
        };
        let ttl = self.inner.config.ttl;
        let mut loaded = 0;

        for key in storage.keys() {
            let Some((_, record)) = storage.get_json::<PersistedEntry>(&key) else {
                continue;
            };
            let persisted = record.data;
            let age = (Utc::now() - persisted.updated_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age >= ttl && !persisted.dirty {
                if let Err(e) = storage.remove(&key) {
                    warn!(key = %key, error = %e, "Failed to remove expired persisted entry");
                }
                continue;
            }

            let now = Instant::now();
            let last_sync = now.checked_sub(age).unwrap_or(now);
            let bytes = serde_json::to_vec(&persisted.value).unwrap_or_default();
            let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
            self.inner.entries.insert(
                key.clone(),
                CacheEntry {
                    key: key.clone(),
                    checksum: checksum(&bytes),
                    size: bytes.len(),
                    value: persisted.value,
                    created_at: persisted.created_at,
                    updated_at: persisted.updated_at,
                    version: persisted.version,
                    stale: false,
                    dirty: persisted.dirty,
                    inserted_at: last_sync,
                    last_sync,
                    expires_at: last_sync + ttl,
                    inserted_seq: seq,
                    synced_seq: seq,
                },
            );
            loaded += 1;
        }

        if loaded > 0 {
            info!(loaded = loaded, "Restored persisted cache entries");
            self.inner.metrics.set_cache_entries(self.inner.entries.len());
        }
        loaded
    }
}

impl CacheInner {
    async fn run_sync<F>(&self, key: &str, fetch: F) -> Result<Value>
    where
        F: FnOnce() -> BoxFuture<'static, Result<Value>>,
    {
        self.metrics.inc_sync_attempts();
        match fetch().await {
            Ok(value) => self.store_remote(key, value),
            Err(e) => {
                self.metrics.inc_sync_failures();
                warn!(key = %key, error = %e, "Cache sync failed");
                Err(match e {
                    Error::SyncFailed { .. } => e,
                    other => Error::SyncFailed {
                        key: key.to_string(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    fn store_remote(&self, key: &str, value: Value) -> Result<Value> {
        let bytes = serde_json::to_vec(&value)?;
        let remote_checksum = checksum(&bytes);

        let conflict = self.entries.get(key).and_then(|local| {
            if !local.dirty || local.checksum == remote_checksum {
                return None;
            }
            Some(DataConflict {
                id: format!("conflict_{}", uuid::Uuid::new_v4().simple()),
                key: key.to_string(),
                local: Revision::new(local.value.clone(), local.updated_at),
                remote: Revision::new(
                    value.clone(),
                    remote_timestamp(&value).unwrap_or_else(Utc::now),
                ),
                local_version: local.version,
                resolution: ConflictResolution::Manual,
                resolved: false,
                detected_at: Utc::now(),
            })
        });

        if let Some(conflict) = conflict {
            self.metrics.inc_conflicts_detected();
            warn!(key = %key, conflict_id = %conflict.id, "Remote value diverged from local write");
            self.conflicts.publish(&(), &conflict);
            return Err(Error::Conflict {
                key: key.to_string(),
            });
        }

        self.store(key, value.clone(), None, false)?;
        Ok(value)
    }

    fn store(&self, key: &str, value: Value, version: Option<u64>, dirty: bool) -> Result<u64> {
        let bytes = serde_json::to_vec(&value)?;
        let sum = checksum(&bytes);
        let now = Instant::now();
        let wall_now = Utc::now();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let expires_at = now + self.config.ttl;

        let snapshot = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                entry.version = version.unwrap_or(0).max(entry.version + 1);
                entry.value = value;
                entry.updated_at = wall_now;
                entry.checksum = sum;
                entry.size = bytes.len();
                entry.stale = false;
                entry.dirty = dirty;
                entry.last_sync = now;
                entry.expires_at = expires_at;
                entry.synced_seq = seq;
                entry.clone()
            }
            Entry::Vacant(slot) => {
                let entry = CacheEntry {
                    key: key.to_string(),
                    value,
                    created_at: wall_now,
                    updated_at: wall_now,
                    version: version.unwrap_or(1).max(1),
                    checksum: sum,
                    size: bytes.len(),
                    stale: false,
                    dirty,
                    inserted_at: now,
                    last_sync: now,
                    expires_at,
                    inserted_seq: seq,
                    synced_seq: seq,
                };
                slot.insert(entry.clone());
                entry
            }
        };

        self.persist(&snapshot);
        self.evict();
        self.metrics.set_cache_entries(self.entries.len());

        self.updates.publish(
            &snapshot.key,
            &CacheUpdate {
                key: snapshot.key.clone(),
                value: snapshot.value.clone(),
                version: snapshot.version,
            },
        );
        Ok(snapshot.version)
    }

    /// Drop clean entries until the cache fits `max_size`.
    ///
    /// Dirty entries hold unconfirmed local writes and are never evicted.
    fn evict(&self) {
        let excess = self.entries.len().saturating_sub(self.config.max_size);
        if excess == 0 {
            return;
        }

        let policy = self.config.eviction_policy;
        let mut ranked: Vec<((Instant, u64), String)> = self
            .entries
            .iter()
            .filter(|entry| !entry.dirty)
            .map(|entry| (entry.eviction_rank(policy), entry.key().clone()))
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0));
        if ranked.len() < excess {
            warn!(
                entries = self.entries.len(),
                max_size = self.config.max_size,
                "Cache over capacity with unsynced local writes"
            );
        }

        for (_, key) in ranked.into_iter().take(excess) {
            self.entries.remove(&key);
            self.unpersist(&key);
            debug!(key = %key, policy = ?policy, "Evicted cache entry");
        }
    }

    fn persist(&self, entry: &CacheEntry) {
        let Some(storage) = &self.storage else {
            return;
        };
        let record = PersistedEntry {
            value: entry.value.clone(),
            version: entry.version,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
            dirty: entry.dirty,
        };
        if let Err(e) = storage.put_json(&entry.key, &record, None) {
            warn!(key = %entry.key, error = %e, "Failed to persist cache entry");
        }
    }

    fn unpersist(&self, key: &str) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.remove(key) {
                warn!(key = %key, error = %e, "Failed to remove persisted cache entry");
            }
        }
    }
}
