//! Fallback data sources for when the primary call path fails
//!
//! Every [`FallbackResult`] carries its provenance ([`DataSource`]) and a
//! staleness flag, so callers can tell live data from a cached, mocked or
//! locally stored substitute.

use crate::error::{Error, Result};
use crate::events::{EventBus, Subscription};
use crate::storage::{StoredRecord, TieredStorage};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackStrategy {
    Cache,
    Polling,
    Mock,
    Local,
    None,
}

/// Where a returned value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Live,
    Cache,
    Mock,
    Local,
    Polling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackResult<T> {
    pub data: T,
    pub source: DataSource,
    pub timestamp: DateTime<Utc>,
    pub stale: bool,
    /// True whenever `data` did not come from the primary call
    pub fallback: bool,
}

/// Per-call fallback options
#[derive(Debug, Clone)]
pub struct FallbackOptions<T> {
    pub strategy: FallbackStrategy,
    pub cache_key: Option<String>,
    pub poll_interval: Option<Duration>,
    pub mock_data: Option<T>,
}

impl<T> FallbackOptions<T> {
    pub fn new(strategy: FallbackStrategy) -> Self {
        Self {
            strategy,
            cache_key: None,
            poll_interval: None,
            mock_data: None,
        }
    }

    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn mock_data(mut self, data: T) -> Self {
        self.mock_data = Some(data);
        self
    }
}

#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Lifetime of a cached live result before it is served as stale
    pub cache_ttl: Duration,
    pub default_poll_interval: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30 * 60),
            default_poll_interval: Duration::from_secs(5),
        }
    }
}

impl FallbackConfig {
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_default_poll_interval(mut self, interval: Duration) -> Self {
        self.default_poll_interval = interval;
        self
    }
}

/// Published whenever a fallback strategy is engaged
#[derive(Debug, Clone)]
pub struct FallbackActivated {
    pub cache_key: Option<String>,
    pub strategy: FallbackStrategy,
    /// Source that served the call, `None` if the strategy had nothing
    pub source: Option<DataSource>,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FallbackStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Percentage in `0.0..=100.0`
    pub hit_rate: f64,
    pub cached_keys: usize,
    pub active_pollers: usize,
}

/// Remembered result of a key and who produced it
#[derive(Debug, Clone)]
struct CachedResult {
    record: StoredRecord<Value>,
    /// `Cache` for results of a caller's primary call, `Polling` for
    /// results a background poller recovered
    source: DataSource,
}

struct FallbackInner {
    config: FallbackConfig,
    cache: DashMap<String, CachedResult>,
    storage: Option<Arc<TieredStorage>>,
    pollers: Mutex<HashMap<String, JoinHandle<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    events: EventBus<(), FallbackActivated>,
}

impl Drop for FallbackInner {
    fn drop(&mut self) {
        for (_, handle) in self.pollers.lock().drain() {
            handle.abort();
        }
    }
}

/// Namespace of mirrored results inside a shared [`TieredStorage`]
pub const STORAGE_NAMESPACE: &str = "fallback";

/// Runs a primary call and substitutes fallback data when it fails
#[derive(Clone)]
pub struct FallbackManager {
    inner: Arc<FallbackInner>,
}

impl Default for FallbackManager {
    fn default() -> Self {
        Self::new(FallbackConfig::default())
    }
}

impl FallbackManager {
    pub fn new(config: FallbackConfig) -> Self {
        Self::build(config, None)
    }

    /// Mirror live results into the [`STORAGE_NAMESPACE`] scope of `storage`
    /// and serve them for the `local` strategy
    pub fn with_storage(config: FallbackConfig, storage: Arc<TieredStorage>) -> Self {
        Self::build(config, Some(Arc::new(storage.scoped(STORAGE_NAMESPACE))))
    }

    fn build(config: FallbackConfig, storage: Option<Arc<TieredStorage>>) -> Self {
        Self {
            inner: Arc::new(FallbackInner {
                config,
                cache: DashMap::new(),
                storage,
                pollers: Mutex::new(HashMap::new()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                events: EventBus::new(),
            }),
        }
    }

    /// Try `primary`; on failure serve data according to `options.strategy`.
    pub async fn execute_with_fallback<T, F, Fut>(
        &self,
        primary: F,
        options: FallbackOptions<T>,
    ) -> Result<FallbackResult<T>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let error = match primary().await {
            Ok(data) => {
                if let Some(key) = &options.cache_key {
                    self.inner.store_live(key, &data, DataSource::Cache);
                }
                return Ok(FallbackResult {
                    data,
                    source: DataSource::Live,
                    timestamp: Utc::now(),
                    stale: false,
                    fallback: false,
                });
            }
            Err(e) => e,
        };

        warn!(
            strategy = ?options.strategy,
            cache_key = ?options.cache_key,
            error = %error,
            "Primary call failed, using fallback strategy"
        );

        let key = options.cache_key.clone();
        let result = match options.strategy {
            FallbackStrategy::None => Err(error.clone()),
            FallbackStrategy::Cache => self.from_cache(key.as_deref()),
            FallbackStrategy::Mock => options
                .mock_data
                .map(|data| FallbackResult {
                    data,
                    source: DataSource::Mock,
                    timestamp: Utc::now(),
                    stale: false,
                    fallback: true,
                })
                .ok_or_else(|| {
                    Error::FallbackUnavailable("mock data required for mock fallback".into())
                }),
            FallbackStrategy::Local => self.from_local(key.as_deref()),
            FallbackStrategy::Polling => match self.from_cache(key.as_deref()) {
                Ok(result) => Ok(result),
                Err(_) => match key.as_deref() {
                    Some(key) => {
                        let interval = options
                            .poll_interval
                            .unwrap_or(self.inner.config.default_poll_interval);
                        self.start_polling(key, interval, primary);
                        Err(Error::PollingStarted {
                            key: key.to_string(),
                        })
                    }
                    None => Err(Error::FallbackUnavailable(
                        "polling fallback requires a cache key".into(),
                    )),
                },
            },
        };

        if options.strategy != FallbackStrategy::None {
            self.inner.events.publish(
                &(),
                &FallbackActivated {
                    cache_key: options.cache_key,
                    strategy: options.strategy,
                    source: result.as_ref().ok().map(|r| r.source),
                    error: error.to_string(),
                },
            );
        }
        result
    }

    /// Last remembered result for `key`, regardless of age.
    ///
    /// Tagged [`DataSource::Polling`] when a background poller produced it.
    pub fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<FallbackResult<T>> {
        let CachedResult { record, source } = self.inner.cache.get(key)?.clone();
        let stale = record.is_expired();
        let data = serde_json::from_value(record.data).ok()?;
        Some(FallbackResult {
            data,
            source,
            timestamp: record.stored_at,
            stale,
            fallback: true,
        })
    }

    fn from_cache<T: DeserializeOwned>(&self, key: Option<&str>) -> Result<FallbackResult<T>> {
        let key = key.ok_or_else(|| {
            Error::FallbackUnavailable("cache fallback requires a cache key".into())
        })?;
        match self.cached(key) {
            Some(result) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                Err(Error::FallbackUnavailable(format!(
                    "no cached data available for '{}'",
                    key
                )))
            }
        }
    }

    fn from_local<T: DeserializeOwned>(&self, key: Option<&str>) -> Result<FallbackResult<T>> {
        let key = key.ok_or_else(|| {
            Error::FallbackUnavailable("local fallback requires a cache key".into())
        })?;
        let storage = self.inner.storage.as_ref().ok_or_else(|| {
            Error::FallbackUnavailable("no local storage configured".into())
        })?;

        match storage.get_json::<T>(key) {
            Some((tier, record)) => {
                debug!(key = %key, tier = %tier, "Served fallback from local storage");
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                let stale = record.is_expired();
                Ok(FallbackResult {
                    data: record.data,
                    source: DataSource::Local,
                    timestamp: record.stored_at,
                    stale,
                    fallback: true,
                })
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                Err(Error::FallbackUnavailable(format!(
                    "no local data available for '{}'",
                    key
                )))
            }
        }
    }

    fn start_polling<T, F, Fut>(&self, key: &str, interval: Duration, primary: F)
    where
        T: Serialize + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.stop_polling(key);

        let weak: Weak<FallbackInner> = Arc::downgrade(&self.inner);
        let poll_key = key.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let result = primary().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match result {
                    Ok(data) => {
                        inner.store_live(&poll_key, &data, DataSource::Polling);
                        inner.pollers.lock().remove(&poll_key);
                        info!(key = %poll_key, "Polling recovered data, poller stopped");
                        break;
                    }
                    Err(e) => debug!(key = %poll_key, error = %e, "Poll attempt failed"),
                }
            }
        });

        self.inner.pollers.lock().insert(key.to_string(), handle);
        info!(key = %key, interval_ms = interval.as_millis() as u64, "Started fallback poller");
    }

    pub fn is_polling(&self, key: &str) -> bool {
        self.inner.pollers.lock().contains_key(key)
    }

    pub fn stop_polling(&self, key: &str) {
        if let Some(handle) = self.inner.pollers.lock().remove(key) {
            handle.abort();
        }
    }

    pub fn stop_all_polling(&self) {
        for (_, handle) in self.inner.pollers.lock().drain() {
            handle.abort();
        }
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Percentage of fallback lookups that found data
    pub fn hit_rate(&self) -> f64 {
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let total = hits + self.inner.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64 * 100.0
        }
    }

    pub fn stats(&self) -> FallbackStats {
        FallbackStats {
            cache_hits: self.inner.hits.load(Ordering::Relaxed),
            cache_misses: self.inner.misses.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
            cached_keys: self.inner.cache.len(),
            active_pollers: self.inner.pollers.lock().len(),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&FallbackActivated) + Send + Sync + 'static,
    {
        self.inner.events.subscribe((), callback)
    }
}

impl FallbackInner {
    fn store_live<T: Serialize>(&self, key: &str, data: &T, source: DataSource) {
        let value = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize live result for fallback cache");
                return;
            }
        };
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(self.config.cache_ttl)
            .ok()
            .map(|ttl| now + ttl);

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.put_json(key, &value, expires_at) {
                warn!(key = %key, error = %e, "Failed to mirror live result to local storage");
            }
        }

        self.cache.insert(
            key.to_string(),
            CachedResult {
                record: StoredRecord {
                    data: value,
                    stored_at: now,
                    expires_at,
                },
                source,
            },
        );
    }
}
