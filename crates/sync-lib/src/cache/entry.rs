//! Cache entries and the policies that order them for eviction

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::Instant;

/// Which entries go first when the cache is over capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Oldest last sync first
    Lru,
    /// Oldest insertion first
    Fifo,
    /// Nearest expiry first
    Ttl,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy::Lru
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_size: usize,
    pub eviction_policy: EvictionPolicy,
    /// Period of the expired-entry sweep
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            max_size: 1000,
            eviction_policy: EvictionPolicy::Lru,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

/// A versioned cached value
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    /// Last successful sync or local write
    pub updated_at: DateTime<Utc>,
    pub version: u64,
    pub checksum: String,
    pub size: usize,
    /// Manually invalidated
    pub stale: bool,
    /// Holds a local write the server has not confirmed
    pub dirty: bool,
    #[serde(skip)]
    pub(crate) inserted_at: Instant,
    #[serde(skip)]
    pub(crate) last_sync: Instant,
    #[serde(skip)]
    pub(crate) expires_at: Instant,
    #[serde(skip)]
    pub(crate) inserted_seq: u64,
    #[serde(skip)]
    pub(crate) synced_seq: u64,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Servable without a fetch
    pub fn is_fresh(&self) -> bool {
        !self.stale && !self.is_expired()
    }

    pub fn age(&self) -> Duration {
        self.last_sync.elapsed()
    }

    /// Ordering key under `policy`, smallest evicted first
    pub(crate) fn eviction_rank(&self, policy: EvictionPolicy) -> (Instant, u64) {
        match policy {
            EvictionPolicy::Lru => (self.last_sync, self.synced_seq),
            EvictionPolicy::Fifo => (self.inserted_at, self.inserted_seq),
            EvictionPolicy::Ttl => (self.expires_at, self.synced_seq),
        }
    }
}

/// SHA-256 of the serialized value, first 16 hex characters
pub fn checksum(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = hex::encode(digest);
    hex.truncate(16);
    hex
}

/// Modification time carried by a fetched value, if it has one.
///
/// Looks at `updatedAt`, `updated_at` and `timestamp`, accepting RFC 3339
/// strings or epoch milliseconds.
pub fn remote_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let object = value.as_object()?;
    ["updatedAt", "updated_at", "timestamp"]
        .iter()
        .filter_map(|field| object.get(*field))
        .find_map(|v| match v {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            Value::Number(n) => n
                .as_i64()
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
            _ => None,
        })
}
