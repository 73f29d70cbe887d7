//! Key/value persistence tiers
//!
//! Opaque JSON blobs keyed by a service prefix. Three tiers exist, tried in
//! priority order: durable (survives restarts), session (lives as long as the
//! embedding application session) and memory-only.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage tier, in descending priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    Durable,
    Session,
    Memory,
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageTier::Durable => write!(f, "durable"),
            StorageTier::Session => write!(f, "session"),
            StorageTier::Memory => write!(f, "memory"),
        }
    }
}

/// A single storage backend
pub trait KeyValueStore: Send + Sync {
    fn tier(&self) -> StorageTier;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    fn keys(&self) -> Result<Vec<String>>;

    fn clear(&self) -> Result<()> {
        for key in self.keys()? {
            self.remove(&key)?;
        }
        Ok(())
    }
}

/// Envelope written for every stored value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord<T> {
    pub data: T,
    pub stored_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl<T> StoredRecord<T> {
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|exp| exp < Utc::now()).unwrap_or(false)
    }
}

/// In-process store used for the session and memory tiers
pub struct MemoryStore {
    tier: StorageTier,
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new(tier: StorageTier) -> Self {
        Self {
            tier,
            entries: DashMap::new(),
        }
    }

    pub fn session() -> Self {
        Self::new(StorageTier::Session)
    }

    pub fn memory() -> Self {
        Self::new(StorageTier::Memory)
    }
}

impl KeyValueStore for MemoryStore {
    fn tier(&self) -> StorageTier {
        self.tier
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }

    fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

/// Durable store writing one JSON file per key
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| storage_error("open", &e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys may contain path separators; hex keeps them filesystem-safe
        self.dir.join(format!("{}.json", hex::encode(key.as_bytes())))
    }
}

fn storage_error(operation: &str, err: &dyn std::fmt::Display) -> Error {
    Error::Storage {
        tier: StorageTier::Durable,
        operation: operation.to_string(),
        message: err.to_string(),
    }
}

impl KeyValueStore for FileStore {
    fn tier(&self) -> StorageTier {
        StorageTier::Durable
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("get", &e)),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key);

        // Write atomically using temp file
        let temp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| storage_error("put", &e))?;
        file.write_all(value).map_err(|e| storage_error("put", &e))?;
        file.sync_all().map_err(|e| storage_error("put", &e))?;

        fs::rename(&temp_path, &path).map_err(|e| storage_error("put", &e))?;
        debug!(path = %path.display(), bytes = value.len(), "Record written to durable storage");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error("remove", &e)),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| storage_error("keys", &e))?;
        for entry in entries {
            let entry = entry.map_err(|e| storage_error("keys", &e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let decoded = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|stem| hex::decode(stem).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok());
            if let Some(key) = decoded {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

/// Ordered set of stores, highest priority first
#[derive(Clone)]
pub struct TieredStorage {
    prefix: String,
    tiers: Vec<Arc<dyn KeyValueStore>>,
}

impl TieredStorage {
    pub fn new(prefix: impl Into<String>, mut tiers: Vec<Arc<dyn KeyValueStore>>) -> Self {
        tiers.sort_by_key(|t| t.tier());
        Self {
            prefix: prefix.into(),
            tiers,
        }
    }

    /// Session + memory tiers only
    pub fn in_memory(prefix: impl Into<String>) -> Self {
        Self::new(
            prefix,
            vec![Arc::new(MemoryStore::session()), Arc::new(MemoryStore::memory())],
        )
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Same tiers under `{prefix}:{namespace}`.
    ///
    /// Keys of one namespace never show up in the keys of another, nor in
    /// those of the unscoped storage.
    pub fn scoped(&self, namespace: &str) -> Self {
        Self {
            prefix: format!("{}:{}", self.prefix, namespace),
            tiers: self.tiers.clone(),
        }
    }

    pub fn tiers(&self) -> impl Iterator<Item = StorageTier> + '_ {
        self.tiers.iter().map(|t| t.tier())
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}_{}", self.prefix, key)
    }

    /// Read `key` from the first tier holding it.
    ///
    /// A tier that fails to read or decode is logged and skipped.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<(StorageTier, StoredRecord<T>)> {
        let full_key = self.prefixed(key);
        for store in &self.tiers {
            match store.get(&full_key) {
                Ok(Some(bytes)) => match serde_json::from_slice::<StoredRecord<T>>(&bytes) {
                    Ok(record) => return Some((store.tier(), record)),
                    Err(e) => {
                        warn!(tier = %store.tier(), key = %key, error = %e, "Discarding undecodable record");
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!(tier = %store.tier(), key = %key, error = %e, "Storage tier read failed");
                }
            }
        }
        None
    }

    /// Write `value` to the highest tier that accepts it
    pub fn put_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<StorageTier> {
        let record = StoredRecord {
            data: value,
            stored_at: Utc::now(),
            expires_at,
        };
        let bytes = serde_json::to_vec(&record)?;
        let full_key = self.prefixed(key);

        let mut last_error = None;
        for store in &self.tiers {
            match store.put(&full_key, &bytes) {
                Ok(()) => return Ok(store.tier()),
                Err(e) => {
                    warn!(tier = %store.tier(), key = %key, error = %e, "Storage tier rejected write");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Storage {
            tier: StorageTier::Memory,
            operation: "put".to_string(),
            message: "no storage tiers configured".to_string(),
        }))
    }

    /// Remove `key` from every tier
    pub fn remove(&self, key: &str) -> Result<()> {
        let full_key = self.prefixed(key);
        for store in &self.tiers {
            store.remove(&full_key)?;
        }
        Ok(())
    }

    /// Keys (without prefix) present in any tier
    pub fn keys(&self) -> Vec<String> {
        let marker = format!("{}_", self.prefix);
        let mut keys: Vec<String> = self
            .tiers
            .iter()
            .filter_map(|store| store.keys().ok())
            .flatten()
            .filter_map(|k| k.strip_prefix(&marker).map(str::to_string))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}
