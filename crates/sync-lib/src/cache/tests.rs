use super::*;
use crate::storage::{FileStore, KeyValueStore, MemoryStore, StorageTier};
use serde_json::json;
use std::sync::atomic::AtomicUsize;
use tempfile::TempDir;
use tokio_test::assert_err;

fn small_cache(policy: EvictionPolicy) -> SyncCache {
    SyncCache::new(
        CacheConfig::default()
            .with_max_size(3)
            .with_eviction_policy(policy),
    )
}

fn counting_fetch<T: Send + 'static>(
    calls: &Arc<AtomicUsize>,
    value: T,
) -> impl FnOnce() -> std::future::Ready<Result<T>> + Send + 'static {
    let calls = Arc::clone(calls);
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(value))
    }
}

#[tokio::test]
async fn test_lru_evicts_oldest_sync() {
    let cache = small_cache(EvictionPolicy::Lru);
    for key in ["A", "B", "C", "D"] {
        cache.set(key, &key, None).unwrap();
    }
    assert_eq!(cache.keys(), vec!["B", "C", "D"]);
}

#[tokio::test]
async fn test_lru_refresh_protects_entry() {
    let cache = small_cache(EvictionPolicy::Lru);
    for key in ["A", "B", "C"] {
        cache.set(key, &key, None).unwrap();
    }
    // Re-syncing A makes B the least recently synced
    cache.set("A", &"A2", None).unwrap();
    cache.set("D", &"D", None).unwrap();
    assert_eq!(cache.keys(), vec!["A", "C", "D"]);
}

#[tokio::test]
async fn test_fifo_ignores_refreshes() {
    let cache = small_cache(EvictionPolicy::Fifo);
    for key in ["A", "B", "C"] {
        cache.set(key, &key, None).unwrap();
    }
    cache.set("A", &"A2", None).unwrap();
    cache.set("D", &"D", None).unwrap();
    assert_eq!(cache.keys(), vec!["B", "C", "D"]);
}

#[tokio::test(start_paused = true)]
async fn test_ttl_policy_evicts_nearest_expiry() {
    let cache = small_cache(EvictionPolicy::Ttl);
    cache.set("A", &1, None).unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    cache.set("B", &2, None).unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    cache.set("C", &3, None).unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    cache.set("A", &4, None).unwrap();
    cache.set("D", &5, None).unwrap();
    assert_eq!(cache.keys(), vec!["A", "C", "D"]);
}

#[tokio::test]
async fn test_eviction_keeps_unsynced_local_writes() {
    let cache = SyncCache::new(CacheConfig::default().with_max_size(2));
    cache.set_local("draft", &"unsent").unwrap();
    cache.set("b", &"b", None).unwrap();
    cache.set("c", &"c", None).unwrap();
    assert_eq!(cache.keys(), vec!["c", "draft"]);

    // With nothing clean left to drop the cache stays over capacity
    cache.set_local("c", &"edited").unwrap();
    cache.set_local("d", &"new").unwrap();
    assert_eq!(cache.keys(), vec!["c", "d", "draft"]);
    assert!(cache.entry("draft").unwrap().dirty);
}

#[tokio::test]
async fn test_set_then_get_skips_fetch() {
    let cache = SyncCache::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let value = json!({"title": "Budget 2025", "votes": [1, 2, 3]});

    cache.set("proposal:1", &value, None).unwrap();
    let got: Value = cache
        .get("proposal:1", counting_fetch(&calls, json!(null)), false)
        .await
        .unwrap();

    assert_eq!(got, value);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(cache.stats().hits, 1);
}

#[tokio::test]
async fn test_concurrent_gets_share_one_fetch() {
    let cache = SyncCache::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let counter = Arc::clone(&calls);
    let first = cache.get(
        "members",
        move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = release_rx.await;
            Ok(vec!["alice".to_string(), "bob".to_string()])
        },
        false,
    );
    let second = cache.get(
        "members",
        counting_fetch(&calls, vec!["unexpected".to_string()]),
        false,
    );
    let release = async move {
        tokio::task::yield_now().await;
        let _ = release_tx.send(());
    };

    let (a, b, _) = tokio::join!(first, second, release);
    assert_eq!(a.unwrap(), vec!["alice", "bob"]);
    assert_eq!(b.unwrap(), vec!["alice", "bob"]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!cache.is_syncing("members"));
}

#[tokio::test]
async fn test_failed_sync_keeps_previous_entry() {
    let cache = SyncCache::default();
    cache.set("balance", &100, None).unwrap();

    let result: Result<u64> = cache
        .sync("balance", || async { Err(Error::Network("timeout".into())) })
        .await;

    match result {
        Err(Error::SyncFailed { key, reason }) => {
            assert_eq!(key, "balance");
            assert!(reason.contains("timeout"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(cache.peek::<u64>("balance"), Some(100));
    assert_eq!(cache.entry("balance").unwrap().version, 1);
}

#[tokio::test]
async fn test_versions_only_increase() {
    let cache = SyncCache::default();
    assert_eq!(cache.set("k", &1, None).unwrap(), 1);
    assert_eq!(cache.set("k", &2, Some(10)).unwrap(), 10);
    assert_eq!(cache.set("k", &3, Some(4)).unwrap(), 11);
    assert_eq!(cache.set("k", &4, None).unwrap(), 12);
}

#[tokio::test]
async fn test_invalidate_forces_refetch() {
    let cache = SyncCache::default();
    let calls = Arc::new(AtomicUsize::new(0));
    cache.set("user:1", &json!("old"), None).unwrap();
    cache.set("user:2", &json!("old"), None).unwrap();
    cache.set("proposal:1", &json!("old"), None).unwrap();

    assert_eq!(cache.invalidate_pattern(r"^user:\d+$").unwrap(), 2);
    assert_err!(cache.invalidate_pattern("("));

    let got: Value = cache
        .get("user:1", counting_fetch(&calls, json!("new")), false)
        .await
        .unwrap();
    assert_eq!(got, json!("new"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(cache.entry("proposal:1").unwrap().is_fresh());

    assert!(cache.invalidate("proposal:1"));
    assert!(!cache.invalidate("missing"));
    assert!(!cache.entry("proposal:1").unwrap().is_fresh());
}

#[tokio::test(start_paused = true)]
async fn test_expired_entry_refetches_and_cleanup_removes() {
    let cache = SyncCache::new(CacheConfig::default().with_ttl(Duration::from_secs(30)));
    let calls = Arc::new(AtomicUsize::new(0));
    cache.set("a", &1, None).unwrap();
    cache.set("b", &2, None).unwrap();

    tokio::time::advance(Duration::from_secs(31)).await;
    let got: u32 = cache
        .get("a", counting_fetch(&calls, 5u32), false)
        .await
        .unwrap();
    assert_eq!(got, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(cache.cleanup_expired(), 1);
    assert_eq!(cache.keys(), vec!["a"]);
}

#[tokio::test]
async fn test_force_refresh_bypasses_fresh_entry() {
    let cache = SyncCache::default();
    let calls = Arc::new(AtomicUsize::new(0));
    cache.set("k", &1, None).unwrap();

    let got: u32 = cache
        .get("k", counting_fetch(&calls, 2u32), true)
        .await
        .unwrap();
    assert_eq!(got, 2);
    assert_eq!(cache.entry("k").unwrap().version, 2);
}

#[tokio::test]
async fn test_subscribers_receive_updates() {
    let cache = SyncCache::default();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = cache.subscribe("count", move |v: &u32| sink.lock().push(*v));

    cache.set("count", &1, None).unwrap();
    let _: u32 = cache.sync("count", || async { Ok(2u32) }).await.unwrap();
    cache.set("other", &9, None).unwrap();
    sub.unsubscribe();
    cache.set("count", &3, None).unwrap();

    assert_eq!(*seen.lock(), vec![1, 2]);
}

#[tokio::test]
async fn test_diverging_sync_on_local_write_is_conflict() {
    let cache = SyncCache::default();
    let conflicts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&conflicts);
    cache.subscribe_conflicts(move |c| sink.lock().push(c.clone()));

    cache.set("profile", &json!({"name": "server"}), None).unwrap();
    cache.set_local("profile", &json!({"name": "local edit"})).unwrap();
    assert!(cache.entry("profile").unwrap().dirty);

    let result: Result<Value> = cache
        .sync("profile", || async {
            Ok(json!({"name": "remote edit", "updatedAt": "2024-01-01T00:00:00Z"}))
        })
        .await;
    assert!(matches!(result, Err(Error::Conflict { ref key }) if key == "profile"));

    let conflicts = conflicts.lock();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].local.value, json!({"name": "local edit"}));
    assert_eq!(conflicts[0].remote.timestamp.timestamp(), 1_704_067_200);
    assert_eq!(conflicts[0].local_version, 2);
    // Local write preserved until resolved
    assert_eq!(
        cache.peek::<Value>("profile"),
        Some(json!({"name": "local edit"}))
    );
}

#[tokio::test]
async fn test_matching_sync_confirms_local_write() {
    let cache = SyncCache::default();
    cache.set_local("vote", &json!({"choice": "yes"})).unwrap();

    let _: Value = cache
        .sync("vote", || async { Ok(json!({"choice": "yes"})) })
        .await
        .unwrap();
    assert!(!cache.entry("vote").unwrap().dirty);
}

#[tokio::test]
async fn test_registered_resolver_overrides_default() {
    let cache = SyncCache::default();
    cache.register_conflict_resolver("tally", |local: &Revision, remote: &Revision| {
        let l = local.value.as_u64().unwrap_or(0);
        let r = remote.value.as_u64().unwrap_or(0);
        json!(l.max(r))
    });

    let now = Utc::now();
    let local = Revision::new(json!(12), now);
    let remote = Revision::new(json!(9), now + chrono::Duration::seconds(1));

    assert_eq!(cache.resolve_conflict("proposal:tally", &local, &remote), json!(12));
    assert_eq!(cache.resolve_conflict("proposal:title", &local, &remote), json!(9));
}

#[tokio::test(start_paused = true)]
async fn test_auto_sync_refreshes_until_stopped() {
    let cache = SyncCache::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    cache.setup_auto_sync(
        "prices",
        move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n) }
        },
        Duration::from_secs(10),
    );
    assert_eq!(cache.auto_sync_keys(), vec!["prices"]);

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.peek::<usize>("prices"), Some(1));

    assert!(cache.stop_auto_sync("prices"));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!cache.stop_auto_sync("prices"));
}

#[tokio::test]
async fn test_resync_all_reports_failures() {
    let cache = SyncCache::default();
    cache.setup_auto_sync("ok", || async { Ok(1u8) }, Duration::from_secs(3600));
    cache.setup_auto_sync(
        "broken",
        || async { Err::<u8, _>(Error::Network("refused".into())) },
        Duration::from_secs(3600),
    );

    let failures = cache.resync_all().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "broken");
    assert_eq!(cache.peek::<u8>("ok"), Some(1));
}

#[tokio::test]
async fn test_persisted_entries_survive_restart() {
    let dir = TempDir::new().unwrap();
    let durable: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(dir.path()).unwrap());
    let memory: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::memory());
    let storage = Arc::new(TieredStorage::new("cache", vec![memory, durable]));

    let cache = SyncCache::with_storage(CacheConfig::default(), Arc::clone(&storage));
    cache.set("settings", &json!({"theme": "dark"}), Some(3)).unwrap();
    cache.set_local("draft", &json!("unsent")).unwrap();
    drop(cache);

    let reopened_store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(dir.path()).unwrap());
    let reopened = SyncCache::with_storage(
        CacheConfig::default(),
        Arc::new(TieredStorage::new("cache", vec![reopened_store])),
    );
    assert_eq!(reopened.load_persisted(), 2);

    let entry = reopened.entry("settings").unwrap();
    assert_eq!(entry.version, 3);
    assert_eq!(entry.value, json!({"theme": "dark"}));
    assert!(reopened.entry("draft").unwrap().dirty);
}

#[tokio::test]
async fn test_stats() {
    let cache = SyncCache::default();
    let calls = Arc::new(AtomicUsize::new(0));
    cache.set("a", &"x", None).unwrap();
    cache.set_local("b", &"y").unwrap();
    cache.invalidate("a");

    let _: String = cache
        .get("a", counting_fetch(&calls, "z".to_string()), false)
        .await
        .unwrap();
    let _: String = cache
        .get("a", counting_fetch(&calls, "unused".to_string()), false)
        .await
        .unwrap();

    let stats = cache.stats();
    assert_eq!(stats.total_entries, 2);
    assert_eq!(stats.dirty_entries, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hit_rate, 50.0);
    assert!(stats.total_bytes > 0);
}

#[tokio::test]
async fn test_cache_and_fallback_share_storage_without_collisions() {
    use crate::resilience::{
        DataSource, FallbackConfig, FallbackManager, FallbackOptions, FallbackStrategy,
    };

    let storage = Arc::new(TieredStorage::in_memory("sync_engine"));
    let cache = SyncCache::with_storage(CacheConfig::default(), Arc::clone(&storage));
    let fallback = FallbackManager::with_storage(FallbackConfig::default(), Arc::clone(&storage));
    let local = || FallbackOptions::new(FallbackStrategy::Local).cache_key("feed");

    fallback
        .execute_with_fallback(|| async { Ok(7u32) }, local())
        .await
        .unwrap();
    cache.set("feed", &json!({"items": []}), None).unwrap();
    cache.clear();

    let served = fallback
        .execute_with_fallback(
            || async { Err::<u32, _>(Error::Network("offline".into())) },
            local(),
        )
        .await
        .unwrap();
    assert_eq!(served.data, 7);
    assert_eq!(served.source, DataSource::Local);

    cache.set("profile", &json!("ada"), None).unwrap();
    let reopened = SyncCache::with_storage(CacheConfig::default(), storage);
    assert_eq!(reopened.load_persisted(), 1);
    assert!(reopened.contains("profile"));
    assert!(!reopened.contains("feed"));
}

/// Memory tier that refuses deletes
struct UndeletableStore(MemoryStore);

impl KeyValueStore for UndeletableStore {
    fn tier(&self) -> StorageTier {
        self.0.tier()
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.0.get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.0.put(key, value)
    }

    fn remove(&self, _key: &str) -> Result<()> {
        Err(Error::Storage {
            tier: StorageTier::Memory,
            operation: "remove".to_string(),
            message: "read-only volume".to_string(),
        })
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.0.keys()
    }
}

#[tokio::test]
async fn test_load_persisted_skips_expired_entries_it_cannot_delete() {
    let store: Arc<dyn KeyValueStore> = Arc::new(UndeletableStore(MemoryStore::memory()));
    let storage = Arc::new(TieredStorage::new("sync_engine", vec![store]));
    let expired = CacheConfig::default().with_ttl(Duration::ZERO);

    let cache = SyncCache::with_storage(expired.clone(), Arc::clone(&storage));
    cache.set("old", &1, None).unwrap();
    cache.set_local("draft", &2).unwrap();

    let reopened = SyncCache::with_storage(expired, Arc::clone(&storage));
    assert_eq!(reopened.load_persisted(), 1);
    assert_eq!(reopened.keys(), vec!["draft"]);
    // The failed delete leaves the record behind for the next start
    assert!(storage
        .scoped(crate::cache::STORAGE_NAMESPACE)
        .keys()
        .contains(&"old".to_string()));
}
