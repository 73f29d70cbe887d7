use super::*;
use crate::cache::{CacheConfig, SyncCache};
use crate::error::{Error, Result};
use crate::health::{components, ComponentStatus, HealthRegistry};
use crate::models::{
    ConflictResolution, ConnectionState, HttpMethod, HttpRequest, Operation, OperationPayload,
    OperationRequest, Priority,
};
use crate::queue::{OperationExecutor, QueueManager, QueueManagerConfig, DEFAULT_CHANNEL};
use crate::resilience::{FallbackManager, RetryPolicy};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingExecutor {
    executed: Mutex<Vec<String>>,
    failing: Mutex<Vec<String>>,
}

#[async_trait]
impl OperationExecutor for RecordingExecutor {
    async fn execute(&self, operation: &Operation) -> Result<Value> {
        let endpoint = match &operation.payload {
            OperationPayload::Http(req) => req.endpoint.clone(),
            OperationPayload::Transaction(_) => "transaction".to_string(),
        };
        self.executed.lock().push(endpoint.clone());
        if self.failing.lock().contains(&endpoint) {
            return Err(Error::Network("backend unavailable".into()));
        }
        Ok(json!({ "ok": true }))
    }
}

struct ScriptedProbe {
    results: Mutex<VecDeque<Result<Duration>>>,
}

#[async_trait]
impl ConnectivityProbe for ScriptedProbe {
    async fn probe(&self) -> Result<Duration> {
        self.results
            .lock()
            .pop_front()
            .unwrap_or(Ok(Duration::from_millis(20)))
    }
}

struct Harness {
    coordinator: OfflineCoordinator,
    executor: Arc<RecordingExecutor>,
    events: Arc<Mutex<Vec<&'static str>>>,
}

fn harness(config: CoordinatorConfig, probe: Option<Arc<dyn ConnectivityProbe>>) -> Harness {
    let executor = Arc::new(RecordingExecutor::default());
    let queue = QueueManager::new(
        QueueManagerConfig::default().with_transport_retry(RetryPolicy::none()),
        executor.clone(),
    );
    let coordinator = OfflineCoordinator::new(
        config,
        Components {
            queue,
            cache: SyncCache::new(CacheConfig::default()),
            fallback: FallbackManager::default(),
            health: HealthRegistry::new(),
            probe,
        },
    );

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    coordinator.subscribe(move |event| sink.lock().push(event.name()));

    Harness {
        coordinator,
        executor,
        events,
    }
}

fn post(endpoint: &str) -> OperationRequest {
    OperationRequest::http(HttpRequest::new(HttpMethod::Post, endpoint))
}

/// Leave a dirty local value for `key` and register a refresh returning `remote`
fn diverge(coordinator: &OfflineCoordinator, key: &str, local: Value, remote: Value) {
    let cache = coordinator.cache();
    cache.set_local(key, &local).unwrap();
    cache.setup_auto_sync(
        key,
        move || {
            let remote = remote.clone();
            async move { Ok(remote) }
        },
        Duration::from_secs(3600),
    );
}

#[tokio::test]
async fn test_reconnect_drains_queue_in_priority_order() {
    let h = harness(CoordinatorConfig::default(), None);
    let c = &h.coordinator;

    let status = c.connectivity_changed(false).await;
    assert_eq!(status.state, ConnectionState::Offline);
    assert!(!c.queue().is_online());

    c.queue_operation(DEFAULT_CHANNEL, post("/low"), Priority::Low).unwrap();
    c.queue_operation(DEFAULT_CHANNEL, post("/critical"), Priority::Critical).unwrap();
    c.queue_operation(DEFAULT_CHANNEL, post("/medium"), Priority::Medium).unwrap();
    c.queue_operation(DEFAULT_CHANNEL, post("/high"), Priority::High).unwrap();
    tokio::task::yield_now().await;
    assert!(h.executor.executed.lock().is_empty());

    let status = c.connectivity_changed(true).await;
    assert_eq!(status.state, ConnectionState::Online);
    assert_eq!(
        *h.executor.executed.lock(),
        vec!["/critical", "/high", "/medium", "/low"]
    );

    let events = h.events.lock().clone();
    assert_eq!(
        events,
        vec![
            "connection:offline",
            "operation:queued",
            "operation:queued",
            "operation:queued",
            "operation:queued",
            "connection:online",
            "sync:started",
            "operation:synced",
            "operation:synced",
            "operation:synced",
            "operation:synced",
            "sync:completed",
        ]
    );

    let metrics = c.metrics();
    assert_eq!(metrics.operations_queued, 4);
    assert_eq!(metrics.operations_synced, 4);
    assert_eq!(metrics.sync_successes, 1);
    assert_eq!(c.sync_status().progress, 100);
}

#[tokio::test]
async fn test_sync_now_fails_fast_offline() {
    let h = harness(CoordinatorConfig::default(), None);
    let c = &h.coordinator;
    c.connectivity_changed(false).await;
    c.queue_operation(DEFAULT_CHANNEL, post("/vote"), Priority::High).unwrap();

    assert!(matches!(c.sync_now().await, Err(Error::Offline)));
    assert!(h.executor.executed.lock().is_empty());
    assert_eq!(c.metrics().sync_attempts, 0);
}

#[tokio::test]
async fn test_sync_reports_operations_still_pending() {
    let h = harness(CoordinatorConfig::default(), None);
    let c = &h.coordinator;
    h.executor.failing.lock().push("/flaky".to_string());

    c.connectivity_changed(false).await;
    let id = c.queue_operation(DEFAULT_CHANNEL, post("/flaky"), Priority::High).unwrap();
    c.connectivity_changed(true).await;

    match c.sync_now().await {
        Err(Error::Sync {
            pending_operations,
            pending_conflicts,
        }) => {
            assert_eq!(pending_operations, vec![id.to_string()]);
            assert!(pending_conflicts.is_empty());
        }
        other => panic!("expected sync error, got {:?}", other),
    }
    assert!(h.events.lock().contains(&"sync:failed"));
    assert_eq!(c.sync_status().pending_operations, 1);
}

#[tokio::test]
async fn test_manual_conflicts_are_retained_until_resolved() {
    let h = harness(
        CoordinatorConfig::default().with_conflict_resolution(ConflictResolution::Manual),
        None,
    );
    let c = &h.coordinator;
    diverge(c, "profile", json!({"name": "local"}), json!({"name": "remote"}));

    let conflict_id = match c.sync_now().await {
        Err(Error::Sync {
            pending_conflicts, ..
        }) => {
            assert_eq!(pending_conflicts.len(), 1);
            pending_conflicts[0].clone()
        }
        other => panic!("expected pending conflict, got {:?}", other),
    };
    let conflicts = c.get_conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].key, "profile");
    assert_eq!(conflicts[0].local.value, json!({"name": "local"}));
    assert_eq!(c.cache().peek::<Value>("profile"), Some(json!({"name": "local"})));

    assert!(matches!(
        c.resolve_conflict("conflict_missing", ConflictResolution::Remote, None),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        c.resolve_conflict(&conflict_id, ConflictResolution::Manual, None),
        Err(Error::Operation(_))
    ));
    assert_eq!(c.get_conflicts().len(), 1);

    let resolved = c
        .resolve_conflict(&conflict_id, ConflictResolution::Remote, None)
        .unwrap();
    assert!(resolved.resolved);
    assert!(c.get_conflicts().is_empty());
    assert_eq!(c.cache().peek::<Value>("profile"), Some(json!({"name": "remote"})));
    assert!(!c.cache().entry("profile").unwrap().dirty);

    let events = h.events.lock().clone();
    assert!(events.contains(&"conflict:detected"));
    assert!(events.contains(&"conflict:resolved"));
    assert_eq!(c.metrics().conflicts_resolved, 1);

    // Nothing left to reconcile
    c.sync_now().await.unwrap();
}

#[tokio::test]
async fn test_manual_resolution_with_supplied_value() {
    let h = harness(
        CoordinatorConfig::default().with_conflict_resolution(ConflictResolution::Manual),
        None,
    );
    let c = &h.coordinator;
    diverge(c, "draft", json!("mine"), json!("theirs"));
    let _ = c.sync_now().await;

    let id = c.get_conflicts()[0].id.clone();
    c.resolve_conflict(&id, ConflictResolution::Manual, Some(json!("merged")))
        .unwrap();
    assert_eq!(c.cache().peek::<String>("draft").as_deref(), Some("merged"));
}

#[tokio::test]
async fn test_timestamp_policy_resolves_automatically() {
    let h = harness(CoordinatorConfig::default(), None);
    let c = &h.coordinator;
    diverge(
        c,
        "poll:42",
        json!({"votes": 10}),
        json!({"votes": 12, "updatedAt": "2999-01-01T00:00:00Z"}),
    );

    c.sync_now().await.unwrap();

    assert!(c.get_conflicts().is_empty());
    assert_eq!(
        c.cache().peek::<Value>("poll:42"),
        Some(json!({"votes": 12, "updatedAt": "2999-01-01T00:00:00Z"}))
    );
    let metrics = c.metrics();
    assert_eq!(metrics.conflicts_detected, 1);
    assert_eq!(metrics.conflicts_resolved, 1);
}

#[tokio::test]
async fn test_local_policy_keeps_local_write_pending() {
    let h = harness(
        CoordinatorConfig::default().with_conflict_resolution(ConflictResolution::Local),
        None,
    );
    let c = &h.coordinator;
    diverge(c, "settings", json!({"theme": "dark"}), json!({"theme": "light"}));

    c.sync_now().await.unwrap();

    let entry = c.cache().entry("settings").unwrap();
    assert_eq!(entry.value, json!({"theme": "dark"}));
    assert!(entry.dirty);
}

#[tokio::test]
async fn test_version_tie_goes_to_remote() {
    let h = harness(
        CoordinatorConfig::default().with_conflict_resolution(ConflictResolution::Version),
        None,
    );
    let c = &h.coordinator;
    diverge(
        c,
        "doc",
        json!({"body": "local", "version": 1}),
        json!({"body": "remote", "version": 1}),
    );

    c.sync_now().await.unwrap();

    assert_eq!(
        c.cache().peek::<Value>("doc"),
        Some(json!({"body": "remote", "version": 1}))
    );
    assert_eq!(c.metrics().timestamp_ties, 1);
}

#[tokio::test]
async fn test_version_policy_prefers_higher_remote_version() {
    let h = harness(
        CoordinatorConfig::default().with_conflict_resolution(ConflictResolution::Version),
        None,
    );
    let c = &h.coordinator;
    diverge(c, "doc", json!({"body": "local"}), json!({"body": "remote", "version": 7}));

    c.sync_now().await.unwrap();

    let entry = c.cache().entry("doc").unwrap();
    assert_eq!(entry.version, 7);
    assert!(!entry.dirty);
    assert_eq!(c.metrics().timestamp_ties, 0);
}

#[tokio::test]
async fn test_probe_failures_take_coordinator_offline() {
    let probe = Arc::new(ScriptedProbe {
        results: Mutex::new(
            vec![
                Err(Error::Network("refused".into())),
                Err(Error::Network("refused".into())),
                Err(Error::Network("refused".into())),
                Ok(Duration::from_millis(50)),
            ]
            .into(),
        ),
    });
    let h = harness(CoordinatorConfig::default(), Some(probe));
    let c = &h.coordinator;
    for name in components::ALL {
        c.health().register(name).await;
    }

    assert_eq!(c.check_connection().await.state, ConnectionState::Unstable);
    assert!(c.queue().is_online());
    c.check_connection().await;
    assert_eq!(c.check_connection().await.state, ConnectionState::Offline);
    assert!(!c.queue().is_online());
    assert_eq!(
        c.health().component(components::NETWORK).await.map(|h| h.status),
        Some(ComponentStatus::Degraded)
    );

    c.queue_operation(DEFAULT_CHANNEL, post("/queued-offline"), Priority::Medium)
        .unwrap();
    let status = c.check_connection().await;
    assert_eq!(status.state, ConnectionState::Online);
    assert_eq!(*h.executor.executed.lock(), vec!["/queued-offline"]);
    assert_eq!(
        c.health().component(components::NETWORK).await.map(|h| h.status),
        Some(ComponentStatus::Healthy)
    );

    let events = h.events.lock().clone();
    let connection: Vec<&str> = events
        .into_iter()
        .filter(|e| e.starts_with("connection:"))
        .collect();
    assert_eq!(
        connection,
        vec!["connection:unstable", "connection:offline", "connection:online"]
    );
}

#[tokio::test]
async fn test_queue_operation_nudges_processing_when_online() {
    let h = harness(CoordinatorConfig::default(), None);
    h.coordinator
        .queue_operation(DEFAULT_CHANNEL, post("/now"), Priority::High)
        .unwrap();

    for _ in 0..50 {
        if !h.executor.executed.lock().is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(*h.executor.executed.lock(), vec!["/now"]);
}

#[tokio::test]
async fn test_failed_operations_surface_in_events_and_health() {
    let h = harness(CoordinatorConfig::default(), None);
    let c = &h.coordinator;
    h.executor.failing.lock().push("/doomed".to_string());
    c.connectivity_changed(false).await;
    c.queue_operation(
        DEFAULT_CHANNEL,
        post("/doomed").with_max_retries(1),
        Priority::Low,
    )
    .unwrap();
    c.connectivity_changed(true).await;

    assert!(h.events.lock().contains(&"operation:failed"));
    assert_eq!(c.metrics().operations_failed, 1);
    assert_eq!(c.sync_status().failed_operations, 1);
    assert_eq!(
        c.health().component(components::QUEUE).await.map(|h| h.status),
        Some(ComponentStatus::Degraded)
    );
}

#[tokio::test(start_paused = true)]
async fn test_start_runs_background_sync_until_shutdown() {
    let attempts = Arc::new(AtomicU32::new(0));
    let h = harness(
        CoordinatorConfig::default().with_sync_interval(Duration::from_secs(30)),
        None,
    );
    let c = &h.coordinator;
    let counter = Arc::clone(&attempts);
    c.cache().setup_auto_sync(
        "feed",
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(json!(["item"])) }
        },
        Duration::from_secs(3600),
    );

    c.start().await;
    c.start().await;
    assert!(c.health().readiness().await.ready);
    assert!(c.sync_status().is_active);

    tokio::time::sleep(Duration::from_secs(65)).await;
    assert_eq!(c.metrics().sync_attempts, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    c.shutdown().await;
    assert!(!c.health().readiness().await.ready);
    assert!(!c.sync_status().is_active);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(c.metrics().sync_attempts, 2);
}
