//! Offline coordinator
//!
//! Ties the queue, the cache and the network monitor together: operations
//! are queued through it, connectivity transitions gate the queue, and every
//! return to online drains the queue and refreshes auto-sync keys.

use super::monitor::{ConnectivityProbe, MonitorConfig, NetworkMonitor, Transition};
use crate::cache::{ResolvedFrom, SyncCache};
use crate::error::{Error, Result};
use crate::events::{EventBus, Subscription};
use crate::health::{components, HealthRegistry};
use crate::models::{
    ConflictResolution, ConnectionState, DataConflict, NetworkStatus, Operation, OperationId,
    OperationRequest, OperationStatus, Priority,
};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::queue::{OperationUpdate, QueueManager};
use crate::resilience::{FallbackActivated, FallbackManager};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Period of the background sync pass; zero disables it
    pub sync_interval: Duration,
    /// Applied to detected conflicts; `Manual` keeps them for the application
    pub conflict_resolution: ConflictResolution,
    pub monitor: MonitorConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            conflict_resolution: ConflictResolution::Timestamp,
            monitor: MonitorConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_conflict_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.conflict_resolution = resolution;
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }
}

/// The services a coordinator drives
pub struct Components {
    pub queue: QueueManager,
    pub cache: SyncCache,
    pub fallback: FallbackManager,
    pub health: HealthRegistry,
    pub probe: Option<Arc<dyn ConnectivityProbe>>,
}

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    ConnectionOnline(NetworkStatus),
    ConnectionOffline(NetworkStatus),
    ConnectionUnstable(NetworkStatus),
    OperationQueued(Operation),
    OperationSynced(Operation),
    OperationFailed { operation: Operation, error: String },
    SyncStarted(SyncStatus),
    SyncCompleted(SyncStatus),
    SyncFailed { status: SyncStatus, error: String },
    ConflictDetected(DataConflict),
    ConflictResolved(DataConflict),
    FallbackActivated(FallbackActivated),
}

impl CoordinatorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CoordinatorEvent::ConnectionOnline(_) => "connection:online",
            CoordinatorEvent::ConnectionOffline(_) => "connection:offline",
            CoordinatorEvent::ConnectionUnstable(_) => "connection:unstable",
            CoordinatorEvent::OperationQueued(_) => "operation:queued",
            CoordinatorEvent::OperationSynced(_) => "operation:synced",
            CoordinatorEvent::OperationFailed { .. } => "operation:failed",
            CoordinatorEvent::SyncStarted(_) => "sync:started",
            CoordinatorEvent::SyncCompleted(_) => "sync:completed",
            CoordinatorEvent::SyncFailed { .. } => "sync:failed",
            CoordinatorEvent::ConflictDetected(_) => "conflict:detected",
            CoordinatorEvent::ConflictResolved(_) => "conflict:resolved",
            CoordinatorEvent::FallbackActivated(_) => "fallback:activated",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStatus {
    /// Background sync loop is running
    pub is_active: bool,
    pub in_progress: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub next_sync: Option<DateTime<Utc>>,
    pub pending_operations: usize,
    pub failed_operations: usize,
    pub conflicts: usize,
    /// Percentage of the current or last pass
    pub progress: u8,
}

/// Read-only counters kept by the coordinator
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OfflineMetrics {
    pub offline_time: Duration,
    pub operations_queued: u64,
    pub operations_synced: u64,
    pub operations_failed: u64,
    pub sync_attempts: u64,
    pub sync_successes: u64,
    pub sync_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub timestamp_ties: u64,
}

#[derive(Default)]
struct Counters {
    operations_queued: AtomicU64,
    operations_synced: AtomicU64,
    operations_failed: AtomicU64,
    sync_attempts: AtomicU64,
    sync_successes: AtomicU64,
    sync_failures: AtomicU64,
    conflicts_detected: AtomicU64,
    conflicts_resolved: AtomicU64,
    timestamp_ties: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct CoordinatorInner {
    config: CoordinatorConfig,
    queue: QueueManager,
    cache: SyncCache,
    fallback: FallbackManager,
    health: HealthRegistry,
    monitor: NetworkMonitor,
    events: EventBus<(), CoordinatorEvent>,
    conflicts: Mutex<Vec<DataConflict>>,
    sync_status: Mutex<SyncStatus>,
    sync_lock: tokio::sync::Mutex<()>,
    counters: Counters,
    metrics: EngineMetrics,
    logger: StructuredLogger,
    started: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    links: Mutex<Vec<Subscription>>,
}

impl Drop for CoordinatorInner {
    fn drop(&mut self) {
        for link in self.links.lock().drain(..) {
            link.unsubscribe();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Single entry point for application code. Clones share state.
#[derive(Clone)]
pub struct OfflineCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl OfflineCoordinator {
    pub fn new(config: CoordinatorConfig, parts: Components) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let monitor = NetworkMonitor::new(config.monitor.clone(), parts.probe);
        parts.queue.set_online(monitor.is_online());

        let inner = Arc::new(CoordinatorInner {
            config,
            queue: parts.queue,
            cache: parts.cache,
            fallback: parts.fallback,
            health: parts.health,
            monitor,
            events: EventBus::new(),
            conflicts: Mutex::new(Vec::new()),
            sync_status: Mutex::new(SyncStatus::default()),
            sync_lock: tokio::sync::Mutex::new(()),
            counters: Counters::default(),
            metrics: EngineMetrics::new(),
            logger: StructuredLogger::new("coordinator"),
            started: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
        });
        Self::link(&inner);
        Self { inner }
    }

    /// Forward queue, cache and fallback notifications into coordinator events
    fn link(inner: &Arc<CoordinatorInner>) {
        let weak = Arc::downgrade(inner);
        let operations = inner.queue.subscribe_all(move |update: &OperationUpdate| {
            if let Some(inner) = weak.upgrade() {
                inner.on_operation_update(update);
            }
        });

        let weak: Weak<CoordinatorInner> = Arc::downgrade(inner);
        let conflicts = inner.cache.subscribe_conflicts(move |conflict: &DataConflict| {
            if let Some(inner) = weak.upgrade() {
                inner.on_conflict(conflict.clone());
            }
        });

        let weak: Weak<CoordinatorInner> = Arc::downgrade(inner);
        let fallbacks = inner.fallback.subscribe(move |activated: &FallbackActivated| {
            if let Some(inner) = weak.upgrade() {
                inner.emit(CoordinatorEvent::FallbackActivated(activated.clone()));
            }
        });

        inner.links.lock().extend([operations, conflicts, fallbacks]);
    }

    pub fn queue(&self) -> &QueueManager {
        &self.inner.queue
    }

    pub fn cache(&self) -> &SyncCache {
        &self.inner.cache
    }

    pub fn fallback(&self) -> &FallbackManager {
        &self.inner.fallback
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.inner.health
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.inner.monitor.status()
    }

    pub fn is_online(&self) -> bool {
        self.inner.monitor.is_online()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&CoordinatorEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe((), callback)
    }

    /// Queue an operation, nudging the queue when online
    pub fn queue_operation(
        &self,
        channel: &str,
        request: OperationRequest,
        priority: Priority,
    ) -> Result<OperationId> {
        let id = self.inner.queue.enqueue(channel, request, priority)?;
        bump(&self.inner.counters.operations_queued);
        if let Some(op) = self.inner.queue.operation(&id) {
            self.inner.emit(CoordinatorEvent::OperationQueued(op));
        }

        if self.is_online() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let queue = self.inner.queue.clone();
                handle.spawn(async move {
                    queue.process_queue().await;
                });
            }
        }
        Ok(id)
    }

    /// Host connectivity event (the OS reporting the link up or down).
    ///
    /// Returning online drains the queue and resyncs before this resolves.
    pub async fn connectivity_changed(&self, online: bool) -> NetworkStatus {
        if let Some(transition) = self.inner.monitor.connectivity_changed(online) {
            self.apply_transition(transition).await;
        }
        self.network_status()
    }

    /// Probe the backend once and apply the result
    pub async fn check_connection(&self) -> NetworkStatus {
        if let Some(transition) = self.inner.monitor.check().await {
            self.apply_transition(transition).await;
        }
        self.network_status()
    }

    async fn apply_transition(&self, transition: Transition) {
        let inner = &self.inner;
        let status = transition.status.clone();
        inner.queue.set_online(status.is_online);
        inner.metrics.set_connection_state(transition.to);
        inner.logger.log_connection_change(
            transition.from,
            transition.to,
            status.latency.map(|l| l.as_millis() as u64),
        );

        match transition.to {
            ConnectionState::Online => {
                inner.health.set_healthy(components::NETWORK).await;
                inner.emit(CoordinatorEvent::ConnectionOnline(status));
            }
            ConnectionState::Unstable => {
                inner
                    .health
                    .set_degraded(components::NETWORK, "connection unstable")
                    .await;
                inner.emit(CoordinatorEvent::ConnectionUnstable(status));
            }
            ConnectionState::Reconnecting => {
                inner
                    .health
                    .set_degraded(components::NETWORK, "reconnecting")
                    .await;
            }
            ConnectionState::Offline => {
                inner.health.set_degraded(components::NETWORK, "offline").await;
                inner.emit(CoordinatorEvent::ConnectionOffline(status));
            }
        }

        if transition.is_reconnect() {
            info!(
                pending = inner.queue.pending_count(),
                "Connection restored, syncing"
            );
            if let Err(e) = self.sync_now().await {
                warn!(error = %e, "Sync after reconnect did not complete");
            }
        }
    }

    /// Drain queued operations, then refresh auto-sync cache keys.
    ///
    /// Fails with [`Error::Offline`] without doing anything while offline,
    /// and with [`Error::Sync`] when operations or conflicts remain.
    pub async fn sync_now(&self) -> Result<()> {
        if !self.is_online() {
            return Err(Error::Offline);
        }
        let _guard = self.inner.sync_lock.lock().await;
        let inner = &self.inner;
        let started = Instant::now();

        bump(&inner.counters.sync_attempts);
        let status = {
            let mut status = inner.sync_status.lock();
            status.in_progress = true;
            status.progress = 0;
            status.last_sync = Some(Utc::now());
            status.clone()
        };
        inner.emit(CoordinatorEvent::SyncStarted(status));

        let drained = inner.queue.process_queue().await;
        inner.sync_status.lock().progress = 50;

        let refreshed_keys = inner.cache.auto_sync_keys().len();
        let cache_failures: Vec<(String, Error)> = inner
            .cache
            .resync_all()
            .await
            .into_iter()
            .filter(|(_, e)| !matches!(e, Error::Conflict { .. }))
            .collect();
        for (key, e) in &cache_failures {
            warn!(key = %key, error = %e, "Cache key failed to resync");
        }

        let pending_operations: Vec<String> = inner
            .queue
            .pending_operations()
            .iter()
            .map(|op| op.id.to_string())
            .collect();
        let pending_conflicts: Vec<String> =
            inner.conflicts.lock().iter().map(|c| c.id.clone()).collect();

        let outcome = if !pending_operations.is_empty() || !pending_conflicts.is_empty() {
            Err(Error::Sync {
                pending_operations,
                pending_conflicts,
            })
        } else if let Some((_, e)) = cache_failures.into_iter().next() {
            Err(e)
        } else {
            Ok(())
        };

        let status = {
            let mut status = inner.sync_status.lock();
            status.in_progress = false;
            status.progress = if outcome.is_ok() { 100 } else { status.progress };
            if let Ok(next) = chrono::Duration::from_std(inner.config.sync_interval) {
                status.next_sync = Some(Utc::now() + next);
            }
            status.clone()
        };
        let status = self.fill_counts(status);
        *inner.sync_status.lock() = status.clone();

        inner.logger.log_sync_cycle(
            drained.synced,
            refreshed_keys,
            started.elapsed().as_millis() as u64,
            outcome.is_ok(),
        );
        match &outcome {
            Ok(()) => {
                bump(&inner.counters.sync_successes);
                inner.emit(CoordinatorEvent::SyncCompleted(status));
            }
            Err(e) => {
                bump(&inner.counters.sync_failures);
                inner.emit(CoordinatorEvent::SyncFailed {
                    status,
                    error: e.to_string(),
                });
            }
        }
        self.refresh_health().await;
        outcome
    }

    /// Unresolved conflicts, oldest first
    pub fn get_conflicts(&self) -> Vec<DataConflict> {
        self.inner.conflicts.lock().clone()
    }

    /// Settle a retained conflict, updating the cache and dropping the record.
    ///
    /// `Manual` needs `data`, the value to keep.
    pub fn resolve_conflict(
        &self,
        id: &str,
        resolution: ConflictResolution,
        data: Option<Value>,
    ) -> Result<DataConflict> {
        let conflict = self
            .inner
            .conflicts
            .lock()
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("conflict {}", id)))?;

        let resolved = self.inner.apply_resolution(conflict, resolution, data)?;
        self.inner.conflicts.lock().retain(|c| c.id != id);
        Ok(resolved)
    }

    pub fn sync_status(&self) -> SyncStatus {
        let status = self.inner.sync_status.lock().clone();
        self.fill_counts(status)
    }

    fn fill_counts(&self, mut status: SyncStatus) -> SyncStatus {
        status.pending_operations = self.inner.queue.pending_count();
        status.failed_operations = self.inner.queue.failed_operations().len();
        status.conflicts = self.inner.conflicts.lock().len();
        status
    }

    pub fn metrics(&self) -> OfflineMetrics {
        let counters = &self.inner.counters;
        let cache = self.inner.cache.stats();
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        OfflineMetrics {
            offline_time: self.inner.monitor.total_downtime(),
            operations_queued: load(&counters.operations_queued),
            operations_synced: load(&counters.operations_synced),
            operations_failed: load(&counters.operations_failed),
            sync_attempts: load(&counters.sync_attempts),
            sync_successes: load(&counters.sync_successes),
            sync_failures: load(&counters.sync_failures),
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            conflicts_detected: load(&counters.conflicts_detected),
            conflicts_resolved: load(&counters.conflicts_resolved),
            timestamp_ties: load(&counters.timestamp_ties),
        }
    }

    /// Recompute queue and circuit health from current state
    pub async fn refresh_health(&self) {
        let health = &self.inner.health;
        let open = self.inner.queue.open_circuits();
        if open.is_empty() {
            health.set_healthy(components::CIRCUIT).await;
        } else {
            health
                .set_degraded(components::CIRCUIT, format!("open: {}", open.join(", ")))
                .await;
        }

        let failed = self.inner.queue.failed_operations().len();
        if failed == 0 {
            health.set_healthy(components::QUEUE).await;
        } else {
            health
                .set_degraded(
                    components::QUEUE,
                    format!("{} failed operation(s) awaiting retry or discard", failed),
                )
                .await;
        }
    }

    /// Spawn the monitor, scheduler, cache cleanup and periodic sync tasks
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = &self.inner;
        for name in components::ALL {
            inner.health.register(name).await;
        }
        if !self.is_online() {
            inner.health.set_degraded(components::NETWORK, "offline").await;
        }
        inner.metrics.set_connection_state(self.network_status().state);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            inner.queue.clone().run(inner.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            inner.cache.clone().run_cleanup(inner.shutdown_tx.subscribe()),
        ));
        if inner.monitor.has_probe() {
            tasks.push(tokio::spawn(
                self.clone().run_monitor(inner.shutdown_tx.subscribe()),
            ));
        }
        if !inner.config.sync_interval.is_zero() {
            inner.sync_status.lock().is_active = true;
            tasks.push(tokio::spawn(
                self.clone().run_sync_loop(inner.shutdown_tx.subscribe()),
            ));
        }
        inner.tasks.lock().extend(tasks);

        inner.health.set_ready(true).await;
        inner.logger.log_startup(env!("CARGO_PKG_VERSION"));
    }

    /// Stop every background task and wait for them to finish
    pub async fn shutdown(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let inner = &self.inner;
        inner.logger.log_shutdown("shutdown requested");
        inner.health.set_ready(false).await;
        let _ = inner.shutdown_tx.send(());

        let tasks: Vec<JoinHandle<()>> = inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        inner.fallback.stop_all_polling();
        inner.sync_status.lock().is_active = false;
    }

    async fn run_monitor(self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.inner.monitor.config().probe_interval;
        let mut ticker = interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = period.as_secs(),
            "Starting connectivity monitor"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_connection().await;
                }
                _ = shutdown.recv() => {
                    info!("Connectivity monitor received shutdown signal");
                    break;
                }
            }
        }
    }

    async fn run_sync_loop(self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.inner.config.sync_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = period.as_secs(), "Starting periodic sync");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_online() {
                        if let Err(e) = self.sync_now().await {
                            debug!(error = %e, "Periodic sync incomplete");
                        }
                    } else {
                        self.refresh_health().await;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Periodic sync received shutdown signal");
                    break;
                }
            }
        }
    }
}

impl CoordinatorInner {
    fn emit(&self, event: CoordinatorEvent) {
        debug!(event = event.name(), "Coordinator event");
        self.events.publish(&(), &event);
    }

    fn on_operation_update(&self, update: &OperationUpdate) {
        match update.operation.status {
            OperationStatus::Synced => {
                bump(&self.counters.operations_synced);
                self.emit(CoordinatorEvent::OperationSynced(update.operation.clone()));
            }
            OperationStatus::Failed => {
                bump(&self.counters.operations_failed);
                let error = update
                    .error
                    .as_ref()
                    .map(ToString::to_string)
                    .or_else(|| update.operation.last_error.clone())
                    .unwrap_or_default();
                self.emit(CoordinatorEvent::OperationFailed {
                    operation: update.operation.clone(),
                    error,
                });
            }
            _ => {}
        }
    }

    fn on_conflict(&self, mut conflict: DataConflict) {
        bump(&self.counters.conflicts_detected);
        let policy = self.config.conflict_resolution;
        conflict.resolution = policy;
        self.logger
            .log_conflict_detected(&conflict.id, &conflict.key, &policy.to_string());
        self.emit(CoordinatorEvent::ConflictDetected(conflict.clone()));

        if policy == ConflictResolution::Manual {
            let mut conflicts = self.conflicts.lock();
            // A newer divergence on the same key supersedes the old record
            conflicts.retain(|c| c.key != conflict.key);
            conflicts.push(conflict);
            return;
        }

        let id = conflict.id.clone();
        if let Err(e) = self.apply_resolution(conflict, policy, None) {
            warn!(conflict_id = %id, error = %e, "Automatic conflict resolution failed");
        }
    }

    fn apply_resolution(
        &self,
        mut conflict: DataConflict,
        resolution: ConflictResolution,
        data: Option<Value>,
    ) -> Result<DataConflict> {
        let key = conflict.key.clone();
        let local = conflict.local.value.clone();
        let remote = conflict.remote.value.clone();

        match resolution {
            ConflictResolution::Local => {
                self.cache.set_local(&key, &local)?;
            }
            ConflictResolution::Remote => {
                self.cache.set(&key, &remote, None)?;
            }
            ConflictResolution::Timestamp => {
                let outcome = self
                    .cache
                    .resolution_for(&key, &conflict.local, &conflict.remote);
                if outcome.tie {
                    bump(&self.counters.timestamp_ties);
                }
                match outcome.from {
                    ResolvedFrom::Remote => self.cache.set(&key, &outcome.value, None)?,
                    ResolvedFrom::Local | ResolvedFrom::Resolver => {
                        self.cache.set_local(&key, &outcome.value)?
                    }
                };
            }
            ConflictResolution::Version => {
                let remote_version = remote.get("version").and_then(Value::as_u64).unwrap_or(0);
                if remote_version > conflict.local_version {
                    self.cache.set(&key, &remote, Some(remote_version))?;
                } else if remote_version < conflict.local_version {
                    self.cache.set_local(&key, &local)?;
                } else {
                    bump(&self.counters.timestamp_ties);
                    self.metrics.inc_timestamp_ties();
                    debug!(key = %key, version = remote_version, "Conflict versions tied, keeping remote");
                    self.cache.set(&key, &remote, None)?;
                }
            }
            ConflictResolution::Manual => {
                let value = data.ok_or_else(|| {
                    Error::Operation(format!(
                        "manual resolution of conflict {} requires a value",
                        conflict.id
                    ))
                })?;
                self.cache.set(&key, &value, None)?;
            }
        }

        conflict.resolution = resolution;
        conflict.resolved = true;
        bump(&self.counters.conflicts_resolved);
        self.metrics.inc_conflicts_resolved();
        info!(
            conflict_id = %conflict.id,
            key = %key,
            resolution = %resolution,
            "Conflict resolved"
        );
        self.emit(CoordinatorEvent::ConflictResolved(conflict.clone()));
        Ok(conflict)
    }
}
