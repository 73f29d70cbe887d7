//! Priority operation queue with retries, circuit breaking and optimistic updates
//!
//! Operations are grouped into named channels. Within a channel they run one
//! at a time in strict priority order (critical, high, medium, low), FIFO
//! within a tier. Different channels run concurrently.
//!
//! An operation lives in exactly one place at a time: its channel, the
//! active set while executing, or the terminal history / failure log.

mod channel;
mod executor;
mod optimistic;


pub use channel::QueueStats;
pub use executor::{OperationExecutor, RoutingExecutor, TransactionClient, TransactionExecutor};
pub use optimistic::OptimisticUpdates;

use crate::error::{Error, Result};
use crate::events::{EventBus, Subscription};
use crate::models::{Operation, OperationId, OperationRequest, OperationStatus, Priority};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::resilience::{execute_with_retry, with_timeout, CircuitBreakerConfig, RetryPolicy};
use channel::Channel;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Name of the channel used when callers do not pick one
pub const DEFAULT_CHANNEL: &str = "default";

#[derive(Debug, Clone)]
pub struct QueueManagerConfig {
    pub tick_interval: Duration,
    /// Attempts allowed when a request does not set its own
    pub default_max_retries: u32,
    /// Per-attempt deadline when a request does not set its own
    pub default_timeout: Duration,
    /// Byte budget of channels created on demand
    pub default_max_bytes: usize,
    pub failure_log_capacity: usize,
    pub history_capacity: usize,
    /// Inner retries of transport errors within one attempt
    pub transport_retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            default_max_retries: 3,
            default_timeout: Duration::from_secs(30),
            default_max_bytes: 5 * 1024 * 1024,
            failure_log_capacity: 100,
            history_capacity: 500,
            transport_retry: RetryPolicy::transport(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl QueueManagerConfig {
    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }

    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries.max(1);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_default_max_bytes(mut self, bytes: usize) -> Self {
        self.default_max_bytes = bytes;
        self
    }

    pub fn with_failure_log_capacity(mut self, capacity: usize) -> Self {
        self.failure_log_capacity = capacity;
        self
    }

    pub fn with_transport_retry(mut self, policy: RetryPolicy) -> Self {
        self.transport_retry = policy;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }
}

/// Status change pushed to operation subscribers
#[derive(Debug, Clone)]
pub struct OperationUpdate {
    pub operation: Operation,
    /// Set on terminal failure
    pub error: Option<Error>,
    /// Backend response on success
    pub result: Option<Value>,
}

/// Outcome of a [`QueueManager::process_queue`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub synced: usize,
    pub failed: usize,
    pub requeued: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Synced,
    Failed,
    Requeued,
}

struct ManagerState {
    channels: HashMap<String, Channel>,
    active: HashMap<OperationId, Operation>,
    failed: VecDeque<Operation>,
    history: VecDeque<Operation>,
}

struct ManagerInner {
    config: QueueManagerConfig,
    executor: Arc<dyn OperationExecutor>,
    state: Mutex<ManagerState>,
    online: AtomicBool,
    updates: EventBus<OperationId, OperationUpdate>,
    all_updates: EventBus<(), OperationUpdate>,
    optimistic: OptimisticUpdates,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

/// Schedules and executes queued operations. Clones share state.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<ManagerInner>,
}

impl QueueManager {
    pub fn new(config: QueueManagerConfig, executor: Arc<dyn OperationExecutor>) -> Self {
        let mut channels = HashMap::new();
        channels.insert(
            DEFAULT_CHANNEL.to_string(),
            Channel::new(
                DEFAULT_CHANNEL,
                config.default_max_bytes,
                config.circuit_breaker.clone(),
            ),
        );

        Self {
            inner: Arc::new(ManagerInner {
                config,
                executor,
                state: Mutex::new(ManagerState {
                    channels,
                    active: HashMap::new(),
                    failed: VecDeque::new(),
                    history: VecDeque::new(),
                }),
                online: AtomicBool::new(true),
                updates: EventBus::new(),
                all_updates: EventBus::new(),
                optimistic: OptimisticUpdates::new(),
                metrics: EngineMetrics::new(),
                logger: StructuredLogger::new("queue"),
            }),
        }
    }

    pub fn config(&self) -> &QueueManagerConfig {
        &self.inner.config
    }

    /// Queue `request` on `channel` and return its id without waiting.
    ///
    /// The channel is created on first use.
    pub fn enqueue(
        &self,
        channel: &str,
        request: OperationRequest,
        priority: Priority,
    ) -> Result<OperationId> {
        let op = Operation::from_request(
            channel,
            request,
            priority,
            self.inner.config.default_max_retries,
        );
        let id = op.id.clone();

        let depth = {
            let mut state = self.inner.state.lock();
            let queue = self.inner.channel_mut(&mut state, channel);
            if !queue.has_room_for(op.size_bytes) {
                return Err(Error::QueueFull {
                    channel: channel.to_string(),
                    current_bytes: queue.bytes,
                    max_bytes: queue.max_bytes,
                });
            }
            queue.push_back(op);
            queue.len()
        };

        self.inner.metrics.inc_operations_queued();
        self.inner.metrics.set_queue_depth(channel, depth);
        debug!(operation_id = %id, channel = %channel, priority = %priority, "Operation queued");
        Ok(id)
    }

    pub fn status(&self, id: &OperationId) -> Option<OperationStatus> {
        self.operation(id).map(|op| op.status)
    }

    /// Snapshot of an operation wherever it currently lives
    pub fn operation(&self, id: &OperationId) -> Option<Operation> {
        let state = self.inner.state.lock();
        state
            .active
            .get(id)
            .or_else(|| state.channels.values().find_map(|c| c.get(id)))
            .or_else(|| state.failed.iter().find(|op| &op.id == id))
            .or_else(|| state.history.iter().rev().find(|op| &op.id == id))
            .cloned()
    }

    /// Watch status transitions of one operation.
    ///
    /// Callbacks see each `Syncing` attempt and the terminal outcome. An
    /// operation put back to `Pending` for another attempt, or because its
    /// channel's circuit was open, is not published; the retry shows up as
    /// the next `Syncing` update with a higher `retry_count`.
    pub fn subscribe<F>(&self, id: &OperationId, callback: F) -> Subscription
    where
        F: Fn(&OperationUpdate) + Send + Sync + 'static,
    {
        self.inner.updates.subscribe(id.clone(), callback)
    }

    /// Watch status transitions of every operation, with the same
    /// publishing rules as [`subscribe`](Self::subscribe)
    pub fn subscribe_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&OperationUpdate) + Send + Sync + 'static,
    {
        self.inner.all_updates.subscribe((), callback)
    }

    /// Remove a pending operation. Executing or finished operations are left alone.
    pub fn cancel(&self, id: &OperationId) -> bool {
        let cancelled = {
            let mut state = self.inner.state.lock();
            let removed = state.channels.values_mut().find_map(|c| c.remove(id));
            match removed {
                Some(mut op) => {
                    op.set_status(OperationStatus::Cancelled);
                    self.inner.push_history(&mut state, op.clone());
                    op
                }
                None => return false,
            }
        };

        info!(operation_id = %id, channel = %cancelled.channel, "Operation cancelled");
        if let Some(update_id) = &cancelled.optimistic_id {
            self.inner.optimistic.rollback(update_id);
        }
        self.inner.refresh_depth(&cancelled.channel);
        self.inner.notify(OperationUpdate {
            operation: cancelled,
            error: None,
            result: None,
        });
        true
    }

    /// Register an optimistic update that an operation can be linked to
    pub fn create_optimistic_update<T, R, C>(
        &self,
        id: &str,
        original: T,
        optimistic: T,
        rollback: R,
        commit: C,
    ) where
        T: Send + 'static,
        R: FnOnce(T) + Send + 'static,
        C: FnOnce(T) -> Result<()> + Send + 'static,
    {
        self.inner
            .optimistic
            .create(id, original, optimistic, rollback, commit);
    }

    pub fn commit_optimistic_update(&self, id: &str) -> Result<bool> {
        self.inner.optimistic.commit(id)
    }

    pub fn rollback_optimistic_update(&self, id: &str) -> bool {
        self.inner.optimistic.rollback(id)
    }

    pub fn optimistic_updates(&self) -> &OptimisticUpdates {
        &self.inner.optimistic
    }

    /// Gate execution on connectivity. Operations stay queued while offline.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Create a channel with its own byte budget. Returns false if it exists.
    pub fn create_queue(&self, name: &str, max_bytes: usize) -> bool {
        let mut state = self.inner.state.lock();
        if state.channels.contains_key(name) {
            return false;
        }
        state.channels.insert(
            name.to_string(),
            Channel::new(name, max_bytes, self.inner.config.circuit_breaker.clone()),
        );
        true
    }

    pub fn pause_queue(&self, name: &str) -> bool {
        self.set_paused(name, true)
    }

    pub fn resume_queue(&self, name: &str) -> bool {
        self.set_paused(name, false)
    }

    fn set_paused(&self, name: &str, paused: bool) -> bool {
        let mut state = self.inner.state.lock();
        match state.channels.get_mut(name) {
            Some(channel) => {
                channel.paused = paused;
                info!(channel = %name, paused = paused, "Queue pause state changed");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending operation of a channel, returning how many
    pub fn clear_queue(&self, name: &str) -> usize {
        let drained = {
            let mut state = self.inner.state.lock();
            let Some(channel) = state.channels.get_mut(name) else {
                return 0;
            };
            let mut drained = channel.drain();
            for op in drained.iter_mut() {
                op.set_status(OperationStatus::Cancelled);
            }
            for op in &drained {
                self.inner.push_history(&mut state, op.clone());
            }
            drained
        };

        let count = drained.len();
        self.inner.refresh_depth(name);
        for op in drained {
            if let Some(update_id) = &op.optimistic_id {
                self.inner.optimistic.rollback(update_id);
            }
            self.inner.notify(OperationUpdate {
                operation: op,
                error: None,
                result: None,
            });
        }
        count
    }

    pub fn queue_stats(&self, name: &str) -> Option<QueueStats> {
        self.inner.state.lock().channels.get(name).map(Channel::stats)
    }

    pub fn all_queue_stats(&self) -> Vec<QueueStats> {
        let mut stats: Vec<QueueStats> = self
            .inner
            .state
            .lock()
            .channels
            .values()
            .map(Channel::stats)
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Pending, executing and permanently failed operations
    pub fn queued_operations(&self) -> Vec<Operation> {
        let state = self.inner.state.lock();
        let mut names: Vec<&String> = state.channels.keys().collect();
        names.sort();

        let mut ops: Vec<Operation> = names
            .into_iter()
            .filter_map(|name| state.channels.get(name))
            .flat_map(|c| c.iter().cloned())
            .collect();
        ops.extend(state.active.values().cloned());
        ops.extend(state.failed.iter().cloned());
        ops
    }

    pub fn pending_operations(&self) -> Vec<Operation> {
        self.queued_operations()
            .into_iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.channels.values().map(Channel::len).sum::<usize>() + state.active.len()
    }

    pub fn failed_operations(&self) -> Vec<Operation> {
        self.inner.state.lock().failed.iter().cloned().collect()
    }

    /// Move a failed operation back into its channel with a fresh retry budget
    pub fn retry_failed(&self, id: &OperationId) -> Result<OperationId> {
        let channel = {
            let mut state = self.inner.state.lock();
            let pos = state
                .failed
                .iter()
                .position(|op| &op.id == id)
                .ok_or_else(|| Error::NotFound(format!("failed operation {}", id)))?;
            let Some(mut op) = state.failed.remove(pos) else {
                return Err(Error::NotFound(format!("failed operation {}", id)));
            };
            op.retry_count = 0;
            op.last_error = None;
            op.set_status(OperationStatus::Pending);
            let channel = op.channel.clone();
            self.inner.channel_mut(&mut state, &channel).push_back(op);
            channel
        };
        info!(operation_id = %id, channel = %channel, "Failed operation requeued manually");
        self.inner.refresh_depth(&channel);
        Ok(id.clone())
    }

    pub fn discard_failed(&self, id: &OperationId) -> bool {
        let mut state = self.inner.state.lock();
        match state.failed.iter().position(|op| &op.id == id) {
            Some(pos) => state.failed.remove(pos).is_some(),
            None => false,
        }
    }

    /// Channels whose circuit breaker is currently open
    pub fn open_circuits(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut names: Vec<String> = state
            .channels
            .values()
            .filter(|c| c.breaker.is_open())
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Run one operation from every ready channel
    pub async fn tick(&self) -> ProcessSummary {
        if !self.is_online() {
            return ProcessSummary::default();
        }
        let claimed = self.inner.claim_from_ready_channels();
        let outcomes = join_all(claimed.into_iter().map(|op| self.inner.execute(op))).await;

        let mut summary = ProcessSummary::default();
        for outcome in outcomes {
            summary.record(outcome);
        }
        summary
    }

    /// Drain every channel now.
    ///
    /// Channels run concurrently; each stops after its first unsuccessful
    /// attempt so a failing operation waits for the scheduler's next tick.
    pub async fn process_queue(&self) -> ProcessSummary {
        if !self.is_online() {
            return ProcessSummary::default();
        }

        let names: Vec<String> = self.inner.state.lock().channels.keys().cloned().collect();
        let drains = names.iter().map(|name| self.drain_channel(name));
        let mut summary = ProcessSummary::default();
        for partial in join_all(drains).await {
            summary.synced += partial.synced;
            summary.failed += partial.failed;
            summary.requeued += partial.requeued;
        }
        summary
    }

    async fn drain_channel(&self, name: &str) -> ProcessSummary {
        let mut summary = ProcessSummary::default();
        while self.is_online() {
            let Some(op) = self.inner.claim_from(name) else {
                break;
            };
            let outcome = self.inner.execute(op).await;
            summary.record(outcome);
            if outcome != AttemptOutcome::Synced {
                break;
            }
        }
        summary
    }

    /// Scheduler loop, ticking until shutdown
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.inner.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_ms = self.inner.config.tick_interval.as_millis() as u64,
            "Starting queue scheduler"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.tick().await;
                    if summary != ProcessSummary::default() {
                        debug!(
                            synced = summary.synced,
                            failed = summary.failed,
                            requeued = summary.requeued,
                            "Scheduler tick processed operations"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    info!("Queue scheduler received shutdown signal");
                    break;
                }
            }
        }
    }
}

impl ProcessSummary {
    fn record(&mut self, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Synced => self.synced += 1,
            AttemptOutcome::Failed => self.failed += 1,
            AttemptOutcome::Requeued => self.requeued += 1,
        }
    }
}

impl ManagerInner {
    fn channel_mut<'a>(&self, state: &'a mut ManagerState, name: &str) -> &'a mut Channel {
        state.channels.entry(name.to_string()).or_insert_with(|| {
            Channel::new(
                name,
                self.config.default_max_bytes,
                self.config.circuit_breaker.clone(),
            )
        })
    }

    /// Move the next operation of `channel` into the active set
    fn claim(state: &mut ManagerState, name: &str) -> Option<Operation> {
        let channel = state.channels.get_mut(name)?;
        if !channel.is_ready() {
            return None;
        }
        let mut op = channel.pop_next()?;
        channel.processing = true;
        op.set_status(OperationStatus::Syncing);
        state.active.insert(op.id.clone(), op.clone());
        Some(op)
    }

    fn claim_from(&self, name: &str) -> Option<Operation> {
        let mut state = self.state.lock();
        Self::claim(&mut state, name)
    }

    fn claim_from_ready_channels(&self) -> Vec<Operation> {
        let mut state = self.state.lock();
        let mut names: Vec<String> = state
            .channels
            .values()
            .filter(|c| c.is_ready())
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
            .iter()
            .filter_map(|name| Self::claim(&mut state, name))
            .collect()
    }

    async fn execute(&self, op: Operation) -> AttemptOutcome {
        self.notify(OperationUpdate {
            operation: op.clone(),
            error: None,
            result: None,
        });

        let breaker = {
            let state = self.state.lock();
            state.channels.get(&op.channel).map(|c| c.breaker.clone())
        };
        let timeout = op.timeout.unwrap_or(self.config.default_timeout);
        let started = Instant::now();

        let attempt = || {
            execute_with_retry(&self.config.transport_retry, || {
                with_timeout(timeout, self.executor.execute(&op))
            })
        };
        let result = match breaker {
            Some(breaker) => breaker.execute(attempt).await,
            None => attempt().await,
        };
        self.metrics
            .observe_operation_latency(started.elapsed().as_secs_f64());

        match result {
            Ok(value) => self.complete(op, value),
            Err(Error::CircuitOpen { name, retry_after }) => {
                self.metrics.inc_circuit_open_rejections();
                debug!(
                    operation_id = %op.id,
                    breaker = %name,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Circuit open, operation returned to queue"
                );
                self.requeue(op, None);
                AttemptOutcome::Requeued
            }
            Err(e) => self.fail_attempt(op, e),
        }
    }

    fn complete(&self, mut op: Operation, value: Value) -> AttemptOutcome {
        op.set_status(OperationStatus::Synced);
        op.last_error = None;
        {
            let mut state = self.state.lock();
            state.active.remove(&op.id);
            if let Some(channel) = state.channels.get_mut(&op.channel) {
                channel.processing = false;
                channel.completed += 1;
            }
            self.push_history(&mut state, op.clone());
        }

        self.metrics.inc_operations_synced();
        self.refresh_depth(&op.channel);
        info!(operation_id = %op.id, channel = %op.channel, "Operation synced");

        if let Some(update_id) = &op.optimistic_id {
            if let Err(e) = self.optimistic.commit(update_id) {
                warn!(operation_id = %op.id, error = %e, "Optimistic commit failed after sync");
            }
        }
        self.notify(OperationUpdate {
            operation: op,
            error: None,
            result: Some(value),
        });
        AttemptOutcome::Synced
    }

    fn fail_attempt(&self, mut op: Operation, error: Error) -> AttemptOutcome {
        op.retry_count += 1;
        op.last_error = Some(error.to_string());

        if op.retry_count < op.max_retries {
            warn!(
                operation_id = %op.id,
                channel = %op.channel,
                attempt = op.retry_count,
                max_retries = op.max_retries,
                error = %error,
                "Operation attempt failed, will retry"
            );
            self.metrics.inc_operations_retried();
            self.requeue(op, Some(error));
            return AttemptOutcome::Requeued;
        }

        op.set_status(OperationStatus::Failed);
        let exhausted = Error::OperationExhausted {
            operation_id: op.id.to_string(),
            attempts: op.retry_count,
            last_error: error.to_string(),
        };
        {
            let mut state = self.state.lock();
            state.active.remove(&op.id);
            if let Some(channel) = state.channels.get_mut(&op.channel) {
                channel.processing = false;
                channel.failed += 1;
            }
            state.failed.push_back(op.clone());
            while state.failed.len() > self.config.failure_log_capacity {
                state.failed.pop_front();
            }
        }

        self.metrics.inc_operations_failed();
        self.refresh_depth(&op.channel);
        self.logger.log_operation_exhausted(
            op.id.as_str(),
            &op.channel,
            op.retry_count,
            &error.to_string(),
        );
        if let Some(update_id) = &op.optimistic_id {
            self.optimistic.rollback(update_id);
        }
        self.notify(OperationUpdate {
            operation: op,
            error: Some(exhausted),
            result: None,
        });
        AttemptOutcome::Failed
    }

    /// Put an operation back at the front of its tier
    fn requeue(&self, mut op: Operation, error: Option<Error>) {
        op.set_status(OperationStatus::Pending);
        if let Some(error) = error {
            op.last_error = Some(error.to_string());
        }
        let mut state = self.state.lock();
        state.active.remove(&op.id);
        let channel = self.channel_mut(&mut state, &op.channel.clone());
        channel.processing = false;
        channel.push_front(op);
    }

    fn push_history(&self, state: &mut ManagerState, op: Operation) {
        state.history.push_back(op);
        while state.history.len() > self.config.history_capacity {
            state.history.pop_front();
        }
    }

    fn refresh_depth(&self, channel: &str) {
        let depth = self
            .state
            .lock()
            .channels
            .get(channel)
            .map(Channel::len)
            .unwrap_or(0);
        self.metrics.set_queue_depth(channel, depth);
    }

    fn notify(&self, update: OperationUpdate) {
        self.updates.publish(&update.operation.id, &update);
        self.all_updates.publish(&(), &update);
    }
}
