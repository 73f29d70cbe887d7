//! A single priority-partitioned queue channel

use crate::models::{Operation, OperationId, Priority};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use serde::Serialize;
use std::collections::VecDeque;

/// Pending operations of one channel, FIFO within each priority tier
pub(crate) struct Channel {
    pub name: String,
    tiers: [VecDeque<Operation>; 4],
    pub paused: bool,
    pub max_bytes: usize,
    pub bytes: usize,
    /// An operation of this channel is executing
    pub processing: bool,
    pub completed: u64,
    pub failed: u64,
    pub breaker: CircuitBreaker,
}

impl Channel {
    pub fn new(name: &str, max_bytes: usize, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            tiers: Default::default(),
            paused: false,
            max_bytes,
            bytes: 0,
            processing: false,
            completed: 0,
            failed: 0,
            breaker: CircuitBreaker::new(name, breaker_config),
        }
    }

    pub fn has_room_for(&self, size: usize) -> bool {
        self.bytes + size <= self.max_bytes
    }

    pub fn push_back(&mut self, op: Operation) {
        self.bytes += op.size_bytes;
        self.tiers[op.priority.index()].push_back(op);
    }

    /// Retries go ahead of newer work in their tier
    pub fn push_front(&mut self, op: Operation) {
        self.bytes += op.size_bytes;
        self.tiers[op.priority.index()].push_front(op);
    }

    /// Highest-priority operation, oldest first
    pub fn pop_next(&mut self) -> Option<Operation> {
        let op = Priority::DESCENDING
            .iter()
            .find_map(|p| self.tiers[p.index()].pop_front())?;
        self.bytes = self.bytes.saturating_sub(op.size_bytes);
        Some(op)
    }

    pub fn remove(&mut self, id: &OperationId) -> Option<Operation> {
        for tier in self.tiers.iter_mut() {
            if let Some(pos) = tier.iter().position(|op| &op.id == id) {
                let op = tier.remove(pos)?;
                self.bytes = self.bytes.saturating_sub(op.size_bytes);
                return Some(op);
            }
        }
        None
    }

    pub fn get(&self, id: &OperationId) -> Option<&Operation> {
        self.tiers.iter().flatten().find(|op| &op.id == id)
    }

    /// Pending operations in execution order
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        Priority::DESCENDING
            .iter()
            .flat_map(move |p| self.tiers[p.index()].iter())
    }

    pub fn drain(&mut self) -> Vec<Operation> {
        self.bytes = 0;
        Priority::DESCENDING
            .iter()
            .flat_map(|p| std::mem::take(&mut self.tiers[p.index()]))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    /// Not paused, idle, holding work and admitted by the breaker
    pub fn is_ready(&self) -> bool {
        !self.paused && !self.processing && !self.is_empty() && self.breaker.allows_call()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            name: self.name.clone(),
            pending: self.len(),
            critical: self.tiers[Priority::Critical.index()].len(),
            high: self.tiers[Priority::High.index()].len(),
            medium: self.tiers[Priority::Medium.index()].len(),
            low: self.tiers[Priority::Low.index()].len(),
            processing: self.processing,
            paused: self.paused,
            bytes: self.bytes,
            max_bytes: self.max_bytes,
            completed: self.completed,
            failed: self.failed,
            circuit: self.breaker.state(),
        }
    }
}

/// Counters for one queue channel
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub pending: usize,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub processing: bool,
    pub paused: bool,
    pub bytes: usize,
    pub max_bytes: usize,
    pub completed: u64,
    pub failed: u64,
    pub circuit: CircuitState,
}
