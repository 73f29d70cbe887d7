//! Client-side resilience and synchronization engine
//!
//! This crate lets an application keep working against an unreliable
//! backend:
//! - Priority operation queue with retries and optimistic updates
//! - Versioned data cache with de-duplicated refreshes and conflict detection
//! - Offline coordination driven by connectivity monitoring
//! - Circuit breaking, retry with backoff and fallback data sources
//! - Health checks and observability

pub mod cache;
pub mod error;
pub mod events;
pub mod health;
pub mod models;
pub mod observability;
pub mod offline;
pub mod queue;
pub mod resilience;
pub mod storage;

pub use cache::{CacheConfig, CacheEntry, CacheStats, EvictionPolicy, SyncCache};
pub use error::{Error, Result};
pub use events::{EventBus, Subscription};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{EngineMetrics, StructuredLogger};
pub use offline::{
    Components, ConnectivityProbe, CoordinatorConfig, CoordinatorEvent, MonitorConfig,
    OfflineCoordinator, OfflineMetrics, SyncStatus,
};
pub use queue::{
    OperationExecutor, OperationUpdate, QueueManager, QueueManagerConfig, QueueStats,
    DEFAULT_CHANNEL,
};
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, FallbackManager, FallbackOptions,
    FallbackStrategy, RetryExecutor, RetryPolicy,
};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageTier, TieredStorage};
