//! Agent configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use sync_lib::{
    CacheConfig, CircuitBreakerConfig, ConflictResolution, CoordinatorConfig, EvictionPolicy,
    MonitorConfig, QueueManagerConfig,
};

/// Agent configuration, read from `SYNC_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name reported in structured logs
    #[serde(default = "default_instance")]
    pub instance: String,

    /// Port of the health/metrics server
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Base URL of the REST backend
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_queue_max_bytes")]
    pub queue_max_bytes: usize,

    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    #[serde(default = "default_degraded_latency_ms")]
    pub degraded_latency_ms: u64,

    #[serde(default = "default_offline_after_failures")]
    pub offline_after_failures: u32,

    /// Zero disables the periodic sync pass
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    #[serde(default = "default_eviction_policy")]
    pub eviction_policy: EvictionPolicy,

    #[serde(default = "default_conflict_resolution")]
    pub conflict_resolution: ConflictResolution,

    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    #[serde(default = "default_circuit_recovery_secs")]
    pub circuit_recovery_secs: u64,

    /// Directory of the durable storage tier; memory only when unset
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default = "default_storage_prefix")]
    pub storage_prefix: String,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "sync-agent".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_api_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_queue_max_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_probe_interval_secs() -> u64 {
    10
}

fn default_degraded_latency_ms() -> u64 {
    1_000
}

fn default_offline_after_failures() -> u32 {
    3
}

fn default_sync_interval_secs() -> u64 {
    30
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_max_entries() -> usize {
    1_000
}

fn default_eviction_policy() -> EvictionPolicy {
    EvictionPolicy::Lru
}

fn default_conflict_resolution() -> ConflictResolution {
    ConflictResolution::Timestamp
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_recovery_secs() -> u64 {
    60
}

fn default_storage_prefix() -> String {
    "sync_engine".to_string()
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("SYNC"))
            .build()
            .context("Failed to read SYNC_* environment")?;
        Self::from_config(config)
    }

    pub fn from_config(config: config::Config) -> Result<Self> {
        config
            .try_deserialize()
            .context("Invalid sync agent configuration")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_failure_threshold(self.circuit_failure_threshold)
            .with_recovery_timeout(Duration::from_secs(self.circuit_recovery_secs))
    }

    pub fn queue(&self) -> QueueManagerConfig {
        QueueManagerConfig::default()
            .with_tick_interval(Duration::from_millis(self.tick_interval_ms))
            .with_default_max_retries(self.max_retries)
            .with_default_timeout(self.request_timeout())
            .with_default_max_bytes(self.queue_max_bytes)
            .with_circuit_breaker(self.circuit_breaker())
    }

    pub fn cache(&self) -> CacheConfig {
        CacheConfig::default()
            .with_ttl(Duration::from_secs(self.cache_ttl_secs))
            .with_max_size(self.cache_max_entries)
            .with_eviction_policy(self.eviction_policy)
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig::default()
            .with_sync_interval(Duration::from_secs(self.sync_interval_secs))
            .with_conflict_resolution(self.conflict_resolution)
            .with_monitor(
                MonitorConfig::default()
                    .with_probe_interval(Duration::from_secs(self.probe_interval_secs))
                    .with_degraded_latency(Duration::from_millis(self.degraded_latency_ms))
                    .with_offline_after_failures(self.offline_after_failures),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_without_environment() {
        let config = AgentConfig::from_config(config::Config::builder().build().unwrap()).unwrap();

        assert_eq!(config.api_port, 8080);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.eviction_policy, EvictionPolicy::Lru);
        assert_eq!(config.conflict_resolution, ConflictResolution::Timestamp);
        assert!(config.data_dir.is_none());
        assert_eq!(config.queue().default_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides_map_onto_engine_configs() {
        let source = config::Config::builder()
            .set_override("api_port", 9100)
            .unwrap()
            .set_override("eviction_policy", "fifo")
            .unwrap()
            .set_override("conflict_resolution", "manual")
            .unwrap()
            .set_override("sync_interval_secs", 0)
            .unwrap()
            .set_override("offline_after_failures", 5)
            .unwrap()
            .build()
            .unwrap();
        let config = AgentConfig::from_config(source).unwrap();

        assert_eq!(config.api_port, 9100);
        assert_eq!(config.cache().eviction_policy, EvictionPolicy::Fifo);

        let coordinator = config.coordinator();
        assert_eq!(coordinator.conflict_resolution, ConflictResolution::Manual);
        assert!(coordinator.sync_interval.is_zero());
        assert_eq!(coordinator.monitor.offline_after_failures, 5);
    }
}
