//! Sync agent - hosts the offline sync engine
//!
//! Queues operations against the REST backend, keeps the data cache in sync
//! and serves health, status and metrics endpoints.

use anyhow::{Context, Result};
use std::sync::Arc;
use sync_agent::{
    api,
    config::AgentConfig,
    transport::{HttpExecutor, HttpProbe},
};
use sync_lib::{
    queue::RoutingExecutor,
    resilience::FallbackConfig,
    Components, FallbackManager, FileStore, HealthRegistry, KeyValueStore, MemoryStore,
    OfflineCoordinator, QueueManager, SyncCache, TieredStorage,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = AgentConfig::load()?;
    info!(
        instance = %config.instance,
        backend = %config.api_base_url,
        "Starting sync-agent"
    );

    let mut tiers: Vec<Arc<dyn KeyValueStore>> = vec![Arc::new(MemoryStore::session())];
    if let Some(dir) = &config.data_dir {
        let store = FileStore::new(dir)
            .with_context(|| format!("Failed to open data directory {}", dir.display()))?;
        tiers.push(Arc::new(store));
    }
    let storage = Arc::new(TieredStorage::new(config.storage_prefix.clone(), tiers));

    let http = HttpExecutor::new(&config.api_base_url, config.request_timeout())?;
    let executor = RoutingExecutor::new().http(Arc::new(http));
    let probe = HttpProbe::new(&config.api_base_url, config.request_timeout())?;

    let cache = SyncCache::with_storage(config.cache(), Arc::clone(&storage));
    let restored = cache.load_persisted();
    if restored > 0 {
        info!(entries = restored, "Restored cached data");
    }

    let coordinator = OfflineCoordinator::new(
        config.coordinator(),
        Components {
            queue: QueueManager::new(config.queue(), Arc::new(executor)),
            cache,
            fallback: FallbackManager::with_storage(FallbackConfig::default(), storage),
            health: HealthRegistry::new(),
            probe: Some(Arc::new(probe)),
        },
    );
    coordinator.start().await;

    let app_state = Arc::new(api::AppState::new(coordinator.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("SIGINT received");
        }
        result = api_handle => {
            match result {
                Ok(Ok(())) => warn!("API server stopped"),
                Ok(Err(e)) => warn!(error = %e, "API server failed"),
                Err(e) => warn!(error = %e, "API server task panicked"),
            }
        }
    }

    coordinator.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
