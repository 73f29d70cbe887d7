//! Connectivity monitoring and sync scheduling

mod coordinator;
mod monitor;

#[cfg(test)]
mod tests;

pub use coordinator::{
    Components, CoordinatorConfig, CoordinatorEvent, OfflineCoordinator, OfflineMetrics,
    SyncStatus,
};
pub use monitor::{quality_for, ConnectivityProbe, MonitorConfig, NetworkMonitor, Transition};
