//! Connectivity state machine
//!
//! [`NetworkMonitor`] folds two inputs into a [`NetworkStatus`]: connectivity
//! events reported by the host (the OS going on or offline) and the results
//! of a periodic liveness probe. It never spawns anything itself; the
//! coordinator drives it and reacts to the transitions it returns.

use crate::error::{Error, Result};
use crate::models::{ConnectionState, NetworkQuality, NetworkStatus};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Liveness check against the backend, returning the observed latency
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> Result<Duration>;
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// Successful probes at or above this latency mark the link unstable
    pub degraded_latency: Duration,
    /// Consecutive probe failures before the link counts as offline
    pub offline_after_failures: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            degraded_latency: Duration::from_millis(1000),
            offline_after_failures: 3,
        }
    }
}

impl MonitorConfig {
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_degraded_latency(mut self, latency: Duration) -> Self {
        self.degraded_latency = latency;
        self
    }

    pub fn with_offline_after_failures(mut self, failures: u32) -> Self {
        self.offline_after_failures = failures.max(1);
        self
    }
}

/// A change of [`ConnectionState`]
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub status: NetworkStatus,
}

impl Transition {
    /// The link came back from offline or reconnecting
    pub fn is_reconnect(&self) -> bool {
        matches!(
            self.from,
            ConnectionState::Offline | ConnectionState::Reconnecting
        ) && matches!(self.to, ConnectionState::Online | ConnectionState::Unstable)
    }
}

/// Latency bucket of a successful probe
pub fn quality_for(latency: Duration) -> NetworkQuality {
    if latency < Duration::from_millis(100) {
        NetworkQuality::Excellent
    } else if latency < Duration::from_millis(300) {
        NetworkQuality::Good
    } else {
        NetworkQuality::Poor
    }
}

struct MonitorState {
    status: NetworkStatus,
    consecutive_failures: u32,
    offline_since: Option<Instant>,
}

pub struct NetworkMonitor {
    config: MonitorConfig,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    state: Mutex<MonitorState>,
}

impl NetworkMonitor {
    /// Start in the online state, as a freshly loaded client does
    pub fn new(config: MonitorConfig, probe: Option<Arc<dyn ConnectivityProbe>>) -> Self {
        Self {
            config,
            probe,
            state: Mutex::new(MonitorState {
                status: NetworkStatus::online(),
                consecutive_failures: 0,
                offline_since: None,
            }),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn has_probe(&self) -> bool {
        self.probe.is_some()
    }

    pub fn status(&self) -> NetworkStatus {
        self.state.lock().status.clone()
    }

    pub fn is_online(&self) -> bool {
        self.state.lock().status.is_online
    }

    /// Downtime including the current outage, if any
    pub fn total_downtime(&self) -> Duration {
        let state = self.state.lock();
        let current = state
            .offline_since
            .map(|since| since.elapsed())
            .unwrap_or(Duration::ZERO);
        state.status.downtime + current
    }

    /// Host connectivity event.
    ///
    /// Going offline is immediate. Coming back waits for a probe to confirm
    /// when one is configured.
    pub fn connectivity_changed(&self, online: bool) -> Option<Transition> {
        let mut state = self.state.lock();
        let current = state.status.state;
        if !online {
            state.consecutive_failures = self.config.offline_after_failures;
            return self.apply(&mut state, ConnectionState::Offline, None, NetworkQuality::Unavailable);
        }

        match current {
            ConnectionState::Offline if self.probe.is_some() => {
                state.consecutive_failures = 0;
                self.apply(
                    &mut state,
                    ConnectionState::Reconnecting,
                    None,
                    NetworkQuality::Unavailable,
                )
            }
            ConnectionState::Offline | ConnectionState::Reconnecting => {
                state.consecutive_failures = 0;
                self.apply(&mut state, ConnectionState::Online, None, NetworkQuality::Good)
            }
            _ => None,
        }
    }

    /// Fold one probe outcome into the status
    pub fn record_probe(&self, result: &Result<Duration>) -> Option<Transition> {
        let mut state = self.state.lock();
        match result {
            Ok(latency) => {
                state.consecutive_failures = 0;
                let next = if *latency >= self.config.degraded_latency {
                    ConnectionState::Unstable
                } else {
                    ConnectionState::Online
                };
                self.apply(&mut state, next, Some(*latency), quality_for(*latency))
            }
            Err(e) => {
                state.consecutive_failures += 1;
                debug!(
                    failures = state.consecutive_failures,
                    error = %e,
                    "Connectivity probe failed"
                );
                let next = if state.consecutive_failures >= self.config.offline_after_failures {
                    ConnectionState::Offline
                } else {
                    match state.status.state {
                        ConnectionState::Offline | ConnectionState::Reconnecting => {
                            state.status.state
                        }
                        _ => ConnectionState::Unstable,
                    }
                };
                self.apply(&mut state, next, None, NetworkQuality::Unavailable)
            }
        }
    }

    /// Run the probe once, bounded by the probe timeout
    pub async fn check(&self) -> Option<Transition> {
        let probe = self.probe.as_ref()?;
        let result = match tokio::time::timeout(self.config.probe_timeout, probe.probe()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.config.probe_timeout)),
        };
        self.record_probe(&result)
    }

    fn apply(
        &self,
        state: &mut MonitorState,
        next: ConnectionState,
        latency: Option<Duration>,
        quality: NetworkQuality,
    ) -> Option<Transition> {
        let from = state.status.state;
        state.status.quality = quality;
        if latency.is_some() {
            state.status.latency = latency;
        }
        if from == next {
            return None;
        }

        let now = Utc::now();
        let online = matches!(next, ConnectionState::Online | ConnectionState::Unstable);
        match next {
            ConnectionState::Offline if state.offline_since.is_none() => {
                state.offline_since = Some(Instant::now());
                state.status.last_offline = Some(now);
            }
            ConnectionState::Online | ConnectionState::Unstable => {
                if let Some(since) = state.offline_since.take() {
                    state.status.downtime += since.elapsed();
                }
                if !state.status.is_online {
                    state.status.last_online = Some(now);
                }
            }
            _ => {}
        }
        state.status.state = next;
        state.status.is_online = online;

        Some(Transition {
            from,
            to: next,
            status: state.status.clone(),
        })
    }
}
