//! Failure isolation for a single protected call site

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before a probe call is allowed
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub rejected_calls: u64,
    #[serde(skip)]
    pub last_failure: Option<Instant>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    rejected_calls: u64,
}

enum Permit {
    Normal,
    Probe,
}

/// Closed/open/half-open state machine.
///
/// Clones share state. The lock is never held across the protected call.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            config,
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                opened_at: None,
                probe_in_flight: false,
                rejected_calls: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock();
        CircuitBreakerStats {
            name: self.name.to_string(),
            state: state.state,
            failure_count: state.failure_count,
            rejected_calls: state.rejected_calls,
            last_failure: state.last_failure,
        }
    }

    /// Whether a call made now would be admitted
    pub fn allows_call(&self) -> bool {
        let state = self.state.lock();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => state
                .opened_at
                .map(|t| t.elapsed() >= self.config.recovery_timeout)
                .unwrap_or(true),
            CircuitState::HalfOpen => !state.probe_in_flight,
        }
    }

    /// Force the circuit closed and forget past failures
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.opened_at = None;
        state.probe_in_flight = false;
    }

    /// Run `f` if the circuit admits the call.
    ///
    /// While open, calls fail with [`Error::CircuitOpen`] without running `f`.
    /// Once `recovery_timeout` has elapsed a single probe is admitted; its
    /// outcome closes or reopens the circuit.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire()?;
        let mut guard = ProbeGuard {
            breaker: self,
            armed: matches!(permit, Permit::Probe),
        };

        let result = f().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.on_success(),
            Err(e) => self.on_failure(e),
        }
        result
    }

    fn acquire(&self) -> Result<Permit> {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(self.config.recovery_timeout);
                if elapsed >= self.config.recovery_timeout {
                    state.state = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    debug!(breaker = %self.name, "Recovery timeout elapsed, admitting probe");
                    Ok(Permit::Probe)
                } else {
                    state.rejected_calls += 1;
                    Err(Error::CircuitOpen {
                        name: self.name.to_string(),
                        retry_after: self.config.recovery_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    state.rejected_calls += 1;
                    Err(Error::CircuitOpen {
                        name: self.name.to_string(),
                        retry_after: Duration::ZERO,
                    })
                } else {
                    state.probe_in_flight = true;
                    Ok(Permit::Probe)
                }
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        if state.state != CircuitState::Closed {
            info!(breaker = %self.name, "Circuit closed after successful probe");
        }
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.opened_at = None;
        state.probe_in_flight = false;
    }

    fn on_failure(&self, error: &Error) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.failure_count += 1;
        state.last_failure = Some(now);
        state.probe_in_flight = false;

        match state.state {
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                warn!(breaker = %self.name, error = %error, "Probe failed, circuit reopened");
            }
            CircuitState::Closed if state.failure_count >= self.config.failure_threshold => {
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                warn!(
                    breaker = %self.name,
                    failures = state.failure_count,
                    error = %error,
                    "Failure threshold reached, circuit opened"
                );
            }
            _ => {}
        }
    }
}

/// Reopens the circuit if a probe future is dropped before completing
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.breaker.state.lock();
            state.state = CircuitState::Open;
            state.opened_at = Some(Instant::now());
            state.probe_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", CircuitBreakerConfig::default())
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .execute(|| async { Err::<(), _>(Error::Network("down".into())) })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_on_threshold() {
        let breaker = breaker();
        for _ in 0..4 {
            assert!(matches!(fail(&breaker).await, Err(Error::Network(_))));
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_without_calling_while_open() {
        let breaker = breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }

        let calls = &AtomicU32::new(0);
        let result = breaker
            .execute(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.stats().rejected_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_after_recovery() {
        let breaker = breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        let (probe_tx, probe_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_breaker = breaker.clone();
        let probe = tokio::spawn(async move {
            probe_breaker
                .execute(|| async move {
                    let _ = probe_rx.await;
                    Ok(())
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // A second caller is turned away while the probe is in flight
        let second = breaker.execute(|| async { Ok(()) }).await;
        assert!(matches!(second, Err(Error::CircuitOpen { .. })));

        probe_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let breaker = breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(matches!(fail(&breaker).await, Err(Error::Network(_))));
        assert_eq!(breaker.state(), CircuitState::Open);

        // Timer restarted by the failed probe
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(matches!(fail(&breaker).await, Err(Error::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = breaker();
        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.stats().failure_count, 0);

        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_probe_reopens() {
        let breaker = breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(60)).await;

        let probe = breaker.execute(|| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), probe).await;
        assert!(timed_out.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
