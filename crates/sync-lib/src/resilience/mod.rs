//! Resilience utilities: retries with backoff, circuit breaking and fallbacks

mod circuit_breaker;
mod fallback;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use fallback::{
    DataSource, FallbackActivated, FallbackConfig, FallbackManager, FallbackOptions,
    FallbackResult, FallbackStats, FallbackStrategy,
};
pub use retry::{execute_with_retry, with_timeout, RetryExecutor, RetryPolicy};
