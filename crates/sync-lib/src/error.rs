//! Error types shared by every component of the sync engine

use crate::storage::StorageTier;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Closed set of failures the engine can report.
///
/// Payloads are owned so the error can be cloned and handed to every caller
/// waiting on a shared in-flight sync.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Transport failure talking to the backend
    #[error("network error: {0}")]
    Network(String),

    /// The call did not complete within its deadline
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The circuit protecting this call site is open
    #[error("circuit breaker '{name}' is open, retry in {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    /// A cache refresh for a single key failed
    #[error("failed to sync data for key '{key}': {reason}")]
    SyncFailed { key: String, reason: String },

    /// A sync pass finished with work still outstanding
    #[error(
        "sync incomplete: {} operation(s) and {} conflict(s) pending",
        pending_operations.len(),
        pending_conflicts.len()
    )]
    Sync {
        pending_operations: Vec<String>,
        pending_conflicts: Vec<String>,
    },

    /// A storage tier rejected a read or write
    #[error("storage error in {tier} tier during {operation}: {message}")]
    Storage {
        tier: StorageTier,
        operation: String,
        message: String,
    },

    /// Local and remote values diverged and must be resolved first
    #[error("conflicting local and remote values for key '{key}'")]
    Conflict { key: String },

    /// An operation failed on every allowed attempt
    #[error("operation {operation_id} failed after {attempts} attempt(s): {last_error}")]
    OperationExhausted {
        operation_id: String,
        attempts: u32,
        last_error: String,
    },

    /// The backend rejected an operation in a way retrying will not fix
    #[error("operation rejected: {0}")]
    Operation(String),

    /// Network is known to be down
    #[error("cannot sync while offline")]
    Offline,

    /// No cached data was available, a background poller was started instead
    #[error("no data available for '{key}', polling started")]
    PollingStarted { key: String },

    /// A fallback strategy had nothing to serve
    #[error("fallback unavailable: {0}")]
    FallbackUnavailable(String),

    /// A queue channel is over its byte budget
    #[error("queue '{channel}' is full ({current_bytes} of {max_bytes} bytes used)")]
    QueueFull {
        channel: String,
        current_bytes: usize,
        max_bytes: usize,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Transport-level failures that are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }

    /// Short machine-readable tag for logs and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Network(_) => "network",
            Error::Timeout(_) => "timeout",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::SyncFailed { .. } => "sync_failed",
            Error::Sync { .. } => "sync",
            Error::Storage { .. } => "storage",
            Error::Conflict { .. } => "conflict",
            Error::OperationExhausted { .. } => "operation_exhausted",
            Error::Operation(_) => "operation",
            Error::Offline => "offline",
            Error::PollingStarted { .. } => "polling_started",
            Error::FallbackUnavailable(_) => "fallback_unavailable",
            Error::QueueFull { .. } => "queue_full",
            Error::NotFound(_) => "not_found",
            Error::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(Error::Network("connection reset".into()).is_retryable());
        assert!(Error::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(!Error::Operation("HTTP 400".into()).is_retryable());
        assert!(!Error::CircuitOpen {
            name: "default".into(),
            retry_after: Duration::from_secs(1),
        }
        .is_retryable());
    }

    #[test]
    fn test_sync_error_message_counts_pending_work() {
        let err = Error::Sync {
            pending_operations: vec!["op_1".into(), "op_2".into()],
            pending_conflicts: vec![],
        };
        assert_eq!(
            err.to_string(),
            "sync incomplete: 2 operation(s) and 0 conflict(s) pending"
        );
        assert_eq!(err.kind(), "sync");
    }

    #[test]
    fn test_storage_error_names_tier() {
        let err = Error::Storage {
            tier: StorageTier::Durable,
            operation: "put".into(),
            message: "disk full".into(),
        };
        assert_eq!(
            err.to_string(),
            "storage error in durable tier during put: disk full"
        );
    }
}
