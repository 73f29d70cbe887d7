//! Core data models shared across the queue, cache and coordinator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Scheduling priority, strict precedence from `Critical` down to `Low`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Highest first
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Lifecycle of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Synced | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "pending"),
            OperationStatus::Syncing => write!(f, "syncing"),
            OperationStatus::Synced => write!(f, "synced"),
            OperationStatus::Failed => write!(f, "failed"),
            OperationStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Confirmation status reported by the blockchain RPC endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Confirmed,
    Finalized,
    Failed,
}

impl TransactionStatus {
    /// True once the chain has given a final answer
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Confirmed | TransactionStatus::Finalized | TransactionStatus::Failed
        )
    }
}

impl From<TransactionStatus> for OperationStatus {
    fn from(status: TransactionStatus) -> Self {
        match status {
            TransactionStatus::Pending => OperationStatus::Pending,
            TransactionStatus::Processing => OperationStatus::Syncing,
            TransactionStatus::Confirmed | TransactionStatus::Finalized => OperationStatus::Synced,
            TransactionStatus::Failed => OperationStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
            HttpMethod::Delete => write!(f, "DELETE"),
            HttpMethod::Patch => write!(f, "PATCH"),
        }
    }
}

/// REST request executed by the embedding application's executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub endpoint: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Single program instruction inside a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub program_id: String,
    pub accounts: Vec<String>,
    pub data: Vec<u8>,
}

/// Blockchain transaction submitted through the RPC boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub instructions: Vec<Instruction>,
    pub signers: Vec<String>,
}

impl TransactionRequest {
    /// A transaction needs at least one well-formed instruction
    pub fn is_valid(&self) -> bool {
        !self.instructions.is_empty()
            && self
                .instructions
                .iter()
                .all(|ix| !ix.program_id.is_empty() && !ix.accounts.is_empty())
    }
}

/// What an operation does when executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OperationPayload {
    Http(HttpRequest),
    Transaction(TransactionRequest),
}

impl OperationPayload {
    pub fn target(&self) -> String {
        match self {
            OperationPayload::Http(req) => format!("{} {}", req.method, req.endpoint),
            OperationPayload::Transaction(tx) => format!(
                "transaction({} instruction(s))",
                tx.instructions.len()
            ),
        }
    }
}

/// Caller-supplied description of work to queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub payload: OperationPayload,
    /// Total attempts allowed before the operation fails permanently
    pub max_retries: Option<u32>,
    /// Required by the backend for safe retries of non-idempotent calls
    pub idempotency_key: Option<String>,
    /// Per-attempt deadline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Optimistic update committed on success, rolled back on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimistic_id: Option<String>,
}

impl OperationRequest {
    pub fn new(payload: OperationPayload) -> Self {
        Self {
            payload,
            max_retries: None,
            idempotency_key: None,
            timeout: None,
            metadata: HashMap::new(),
            optimistic_id: None,
        }
    }

    pub fn http(request: HttpRequest) -> Self {
        Self::new(OperationPayload::Http(request))
    }

    pub fn transaction(request: TransactionRequest) -> Self {
        Self::new(OperationPayload::Transaction(request))
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_optimistic_update(mut self, id: impl Into<String>) -> Self {
        self.optimistic_id = Some(id.into());
        self
    }
}

/// Stable identifier handed back by `enqueue`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn generate() -> Self {
        Self(format!("op_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A queued unit of work owned by the queue manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub channel: String,
    pub payload: OperationPayload,
    pub priority: Priority,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimistic_id: Option<String>,
    /// Serialized size charged against the channel's byte budget
    pub size_bytes: usize,
}

impl Operation {
    pub(crate) fn from_request(
        channel: &str,
        request: OperationRequest,
        priority: Priority,
        default_max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        let mut op = Self {
            id: OperationId::generate(),
            channel: channel.to_string(),
            payload: request.payload,
            priority,
            status: OperationStatus::Pending,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries).max(1),
            created_at: now,
            updated_at: now,
            last_error: None,
            idempotency_key: request.idempotency_key,
            timeout: request.timeout,
            metadata: request.metadata,
            optimistic_id: request.optimistic_id,
            size_bytes: 0,
        };
        op.size_bytes = serde_json::to_vec(&op).map(|v| v.len()).unwrap_or(0);
        op
    }

    pub(crate) fn set_status(&mut self, status: OperationStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Connection state tracked by the network monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Online,
    Offline,
    Reconnecting,
    Unstable,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Online => write!(f, "online"),
            ConnectionState::Offline => write!(f, "offline"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Unstable => write!(f, "unstable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Poor,
    Unavailable,
}

/// Snapshot of connectivity as seen by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub is_online: bool,
    pub state: ConnectionState,
    pub quality: NetworkQuality,
    pub latency: Option<Duration>,
    pub last_online: Option<DateTime<Utc>>,
    pub last_offline: Option<DateTime<Utc>>,
    /// Accumulated time spent offline
    pub downtime: Duration,
}

impl NetworkStatus {
    pub fn online() -> Self {
        Self {
            is_online: true,
            state: ConnectionState::Online,
            quality: NetworkQuality::Good,
            latency: None,
            last_online: Some(Utc::now()),
            last_offline: None,
            downtime: Duration::ZERO,
        }
    }

    pub fn offline() -> Self {
        Self {
            is_online: false,
            state: ConnectionState::Offline,
            quality: NetworkQuality::Unavailable,
            latency: None,
            last_online: None,
            last_offline: Some(Utc::now()),
            downtime: Duration::ZERO,
        }
    }
}

/// How a conflict between local and remote data is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    Local,
    Remote,
    Timestamp,
    Version,
    Manual,
}

impl std::fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConflictResolution::Local => "local",
            ConflictResolution::Remote => "remote",
            ConflictResolution::Timestamp => "timestamp",
            ConflictResolution::Version => "version",
            ConflictResolution::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// A value together with the moment it was produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

impl Revision {
    pub fn new(value: Value, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }
}

/// Divergence between a locally written value and the server's value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConflict {
    pub id: String,
    pub key: String,
    pub local: Revision,
    pub remote: Revision,
    /// Version of the cached local entry when the conflict was detected
    pub local_version: u64,
    pub resolution: ConflictResolution,
    pub resolved: bool,
    pub detected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::DESCENDING[0], Priority::Critical);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_transaction_status_mapping() {
        assert_eq!(
            OperationStatus::from(TransactionStatus::Processing),
            OperationStatus::Syncing
        );
        assert_eq!(
            OperationStatus::from(TransactionStatus::Finalized),
            OperationStatus::Synced
        );
        assert_eq!(
            OperationStatus::from(TransactionStatus::Failed),
            OperationStatus::Failed
        );
        assert!(!TransactionStatus::Processing.is_settled());
    }

    #[test]
    fn test_operation_from_request() {
        let request = OperationRequest::http(
            HttpRequest::new(HttpMethod::Post, "/api/votes")
                .with_body(serde_json::json!({"proposal": 7})),
        )
        .with_idempotency_key("vote-7")
        .with_max_retries(5);

        let op = Operation::from_request("default", request, Priority::High, 3);
        assert!(op.id.as_str().starts_with("op_"));
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.max_retries, 5);
        assert_eq!(op.retry_count, 0);
        assert!(op.size_bytes > 0);
        assert_eq!(op.payload.target(), "POST /api/votes");
    }

    #[test]
    fn test_transaction_validation() {
        let valid = TransactionRequest {
            instructions: vec![Instruction {
                program_id: "Vote111".into(),
                accounts: vec!["member".into()],
                data: vec![1, 2, 3],
            }],
            signers: vec!["member".into()],
        };
        assert!(valid.is_valid());

        let empty = TransactionRequest {
            instructions: vec![],
            signers: vec![],
        };
        assert!(!empty.is_valid());
    }
}
