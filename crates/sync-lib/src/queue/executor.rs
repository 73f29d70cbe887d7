//! Execution seams between the queue and the outside world

use crate::error::{Error, Result};
use crate::models::{
    Operation, OperationId, OperationPayload, TransactionRequest, TransactionStatus,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Runs a single attempt of a queued operation.
///
/// Implementations report transport failures as [`Error::Network`] or
/// [`Error::Timeout`] so they are retried, and backend rejections as
/// [`Error::Operation`].
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, operation: &Operation) -> Result<Value>;
}

/// Blockchain RPC boundary
#[async_trait]
pub trait TransactionClient: Send + Sync {
    /// Submit a transaction, returning its signature
    async fn submit(
        &self,
        transaction: &TransactionRequest,
        idempotency_key: Option<&str>,
    ) -> Result<String>;

    async fn confirmation_status(&self, signature: &str) -> Result<TransactionStatus>;
}

/// Submits transactions and polls until the chain settles them.
///
/// A transaction is submitted once per operation. When confirmation times
/// out the signature is kept, and the next attempt resumes polling it.
pub struct TransactionExecutor {
    client: Arc<dyn TransactionClient>,
    poll_interval: Duration,
    confirmation_timeout: Duration,
    submitted: DashMap<OperationId, String>,
}

impl TransactionExecutor {
    pub fn new(client: Arc<dyn TransactionClient>) -> Self {
        Self {
            client,
            poll_interval: Duration::from_secs(2),
            confirmation_timeout: Duration::from_secs(25),
            submitted: DashMap::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    /// Signature awaiting confirmation for `id`, if one was submitted
    pub fn pending_signature(&self, id: &OperationId) -> Option<String> {
        self.submitted.get(id).map(|s| s.value().clone())
    }

    async fn signature_for(
        &self,
        operation: &Operation,
        tx: &TransactionRequest,
    ) -> Result<String> {
        if let Some(signature) = self.pending_signature(&operation.id) {
            debug!(operation_id = %operation.id, signature = %signature, "Resuming confirmation");
            return Ok(signature);
        }
        let signature = self
            .client
            .submit(tx, operation.idempotency_key.as_deref())
            .await?;
        info!(operation_id = %operation.id, signature = %signature, "Transaction submitted");
        self.submitted.insert(operation.id.clone(), signature.clone());
        Ok(signature)
    }
    async fn await_confirmation(&self, signature: &str) -> Result<TransactionStatus> {
        let deadline = Instant::now() + self.confirmation_timeout;
        loop {
            let status = self.client.confirmation_status(signature).await?;
            if status.is_settled() {
                return Ok(status);
            }
            if Instant::now() + self.poll_interval > deadline {
                return Err(Error::Timeout(self.confirmation_timeout));
            }
            debug!(signature = %signature, status = ?status, "Transaction not settled yet");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl OperationExecutor for TransactionExecutor {
    async fn execute(&self, operation: &Operation) -> Result<Value> {
        let OperationPayload::Transaction(tx) = &operation.payload else {
            return Err(Error::Operation(format!(
                "operation {} is not a transaction",
                operation.id
            )));
        };
        if !tx.is_valid() {
            return Err(Error::Operation(format!(
                "transaction {} has no valid instructions",
                operation.id
            )));
        }

        let signature = self.signature_for(operation, tx).await?;
        let status = self.await_confirmation(&signature).await?;
        self.submitted.remove(&operation.id);

        match status {
            TransactionStatus::Failed => Err(Error::Operation(format!(
                "transaction {} failed on chain",
                signature
            ))),
            status => Ok(json!({ "signature": signature, "status": status })),
        }
    }
}

/// Dispatches operations to an executor by payload kind
#[derive(Default, Clone)]
pub struct RoutingExecutor {
    http: Option<Arc<dyn OperationExecutor>>,
    transaction: Option<Arc<dyn OperationExecutor>>,
}

impl RoutingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn http(mut self, executor: Arc<dyn OperationExecutor>) -> Self {
        self.http = Some(executor);
        self
    }

    pub fn transaction(mut self, executor: Arc<dyn OperationExecutor>) -> Self {
        self.transaction = Some(executor);
        self
    }
}

#[async_trait]
impl OperationExecutor for RoutingExecutor {
    async fn execute(&self, operation: &Operation) -> Result<Value> {
        let (executor, kind) = match &operation.payload {
            OperationPayload::Http(_) => (&self.http, "http"),
            OperationPayload::Transaction(_) => (&self.transaction, "transaction"),
        };
        match executor {
            Some(executor) => executor.execute(operation).await,
            None => Err(Error::Operation(format!(
                "no executor configured for {} operations",
                kind
            ))),
        }
    }
}
