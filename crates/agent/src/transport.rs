//! HTTP transport to the REST backend

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use sync_lib::{ConnectivityProbe, Error, Operation, OperationExecutor, OperationPayload};
use tokio::time::Instant;
use tracing::debug;
use url::Url;

/// Header carrying the caller's idempotency key
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Health endpoint probed for liveness, relative to the base URL
pub const HEALTH_PATH: &str = "api/health";

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to create HTTP client")
}

fn parse_base(base_url: &str) -> Result<Url> {
    let mut url = Url::parse(base_url).context("Invalid API URL")?;
    // Keep path segments of the base when joining relative endpoints
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Map a non-success response onto the engine's error kinds.
///
/// Server errors and throttling are worth retrying, everything else is not.
pub fn classify_status(status: StatusCode, body: &str) -> Error {
    let message = if body.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), body)
    };
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Error::Network(message)
    } else {
        Error::Operation(message)
    }
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> Error {
    if err.is_timeout() {
        Error::Timeout(timeout)
    } else {
        Error::Network(err.to_string())
    }
}

/// Runs `Http` operations against the backend
#[derive(Debug)]
pub struct HttpExecutor {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpExecutor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: parse_base(base_url)?,
            timeout,
        })
    }

    /// Absolute URL of an operation endpoint
    pub fn url_for(&self, endpoint: &str) -> sync_lib::Result<Url> {
        self.base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| Error::Operation(format!("invalid endpoint '{}': {}", endpoint, e)))
    }
}

#[async_trait]
impl OperationExecutor for HttpExecutor {
    async fn execute(&self, operation: &Operation) -> sync_lib::Result<Value> {
        let OperationPayload::Http(request) = &operation.payload else {
            return Err(Error::Operation(
                "HTTP executor cannot run transactions".to_string(),
            ));
        };

        let url = self.url_for(&request.endpoint)?;
        let method = Method::from_bytes(request.method.to_string().as_bytes())
            .map_err(|e| Error::Operation(e.to_string()))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(key) = &operation.idempotency_key {
            builder = builder.header(IDEMPOTENCY_HEADER, key);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        debug!(
            operation_id = %operation.id,
            status = status.as_u16(),
            "Backend responded"
        );

        if !status.is_success() {
            return Err(classify_status(status, &text));
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

/// Liveness probe issuing `HEAD {base}/api/health`
#[derive(Debug)]
pub struct HttpProbe {
    client: Client,
    url: Url,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let url = parse_base(base_url)?
            .join(HEALTH_PATH)
            .context("Invalid health URL")?;
        Ok(Self {
            client: build_client(timeout)?,
            url,
            timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self) -> sync_lib::Result<Duration> {
        let started = Instant::now();
        let response = self
            .client
            .head(self.url.clone())
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!("health check returned HTTP {}", status.as_u16())));
        }
        Ok(started.elapsed())
    }
}
