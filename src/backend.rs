//! Backend Module
//!
//! The storefront HTTP API as seen by the sync engine: reads addressed by
//! cache key and writes issued by the mutation coordinator.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::keys::CacheKey;

// == Write Request ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WriteMethod {
    Post,
    Put,
    Patch,
    Delete,
}

impl WriteMethod {
    fn as_method(self) -> Method {
        match self {
            WriteMethod::Post => Method::POST,
            WriteMethod::Put => Method::PUT,
            WriteMethod::Patch => Method::PATCH,
            WriteMethod::Delete => Method::DELETE,
        }
    }
}

/// A write sent to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub method: WriteMethod,
    pub path: String,
    pub body: Option<Value>,
    /// Sent as `Idempotency-Key` so retried writes apply once
    pub idempotency_key: Option<String>,
}

impl WriteRequest {
    pub fn new(method: WriteMethod, path: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            method,
            path: path.into(),
            body,
            idempotency_key: None,
        }
    }
}

// == Backend Trait ==
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetches the resource a cache key addresses.
    async fn fetch(&self, key: &CacheKey) -> Result<Value>;

    /// Performs a write and returns the authoritative entity.
    async fn write(&self, request: &WriteRequest) -> Result<Value>;
}

// == HTTP Backend ==
/// `reqwest` implementation against the storefront REST API.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.api_base_url, config.request_timeout())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| self.map_error(e))?;

        if !status.is_success() {
            return Err(SyncError::Http {
                status: status.as_u16(),
                message: error_message(status, &bytes),
            });
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn map_error(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout(self.timeout)
        } else if let Some(status) = err.status() {
            SyncError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

/// Extracts `error` or `message` from a JSON error body, falling back to the
/// raw body or the status reason.
fn error_message(status: StatusCode, body: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<Value>(body) {
        for field in ["error", "message"] {
            if let Some(msg) = json.get(field).and_then(Value::as_str) {
                return msg.to_string();
            }
        }
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    if text.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        text
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn fetch(&self, key: &CacheKey) -> Result<Value> {
        let url = self.url(&key.resource_path());
        debug!(key = %key, url = %url, "Fetching");
        self.send(self.client.get(url)).await
    }

    async fn write(&self, request: &WriteRequest) -> Result<Value> {
        let url = self.url(&request.path);
        debug!(method = ?request.method, url = %url, "Writing");
        let mut builder = self.client.request(request.method.as_method(), url);
        if let Some(key) = &request.idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        self.send(builder).await
    }
}
