//! Shared fixtures for the integration tests: an in-memory storefront API
//! and a realtime connector whose remote end the test drives.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::SinkExt;
use serde_json::Value;

use storefront_sync::backend::{Backend, WriteRequest};
use storefront_sync::keys::CacheKey;
use storefront_sync::realtime::{Connection, Connector, Envelope};
use storefront_sync::{Config, Result, SyncEngine, SyncError};

// == In-Memory Backend ==
#[derive(Default)]
pub struct InMemoryBackend {
    resources: Mutex<HashMap<String, Value>>,
    write_results: Mutex<VecDeque<Result<Value>>>,
    writes: Mutex<Vec<WriteRequest>>,
    fetches: AtomicUsize,
    delay: Duration,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn put(&self, path: &str, value: Value) {
        self.resources.lock().unwrap().insert(path.to_string(), value);
    }

    pub fn reject_next_write(&self, status: u16, message: &str) {
        self.write_results.lock().unwrap().push_back(Err(SyncError::Http {
            status,
            message: message.to_string(),
        }));
    }

    pub fn answer_next_write(&self, value: Value) {
        self.write_results.lock().unwrap().push_back(Ok(value));
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<WriteRequest> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn fetch(&self, key: &CacheKey) -> Result<Value> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let path = key.resource_path();
        self.resources
            .lock()
            .unwrap()
            .get(&path)
            .cloned()
            .ok_or_else(|| SyncError::Http {
                status: 404,
                message: format!("{} not found", path),
            })
    }

    async fn write(&self, request: &WriteRequest) -> Result<Value> {
        self.writes.lock().unwrap().push(request.clone());
        let scripted = self.write_results.lock().unwrap().pop_front();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        scripted.unwrap_or_else(|| Ok(request.body.clone().unwrap_or(Value::Null)))
    }
}

// == Scripted Realtime Connector ==
/// The server side of one scripted connection.
pub struct Remote {
    inbound: mpsc::UnboundedSender<Result<String>>,
    pub outbound: mpsc::UnboundedReceiver<String>,
}

impl Remote {
    pub async fn push(&mut self, topic: &str, payload: Value) {
        let frame = Envelope::new(topic, payload).encode().unwrap();
        self.inbound.send(Ok(frame)).await.unwrap();
    }

    /// Closes the connection from the server side.
    pub fn close(self) {
        drop(self);
    }
}

#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Connection>>,
    attempts: AtomicUsize,
}

impl ScriptedConnector {
    pub fn accept_next(&self) -> Remote {
        let (in_tx, in_rx) = mpsc::unbounded::<Result<String>>();
        let (out_tx, out_rx) = mpsc::unbounded::<String>();
        let sink = out_tx.sink_map_err(|e| SyncError::Channel(e.to_string()));
        self.script
            .lock()
            .unwrap()
            .push_back(Connection::new(Box::pin(sink), Box::pin(in_rx)));
        Remote {
            inbound: in_tx,
            outbound: out_rx,
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Connection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| SyncError::Channel("network error: connection refused".into()))
    }
}

// == Engine ==
pub fn test_config() -> Config {
    Config {
        reconnect_base_ms: 50,
        reconnect_max_ms: 400,
        reconnect_max_attempts: 3,
        retry_base_ms: 10,
        retry_jitter_ms: 0,
        network_retry_delay_ms: 20,
        request_timeout_ms: 1000,
        ..Config::default()
    }
}

pub fn engine(backend: Arc<InMemoryBackend>, connector: Arc<ScriptedConnector>) -> Arc<SyncEngine> {
    let engine = SyncEngine::builder(test_config())
        .backend(backend)
        .connector(connector)
        .client_id("it-client")
        .build()
        .unwrap();
    Arc::new(engine)
}

/// Polls `check` until it holds or a second passes.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
