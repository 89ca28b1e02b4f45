//! Realtime Channel Manager
//!
//! Owns the single realtime connection: connect, serve inbound frames,
//! reconnect with capped exponential backoff, and deterministic shutdown.
//! The whole lifecycle runs as one task with one control-flow path.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backoff::ReconnectPolicy;
use super::connector::{Connection, Connector};
use super::envelope::Envelope;
use super::registry::{HandlerId, SubscriptionRegistry};
use super::state::ConnectionState;
use crate::error::Result;

struct ChannelTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ChannelManager {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    registry: SubscriptionRegistry,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    outbound_capacity: usize,
    task: Mutex<Option<ChannelTask>>,
    retry: Notify,
    failures: AtomicU32,
    client_id: String,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChannelManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        outbound_capacity: usize,
        client_id: impl Into<String>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            policy,
            registry: SubscriptionRegistry::new(),
            state,
            outbound: Mutex::new(None),
            outbound_capacity: outbound_capacity.max(1),
            task: Mutex::new(None),
            retry: Notify::new(),
            failures: AtomicU32::new(0),
            client_id: client_id.into(),
        }
    }

    // == State ==
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Consecutive failed connect attempts since the last success.
    pub fn failed_attempts(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(state = %next, "Realtime state changed");
        }
    }

    // == Subscriptions ==
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        self.registry.subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        self.registry.unsubscribe(id)
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    // == Lifecycle ==
    /// Starts the connection loop. Does nothing if it is already running.
    pub fn start(self: &Arc<Self>) {
        let mut task = guard(&self.task);
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }
        let (shutdown, rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.run(rx).await });
        *task = Some(ChannelTask { shutdown, handle });
    }

    pub fn is_running(&self) -> bool {
        guard(&self.task)
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Resumes reconnection after the attempt ceiling was hit, or cuts a
    /// pending backoff delay short.
    pub fn retry(self: &Arc<Self>) {
        info!("Manual realtime retry requested");
        self.failures.store(0, Ordering::SeqCst);
        if self.is_running() {
            self.retry.notify_one();
        } else {
            self.start();
        }
    }

    /// Closes the connection, stops the loop and drops every subscription.
    pub async fn shutdown(&self) {
        let task = guard(&self.task).take();
        if let Some(task) = task {
            self.set_state(ConnectionState::Disconnecting);
            let _ = task.shutdown.send(true);
            if let Err(err) = task.handle.await {
                warn!(error = %err, "Realtime task ended abnormally");
            }
        }
        guard(&self.outbound).take();
        self.registry.clear();
        self.set_state(ConnectionState::Disconnected);
        info!("Realtime channel shut down");
    }

    // == Outbound ==
    /// Queues a frame for the open connection. Returns `false` (and logs)
    /// when not connected or when the bounded queue is full.
    pub fn send(&self, envelope: &Envelope) -> bool {
        if !self.state().is_connected() {
            warn!(topic = %envelope.topic, state = %self.state(), "Dropping send, channel not connected");
            return false;
        }
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(topic = %envelope.topic, error = %err, "Dropping send, envelope not encodable");
                return false;
            }
        };
        let outbound = guard(&self.outbound);
        match outbound.as_ref().map(|tx| tx.try_send(text)) {
            Some(Ok(())) => true,
            Some(Err(err)) => {
                warn!(topic = %envelope.topic, error = %err, "Dropping send, outbound queue unavailable");
                false
            }
            None => {
                warn!(topic = %envelope.topic, "Dropping send, no open connection");
                false
            }
        }
    }

    // == Connection Loop ==
    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            let attempt = tokio::select! {
                result = self.connector.connect() => result,
                _ = shutdown.changed() => break,
            };

            match attempt {
                Ok(connection) => {
                    self.failures.store(0, Ordering::SeqCst);
                    info!("Realtime channel connected");
                    if self.serve(connection, &mut shutdown).await {
                        break;
                    }
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(err) => {
                    let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                    self.set_state(ConnectionState::Disconnected);
                    warn!(error = %err, failures, "Realtime connect failed");
                    if self.policy.exhausted(failures) {
                        warn!(failures, "Reconnect attempts exhausted, waiting for manual retry");
                        tokio::select! {
                            _ = self.retry.notified() => continue,
                            _ = shutdown.changed() => break,
                        }
                    }
                }
            }

            let failures = self.failures.load(Ordering::SeqCst);
            let delay = self.policy.delay(failures.saturating_sub(1));
            debug!(?delay, failures, "Scheduling reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.retry.notified() => {}
                _ = shutdown.changed() => break,
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Serves one open connection. Returns `true` when it ended because of
    /// a shutdown request.
    async fn serve(&self, connection: Connection, shutdown: &mut watch::Receiver<bool>) -> bool {
        let Connection { mut sink, mut stream } = connection;
        let (tx, mut rx) = mpsc::channel::<String>(self.outbound_capacity);
        *guard(&self.outbound) = Some(tx);
        self.set_state(ConnectionState::Connected);

        match Envelope::hello(&self.client_id).encode() {
            Ok(hello) => {
                if let Err(err) = sink.send(hello).await {
                    warn!(error = %err, "Failed to send hello");
                }
            }
            Err(err) => warn!(error = %err, "Failed to encode hello"),
        }

        let stopping = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(text)) => self.handle_frame(&text),
                    Some(Err(err)) => {
                        warn!(error = %err, "Realtime channel error");
                        break false;
                    }
                    None => {
                        info!("Realtime channel closed by server");
                        break false;
                    }
                },
                Some(text) = rx.recv() => {
                    if let Err(err) = sink.send(text).await {
                        warn!(error = %err, "Realtime send failed");
                        break false;
                    }
                }
                _ = shutdown.changed() => break true,
            }
        };

        guard(&self.outbound).take();
        if stopping {
            if let Err(err) = sink.close().await {
                debug!(error = %err, "Error closing realtime channel");
            }
        }
        stopping
    }

    /// Decodes one inbound frame and fans it out by topic.
    fn handle_frame(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(error = %err, "Ignoring undecodable frame");
                return;
            }
        };
        if !self.registry.has_handlers(&envelope.topic) {
            debug!(topic = %envelope.topic, "Ignoring frame without handlers");
            return;
        }
        let report = self.registry.dispatch(&envelope.topic, &envelope.payload);
        debug!(topic = %envelope.topic, delivered = report.delivered, failed = report.failed, "Dispatched frame");
    }
}
