//! Sync Engine
//!
//! The single owned context a UI layer talks to. It wires the cache store,
//! dispatcher, mutation coordinator, realtime channel and recovery engine
//! together and gives them an explicit `start` / `shutdown` lifecycle.

use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::info;
use uuid::Uuid;

use crate::backend::{Backend, HttpBackend};
use crate::cache::{CacheChange, CacheEntry, CacheStats, CacheStore};
use crate::config::Config;
use crate::dispatch::{Dispatcher, DomainEvent};
use crate::error::{Result, SyncError};
use crate::keys::{CacheKey, EntityKind};
use crate::mutation::{Mutation, MutationCoordinator, MutationHandle};
use crate::realtime::{
    ChannelManager, ConnectionState, Connector, Envelope, HandlerId, ReconnectPolicy, WsConnector,
    CONNECTION_TOPIC,
};
use crate::recovery::{
    Authenticator, ChannelNotifier, ClassifiedError, ErrorContext, NoAuthenticator, Notice,
    RecoveryEngine, RetryPolicy,
};

// == Builder ==
/// Assembles a [`SyncEngine`]; every collaborator defaults to the
/// production implementation derived from the config.
pub struct EngineBuilder {
    config: Config,
    backend: Option<Arc<dyn Backend>>,
    connector: Option<Arc<dyn Connector>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    client_id: Option<String>,
}

impl EngineBuilder {
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn build(self) -> Result<SyncEngine> {
        let config = self.config;
        let backend = match self.backend {
            Some(backend) => backend,
            None => Arc::new(HttpBackend::from_config(&config)?) as Arc<dyn Backend>,
        };
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector::from_config(&config)) as Arc<dyn Connector>);
        let authenticator = self
            .authenticator
            .unwrap_or_else(|| Arc::new(NoAuthenticator) as Arc<dyn Authenticator>);
        let client_id = self
            .client_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let retry = RetryPolicy::from_config(&config);
        let store = CacheStore::new(config.max_entries, config.default_stale_ms);
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), backend.clone(), retry.clone()));
        let notifier = Arc::new(ChannelNotifier::default());
        let recovery = Arc::new(RecoveryEngine::new(
            dispatcher.clone(),
            notifier.clone(),
            authenticator,
            &config,
        ));
        let coordinator = Arc::new(MutationCoordinator::new(
            dispatcher.clone(),
            backend,
            recovery.clone(),
            notifier.clone(),
            retry,
            client_id.clone(),
        ));
        let channel = Arc::new(ChannelManager::new(
            connector,
            ReconnectPolicy::from_config(&config),
            config.outbound_buffer,
            client_id.clone(),
        ));

        Ok(SyncEngine {
            config,
            client_id,
            store,
            dispatcher,
            coordinator,
            channel,
            recovery,
            notifier,
            wired: Mutex::new(Vec::new()),
        })
    }
}

// == Engine ==
pub struct SyncEngine {
    config: Config,
    client_id: String,
    store: CacheStore,
    dispatcher: Arc<Dispatcher>,
    coordinator: Arc<MutationCoordinator>,
    channel: Arc<ChannelManager>,
    recovery: Arc<RecoveryEngine>,
    notifier: Arc<ChannelNotifier>,
    /// Handlers routing realtime topics into the dispatcher
    wired: Mutex<Vec<HandlerId>>,
}

impl SyncEngine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            backend: None,
            connector: None,
            authenticator: None,
            client_id: None,
        }
    }

    // == Lifecycle ==
    /// Routes entity topics into the dispatcher and opens the realtime channel.
    pub fn start(&self) {
        {
            let mut wired = self.wired.lock().unwrap_or_else(PoisonError::into_inner);
            if wired.is_empty() {
                for kind in EntityKind::ALL {
                    let dispatcher = self.dispatcher.clone();
                    let topic = kind.topic();
                    wired.push(self.channel.subscribe(topic, move |payload| {
                        let event = DomainEvent::from_topic(topic, payload)
                            .ok_or_else(|| SyncError::InvalidRequest(format!("unroutable topic {}", topic)))?;
                        dispatcher.apply(&event);
                        Ok(())
                    }));
                }
                wired.push(self.channel.subscribe(CONNECTION_TOPIC, |payload| {
                    info!(%payload, "Connection notice");
                    Ok(())
                }));
            }
        }
        self.channel.start();
        info!(client_id = %self.client_id, "Sync engine started");
    }

    /// Closes the realtime channel and drops every topic subscription.
    pub async fn shutdown(&self) {
        self.channel.shutdown().await;
        self.wired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("Sync engine stopped");
    }

    // == Reads ==
    /// Serves `key` from cache or fetches it with the default freshness window.
    pub async fn ensure_fresh<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<T> {
        self.ensure_fresh_within(key, self.config.default_stale_ms).await
    }

    /// Like [`ensure_fresh`](Self::ensure_fresh) with an explicit window.
    /// A failed fetch is reported once, not once per waiting caller.
    pub async fn ensure_fresh_within<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
        stale_after_ms: u64,
    ) -> Result<T> {
        let fetch = self.dispatcher.fetcher(key.clone());
        let recovery = self.recovery.clone();
        let context = ErrorContext::new("fetch").with_key(key);
        let reported = move || async move {
            match fetch().await {
                Ok(value) => Ok(value),
                Err(err) => Err(SyncError::Classified(recovery.report(&err, context))),
            }
        };
        self.store.ensure_fresh(key, reported, stale_after_ms).await
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.store.get(key)
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        self.store.get_as(key)
    }

    pub fn patch<F>(&self, prefix: &CacheKey, updater: F) -> usize
    where
        F: FnMut(&mut Value),
    {
        self.store.patch(prefix, updater)
    }

    pub fn invalidate(&self, prefix: &CacheKey, refetch: bool) -> usize {
        self.dispatcher.invalidate(prefix, refetch)
    }

    /// Cache change notifications for UI bindings.
    pub fn changes(&self) -> broadcast::Receiver<CacheChange> {
        self.store.subscribe()
    }

    // == Writes ==
    /// Applies the mutation optimistically and settles it in the background.
    pub fn mutate(&self, mutation: Mutation) -> Result<MutationHandle> {
        self.coordinator.trigger(mutation)
    }

    pub async fn run_mutation(&self, mutation: Mutation) -> Result<Value> {
        self.coordinator.run(mutation).await
    }

    // == Realtime ==
    pub fn subscribe_topic<F>(&self, topic: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        self.channel.subscribe(topic, handler)
    }

    pub fn unsubscribe_topic(&self, id: HandlerId) -> bool {
        self.channel.unsubscribe(id)
    }

    pub fn send(&self, envelope: &Envelope) -> bool {
        self.channel.send(envelope)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.channel.watch_state()
    }

    pub fn retry_realtime(&self) {
        self.channel.retry();
    }

    pub fn realtime(&self) -> &ChannelManager {
        &self.channel
    }

    // == Errors ==
    /// Funnels any failure through classification and recovery.
    pub fn report_error(&self, err: &SyncError, context: ErrorContext) -> ClassifiedError {
        self.recovery.report(err, context)
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notifier.subscribe()
    }

    pub fn recent_errors(&self) -> Vec<ClassifiedError> {
        self.recovery.recent_errors()
    }

    pub fn prune_errors(&self) -> usize {
        self.recovery.prune()
    }

    // == Accessors ==
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    pub fn pending_mutations(&self) -> usize {
        self.coordinator.active_count()
    }
}
