//! Invalidation & Patch Dispatcher
//!
//! Translates domain events (`order.created`, `product.updated`,
//! `stock.changed`, ...) into cache store operations: list prepend/remove,
//! identity-matched merges, detail writes and aggregate invalidation.
//!
//! Aggregates (`stock:summary`, `dashboard:stats`) are never patched in
//! place; they are marked stale and refetched from the backend.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::cache::{CacheStore, OwnerStamp};
use crate::error::Result;
use crate::keys::{self, CacheKey, EntityKind};
use crate::recovery::RetryPolicy;

// == Domain Event ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Created,
    Updated,
    Deleted,
}

impl EventAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "created" | "create" | "added" => Some(EventAction::Created),
            "updated" | "update" | "changed" => Some(EventAction::Updated),
            "deleted" | "delete" | "removed" => Some(EventAction::Deleted),
            _ => None,
        }
    }
}

/// A change to one server-owned entity.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub entity: EntityKind,
    pub action: EventAction,
    /// The entity (or the changed fields of it)
    pub payload: Value,
}

impl DomainEvent {
    pub fn new(entity: EntityKind, action: EventAction, payload: Value) -> Self {
        Self {
            entity,
            action,
            payload,
        }
    }

    /// Builds an event from a realtime topic and its payload.
    ///
    /// The payload is either `{"action": "...", "data": {...}}` or the entity
    /// itself with an optional `action` field. A missing action means update.
    pub fn from_topic(topic: &str, payload: &Value) -> Option<Self> {
        let entity = EntityKind::from_topic(topic)?;
        let action = payload
            .get("action")
            .and_then(Value::as_str)
            .and_then(EventAction::parse)
            .unwrap_or(EventAction::Updated);
        let data = match payload.get("data") {
            Some(data) => data.clone(),
            None => {
                let mut data = payload.clone();
                if let Some(map) = data.as_object_mut() {
                    map.remove("action");
                }
                data
            }
        };
        Some(Self::new(entity, action, data))
    }

    pub fn id(&self) -> Option<String> {
        entity_id(self.entity, &self.payload)
    }
}

/// Identity of an entity payload; numeric ids are rendered as strings.
pub fn entity_id(kind: EntityKind, payload: &Value) -> Option<String> {
    match payload.get(kind.id_field())? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// == List Helpers ==
fn items_mut(list: &mut Value) -> Option<&mut Vec<Value>> {
    match list {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.get_mut("items").and_then(Value::as_array_mut),
        _ => None,
    }
}

fn bump_total(list: &mut Value, delta: i64) {
    if let Some(total) = list.get_mut("total") {
        if let Some(n) = total.as_i64() {
            *total = json!((n + delta).max(0));
        }
    }
}

/// Shallow merge of `patch` into `target`; non-objects are replaced.
fn merge(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target), Some(patch)) => {
            for (k, v) in patch {
                target.insert(k.clone(), v.clone());
            }
        }
        _ => *target = patch.clone(),
    }
}

fn position_of(kind: EntityKind, items: &[Value], id: &str) -> Option<usize> {
    items
        .iter()
        .position(|item| entity_id(kind, item).as_deref() == Some(id))
}

// == Dispatcher ==
pub struct Dispatcher {
    store: CacheStore,
    backend: Arc<dyn Backend>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(store: CacheStore, backend: Arc<dyn Backend>, retry: RetryPolicy) -> Self {
        Self {
            store,
            backend,
            retry,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    // == Realtime Path ==
    /// Applies a server-pushed event. Touched entries lose any mutation
    /// ownership, and affected aggregates are invalidated and refetched.
    pub fn apply(&self, event: &DomainEvent) -> usize {
        let touched = self.apply_with(event, OwnerStamp::Clear);
        let aggregates = Self::aggregates_for(event);
        if !aggregates.is_empty() {
            self.invalidate_aggregates(&aggregates);
        }
        debug!(entity = %event.entity, action = ?event.action, touched, "Applied event");
        touched
    }

    /// Applies an event to detail and list keys under the given stamp.
    /// Returns the number of entries touched.
    pub fn apply_with(&self, event: &DomainEvent, stamp: OwnerStamp) -> usize {
        let Some(id) = event.id() else {
            warn!(entity = %event.entity, "Event payload has no identity, ignoring");
            return 0;
        };
        let kind = event.entity;
        let mut touched = match event.action {
            EventAction::Created => self.created(kind, &id, &event.payload, stamp),
            EventAction::Updated => self.updated(kind, &id, &event.payload, stamp),
            EventAction::Deleted => self.deleted(kind, &id, stamp),
        };

        // Stock levels are mirrored on the product they belong to.
        if kind == EntityKind::Stock && event.action != EventAction::Deleted {
            if let Some(quantity) = event.payload.get("quantity") {
                let patch = json!({ "id": id, "stock": quantity });
                touched += self.updated(EntityKind::Product, &id, &patch, stamp);
            }
        }
        touched
    }

    fn created(&self, kind: EntityKind, id: &str, entity: &Value, stamp: OwnerStamp) -> usize {
        self.store.write(&keys::detail(kind, id), entity.clone(), stamp);
        let lists = self.store.patch_where(&keys::lists(kind), stamp, |_, list| {
            let Some(items) = items_mut(list) else {
                return false;
            };
            match position_of(kind, items, id) {
                Some(index) => merge(&mut items[index], entity),
                None => {
                    items.insert(0, entity.clone());
                    bump_total(list, 1);
                }
            }
            true
        });
        1 + lists
    }

    fn updated(&self, kind: EntityKind, id: &str, patch: &Value, stamp: OwnerStamp) -> usize {
        let detail_key = keys::detail(kind, id);
        let detail = self.store.patch_where(&detail_key, stamp, |key, value| {
            if key != &detail_key {
                return false;
            }
            merge(value, patch);
            true
        });
        let lists = self.store.patch_where(&keys::lists(kind), stamp, |_, list| {
            let Some(items) = items_mut(list) else {
                return false;
            };
            match position_of(kind, items, id) {
                Some(index) => {
                    merge(&mut items[index], patch);
                    true
                }
                None => false,
            }
        });
        detail + lists
    }

    fn deleted(&self, kind: EntityKind, id: &str, stamp: OwnerStamp) -> usize {
        let detail = usize::from(self.store.delete_key(&keys::detail(kind, id), stamp));
        let lists = self.store.patch_where(&keys::lists(kind), stamp, |_, list| {
            let Some(items) = items_mut(list) else {
                return false;
            };
            match position_of(kind, items, id) {
                Some(index) => {
                    items.remove(index);
                    bump_total(list, -1);
                    true
                }
                None => false,
            }
        });
        detail + lists
    }

    /// Aggregate keys an event makes stale.
    pub fn aggregates_for(event: &DomainEvent) -> Vec<CacheKey> {
        let price_sensitive = event.payload.get("price").is_some()
            || event.payload.get("stock").is_some()
            || event.action != EventAction::Updated;
        match event.entity {
            EntityKind::Stock | EntityKind::Order => keys::aggregates(),
            EntityKind::Product if price_sensitive => keys::aggregates(),
            _ => Vec::new(),
        }
    }

    // == Invalidation ==
    /// Marks entries under `prefix` stale; with `refetch`, reloads those
    /// entries in the background.
    pub fn invalidate(&self, prefix: &CacheKey, refetch: bool) -> usize {
        let keys = self.store.invalidate(prefix);
        if refetch {
            for key in &keys {
                self.spawn_refetch(key.clone());
            }
        }
        keys.len()
    }

    /// Invalidates and refetches aggregate keys that are currently cached.
    pub fn invalidate_aggregates(&self, aggregates: &[CacheKey]) -> usize {
        aggregates
            .iter()
            .map(|key| self.invalidate(key, true))
            .sum()
    }

    /// Fetches `key` from the backend through the store's fetch guard, even
    /// if the cached value is still fresh.
    pub async fn refetch(&self, key: &CacheKey) -> Result<Value> {
        self.store.invalidate(key);
        let stale_after = self
            .store
            .get(key)
            .map(|e| e.stale_after_ms)
            .unwrap_or_else(|| self.store.default_stale_ms());
        let fetch = self.fetcher(key.clone());
        self.store.ensure_fresh(key, fetch, stale_after).await
    }

    /// Builds a fetcher for `key` running through the retry policy.
    pub fn fetcher(
        &self,
        key: CacheKey,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<Value>> + Send + 'static {
        let backend = self.backend.clone();
        let retry = self.retry.clone();
        move || async move { retry.run("fetch", || backend.fetch(&key)).await }.boxed()
    }

    fn spawn_refetch(&self, key: CacheKey) {
        if tokio::runtime::Handle::try_current().is_err() {
            debug!(key = %key, "No runtime, leaving entry stale");
            return;
        }
        let store = self.store.clone();
        let stale_after = store
            .get(&key)
            .map(|e| e.stale_after_ms)
            .unwrap_or_else(|| store.default_stale_ms());
        let fetch = self.fetcher(key.clone());
        tokio::spawn(async move {
            if let Err(err) = store.ensure_fresh::<Value, _, _>(&key, fetch, stale_after).await {
                debug!(key = %key, error = %err, "Background refetch failed");
            }
        });
    }
}
