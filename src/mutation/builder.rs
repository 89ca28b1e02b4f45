use serde_json::{Map, Value};

use crate::backend::{WriteMethod, WriteRequest};
use crate::dispatch::{entity_id, Dispatcher, DomainEvent, EventAction};
use crate::keys::{self, CacheKey, EntityKind};

/// A write against one entity, with the speculative change it implies.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub entity: EntityKind,
    pub action: EventAction,
    /// Entity id; a client-side temporary id for creates
    pub id: String,
    /// Speculative entity (create) or changed fields (update)
    pub payload: Value,
    pub request: WriteRequest,
    /// Extra keys to invalidate once the write succeeds
    pub invalidates: Vec<CacheKey>,
}

impl Mutation {
    fn new(entity: EntityKind, action: EventAction, id: String, payload: Value, request: WriteRequest) -> Self {
        Self {
            entity,
            action,
            id,
            payload,
            request,
            invalidates: Vec::new(),
        }
    }

    /// `POST /{resource}` with `payload` as body.
    pub fn create(entity: EntityKind, temp_id: impl Into<String>, payload: Value) -> Self {
        let request = WriteRequest::new(
            WriteMethod::Post,
            format!("/{}", entity.resource()),
            Some(payload.clone()),
        );
        Self::new(entity, EventAction::Created, temp_id.into(), payload, request)
    }

    /// `PATCH /{resource}/{id}` with the changed fields as body.
    pub fn update(entity: EntityKind, id: impl Into<String>, changes: Value) -> Self {
        let id = id.into();
        let request = WriteRequest::new(
            WriteMethod::Patch,
            format!("/{}/{}", entity.resource(), id),
            Some(changes.clone()),
        );
        Self::new(entity, EventAction::Updated, id, changes, request)
    }

    /// `DELETE /{resource}/{id}`.
    pub fn delete(entity: EntityKind, id: impl Into<String>) -> Self {
        let id = id.into();
        let request = WriteRequest::new(WriteMethod::Delete, format!("/{}/{}", entity.resource(), id), None);
        Self::new(entity, EventAction::Deleted, id, Value::Null, request)
    }

    pub fn invalidating(mut self, key: CacheKey) -> Self {
        self.invalidates.push(key);
        self
    }

    /// Overrides the generated request (custom endpoint or method).
    pub fn with_request(mut self, request: WriteRequest) -> Self {
        self.request = request;
        self
    }

    /// Short description for logs and error contexts, e.g. `update products`.
    pub fn label(&self) -> String {
        let verb = match self.action {
            EventAction::Created => "create",
            EventAction::Updated => "update",
            EventAction::Deleted => "delete",
        };
        format!("{} {}", verb, self.entity)
    }

    pub fn detail_key(&self) -> CacheKey {
        keys::detail(self.entity, self.id.as_str())
    }

    /// Every key prefix the speculative change may touch.
    pub fn affected_prefixes(&self) -> Vec<CacheKey> {
        let mut prefixes = vec![self.detail_key(), keys::lists(self.entity)];
        if self.entity == EntityKind::Stock {
            prefixes.push(keys::detail(EntityKind::Product, self.id.as_str()));
            prefixes.push(keys::lists(EntityKind::Product));
        }
        prefixes
    }

    /// Keys to invalidate and refetch after the write is confirmed.
    pub fn derived_keys(&self) -> Vec<CacheKey> {
        let mut derived = Dispatcher::aggregates_for(&self.speculative_event());
        for key in &self.invalidates {
            if !derived.contains(key) {
                derived.push(key.clone());
            }
        }
        derived
    }

    /// The change applied to the cache before the server answers.
    pub fn speculative_event(&self) -> DomainEvent {
        DomainEvent::new(self.entity, self.action, self.with_identity(self.payload.clone()))
    }

    /// The change implied by the server's answer. Falls back to the
    /// speculative payload when the response carries no entity.
    pub fn settled_event(&self, response: &Value) -> DomainEvent {
        match self.action {
            EventAction::Deleted => self.speculative_event(),
            action if response.is_object() => {
                let payload = if entity_id(self.entity, response).is_some() {
                    response.clone()
                } else {
                    self.with_identity(response.clone())
                };
                DomainEvent::new(self.entity, action, payload)
            }
            _ => self.speculative_event(),
        }
    }

    fn with_identity(&self, payload: Value) -> Value {
        let mut map = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        map.entry(self.entity.id_field())
            .or_insert_with(|| Value::String(self.id.clone()));
        Value::Object(map)
    }
}
