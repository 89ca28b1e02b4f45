//! Cache Entry Module
//!
//! Defines a single cached value with its freshness metadata and the
//! mutation that currently owns it, if any.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

use crate::keys::CacheKey;
use crate::recovery::ClassifiedError;

/// Identifier of an optimistic mutation. Monotonically increasing per coordinator.
pub type MutationId = u64;

// == Cache Entry ==
/// Represents a single cache entry with value and metadata.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    /// The key this entry is stored under
    pub key: CacheKey,
    /// The cached value; `None` before the first successful fetch
    pub value: Option<Value>,
    /// When the value was last confirmed by the server (Unix milliseconds)
    pub fetched_at: Option<u64>,
    /// A fetch for this key is in flight
    pub is_fetching: bool,
    /// Freshness window in milliseconds
    pub stale_after_ms: u64,
    /// Last fetch failure, cleared by the next success
    pub error: Option<ClassifiedError>,
    /// Optimistic mutation that last wrote this entry and has not settled
    pub owner: Option<MutationId>,
    /// A rolled-back write may still be part of the value. Set when a
    /// rollback had to skip the entry because another mutation owned it
    pub needs_repair: bool,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates an empty entry that has never been fetched.
    pub fn vacant(key: CacheKey, stale_after_ms: u64) -> Self {
        Self {
            key,
            value: None,
            fetched_at: None,
            is_fetching: false,
            stale_after_ms,
            error: None,
            owner: None,
            needs_repair: false,
        }
    }

    /// Creates an entry holding a freshly confirmed value.
    pub fn fresh(key: CacheKey, value: Value, stale_after_ms: u64) -> Self {
        Self {
            value: Some(value),
            fetched_at: Some(current_timestamp_ms()),
            ..Self::vacant(key, stale_after_ms)
        }
    }

    // == Is Stale ==
    /// An entry is stale when it has no value, was never fetched (or was
    /// invalidated), or `now - fetched_at` exceeds the freshness window.
    pub fn is_stale(&self, now_ms: u64) -> bool {
        self.is_stale_within(now_ms, self.stale_after_ms)
    }

    /// Staleness judged against a caller-supplied window.
    pub fn is_stale_within(&self, now_ms: u64, window_ms: u64) -> bool {
        match (&self.value, self.fetched_at) {
            (Some(_), Some(fetched)) => now_ms.saturating_sub(fetched) > window_ms,
            _ => true,
        }
    }

    /// The entry holds speculative state of an unsettled mutation.
    pub fn is_owned(&self) -> bool {
        self.owner.is_some()
    }
}

// == Owner Stamp ==
/// How a write affects the entry's owning mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerStamp {
    /// Leave ownership untouched
    Keep,
    /// Authoritative write (server response or realtime push); drops ownership
    Clear,
    /// Speculative write by the given mutation
    Owner(MutationId),
    /// Reconciling write of a settled mutation; drops ownership but skips
    /// entries a different mutation owns
    Settle(MutationId),
}

impl OwnerStamp {
    pub(crate) fn apply(self, entry: &mut CacheEntry) {
        match self {
            OwnerStamp::Keep => {}
            OwnerStamp::Clear | OwnerStamp::Settle(_) => entry.owner = None,
            OwnerStamp::Owner(id) => entry.owner = Some(id),
        }
    }

    /// Whether a write under this stamp may touch `entry`.
    pub(crate) fn permits(self, entry: &CacheEntry) -> bool {
        match self {
            OwnerStamp::Settle(id) => entry.owner.map_or(true, |owner| owner == id),
            _ => true,
        }
    }
}

// == Snapshot ==
/// Pre-mutation state of one key, replayed on rollback.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    pub key: CacheKey,
    /// `false` when the key had no entry at snapshot time
    pub existed: bool,
    pub value: Option<Value>,
    pub fetched_at: Option<u64>,
    pub owner: Option<MutationId>,
}

impl EntrySnapshot {
    pub fn of(entry: &CacheEntry) -> Self {
        Self {
            key: entry.key.clone(),
            existed: true,
            value: entry.value.clone(),
            fetched_at: entry.fetched_at,
            owner: entry.owner,
        }
    }

    pub fn absent(key: CacheKey) -> Self {
        Self {
            key,
            existed: false,
            value: None,
            fetched_at: None,
            owner: None,
        }
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
