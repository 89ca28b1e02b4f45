//! Cache Store Module
//!
//! Key-addressed cache of server-owned entities with per-entry freshness,
//! a per-key fetch guard and change notifications for UI bindings.
//!
//! All state sits behind one mutex that is only held for synchronous
//! bookkeeping and never across an `.await`, so every transition below is
//! atomic with respect to other tasks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::cache::entry::{current_timestamp_ms, EntrySnapshot, MutationId, OwnerStamp};
use crate::cache::{CacheEntry, CacheStats, LruTracker};
use crate::error::{Result, SyncError};
use crate::keys::CacheKey;
use crate::recovery::{ClassifiedError, ErrorContext};

type FetchOutcome = std::result::Result<Value, ClassifiedError>;
type FetchSlot = Option<FetchOutcome>;

/// Capacity of the change notification channel.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

// == Change Notifications ==
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Set,
    Patched,
    Invalidated,
    Removed,
    Evicted,
    FetchStarted,
    Fetched,
    FetchFailed,
    Restored,
}

/// Emitted after every mutation of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheChange {
    pub key: CacheKey,
    pub kind: ChangeKind,
}

impl CacheChange {
    fn new(key: &CacheKey, kind: ChangeKind) -> Self {
        Self {
            key: key.clone(),
            kind,
        }
    }
}

// == Internal State ==
#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<CacheKey, CacheEntry>,
    lru: LruTracker,
    stats: CacheStats,
    /// One receiver per key with a fetch in flight
    in_flight: HashMap<CacheKey, watch::Receiver<FetchSlot>>,
    /// Keys whose value may still carry a rolled-back write, waiting for a refetch
    repairs: BTreeSet<CacheKey>,
}

impl StoreState {
    /// Returns the entry for `key`, creating a vacant one (and evicting if
    /// the store is full) when it does not exist yet.
    fn slot(
        &mut self,
        key: &CacheKey,
        stale_after_ms: u64,
        max_entries: usize,
        changes: &mut Vec<CacheChange>,
    ) -> &mut CacheEntry {
        if !self.entries.contains_key(key) {
            self.make_room(max_entries, changes);
        }
        self.lru.touch(key);
        self.entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::vacant(key.clone(), stale_after_ms))
    }

    /// Evicts least recently used entries until one more fits. Entries with a
    /// fetch in flight or owned by an unsettled mutation are never evicted.
    fn make_room(&mut self, max_entries: usize, changes: &mut Vec<CacheChange>) {
        while self.entries.len() >= max_entries {
            let entries = &self.entries;
            let victim = self.lru.evict_where(|k| {
                entries
                    .get(k)
                    .map_or(true, |e| !e.is_fetching && !e.is_owned())
            });
            match victim {
                Some(key) => {
                    self.entries.remove(&key);
                    self.stats.record_eviction();
                    changes.push(CacheChange::new(&key, ChangeKind::Evicted));
                }
                None => {
                    debug!("No evictable entry, cache temporarily above capacity");
                    break;
                }
            }
        }
    }

    fn matching_keys(&self, prefix: &CacheKey) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn drop_entry(&mut self, key: &CacheKey) -> bool {
        self.lru.remove(key);
        self.repairs.remove(key);
        self.entries.remove(key).is_some()
    }

    /// Once nobody owns an entry flagged for repair, marks it stale and
    /// queues it for a refetch.
    fn queue_repair(&mut self, key: &CacheKey) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        if entry.needs_repair && entry.owner.is_none() {
            entry.needs_repair = false;
            entry.fetched_at = None;
            self.repairs.insert(key.clone());
        }
    }
}

enum FetchTicket {
    Fresh(Value),
    Join(watch::Receiver<FetchSlot>),
    Start(watch::Sender<FetchSlot>, watch::Receiver<FetchSlot>),
}

#[derive(Debug)]
struct StoreInner {
    state: Mutex<StoreState>,
    changes: broadcast::Sender<CacheChange>,
    max_entries: usize,
    default_stale_ms: u64,
}

// == Cache Store ==
/// Shared handle to the session's entity cache. Cloning is cheap; all clones
/// address the same entries.
#[derive(Debug, Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl CacheStore {
    // == Constructor ==
    /// Creates a store holding at most `max_entries` entries whose freshness
    /// window defaults to `default_stale_ms`. The bound is soft: entries that
    /// are fetching or owned by a mutation are never evicted.
    pub fn new(max_entries: usize, default_stale_ms: u64) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState::default()),
                changes,
                max_entries: max_entries.max(1),
                default_stale_ms,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, changes: Vec<CacheChange>) {
        for change in changes {
            // No receivers simply means no UI binding is listening.
            let _ = self.inner.changes.send(change);
        }
    }

    pub fn default_stale_ms(&self) -> u64 {
        self.inner.default_stale_ms
    }

    // == Subscribe ==
    /// Subscribes a UI binding to entry changes. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
        self.inner.changes.subscribe()
    }

    // == Get ==
    /// Synchronous read of an entry.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut state = self.lock();
        let entry = state.entries.get(key).cloned();
        if entry.is_some() {
            state.lru.touch(key);
        }
        entry
    }

    /// Reads and decodes the cached value.
    pub fn get_as<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        self.get(key)
            .and_then(|entry| entry.value)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    // == Set ==
    /// Replaces the value with a server-confirmed one and stamps `fetched_at`.
    pub fn set(&self, key: CacheKey, value: Value) {
        self.write(&key, value, OwnerStamp::Clear);
    }

    /// Writes a value under the given ownership stamp.
    ///
    /// Speculative writes (`OwnerStamp::Owner`) keep the previous `fetched_at`
    /// since the server has not confirmed them.
    pub(crate) fn write(&self, key: &CacheKey, value: Value, stamp: OwnerStamp) {
        let mut changes = Vec::new();
        {
            let mut state = self.lock();
            if state.entries.get(key).is_some_and(|e| !stamp.permits(e)) {
                debug!(key = %key, ?stamp, "Entry owned by another mutation, skipping write");
                return;
            }
            let (stale, max) = (self.inner.default_stale_ms, self.inner.max_entries);
            let entry = state.slot(key, stale, max, &mut changes);
            entry.value = Some(value);
            match stamp {
                OwnerStamp::Owner(_) => {
                    if entry.fetched_at.is_none() {
                        entry.fetched_at = Some(current_timestamp_ms());
                    }
                }
                _ => {
                    entry.fetched_at = Some(current_timestamp_ms());
                    entry.error = None;
                }
            }
            // A whole server value replaces whatever a rollback left behind.
            let authoritative = stamp == OwnerStamp::Clear;
            if authoritative {
                entry.needs_repair = false;
            }
            stamp.apply(entry);
            if authoritative {
                state.repairs.remove(key);
            }
            state.queue_repair(key);
            changes.push(CacheChange::new(key, ChangeKind::Set));
        }
        self.emit(changes);
    }

    // == Patch ==
    /// Applies `updater` to the value of every entry under `prefix`.
    /// Returns the number of entries patched.
    pub fn patch<F>(&self, prefix: &CacheKey, mut updater: F) -> usize
    where
        F: FnMut(&mut Value),
    {
        self.patch_where(prefix, OwnerStamp::Keep, |_, value| {
            updater(value);
            true
        })
    }

    /// Applies `updater` under `prefix`; entries for which it returns `true`
    /// count as changed, receive `stamp` and notify subscribers.
    pub(crate) fn patch_where<F>(&self, prefix: &CacheKey, stamp: OwnerStamp, mut updater: F) -> usize
    where
        F: FnMut(&CacheKey, &mut Value) -> bool,
    {
        let mut changes = Vec::new();
        {
            let mut state = self.lock();
            for key in state.matching_keys(prefix) {
                let Some(entry) = state.entries.get_mut(&key) else {
                    continue;
                };
                if !stamp.permits(entry) {
                    continue;
                }
                let Some(value) = entry.value.as_mut() else {
                    continue;
                };
                if updater(&key, value) {
                    stamp.apply(entry);
                    state.queue_repair(&key);
                    changes.push(CacheChange::new(&key, ChangeKind::Patched));
                }
            }
            state.stats.record_patches(changes.len());
        }
        let count = changes.len();
        self.emit(changes);
        count
    }

    // == Invalidate ==
    /// Marks every entry under `prefix` stale so the next read refetches.
    /// Values stay readable until then.
    pub fn invalidate(&self, prefix: &CacheKey) -> Vec<CacheKey> {
        let mut keys = Vec::new();
        {
            let mut state = self.lock();
            for key in state.matching_keys(prefix) {
                if let Some(entry) = state.entries.get_mut(&key) {
                    entry.fetched_at = None;
                    keys.push(key);
                }
            }
            state.stats.record_invalidations(keys.len());
        }
        self.emit(
            keys.iter()
                .map(|k| CacheChange::new(k, ChangeKind::Invalidated))
                .collect(),
        );
        keys
    }

    // == Remove ==
    /// Drops every entry under `prefix`. Returns the number removed.
    pub fn remove(&self, prefix: &CacheKey) -> usize {
        let mut changes = Vec::new();
        {
            let mut state = self.lock();
            for key in state.matching_keys(prefix) {
                if state.drop_entry(&key) {
                    changes.push(CacheChange::new(&key, ChangeKind::Removed));
                }
            }
        }
        let count = changes.len();
        self.emit(changes);
        count
    }

    /// Deletes a single key. A speculative delete leaves an owned tombstone
    /// (no value) so the owning mutation can still roll it back.
    pub(crate) fn delete_key(&self, key: &CacheKey, stamp: OwnerStamp) -> bool {
        let changed = {
            let mut state = self.lock();
            match stamp {
                OwnerStamp::Owner(_) => match state.entries.get_mut(key) {
                    Some(entry) => {
                        entry.value = None;
                        stamp.apply(entry);
                        true
                    }
                    None => false,
                },
                _ => {
                    let permitted = state.entries.get(key).is_some_and(|e| stamp.permits(e));
                    permitted && state.drop_entry(key)
                }
            }
        };
        if changed {
            self.emit(vec![CacheChange::new(key, ChangeKind::Removed)]);
        }
        changed
    }

    // == Snapshot / Rollback ==
    /// Captures the current state of every entry under each prefix. A prefix
    /// that is itself absent is recorded as an absent exact key.
    pub fn snapshot(&self, prefixes: &[CacheKey]) -> Vec<EntrySnapshot> {
        let state = self.lock();
        let mut snapshots = BTreeMap::new();
        for prefix in prefixes {
            if !state.entries.contains_key(prefix) {
                snapshots
                    .entry(prefix.clone())
                    .or_insert_with(|| EntrySnapshot::absent(prefix.clone()));
            }
            for key in state.matching_keys(prefix) {
                if let Some(entry) = state.entries.get(&key) {
                    snapshots.insert(key, EntrySnapshot::of(entry));
                }
            }
        }
        snapshots.into_values().collect()
    }

    /// Restores each snapshot whose entry is still owned by `mutation`.
    ///
    /// Entries rewritten since by an authoritative write are left alone.
    /// Entries a newer mutation has taken over are left to it but flagged for
    /// repair: once that owner lets go they are refetched, since the value
    /// may still carry this mutation's speculative change. The previous owner
    /// is reinstated only while `still_active` reports it unsettled. Returns
    /// the number restored.
    pub fn restore_if_owned<F>(
        &self,
        snapshots: &[EntrySnapshot],
        mutation: MutationId,
        still_active: F,
    ) -> usize
    where
        F: Fn(MutationId) -> bool,
    {
        let mut changes = Vec::new();
        {
            let mut state = self.lock();
            for snap in snapshots {
                let Some(owner) = state.entries.get(&snap.key).map(|e| e.owner) else {
                    continue;
                };
                match owner {
                    Some(id) if id == mutation => {}
                    Some(other) => {
                        debug!(key = %snap.key, mutation, owner = other, "Entry taken over, deferring repair");
                        if let Some(entry) = state.entries.get_mut(&snap.key) {
                            entry.needs_repair = true;
                        }
                        continue;
                    }
                    None => {
                        debug!(key = %snap.key, mutation, "Skipping rollback, entry no longer owned");
                        continue;
                    }
                }
                if snap.existed {
                    if let Some(entry) = state.entries.get_mut(&snap.key) {
                        entry.value = snap.value.clone();
                        entry.fetched_at = snap.fetched_at;
                        entry.owner = snap.owner.filter(|id| still_active(*id));
                    }
                    state.queue_repair(&snap.key);
                } else {
                    state.drop_entry(&snap.key);
                }
                changes.push(CacheChange::new(&snap.key, ChangeKind::Restored));
            }
        }
        let count = changes.len();
        self.emit(changes);
        count
    }

    /// Drops `mutation`'s ownership of every entry it still owns under `prefixes`.
    pub fn release(&self, prefixes: &[CacheKey], mutation: MutationId) -> usize {
        let mut state = self.lock();
        let mut released = Vec::new();
        for entry in state.entries.values_mut() {
            if entry.owner == Some(mutation) && prefixes.iter().any(|p| entry.key.starts_with(p)) {
                entry.owner = None;
                released.push(entry.key.clone());
            }
        }
        for key in &released {
            state.queue_repair(key);
        }
        released.len()
    }

    /// Takes the keys queued for repair. The caller refetches them.
    pub fn take_repairs(&self) -> Vec<CacheKey> {
        let mut state = self.lock();
        std::mem::take(&mut state.repairs).into_iter().collect()
    }

    // == Ensure Fresh ==
    /// Serves the cached value if it is fresh; otherwise runs `fetcher`.
    ///
    /// At most one fetch per key is in flight: concurrent callers await the
    /// same fetch and receive the same outcome. The fetch runs on its own task,
    /// so dropping every caller does not cancel it. On failure the previous
    /// value (if any) is kept and the classified error is recorded on the entry.
    pub async fn ensure_fresh<T, F, Fut>(
        &self,
        key: &CacheKey,
        fetcher: F,
        stale_after_ms: u64,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let mut rx = match self.begin_fetch(key, stale_after_ms) {
            FetchTicket::Fresh(value) => return Ok(serde_json::from_value(value)?),
            FetchTicket::Join(rx) => rx,
            FetchTicket::Start(tx, rx) => {
                self.spawn_fetch(key.clone(), tx, fetcher);
                rx
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|slot| (*slot).clone())
            .map_err(|_| SyncError::Internal(format!("fetch task for {} vanished", key)))?;

        match outcome {
            Some(Ok(value)) => Ok(serde_json::from_value(value)?),
            Some(Err(error)) => Err(SyncError::Classified(error)),
            None => Err(SyncError::Internal(format!("fetch for {} produced no outcome", key))),
        }
    }

    fn begin_fetch(&self, key: &CacheKey, stale_after_ms: u64) -> FetchTicket {
        let mut changes = Vec::new();
        let ticket = {
            let mut state = self.lock();
            let now = current_timestamp_ms();

            let fresh = state
                .entries
                .get(key)
                .filter(|e| !e.is_stale_within(now, stale_after_ms))
                .and_then(|e| e.value.clone());
            if let Some(value) = fresh {
                state.lru.touch(key);
                state.stats.record_hit();
                return FetchTicket::Fresh(value);
            }
            state.stats.record_miss();

            if let Some(rx) = state.in_flight.get(key).cloned() {
                state.stats.record_dedup();
                return FetchTicket::Join(rx);
            }

            let (tx, rx) = watch::channel(None);
            state.in_flight.insert(key.clone(), rx.clone());
            state.stats.record_fetch();
            let max = self.inner.max_entries;
            let entry = state.slot(key, stale_after_ms, max, &mut changes);
            entry.is_fetching = true;
            entry.stale_after_ms = stale_after_ms;
            changes.push(CacheChange::new(key, ChangeKind::FetchStarted));
            FetchTicket::Start(tx, rx)
        };
        self.emit(changes);
        ticket
    }

    fn spawn_fetch<F, Fut>(&self, key: CacheKey, tx: watch::Sender<FetchSlot>, fetcher: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let store = self.clone();
        tokio::spawn(async move {
            let context = ErrorContext::new("fetch").with_key(&key);
            let outcome = match AssertUnwindSafe(fetcher()).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(ClassifiedError::from_error(&err, context)),
                Err(_) => Err(ClassifiedError::from_error(
                    &SyncError::Internal("fetcher panicked".to_string()),
                    context,
                )),
            };
            store.finish_fetch(&key, &outcome);
            // Completion is ignored when every caller has gone away.
            let _ = tx.send(Some(outcome));
        });
    }

    fn finish_fetch(&self, key: &CacheKey, outcome: &FetchOutcome) {
        let mut changes = Vec::new();
        {
            let mut state = self.lock();
            state.in_flight.remove(key);
            if outcome.is_err() {
                state.stats.record_fetch_error();
            }
            let Some(entry) = state.entries.get_mut(key) else {
                debug!(key = %key, "Entry removed while fetching, dropping result");
                return;
            };
            entry.is_fetching = false;
            match outcome {
                Ok(value) if entry.owner.is_none() => {
                    entry.value = Some(value.clone());
                    entry.fetched_at = Some(current_timestamp_ms());
                    entry.error = None;
                    entry.needs_repair = false;
                    changes.push(CacheChange::new(key, ChangeKind::Fetched));
                }
                Ok(_) => {
                    debug!(key = %key, owner = ?entry.owner, "Entry owned by a mutation, keeping speculative value");
                    entry.needs_repair = true;
                }
                Err(error) => {
                    entry.error = Some(error.clone());
                    changes.push(CacheChange::new(key, ChangeKind::FetchFailed));
                }
            }
        }
        self.emit(changes);
    }

    /// True while a fetch for `key` is in flight.
    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        self.lock().in_flight.contains_key(key)
    }

    // == Inspection ==
    /// Entries under `prefix`, ordered by key.
    pub fn entries(&self, prefix: &CacheKey) -> Vec<CacheEntry> {
        let state = self.lock();
        state
            .matching_keys(prefix)
            .iter()
            .filter_map(|k| state.entries.get(k).cloned())
            .collect()
    }

    pub fn keys(&self, prefix: &CacheKey) -> Vec<CacheKey> {
        self.lock().matching_keys(prefix)
    }

    // == Stats ==
    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        let mut stats = state.stats.clone();
        stats.set_total_entries(state.entries.len());
        stats
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{self, EntityKind};
    use crate::recovery::ErrorKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn product(id: &str) -> CacheKey {
        keys::detail(EntityKind::Product, id)
    }

    #[test]
    fn test_store_set_and_get() {
        let store = CacheStore::new(100, 30_000);
        store.set(product("1"), json!({"id": "1", "price": 10}));

        let entry = store.get(&product("1")).unwrap();
        assert_eq!(entry.value, Some(json!({"id": "1", "price": 10})));
        assert!(entry.fetched_at.is_some());
        assert!(!entry.is_fetching);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_get_missing() {
        let store = CacheStore::new(100, 30_000);
        assert!(store.get(&product("nope")).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_ensure_fresh_fetches_once() {
        let store = CacheStore::new(100, 30_000);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::parse("product:42");

        let reads = (0..8).map(|_| {
            let calls = calls.clone();
            let store = store.clone();
            let key = key.clone();
            async move {
                store
                    .ensure_fresh::<Value, _, _>(
                        &key,
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(json!({"id": "42", "price": 99}))
                        },
                        30_000,
                    )
                    .await
            }
        });
        let results = futures::future::join_all(reads).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), json!({"id": "42", "price": 99}));
        }
        let stats = store.stats();
        assert_eq!(stats.fetches, 1);
        assert_eq!(stats.deduplicated, 7);
    }

    #[tokio::test]
    async fn test_fresh_value_served_without_fetch() {
        let store = CacheStore::new(100, 30_000);
        store.set(product("1"), json!({"id": "1"}));

        let value: Value = store
            .ensure_fresh(
                &product("1"),
                || async { Err(SyncError::Internal("must not fetch".to_string())) },
                30_000,
            )
            .await
            .unwrap();
        assert_eq!(value, json!({"id": "1"}));
        assert_eq!(store.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_caller_window_overrides_entry_window() {
        let store = CacheStore::new(100, 30_000);
        store.set(product("1"), json!({"v": 1}));
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let value: Value = store
            .ensure_fresh(&product("1"), || async { Ok(json!({"v": 2})) }, 0)
            .await
            .unwrap();
        assert_eq!(value, json!({"v": 2}));
        assert_eq!(store.stats().fetches, 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_previous_value() {
        let store = CacheStore::new(100, 30_000);
        store.set(product("1"), json!({"id": "1", "price": 10}));
        store.invalidate(&product("1"));

        let result: Result<Value> = store
            .ensure_fresh(
                &product("1"),
                || async {
                    Err(SyncError::Http {
                        status: 503,
                        message: "unavailable".to_string(),
                    })
                },
                30_000,
            )
            .await;

        match result {
            Err(SyncError::Classified(e)) => assert_eq!(e.kind(), ErrorKind::Server),
            other => panic!("unexpected: {:?}", other),
        }
        let entry = store.get(&product("1")).unwrap();
        assert_eq!(entry.value, Some(json!({"id": "1", "price": 10})));
        assert_eq!(entry.error.as_ref().map(|e| e.kind()), Some(ErrorKind::Server));
        assert!(!entry.is_fetching);
        assert!(!store.is_fetching(&product("1")));
    }

    #[tokio::test]
    async fn test_invalidate_triggers_refetch() {
        let store = CacheStore::new(100, 30_000);
        store.set(product("1"), json!({"v": 1}));
        assert_eq!(store.invalidate(&keys::all(EntityKind::Product)).len(), 1);

        let value: Value = store
            .ensure_fresh(&product("1"), || async { Ok(json!({"v": 2})) }, 30_000)
            .await
            .unwrap();
        assert_eq!(value, json!({"v": 2}));
        assert_eq!(store.get(&product("1")).unwrap().value, Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_fetch_survives_dropped_caller() {
        let store = CacheStore::new(100, 30_000);
        let key = product("slow");
        let pending = store.ensure_fresh::<Value, _, _>(
            &key,
            || async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(json!("done"))
            },
            30_000,
        );
        let _ = tokio::time::timeout(Duration::from_millis(1), pending).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get(&key).unwrap().value, Some(json!("done")));
    }

    #[test]
    fn test_patch_by_prefix() {
        let store = CacheStore::new(100, 30_000);
        store.set(product("1"), json!({"price": 10}));
        store.set(product("2"), json!({"price": 20}));
        store.set(keys::detail(EntityKind::Order, "1"), json!({"price": 30}));

        let patched = store.patch(&keys::details(EntityKind::Product), |value| {
            value["price"] = json!(0);
        });

        assert_eq!(patched, 2);
        assert_eq!(store.get(&product("2")).unwrap().value, Some(json!({"price": 0})));
        assert_eq!(
            store.get(&keys::detail(EntityKind::Order, "1")).unwrap().value,
            Some(json!({"price": 30}))
        );
    }

    #[test]
    fn test_remove_by_prefix() {
        let store = CacheStore::new(100, 30_000);
        store.set(product("1"), json!(1));
        store.set(product("2"), json!(2));
        assert_eq!(store.remove(&keys::all(EntityKind::Product)), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_lru_eviction_skips_owned_entries() {
        let store = CacheStore::new(2, 30_000);
        store.write(&product("owned"), json!(1), OwnerStamp::Owner(1));
        store.set(product("b"), json!(2));
        store.set(product("c"), json!(3));

        assert_eq!(store.len(), 2);
        assert!(store.get(&product("owned")).is_some());
        assert!(store.get(&product("b")).is_none());
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_rollback_restores_owned_snapshot() {
        let store = CacheStore::new(100, 30_000);
        store.set(product("1"), json!({"price": 100}));
        let snapshot = store.snapshot(&[product("1"), product("new")]);

        store.write(&product("1"), json!({"price": 80}), OwnerStamp::Owner(5));
        store.write(&product("new"), json!({"id": "new"}), OwnerStamp::Owner(5));

        let restored = store.restore_if_owned(&snapshot, 5, |_| false);
        assert_eq!(restored, 2);
        assert_eq!(store.get(&product("1")).unwrap().value, Some(json!({"price": 100})));
        assert!(store.get(&product("new")).is_none());
    }

    #[test]
    fn test_rollback_skips_newer_owner() {
        let store = CacheStore::new(100, 30_000);
        store.set(product("1"), json!({"price": 100}));
        let snapshot = store.snapshot(&[product("1")]);

        store.write(&product("1"), json!({"price": 80}), OwnerStamp::Owner(1));
        store.write(&product("1"), json!({"price": 70}), OwnerStamp::Owner(2));

        assert_eq!(store.restore_if_owned(&snapshot, 1, |_| true), 0);
        assert_eq!(store.get(&product("1")).unwrap().value, Some(json!({"price": 70})));
    }

    #[test]
    fn test_settle_skips_entries_of_other_mutations() {
        let store = CacheStore::new(100, 30_000);
        store.write(&product("1"), json!({"price": 80}), OwnerStamp::Owner(1));
        store.write(&product("1"), json!({"price": 70}), OwnerStamp::Owner(2));

        store.write(&product("1"), json!({"price": 81}), OwnerStamp::Settle(1));
        assert_eq!(store.get(&product("1")).unwrap().value, Some(json!({"price": 70})));
        assert!(!store.delete_key(&product("1"), OwnerStamp::Settle(1)));

        store.write(&product("1"), json!({"price": 71}), OwnerStamp::Settle(2));
        let entry = store.get(&product("1")).unwrap();
        assert_eq!(entry.value, Some(json!({"price": 71})));
        assert_eq!(entry.owner, None);
    }

    #[tokio::test]
    async fn test_fetch_result_does_not_clobber_owned_entry() {
        let store = CacheStore::new(100, 30_000);
        store.write(&product("1"), json!({"price": 80}), OwnerStamp::Owner(3));
        store.invalidate(&product("1"));

        let fetched: Value = store
            .ensure_fresh(&product("1"), || async { Ok(json!({"price": 100})) }, 30_000)
            .await
            .unwrap();

        assert_eq!(fetched, json!({"price": 100}));
        assert_eq!(store.get(&product("1")).unwrap().value, Some(json!({"price": 80})));
    }

    #[test]
    fn test_skipped_rollback_is_repaired_when_owner_settles() {
        let store = CacheStore::new(100, 30_000);
        let list = keys::list(EntityKind::Product, &keys::ListFilter::default());
        store.set(list.clone(), json!({"items": [{"id": "p1", "price": 100}, {"id": "p2", "price": 10}]}));
        let snapshot = store.snapshot(&[list.clone()]);

        store.write(&list, json!({"items": [{"id": "p1", "price": 80}, {"id": "p2", "price": 10}]}), OwnerStamp::Owner(1));
        store.write(&list, json!({"items": [{"id": "p1", "price": 80}, {"id": "p2", "price": 5}]}), OwnerStamp::Owner(2));

        assert_eq!(store.restore_if_owned(&snapshot, 1, |_| true), 0);
        assert!(store.get(&list).unwrap().needs_repair);
        assert!(store.take_repairs().is_empty());

        store.write(&list, json!({"items": [{"id": "p1", "price": 80}, {"id": "p2", "price": 5}]}), OwnerStamp::Settle(2));
        let entry = store.get(&list).unwrap();
        assert!(!entry.needs_repair);
        assert!(entry.is_stale(current_timestamp_ms()));
        assert_eq!(store.take_repairs(), vec![list]);
        assert!(store.take_repairs().is_empty());
    }

    #[test]
    fn test_server_value_clears_pending_repair() {
        let store = CacheStore::new(100, 30_000);
        let snapshot = store.snapshot(&[product("1")]);
        store.write(&product("1"), json!({"price": 80}), OwnerStamp::Owner(1));
        store.write(&product("1"), json!({"price": 70}), OwnerStamp::Owner(2));
        store.restore_if_owned(&snapshot, 1, |_| true);

        store.set(product("1"), json!({"price": 100}));
        assert!(!store.get(&product("1")).unwrap().needs_repair);
        assert!(store.take_repairs().is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let store = CacheStore::new(100, 30_000);
        let mut rx = store.subscribe();

        store.set(product("1"), json!(1));
        store.invalidate(&product("1"));

        assert_eq!(rx.recv().await.unwrap(), CacheChange::new(&product("1"), ChangeKind::Set));
        assert_eq!(
            rx.recv().await.unwrap(),
            CacheChange::new(&product("1"), ChangeKind::Invalidated)
        );
    }
}
