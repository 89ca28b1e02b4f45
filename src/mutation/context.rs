use serde_json::Value;

use crate::cache::{CacheStore, EntrySnapshot, MutationId};
use crate::keys::CacheKey;

/// Pre-mutation state captured when a mutation starts.
///
/// Consumed exactly once: [`commit`](Self::commit) after reconciliation or
/// [`rollback`](Self::rollback) after a rejected write.
#[derive(Debug)]
pub struct OptimisticContext {
    mutation_id: MutationId,
    previous_snapshot: Vec<EntrySnapshot>,
    speculative_value: Value,
    prefixes: Vec<CacheKey>,
}

/// Result of replaying a snapshot.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub restored: usize,
    /// Keys whose snapshot held the speculative value of a mutation that has
    /// settled since; they are refetched to converge on server state
    pub refetch: Vec<CacheKey>,
}

impl OptimisticContext {
    /// Snapshots every entry under `prefixes`. Must run before the
    /// speculative value is applied.
    pub fn capture(
        store: &CacheStore,
        mutation_id: MutationId,
        prefixes: Vec<CacheKey>,
        speculative_value: Value,
    ) -> Self {
        Self {
            mutation_id,
            previous_snapshot: store.snapshot(&prefixes),
            speculative_value,
            prefixes,
        }
    }

    pub fn mutation_id(&self) -> MutationId {
        self.mutation_id
    }

    pub fn previous_snapshot(&self) -> &[EntrySnapshot] {
        &self.previous_snapshot
    }

    pub fn speculative_value(&self) -> &Value {
        &self.speculative_value
    }

    /// Hands entries still owned by this mutation back to the store.
    pub fn commit(self, store: &CacheStore) -> usize {
        store.release(&self.prefixes, self.mutation_id)
    }

    /// Restores entries this mutation still owns. `still_active` tells
    /// whether an earlier owner recorded in the snapshot is unsettled.
    pub fn rollback<F>(self, store: &CacheStore, still_active: F) -> RollbackReport
    where
        F: Fn(MutationId) -> bool,
    {
        let refetch = self
            .previous_snapshot
            .iter()
            .filter(|snap| snap.owner.is_some_and(|owner| !still_active(owner)))
            .map(|snap| snap.key.clone())
            .collect();
        let restored = store.restore_if_owned(&self.previous_snapshot, self.mutation_id, &still_active);
        RollbackReport { restored, refetch }
    }
}
