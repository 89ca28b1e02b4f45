//! Cache Statistics Module
//!
//! Tracks how reads were served and how often the network was hit.

use serde::Serialize;

// == Cache Stats ==
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Reads served from a fresh cached value
    pub hits: u64,
    /// Reads that needed a fetch (missing or stale)
    pub misses: u64,
    /// Network fetches actually started
    pub fetches: u64,
    /// Reads that joined a fetch already in flight
    pub deduplicated: u64,
    /// Fetches that failed
    pub fetch_errors: u64,
    /// Entries evicted to respect the capacity bound
    pub evictions: u64,
    /// Entries rewritten in place by patches
    pub patches: u64,
    /// Entries marked stale by invalidation
    pub invalidations: u64,
    /// Current number of entries in the cache
    pub total_entries: usize,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Returns hits / (hits + misses), or 0.0 if no reads have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_fetch(&mut self) {
        self.fetches += 1;
    }

    pub fn record_dedup(&mut self) {
        self.deduplicated += 1;
    }

    pub fn record_fetch_error(&mut self) {
        self.fetch_errors += 1;
    }

    pub fn record_eviction(&mut self) {
        self.evictions += 1;
    }

    pub fn record_patches(&mut self, count: usize) {
        self.patches += count as u64;
    }

    pub fn record_invalidations(&mut self, count: usize) {
        self.invalidations += count as u64;
    }

    pub fn set_total_entries(&mut self, count: usize) {
        self.total_entries = count;
    }
}
