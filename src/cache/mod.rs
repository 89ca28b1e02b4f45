//! Cache Module
//!
//! Session-scoped, memory-only cache of server-owned entities with
//! freshness tracking, a per-key fetch guard and LRU bounding.

mod entry;
mod lru;
mod stats;
mod store;

#[cfg(test)]
mod property_tests;

// Re-export public types
pub use entry::{current_timestamp_ms, CacheEntry, EntrySnapshot, MutationId, OwnerStamp};
pub use lru::LruTracker;
pub use stats::CacheStats;
pub use store::{CacheChange, CacheStore, ChangeKind};
