//! LRU Tracker Module
//!
//! Orders cache keys by recency so the store can bound its memory use.

use std::collections::VecDeque;

use crate::keys::CacheKey;

// == LRU Tracker ==
/// Tracks access order of cache keys.
///
/// - Front = most recently used
/// - Back = least recently used
#[derive(Debug, Default)]
pub struct LruTracker {
    order: VecDeque<CacheKey>,
}

impl LruTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // == Touch ==
    /// Marks a key as recently used (moves it to the front).
    pub fn touch(&mut self, key: &CacheKey) {
        self.remove(key);
        self.order.push_front(key.clone());
    }

    // == Remove ==
    pub fn remove(&mut self, key: &CacheKey) {
        self.order.retain(|k| k != key);
    }

    // == Evict ==
    /// Removes and returns the least recently used key accepted by `evictable`.
    ///
    /// Keys rejected by the predicate keep their position.
    pub fn evict_where<F>(&mut self, mut evictable: F) -> Option<CacheKey>
    where
        F: FnMut(&CacheKey) -> bool,
    {
        let index = self.order.iter().rposition(|k| evictable(k))?;
        self.order.remove(index)
    }

    /// Least recently used key, without removing it.
    pub fn peek_oldest(&self) -> Option<&CacheKey> {
        self.order.back()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.order.iter().any(|k| k == key)
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    fn k(raw: &str) -> CacheKey {
        CacheKey::parse(raw)
    }

    #[test]
    fn test_lru_touch_orders_keys() {
        let mut lru = LruTracker::new();
        lru.touch(&k("a"));
        lru.touch(&k("b"));
        lru.touch(&k("c"));

        assert_eq!(lru.len(), 3);
        assert_eq!(lru.peek_oldest(), Some(&k("a")));

        lru.touch(&k("a"));
        assert_eq!(lru.peek_oldest(), Some(&k("b")));
    }

    #[test]
    fn test_lru_evict_oldest_accepted() {
        let mut lru = LruTracker::new();
        lru.touch(&k("pinned"));
        lru.touch(&k("b"));
        lru.touch(&k("c"));

        let evicted = lru.evict_where(|key| key != &k("pinned"));
        assert_eq!(evicted, Some(k("b")));
        assert_eq!(lru.peek_oldest(), Some(&k("pinned")));
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn test_lru_evict_nothing_evictable() {
        let mut lru = LruTracker::new();
        lru.touch(&k("a"));
        assert_eq!(lru.evict_where(|_| false), None);
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn test_lru_remove() {
        let mut lru = LruTracker::new();
        lru.touch(&k("products:detail:1"));
        lru.touch(&k("products:detail:2"));
        lru.remove(&k("products:detail:1"));

        assert!(!lru.contains(&k("products:detail:1")));
        assert!(lru.contains(&k("products:detail:2")));
        lru.remove(&k("missing"));
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn test_lru_touch_same_key_multiple_times() {
        let mut lru = LruTracker::new();
        lru.touch(&k("a"));
        lru.touch(&k("a"));
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.evict_where(|_| true), Some(k("a")));
        assert!(lru.is_empty());
    }
}
