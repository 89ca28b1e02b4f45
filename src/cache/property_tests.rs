//! Property-Based Tests for Cache Module
//!
//! Uses proptest to check the key, rollback, eviction, backoff and
//! classification laws the sync engine relies on.

use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::cache::{CacheStore, OwnerStamp};
use crate::keys::CacheKey;
use crate::mutation::OptimisticContext;
use crate::realtime::ReconnectPolicy;
use crate::recovery::{classify, ErrorKind, RetryPolicy, Severity};

// == Test Configuration ==
const TEST_MAX_ENTRIES: usize = 16;
const TEST_STALE_MS: u64 = 30_000;
const MUTATION: u64 = 1;

// == Strategies ==
fn segment_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9_]{1,8}"
}

fn key_strategy() -> impl Strategy<Value = CacheKey> {
    prop::collection::vec(segment_strategy(), 1..4).prop_map(CacheKey::new)
}

/// Keys inside a small namespace so prefixes actually collide.
fn shared_key_strategy() -> impl Strategy<Value = CacheKey> {
    prop::collection::vec(prop::sample::select(vec!["a", "b", "c"]), 1..4).prop_map(CacheKey::new)
}

fn value_strategy() -> impl Strategy<Value = Value> {
    (any::<i64>(), "[a-z ]{0,12}").prop_map(|(n, s)| json!({"n": n, "s": s}))
}

fn store() -> CacheStore {
    CacheStore::new(1024, TEST_STALE_MS)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // Any extension of a key is addressed by it and the empty key addresses
    // everything.
    #[test]
    fn prop_extension_starts_with_prefix(
        prefix in prop::collection::vec(segment_strategy(), 0..3),
        suffix in prop::collection::vec(segment_strategy(), 0..3),
    ) {
        let base = CacheKey::new(prefix.clone());
        let full = CacheKey::new(prefix.into_iter().chain(suffix));
        prop_assert!(full.starts_with(&base));
        prop_assert!(full.starts_with(&CacheKey::default()));
    }

    // The display form parses back to the same string-segment key.
    #[test]
    fn prop_display_parse_round_trip(key in key_strategy()) {
        prop_assert_eq!(CacheKey::parse(&key.to_string()), key);
    }

    // Invalidation touches exactly the keys under the prefix.
    #[test]
    fn prop_invalidate_matches_prefix(
        keys in prop::collection::btree_set(shared_key_strategy(), 1..12),
        prefix in shared_key_strategy(),
    ) {
        let store = store();
        for key in &keys {
            store.set(key.clone(), json!(1));
        }

        let mut touched = store.invalidate(&prefix);
        touched.sort();
        let expected: Vec<CacheKey> = keys.iter().filter(|k| k.starts_with(&prefix)).cloned().collect();
        prop_assert_eq!(touched, expected);

        for key in &keys {
            let entry = store.get(key).unwrap();
            prop_assert_eq!(entry.fetched_at.is_none(), key.starts_with(&prefix));
        }
    }

    // Rolling back a mutation with no interleaved writes restores every key
    // it touched, including dropping keys it created.
    #[test]
    fn prop_rollback_restores_prior_state(
        initial in prop::collection::btree_map(shared_key_strategy(), value_strategy(), 0..8),
        speculative in prop::collection::btree_map(shared_key_strategy(), value_strategy(), 1..8),
    ) {
        let store = store();
        for (key, value) in &initial {
            store.set(key.clone(), value.clone());
        }
        let before: BTreeMap<CacheKey, Option<Value>> = initial
            .keys()
            .map(|k| (k.clone(), store.get(k).and_then(|e| e.value)))
            .collect();

        let prefixes: Vec<CacheKey> = speculative.keys().cloned().collect();
        let ctx = OptimisticContext::capture(&store, MUTATION, prefixes, json!(null));
        for (key, value) in &speculative {
            store.write(key, value.clone(), OwnerStamp::Owner(MUTATION));
        }
        ctx.rollback(&store, |_| false);

        for (key, value) in &before {
            prop_assert_eq!(&store.get(key).and_then(|e| e.value), value);
        }
        for key in speculative.keys().filter(|k| !initial.contains_key(*k)) {
            prop_assert!(store.get(key).is_none(), "created key {} survived rollback", key);
        }
        prop_assert!(store.entries(&CacheKey::default()).iter().all(|e| e.owner.is_none()));
    }

    // Authoritative writes landing after the speculative one survive rollback.
    #[test]
    fn prop_authoritative_write_survives_rollback(
        speculative in prop::collection::btree_map(shared_key_strategy(), value_strategy(), 1..8),
        pushed in prop::collection::vec(any::<prop::sample::Index>(), 0..4),
    ) {
        let store = store();
        let keys: Vec<CacheKey> = speculative.keys().cloned().collect();
        let ctx = OptimisticContext::capture(&store, MUTATION, keys.clone(), json!(null));
        for (key, value) in &speculative {
            store.write(key, value.clone(), OwnerStamp::Owner(MUTATION));
        }
        let pushed: Vec<CacheKey> = pushed.iter().map(|i| i.get(&keys).clone()).collect();
        for key in &pushed {
            store.set(key.clone(), json!("server"));
        }

        ctx.rollback(&store, |_| false);

        for key in &pushed {
            prop_assert_eq!(store.get(key).and_then(|e| e.value), Some(json!("server")));
        }
    }

    // Unowned entries never exceed the capacity bound.
    #[test]
    fn prop_capacity_bound_holds(keys in prop::collection::vec(key_strategy(), 1..64)) {
        let store = CacheStore::new(TEST_MAX_ENTRIES, TEST_STALE_MS);
        for key in keys {
            store.set(key, json!(true));
            prop_assert!(store.len() <= TEST_MAX_ENTRIES);
        }
    }

    // Reconnect delays never shrink and never pass the ceiling.
    #[test]
    fn prop_reconnect_delay_monotonic_and_capped(
        base_ms in 1u64..5_000,
        max_ms in 1u64..120_000,
        attempt in 0u32..64,
    ) {
        let policy = ReconnectPolicy {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
            max_attempts: 10,
        };
        prop_assert!(policy.delay(attempt) <= policy.delay(attempt + 1));
        prop_assert!(policy.delay(attempt) <= policy.max);
    }

    #[test]
    fn prop_retry_backoff_monotonic_and_capped(
        base_ms in 1u64..5_000,
        max_ms in 1u64..120_000,
        attempt in 0u32..64,
    ) {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            ..RetryPolicy::default()
        };
        prop_assert!(policy.backoff(attempt) <= policy.backoff(attempt + 1));
        prop_assert!(policy.backoff(attempt) <= policy.max_delay);
    }

    // A maintenance message wins over any status.
    #[test]
    fn prop_maintenance_overrides_status(
        status in prop::option::of(100u16..600),
        before in "[a-z ]{0,10}",
        after in "[a-z ]{0,10}",
    ) {
        let verdict = classify(status, &format!("{} MAINTENANCE {}", before, after));
        prop_assert_eq!(verdict.kind, ErrorKind::Maintenance);
        prop_assert_eq!(verdict.severity, Severity::Critical);
        prop_assert!(!verdict.retryable && !verdict.recoverable);
    }

    // Every 5xx other than 504 is a retryable server error.
    #[test]
    fn prop_server_errors_are_retryable(status in 500u16..600, message in "[a-z ]{0,20}") {
        prop_assume!(status != 504 && !message.contains("maintenance"));
        let verdict = classify(Some(status), &message);
        prop_assert_eq!(verdict.kind, ErrorKind::Server);
        prop_assert!(verdict.retryable);
    }
}
