//! Property-Based Tests for Reliable Dumps
//!
//! **Property 1: Completeness**
//!
//! For any table where some keys vanish while the dump walks it, a dump
//! that reports completion has delivered every key that stayed in the
//! table for the whole walk.
//!
//! **Property 2: Bounded work**
//!
//! A dump never performs more than `4 * max_entries` walk rounds, whether
//! or not it completes, including while another thread keeps rewriting the
//! table underneath it.

use mapcache_map::{DumpStats, Map, MapBuilder, MapConfig, MapError, MapType};
use mapcache_test_utils::fixtures::faulty_store;
use mapcache_test_utils::{FaultyStore, MapRecord, MapStore, TestKey, TestValue};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const MAX_ENTRIES: u32 = 64;

fn map_over(store: Arc<FaultyStore>) -> Map<TestKey, TestValue> {
    MapBuilder::new(MapConfig::new("dumped", MapType::Hash, MAX_ENTRIES))
        .with_opener(store)
        .build()
        .expect("valid config")
}

/// Keys with a flag telling whether they vanish when first looked up. The
/// smallest key always stays, so the table never drains completely.
fn arb_table() -> impl Strategy<Value = Vec<(u32, bool)>> {
    prop::collection::btree_map(1u32..10_000, any::<bool>(), 1..48).prop_map(|m| {
        let mut entries: Vec<_> = m.into_iter().collect();
        entries[0].1 = false;
        entries
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_dump_delivers_stable_keys(entries in arb_table()) {
        let store = faulty_store(MAX_ENTRIES);
        let mut volatile = BTreeSet::new();
        let mut stable = BTreeSet::new();
        for (key, vanishes) in &entries {
            store.inner().upsert(&TestKey(*key).to_bytes(), &TestValue(*key).to_bytes()).unwrap();
            if *vanishes {
                volatile.insert(TestKey(*key).to_bytes());
            } else {
                stable.insert(*key);
            }
        }

        let hook_volatile = volatile.clone();
        store.on_lookup(move |table, key| {
            if hook_volatile.contains(key) {
                let _ = table.delete(key);
            }
        });

        let map = map_over(store.clone());
        let mut stats = DumpStats::new(&map);
        let mut seen = BTreeSet::new();
        map.dump_reliably(|_, k, v| {
            assert_eq!(k.0, v.0);
            seen.insert(k.0);
        }, &mut stats).unwrap();

        prop_assert!(stats.completed);
        prop_assert_eq!(seen, stable);
        prop_assert_eq!(stats.lookup_failed as usize, volatile.len());
        prop_assert!(stats.lookup <= u64::from(MAX_ENTRIES) * 4);
    }

    #[test]
    fn prop_dump_is_bounded(keys in prop::collection::btree_set(0u32..1_000, 1..16)) {
        let store = faulty_store(MAX_ENTRIES);
        for key in &keys {
            store.inner().upsert(&TestKey(*key).to_bytes(), &TestValue(*key).to_bytes()).unwrap();
        }
        // Every lookup misses while the table keeps refilling.
        let refill: Vec<u32> = keys.iter().copied().collect();
        store.on_lookup(move |table, key| {
            let _ = table.delete(key);
            for k in &refill {
                let _ = table.upsert(&TestKey(*k).to_bytes(), &TestValue(*k).to_bytes());
            }
            let _ = table.delete(key);
        });

        let map = map_over(store);
        let mut stats = DumpStats::new(&map);
        let mut delivered = 0;
        let result = map.dump_reliably(|_, _, _| delivered += 1, &mut stats);

        prop_assert_eq!(result, Err(MapError::MaxLookup));
        prop_assert_eq!(delivered, 0);
        prop_assert!(!stats.completed);
        prop_assert_eq!(stats.lookup, u64::from(MAX_ENTRIES) * 4);
    }
}

#[test]
fn test_dump_terminates_under_concurrent_churn() {
    let store = faulty_store(MAX_ENTRIES);
    for key in 0..32u32 {
        store
            .inner()
            .upsert(&TestKey(key).to_bytes(), &TestValue(key).to_bytes())
            .unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let churn = {
        let table = store.inner().clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                for key in 0..32u32 {
                    let _ = table.delete(&TestKey(key).to_bytes());
                    let _ = table.upsert(&TestKey(key).to_bytes(), &TestValue(key).to_bytes());
                }
            }
        })
    };

    let map = map_over(store.clone());
    for _ in 0..16 {
        let mut stats = DumpStats::new(&map);
        let result = map.dump_reliably(
            |_, k, v| {
                assert_eq!(k.0, v.0);
                assert!(k.0 < 32);
            },
            &mut stats,
        );

        match result {
            Ok(()) => assert!(stats.completed),
            Err(e) => {
                assert_eq!(e, MapError::MaxLookup);
                assert!(!stats.completed);
            }
        }
        assert!(stats.lookup <= u64::from(MAX_ENTRIES) * 4);
    }

    stop.store(true, Ordering::SeqCst);
    churn.join().unwrap();
}
