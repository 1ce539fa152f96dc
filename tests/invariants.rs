//! Property-based invariants (spec §8, invariants 1-6), driven only through
//! the public `Store`/`MapHandle` surface.

use std::collections::HashMap;

use chunkstore::{Store, StoreConfig};
use proptest::prelude::*;

fn config_at(path: &std::path::Path) -> StoreConfig {
    StoreConfig::default().file_name(path).auto_commit_delay_ms(0)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Invariant 1: a commit that changed something leaves
    /// `last_stored_version() == current_version()`, both equal to the
    /// version number `commit()` itself returned.
    #[test]
    fn commit_postcondition(key in prop::collection::vec(any::<u8>(), 1..8), val in prop::collection::vec(any::<u8>(), 0..8)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inv1.db");
        let store = Store::open(config_at(&path)).unwrap();
        let m = store.open_map("m").unwrap();
        m.put(key, val).unwrap();
        let v = store.commit().unwrap();
        prop_assert_eq!(store.last_stored_version().unwrap(), v);
        prop_assert_eq!(store.current_version(), v);
    }

    /// Invariant 2: K random keys scattered across N maps survive a
    /// close/reopen round-trip intact.
    #[test]
    fn roundtrip_survives_reopen(
        entries in prop::collection::vec(
            (0u32..4, prop::collection::vec(any::<u8>(), 1..6), prop::collection::vec(any::<u8>(), 0..6)),
            1..30,
        )
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inv2.db");

        let mut expected: HashMap<(u32, Vec<u8>), Vec<u8>> = HashMap::new();
        {
            let store = Store::open(config_at(&path)).unwrap();
            let maps: Vec<_> = (0..4u32).map(|i| store.open_map(&format!("m{i}")).unwrap()).collect();
            for (map_idx, key, val) in &entries {
                maps[*map_idx as usize].put(key.clone(), val.clone()).unwrap();
                expected.insert((*map_idx, key.clone()), val.clone());
            }
            store.commit().unwrap();
            store.close().unwrap();
        }
        {
            let store = Store::open(config_at(&path)).unwrap();
            let maps: Vec<_> = (0..4u32).map(|i| store.open_map(&format!("m{i}")).unwrap()).collect();
            for ((map_idx, key), val) in &expected {
                prop_assert_eq!(maps[*map_idx as usize].get(key).unwrap(), Some(val.clone()));
            }
            store.close().unwrap();
        }
    }

    /// Invariant 3: a commit that changes nothing does not advance the version.
    #[test]
    fn idempotent_commit_does_not_advance(key in prop::collection::vec(any::<u8>(), 1..8)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inv3.db");
        let store = Store::open(config_at(&path)).unwrap();
        let m = store.open_map("m").unwrap();
        m.put(key, b"v".to_vec()).unwrap();
        let v1 = store.commit().unwrap();
        let v2 = store.commit().unwrap();
        prop_assert_eq!(v1, v2);
    }

    /// Invariant 4: reachability soundness. Once a map is removed and enough
    /// commits pass under an aggressive retention window to trigger
    /// reclamation, data in maps that were never removed stays intact.
    #[test]
    fn reachability_soundness_after_gc(
        keep in prop::collection::vec((prop::collection::vec(any::<u8>(), 1..6), prop::collection::vec(any::<u8>(), 0..6)), 1..10),
        churn in 1u32..6,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inv4.db");
        let store = Store::open(config_at(&path)).unwrap();
        store.set_retention_time(0).unwrap();

        let survivor = store.open_map("survivor").unwrap();
        for (k, v) in &keep {
            survivor.put(k.clone(), v.clone()).unwrap();
        }
        store.commit().unwrap();

        for round in 0..churn {
            let doomed = store.open_map(&format!("doomed{round}")).unwrap();
            doomed.put(vec![round as u8], vec![round as u8]).unwrap();
            store.commit().unwrap();
            store.remove_map(&format!("doomed{round}")).unwrap();
            store.commit().unwrap();
        }

        for (k, v) in &keep {
            prop_assert_eq!(survivor.get(k).unwrap(), Some(v.clone()));
        }
        for round in 0..churn {
            prop_assert!(!store.has_map(&format!("doomed{round}")).unwrap());
        }
    }

    /// Invariant 5: the persisted file length stays block-aligned after
    /// every commit. This is the externally-observable proxy for
    /// `file.length_in_use == max(chunk.block + chunk.len)`, since the
    /// internal chunk table isn't part of the public surface.
    #[test]
    fn persisted_length_stays_block_aligned(rounds in 1usize..6) {
        const BLOCK_SIZE: u64 = 4096;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inv5.db");
        let store = Store::open(config_at(&path)).unwrap();
        let m = store.open_map("m").unwrap();
        for i in 0..rounds {
            m.put(vec![i as u8; 4], vec![i as u8; 100]).unwrap();
            store.commit().unwrap();
            let len = std::fs::metadata(&path).unwrap().len();
            prop_assert_eq!(len % BLOCK_SIZE, 0);
        }
    }

    /// Invariant 6: `oldest_version_to_keep` never moves backwards across an
    /// arbitrary interleaving of commits and version pins/unpins.
    #[test]
    fn oldest_version_to_keep_is_monotonic(ops in prop::collection::vec(0u8..3, 1..20)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inv6.db");
        let store = Store::open(config_at(&path)).unwrap();
        let m = store.open_map("m").unwrap();

        let mut pins = Vec::new();
        let mut last = store.oldest_version_to_keep();
        for (i, op) in ops.into_iter().enumerate() {
            match op {
                0 => {
                    m.put(vec![i as u8], vec![i as u8]).unwrap();
                    store.commit().unwrap();
                }
                1 => pins.push(store.register_version_usage()),
                _ => {
                    if let Some(pin) = pins.pop() {
                        store.deregister_version_usage(pin);
                    }
                }
            }
            let now = store.oldest_version_to_keep();
            prop_assert!(now >= last);
            last = now;
        }
    }
}
