// End-to-end behaviour of the public Database handle

use proptest::prelude::*;
use std::collections::BTreeMap;
use stratum::{BTreeConfig, Database, DatabaseConfig, Error, SyncMode, WalConfig};
use tempfile::tempdir;

fn key(i: u32) -> Vec<u8> {
    format!("key:{:05}", i).into_bytes()
}

fn small_nodes() -> DatabaseConfig {
    DatabaseConfig::default()
        .with_btree(BTreeConfig::default().with_max_keys(4).with_inline_limit(16))
        .with_wal(WalConfig::default().with_sync_mode(SyncMode::None))
}

#[test]
fn test_persistence_across_reopens() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(dir.path()).unwrap();
        db.put(b"key1", b"value1").unwrap();
        db.put(b"key2", b"value2").unwrap();
        db.sync().unwrap();
    }
    {
        let db = Database::open(dir.path()).unwrap();
        assert_eq!(db.get(b"key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(db.get(b"key2").unwrap(), Some(b"value2".to_vec()));
        assert_eq!(db.len().unwrap(), 2);
        assert!(!db.recovery_stats().unwrap().rolled_back);
    }
}

#[test]
fn test_tree_shape_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open_with_config(dir.path(), small_nodes()).unwrap();
        for i in 0..200 {
            db.put(&key(i), format!("value number {:05}", i).as_bytes()).unwrap();
        }
    }

    // A different tree configuration is ignored for an existing database
    let db = Database::open(dir.path()).unwrap();
    let stats = db.verify().unwrap();
    let tree = stats.tree.unwrap();
    assert_eq!(tree.entries, 200);
    assert!(tree.height >= 4);
    assert_eq!(tree.spilled, 200);
}

#[test]
fn test_ordered_access() {
    let db = Database::in_memory_with_config(small_nodes()).unwrap();
    assert_eq!(db.first().unwrap(), None);
    assert_eq!(db.last().unwrap(), None);
    assert!(db.scan(b"", 10).unwrap().is_empty());

    for i in (0..50).rev() {
        db.put(&key(i * 2), &i.to_be_bytes()).unwrap();
    }

    assert_eq!(db.first().unwrap().unwrap().0, key(0));
    assert_eq!(db.last().unwrap().unwrap().0, key(98));

    let page = db.scan(&key(11), 3).unwrap();
    let keys: Vec<_> = page.into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![key(12), key(14), key(16)]);

    assert_eq!(db.scan(&key(97), 10).unwrap().len(), 1);
    assert!(db.scan(&key(99), 10).unwrap().is_empty());
    assert_eq!(db.scan(b"", 1000).unwrap().len(), 50);
}

#[test]
fn test_explicit_batch_commit_and_rollback() {
    let db = Database::in_memory().unwrap();
    db.put(b"stable", b"1").unwrap();

    db.begin().unwrap();
    assert!(db.in_batch().unwrap());
    db.put(b"a", b"x").unwrap();
    db.put(b"b", b"y").unwrap();
    db.commit().unwrap();
    assert!(!db.in_batch().unwrap());

    db.begin().unwrap();
    db.put(b"c", b"z").unwrap();
    db.delete(b"a").unwrap();
    db.put(b"stable", b"2").unwrap();
    let stats = db.rollback().unwrap();
    assert!(stats.records_applied > 0);

    assert_eq!(db.get(b"a").unwrap(), Some(b"x".to_vec()));
    assert_eq!(db.get(b"b").unwrap(), Some(b"y".to_vec()));
    assert_eq!(db.get(b"c").unwrap(), None);
    assert_eq!(db.get(b"stable").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.len().unwrap(), 3);
    db.verify().unwrap();
}

#[test]
fn test_batch_misuse_is_invalid_state() {
    let db = Database::in_memory().unwrap();
    assert!(matches!(db.commit(), Err(Error::InvalidState(_))));
    assert!(matches!(db.rollback(), Err(Error::InvalidState(_))));

    db.begin().unwrap();
    assert!(matches!(db.begin(), Err(Error::InvalidState(_))));
    db.commit().unwrap();
}

#[test]
fn test_interrupted_batch_is_rolled_back_on_open() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open_with_config(dir.path(), small_nodes()).unwrap();
        for i in 0..100 {
            db.put(&key(i), b"committed").unwrap();
        }

        db.begin().unwrap();
        for i in 0..100 {
            db.delete(&key(i)).unwrap();
        }
        for i in 100..300 {
            db.put(&key(i), b"never committed").unwrap();
        }
        // Simulate a crash: nothing gets a chance to clean up
        std::mem::forget(db);
    }

    let db = Database::open(dir.path()).unwrap();
    let recovery = db.recovery_stats().unwrap();
    assert!(recovery.rolled_back);
    assert!(recovery.records_applied > 0);

    assert_eq!(db.len().unwrap(), 100);
    for i in 0..100 {
        assert_eq!(db.get(&key(i)).unwrap(), Some(b"committed".to_vec()));
    }
    assert_eq!(db.get(&key(150)).unwrap(), None);
    assert_eq!(db.verify().unwrap().tree.unwrap().entries, 100);
}

#[test]
fn test_clones_share_the_store() {
    let db = Database::in_memory().unwrap();
    let other = db.clone();

    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            let db = db.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    db.put(&key(t * 1000 + i), b"v").unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(other.len().unwrap(), 200);
    other.verify().unwrap();
}

#[test]
fn test_large_values_round_trip() {
    let db = Database::in_memory().unwrap();
    let big: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    db.put(b"big", &big).unwrap();
    db.put(b"big-key".repeat(100).as_slice(), b"small").unwrap();

    assert_eq!(db.get(b"big").unwrap(), Some(big));
    assert_eq!(
        db.get(b"big-key".repeat(100).as_slice()).unwrap(),
        Some(b"small".to_vec())
    );

    let stats = db.verify().unwrap();
    assert!(stats.long_chains >= 1);
    assert_eq!(stats.tree.unwrap().spilled, 2);
}

#[test]
fn test_verify_stats_serialize() {
    fn assert_serialize<T: serde::Serialize>(_: &T) {}

    let db = Database::in_memory().unwrap();
    db.put(b"k", b"v").unwrap();
    let stats = db.verify().unwrap();
    assert_serialize(&stats);
    assert_eq!(stats.handles, 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_matches_model_across_batches(
        batches in prop::collection::vec(
            (
                prop::collection::vec((0u16..300, prop::option::of(0usize..200)), 1..30),
                any::<bool>(),
            ),
            1..8,
        )
    ) {
        let db = Database::in_memory_with_config(small_nodes()).unwrap();
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        for (ops, keep) in batches {
            db.begin().unwrap();
            let mut pending = model.clone();
            for (k, value) in ops {
                let k = key(k as u32);
                match value {
                    Some(len) => {
                        let v = vec![len as u8; len];
                        db.put(&k, &v).unwrap();
                        pending.insert(k, v);
                    }
                    None => {
                        prop_assert_eq!(db.delete(&k).unwrap(), pending.remove(&k).is_some());
                    }
                }
            }
            if keep {
                db.commit().unwrap();
                model = pending;
            } else {
                db.rollback().unwrap();
            }
        }

        let all = db.scan(b"", usize::MAX).unwrap();
        let expected: Vec<_> = model.into_iter().collect();
        prop_assert_eq!(all, expected);
        db.verify().unwrap();
    }
}
