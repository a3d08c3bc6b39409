#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use std::collections::BTreeMap;
use stratum::{BTreeConfig, Database, DatabaseConfig};

#[derive(Arbitrary, Debug)]
enum DbOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Get { key: Vec<u8> },
    Delete { key: Vec<u8> },
    Scan { start: Vec<u8>, limit: u8 },
    Begin,
    Commit,
    Rollback,
}

fuzz_target!(|ops: Vec<DbOp>| {
    let config = DatabaseConfig::default().with_btree(BTreeConfig::default().with_max_keys(4).with_inline_limit(8));
    let Ok(db) = Database::in_memory_with_config(config) else {
        return;
    };

    // Committed state, and the state including the open batch
    let mut committed: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut pending: Option<BTreeMap<Vec<u8>, Vec<u8>>> = None;

    for op in ops.iter().take(200) {
        let model = pending.as_mut().unwrap_or(&mut committed);
        match op {
            DbOp::Put { key, value } => {
                if key.len() <= 4096 && value.len() <= 4096 {
                    db.put(key, value).unwrap();
                    model.insert(key.clone(), value.clone());
                }
            }
            DbOp::Get { key } => {
                assert_eq!(db.get(key).unwrap().as_ref(), model.get(key));
            }
            DbOp::Delete { key } => {
                assert_eq!(db.delete(key).unwrap(), model.remove(key).is_some());
            }
            DbOp::Scan { start, limit } => {
                let got = db.scan(start, *limit as usize).unwrap();
                let want: Vec<_> = model
                    .range(start.clone()..)
                    .take(*limit as usize)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                assert_eq!(got, want);
            }
            DbOp::Begin => {
                if pending.is_none() {
                    db.begin().unwrap();
                    pending = Some(committed.clone());
                }
            }
            DbOp::Commit => {
                if let Some(state) = pending.take() {
                    db.commit().unwrap();
                    committed = state;
                }
            }
            DbOp::Rollback => {
                if pending.take().is_some() {
                    db.rollback().unwrap();
                }
            }
        }
    }

    let stats = db.verify().unwrap();
    let expected = pending.as_ref().unwrap_or(&committed).len() as u64;
    assert_eq!(stats.tree.map(|t| t.entries), Some(expected));
});
