// Verifier behaviour on healthy and damaged stores

use proptest::prelude::*;
use stratum_core::{Error, FileStore, Handle, MemStore, Store};
use stratum_storage::btree::META_SIZE;
use stratum_storage::chunk::{class_of, FLT_OFFSET, MAX_CHUNK_ATOMS};
use stratum_storage::{Allocator, BTree, BTreeConfig, Bytewise, ChunkKind};
use stratum_verify::{verify, Verifier};
use stratum_wal::{SyncMode, WalConfig, WalStore};
use tempfile::TempDir;

fn mem_allocator() -> Allocator<MemStore> {
    Allocator::new(MemStore::new()).expect("open allocator")
}

/// Apply `damage` to the raw bytes under `alloc` and reopen it
fn tamper<F>(alloc: Allocator<MemStore>, damage: F) -> Allocator<MemStore>
where
    F: FnOnce(&mut MemStore),
{
    let mut store = alloc.into_inner();
    damage(&mut store);
    Allocator::new(store).expect("reopen allocator")
}

fn assert_inconsistent(alloc: &Allocator<MemStore>, tree: Option<Handle>) {
    match verify(alloc, &mut MemStore::new(), tree) {
        Err(Error::Inconsistent { .. }) => {}
        other => panic!("expected an inconsistency, got {:?}", other),
    }
}

#[test]
fn test_scenario_reuses_freed_chain() {
    let mut alloc = mem_allocator();
    alloc.allocate(&[b'a'; 10], false).unwrap();
    let b = alloc.allocate(&[b'b'; 4000], false).unwrap();
    alloc.allocate(&[], false).unwrap();

    let before = verify(&alloc, &mut MemStore::new(), None).unwrap();
    assert_eq!(before.long_chains, 1);
    assert_eq!(before.used_histogram.get(&MAX_CHUNK_ATOMS), Some(&1));

    let size = alloc.size().unwrap();
    alloc.free(b).unwrap();
    alloc.allocate(&[b'd'; 10], false).unwrap();
    assert_eq!(alloc.size().unwrap(), size);

    let stats = verify(&alloc, &mut MemStore::new(), None).unwrap();
    assert_eq!(stats.used_chunks, 3);
    assert_eq!(stats.handles, 3);
    assert_eq!(stats.free_chunks, 1);
    assert_eq!(stats.long_chains, 0);
    assert!(stats.free_ratio() > 0.5);
}

#[test]
fn test_tree_emptied_by_merges_reaches_nothing() {
    let mut alloc = mem_allocator();
    let tree = BTree::create(&mut alloc, Bytewise, BTreeConfig::default().with_max_keys(3)).unwrap();
    for i in 1..=400u32 {
        tree.set(&mut alloc, &i.to_be_bytes(), &[0x42; 40]).unwrap();
    }
    let full = Verifier::new(&alloc)
        .with_comparator(&Bytewise)
        .verify(&mut MemStore::new(), Some(tree.handle()))
        .unwrap();
    assert!(full.tree.as_ref().unwrap().height >= 3);

    for i in (1..=400u32).rev() {
        assert!(tree.delete(&mut alloc, &i.to_be_bytes()).unwrap());
    }
    assert!(tree.root(&alloc).unwrap().is_null());

    let empty = verify(&alloc, &mut MemStore::new(), Some(tree.handle())).unwrap();
    let shape = empty.tree.unwrap();
    assert_eq!(shape.reachable_chunks, 0);
    assert_eq!(shape.height, 0);
    assert_eq!(empty.used_chunks, 1);
}

#[test]
fn test_detects_flipped_payload_byte() {
    let mut alloc = mem_allocator();
    let handle = alloc.allocate(b"checksummed payload", false).unwrap();
    let alloc = tamper(alloc, |store| {
        store.write_at(handle.offset() + 20, b"X").unwrap();
    });
    assert_inconsistent(&alloc, None);
}

#[test]
fn test_detects_unlisted_free_chunk() {
    let mut alloc = mem_allocator();
    let doomed = alloc.allocate(&[1; 100], false).unwrap();
    alloc.allocate(&[2; 100], false).unwrap();
    alloc.free(doomed).unwrap();

    let class = class_of(alloc.inspect(doomed).unwrap().atoms());
    let alloc = tamper(alloc, |store| {
        store.write_at(FLT_OFFSET + class as u64 * 8, &0i64.to_le_bytes()).unwrap();
    });
    assert_inconsistent(&alloc, None);
}

#[test]
fn test_detects_short_chunk_retagged_as_chain_head() {
    let mut alloc = mem_allocator();
    alloc.allocate(b"before", false).unwrap();
    let tiny = alloc.allocate(b"", false).unwrap();
    alloc.allocate(b"after", false).unwrap();
    assert_eq!(alloc.inspect(tiny).unwrap().atoms(), 2);

    // Two atoms cannot hold a chain header and a trailer
    let alloc = tamper(alloc, |store| {
        store.write_at(tiny.offset(), &[0x02]).unwrap();
        store.write_at(tiny.offset() + 2 * 16 - 8, &[0x02]).unwrap();
    });
    assert!(matches!(alloc.read(tiny), Err(Error::CorruptChunk { .. })));
    assert_inconsistent(&alloc, None);
}

#[test]
fn test_detects_free_list_pointing_at_used_chunk() {
    let mut alloc = mem_allocator();
    let doomed = alloc.allocate(&[1; 100], false).unwrap();
    let used = alloc.allocate(&[2; 100], false).unwrap();
    alloc.free(doomed).unwrap();

    let alloc = tamper(alloc, |store| {
        store.write_at(doomed.offset() + 8, &used.raw().to_le_bytes()).unwrap();
    });
    assert_inconsistent(&alloc, None);
}

#[test]
fn test_detects_meta_count_mismatch() {
    let mut alloc = mem_allocator();
    let tree = BTree::create(&mut alloc, Bytewise, BTreeConfig::default()).unwrap();
    for i in 0..10u8 {
        tree.set(&mut alloc, &[i], &[i]).unwrap();
    }
    let mut meta = tree.meta(&alloc).unwrap();
    meta.len += 1;
    alloc.realloc(tree.handle(), &meta.encode(), false).unwrap();

    assert!(verify(&alloc, &mut MemStore::new(), None).is_ok());
    assert_inconsistent(&alloc, Some(tree.handle()));
}

#[test]
fn test_detects_unsorted_keys_with_comparator() {
    let mut alloc = mem_allocator();
    let reverse = |a: &[u8], b: &[u8]| b.cmp(a);
    let tree = BTree::create(&mut alloc, reverse, BTreeConfig::default()).unwrap();
    for i in 0..10u8 {
        tree.set(&mut alloc, &[i], b"").unwrap();
    }

    let ok = Verifier::new(&alloc)
        .with_comparator(&reverse)
        .verify(&mut MemStore::new(), Some(tree.handle()));
    assert!(ok.is_ok());

    let wrong = Verifier::new(&alloc)
        .with_comparator(&Bytewise)
        .verify(&mut MemStore::new(), Some(tree.handle()));
    assert!(matches!(wrong, Err(Error::Inconsistent { .. })));
}

#[test]
fn test_non_tree_handle_is_rejected() {
    let mut alloc = mem_allocator();
    let blob = alloc.allocate(&[0; META_SIZE], false).unwrap();
    assert_inconsistent(&alloc, Some(blob));
}

#[test]
fn test_recovered_store_verifies() {
    let dir = TempDir::new().unwrap();
    let data_path = dir.path().join("store.stm");
    let log_path = dir.path().join("store.wal");
    let open = || {
        let data = FileStore::open(&data_path).unwrap();
        let log = FileStore::open(&log_path).unwrap();
        let config = WalConfig::default().with_sync_mode(SyncMode::None);
        Allocator::new(WalStore::open(data, log, config).unwrap()).unwrap()
    };

    let tree_handle = {
        let mut alloc = open();
        alloc.store_mut().begin_batch().unwrap();
        let tree = BTree::create(&mut alloc, Bytewise, BTreeConfig::default().with_max_keys(5)).unwrap();
        for i in 0..80u32 {
            tree.set(&mut alloc, &i.to_be_bytes(), &[1; 90]).unwrap();
        }
        alloc.store_mut().commit().unwrap();

        alloc.store_mut().begin_batch().unwrap();
        for i in 0..60u32 {
            tree.delete(&mut alloc, &i.to_be_bytes()).unwrap();
        }
        let _abandoned = alloc.into_inner().into_inner();
        tree.handle()
    };

    let alloc = open();
    let stats = Verifier::new(&alloc)
        .with_comparator(&Bytewise)
        .verify(&mut MemStore::new(), Some(tree_handle))
        .unwrap();
    assert_eq!(stats.tree.unwrap().entries, 80);
}

proptest! {
    #[test]
    fn prop_any_allocation_history_verifies(
        ops in prop::collection::vec((0usize..5000, any::<bool>(), 0u8..4), 1..40)
    ) {
        let mut alloc = mem_allocator();
        let mut live: Vec<Handle> = Vec::new();
        for (len, compress, action) in ops {
            match action {
                0 if !live.is_empty() => {
                    let handle = live.swap_remove(len % live.len());
                    alloc.free(handle).unwrap();
                }
                1 if !live.is_empty() => {
                    let handle = live[len % live.len()];
                    alloc.realloc(handle, &vec![9; len], compress).unwrap();
                }
                _ => live.push(alloc.allocate(&vec![len as u8; len], compress).unwrap()),
            }
        }

        let stats = verify(&alloc, &mut MemStore::new(), None).unwrap();
        prop_assert_eq!(stats.handles, live.len() as u64);
        let free_seen = alloc
            .chunks()
            .unwrap()
            .filter(|c| c.as_ref().map_or(false, |c| c.kind() == ChunkKind::Free))
            .count() as u64;
        prop_assert_eq!(stats.free_chunks, free_seen);
    }
}
