// Allocator and tree atomicity on top of the undo log

mod common;

use common::{assert_tiling, WalFixture};
use stratum_core::Store;
use stratum_storage::{BTree, BTreeConfig, Bytewise};
use stratum_wal::WalStore;

fn key(i: u32) -> Vec<u8> {
    format!("k{:05}", i).into_bytes()
}

#[test]
fn test_abandoned_batch_is_rolled_back_on_open() {
    let fixture = WalFixture::new();
    let tree_handle = {
        let mut alloc = fixture.open();
        alloc.store_mut().begin_batch().unwrap();
        let tree = BTree::create(&mut alloc, Bytewise, BTreeConfig::default().with_max_keys(4)).unwrap();
        for i in 0..100 {
            tree.set(&mut alloc, &key(i), &vec![i as u8; 300]).unwrap();
        }
        alloc.store_mut().commit().unwrap();
        tree.handle()
    };
    let committed = fixture.data_bytes();

    {
        let mut alloc = fixture.open();
        let tree = BTree::open(&alloc, Bytewise, tree_handle).unwrap();
        alloc.store_mut().begin_batch().unwrap();
        for i in 0..50 {
            tree.delete(&mut alloc, &key(i)).unwrap();
        }
        for i in 100..400 {
            tree.set(&mut alloc, &key(i), &vec![0xEE; 3000]).unwrap();
        }
        // Stop without committing
        let _abandoned = alloc.into_inner().into_inner();
    }
    assert_ne!(fixture.data_bytes(), committed);

    let alloc = fixture.open();
    assert!(alloc.store().recovery_stats().rolled_back);
    assert_eq!(fixture.data_bytes(), committed);

    let tree = BTree::open(&alloc, Bytewise, tree_handle).unwrap();
    assert_eq!(tree.len(&alloc).unwrap(), 100);
    assert_eq!(tree.get(&alloc, &key(7)).unwrap(), Some(vec![7; 300]));
    assert_eq!(tree.get(&alloc, &key(200)).unwrap(), None);
    assert_tiling(&alloc);
}

#[test]
fn test_in_session_rollback_restores_allocator_state() {
    let fixture = WalFixture::new();
    let mut alloc = fixture.open();

    alloc.store_mut().begin_batch().unwrap();
    let kept = alloc.allocate(&[1; 500], false).unwrap();
    let doomed = alloc.allocate(&[2; 500], false).unwrap();
    alloc.store_mut().commit().unwrap();
    let size = alloc.size().unwrap();

    alloc.store_mut().begin_batch().unwrap();
    alloc.free(doomed).unwrap();
    alloc.realloc(kept, &[3; 5000], true).unwrap();
    let extra = alloc.allocate(&[4; 9000], false).unwrap();
    assert_eq!(alloc.read(extra).unwrap(), vec![4; 9000]);
    alloc.store_mut().rollback().unwrap();

    assert_eq!(alloc.size().unwrap(), size);
    assert_eq!(alloc.read(kept).unwrap(), vec![1; 500]);
    assert_eq!(alloc.read(doomed).unwrap(), vec![2; 500]);
    assert_tiling(&alloc);

    // The free lists were rolled back with everything else
    for class in 0..stratum_storage::chunk::SIZE_CLASSES {
        assert!(alloc.flt_head(class).unwrap().is_null());
    }
}

#[test]
fn test_writes_outside_a_batch_are_not_logged() {
    let fixture = WalFixture::new();
    let mut alloc = fixture.open();
    let handle = alloc.allocate(b"unprotected", false).unwrap();

    let store: &WalStore<_, _> = alloc.store();
    assert!(!store.is_batch_open());
    assert_eq!(store.log().size().unwrap(), 0);
    assert_eq!(alloc.read(handle).unwrap(), b"unprotected");
}
