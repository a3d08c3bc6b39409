// Allocator layout and reuse tests

mod common;

use common::{all_chunks, assert_tiling, mem_allocator, used_chunks};
use proptest::prelude::*;
use stratum_core::Error;
use stratum_storage::chunk::{DATA_START, MAX_CHUNK_ATOMS};
use stratum_storage::ChunkKind;

#[test]
fn test_chain_space_is_reused_without_growth() {
    let mut alloc = mem_allocator();
    let a = alloc.allocate(&[b'a'; 10], false).unwrap();
    let b = alloc.allocate(&[b'b'; 4000], false).unwrap();
    let c = alloc.allocate(&[], false).unwrap();

    let info = alloc.content_info(b).unwrap();
    assert_eq!(info.chunks.len(), 2);
    assert_eq!(info.chunks[0].atoms(), MAX_CHUNK_ATOMS);
    assert_eq!(info.chunks[1].atoms(), 127);
    assert_eq!(used_chunks(&alloc), 4);

    let size = alloc.size().unwrap();
    alloc.free(b).unwrap();
    let d = alloc.allocate(&[b'd'; 10], false).unwrap();

    assert_eq!(alloc.size().unwrap(), size);
    assert_eq!(used_chunks(&alloc), 3);
    assert_eq!(alloc.read(a).unwrap(), vec![b'a'; 10]);
    assert_eq!(alloc.read(c).unwrap(), Vec::<u8>::new());
    assert_eq!(alloc.read(d).unwrap(), vec![b'd'; 10]);
    // d takes the front of the coalesced chain space
    assert_eq!(d, b);
    assert_tiling(&alloc);

    alloc.free(d).unwrap();
    assert!(matches!(alloc.read(d), Err(Error::InvalidHandle { .. })));
}

#[test]
fn test_free_everything_leaves_one_free_chunk() {
    let mut alloc = mem_allocator();
    let handles: Vec<_> = (0..50)
        .map(|i| alloc.allocate(&vec![i as u8; i * 97], i % 2 == 0).unwrap())
        .collect();
    for handle in handles.iter().rev().step_by(2) {
        alloc.free(*handle).unwrap();
    }
    for handle in handles.iter().rev().skip(1).step_by(2) {
        alloc.free(*handle).unwrap();
    }

    let chunks = all_chunks(&alloc);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].kind(), ChunkKind::Free);
    assert_eq!(chunks[0].handle.offset(), DATA_START);
}

#[test]
fn test_realloc_through_all_shapes() {
    let mut alloc = mem_allocator();
    let handle = alloc.allocate(b"seed", false).unwrap();
    let _neighbour = alloc.allocate(b"pins the seed in place", false).unwrap();

    for len in [10usize, 3000, 40, 9000, 0, 2024, 2025] {
        let content: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        alloc.realloc(handle, &content, false).unwrap();
        assert_eq!(alloc.read(handle).unwrap(), content, "length {}", len);
        assert_tiling(&alloc);
    }
}

#[test]
fn test_resize_may_move() {
    let mut alloc = mem_allocator();
    let handle = alloc.allocate(&[1; 20], false).unwrap();
    let _neighbour = alloc.allocate(&[2; 20], false).unwrap();

    let same = alloc.resize(handle, &[3; 8], false).unwrap();
    assert_eq!(same, handle);

    let moved = alloc.resize(handle, &[4; 500], false).unwrap();
    assert_ne!(moved, handle);
    assert_eq!(alloc.read(moved).unwrap(), vec![4; 500]);
    assert!(alloc.read(handle).is_err());
}

proptest! {
    #[test]
    fn prop_contents_round_trip(
        contents in prop::collection::vec((0usize..6000, any::<u8>(), any::<bool>()), 1..24)
    ) {
        let mut alloc = mem_allocator();
        let mut live = Vec::new();
        for (len, byte, compress) in &contents {
            let content: Vec<u8> = (0..*len).map(|i| byte.wrapping_add((i % 5) as u8)).collect();
            let handle = alloc.allocate(&content, *compress).unwrap();
            live.push((handle, content));
        }

        // Free every third allocation, then check the rest survived
        let mut kept = Vec::new();
        for (i, (handle, content)) in live.into_iter().enumerate() {
            if i % 3 == 1 {
                alloc.free(handle).unwrap();
            } else {
                kept.push((handle, content));
            }
        }
        for (handle, content) in &kept {
            prop_assert_eq!(&alloc.read(*handle).unwrap(), content);
        }
        assert_tiling(&alloc);
    }

    #[test]
    fn prop_reallocating_freed_sizes_does_not_grow(
        sizes in prop::collection::vec(1usize..3000, 1..16)
    ) {
        let mut alloc = mem_allocator();
        let handles: Vec<_> = sizes
            .iter()
            .map(|len| alloc.allocate(&vec![0x5A; *len], false).unwrap())
            .collect();
        let size = alloc.size().unwrap();

        for handle in handles {
            alloc.free(handle).unwrap();
        }
        for len in &sizes {
            alloc.allocate(&vec![0xA5; *len], false).unwrap();
        }
        prop_assert_eq!(alloc.size().unwrap(), size);
    }
}
