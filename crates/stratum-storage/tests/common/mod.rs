// Common test utilities for storage integration tests

use std::path::PathBuf;
use stratum_core::{FileStore, MemStore, Store};
use stratum_storage::chunk::DATA_START;
use stratum_storage::{Allocator, ChunkInfo, ChunkKind};
use stratum_wal::{SyncMode, WalConfig, WalStore};
use tempfile::TempDir;

#[allow(dead_code)]
pub type WalAllocator = Allocator<WalStore<FileStore, FileStore>>;

#[allow(dead_code)]
pub fn mem_allocator() -> Allocator<MemStore> {
    Allocator::new(MemStore::new()).expect("open allocator")
}

/// Every chunk from the data area to the end of the store
#[allow(dead_code)]
pub fn all_chunks<S: Store>(alloc: &Allocator<S>) -> Vec<ChunkInfo> {
    alloc
        .chunks()
        .expect("chunk walk")
        .collect::<Result<Vec<_>, _>>()
        .expect("chunk walk")
}

#[allow(dead_code)]
pub fn used_chunks<S: Store>(alloc: &Allocator<S>) -> usize {
    all_chunks(alloc)
        .iter()
        .filter(|c| c.kind() != ChunkKind::Free)
        .count()
}

/// Check the layout invariants that hold after every operation: chunks
/// tile the data area and no two free chunks touch
#[allow(dead_code)]
pub fn assert_tiling<S: Store>(alloc: &Allocator<S>) {
    let chunks = all_chunks(alloc);
    let mut offset = DATA_START;
    for pair in chunks.windows(2) {
        assert!(
            !(pair[0].kind() == ChunkKind::Free && pair[1].kind() == ChunkKind::Free),
            "free chunks at {} and {} are adjacent",
            pair[0].handle,
            pair[1].handle
        );
    }
    for chunk in &chunks {
        assert_eq!(chunk.handle.offset(), offset, "gap before {}", chunk.handle);
        offset = chunk.end();
    }
    assert_eq!(offset, alloc.size().expect("size"));
}

/// Data and log files in a temporary directory
#[allow(dead_code)]
pub struct WalFixture {
    pub temp_dir: TempDir,
    pub data_path: PathBuf,
    pub log_path: PathBuf,
}

#[allow(dead_code)]
impl WalFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let data_path = temp_dir.path().join("store.stm");
        let log_path = temp_dir.path().join("store.wal");
        Self {
            temp_dir,
            data_path,
            log_path,
        }
    }

    pub fn open(&self) -> WalAllocator {
        let data = FileStore::open(&self.data_path).expect("Failed to open data file");
        let log = FileStore::open(&self.log_path).expect("Failed to open log file");
        let config = WalConfig::default().with_sync_mode(SyncMode::None);
        let store = WalStore::open(data, log, config).expect("Failed to open WAL store");
        Allocator::new(store).expect("Failed to open allocator")
    }

    pub fn data_bytes(&self) -> Vec<u8> {
        std::fs::read(&self.data_path).expect("Failed to read data file")
    }
}

impl Default for WalFixture {
    fn default() -> Self {
        Self::new()
    }
}
