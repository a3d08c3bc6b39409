// Common test utilities for WAL integration tests

use std::path::PathBuf;
use stratum_core::{FileStore, Store};
use tempfile::TempDir;

/// Test fixture with a data file and a log file in a temporary directory
pub struct WalTestFixture {
    #[allow(dead_code)]
    pub temp_dir: TempDir,
    pub data_path: PathBuf,
    pub log_path: PathBuf,
}

impl WalTestFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let data_path = temp_dir.path().join("data.stm");
        let log_path = temp_dir.path().join("data.wal");

        Self {
            temp_dir,
            data_path,
            log_path,
        }
    }

    pub fn stores(&self) -> (FileStore, FileStore) {
        (
            FileStore::open(&self.data_path).expect("Failed to open data file"),
            FileStore::open(&self.log_path).expect("Failed to open log file"),
        )
    }

    /// CRC32 over the whole data file
    #[allow(dead_code)]
    pub fn data_hash(&self) -> u32 {
        let store = FileStore::open(&self.data_path).expect("Failed to open data file");
        let size = store.size().expect("size");
        let bytes = store.read_vec(0, size as usize).expect("read");
        crc32fast::hash(&bytes)
    }
}

impl Default for WalTestFixture {
    fn default() -> Self {
        Self::new()
    }
}
