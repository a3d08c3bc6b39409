#![no_main]

use libfuzzer_sys::fuzz_target;
use stratum_core::{MemStore, Store};
use stratum_wal::record::WalRecord;
use stratum_wal::WalReader;

fuzz_target!(|data: &[u8]| {
    if data.len() > 1_000_000 {
        return;
    }

    // Decoding a single frame must never panic
    let _ = WalRecord::decode(data);

    // Nor may replaying a whole log of garbage onto a store
    let log = MemStore::from_bytes(data);
    if let Ok(mut reader) = WalReader::new(&log) {
        let _ = reader.read_all();
    }
    let mut target = MemStore::from_bytes(&[0u8; 4096]);
    let _ = stratum_wal::recovery::rollback(&mut target, &log);
    let _ = target.size();
});
