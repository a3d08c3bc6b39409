#![no_main]

use libfuzzer_sys::fuzz_target;
use stratum_core::{Handle, MemStore};
use stratum_storage::chunk::DATA_START;
use stratum_storage::Allocator;

fuzz_target!(|data: &[u8]| {
    if data.len() > 256 * 1024 {
        return;
    }

    // A damaged store may be rejected, but never with a panic
    let Ok(alloc) = Allocator::new(MemStore::from_bytes(data)) else {
        return;
    };
    let _ = stratum_verify::verify(&alloc, &mut MemStore::new(), None);
    let _ = stratum_verify::verify(&alloc, &mut MemStore::new(), Some(Handle::from_offset(DATA_START)));
    if let Ok(chunks) = alloc.chunks() {
        for chunk in chunks.take(10_000) {
            if let Ok(chunk) = chunk {
                let _ = alloc.read(chunk.handle);
            }
        }
    }
});
