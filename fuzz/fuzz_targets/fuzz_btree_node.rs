#![no_main]

use libfuzzer_sys::fuzz_target;
use stratum_core::Handle;
use stratum_storage::btree::node::Node;
use stratum_storage::btree::Meta;
use stratum_storage::chunk::DATA_START;

fuzz_target!(|data: &[u8]| {
    if data.len() > 64 * 1024 {
        return;
    }

    let handle = Handle::from_offset(DATA_START);
    if let Ok(node) = Node::decode(handle, data) {
        // Whatever decodes must encode again
        let _ = node.encode();
    }
    let _ = Meta::decode(handle, data);
});
