//! Verification statistics

use serde::Serialize;
use std::collections::BTreeMap;
use stratum_storage::chunk::SIZE_CLASSES;

/// Space accounting for one verified store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyStats {
    /// Store size in bytes, header included
    pub store_size: u64,
    /// Chunks in the data area
    pub total_chunks: u64,
    /// Used chunks of any kind
    pub used_chunks: u64,
    /// Bytes spanned by used chunks
    pub used_bytes: u64,
    /// Free chunks
    pub free_chunks: u64,
    /// Bytes spanned by free chunks
    pub free_bytes: u64,
    /// Live handles (short heads, long heads and redirects)
    pub handles: u64,
    /// Handles whose content is a chain
    pub long_chains: u64,
    /// Handles whose content is compressed
    pub compressed: u64,
    /// Handles that are redirects to a relocated target
    pub relocations: u64,
    /// Logical content bytes behind all handles
    pub content_bytes: u64,
    /// Bytes inside used chunks that hold neither header, trailer nor payload
    pub padding_bytes: u64,
    /// Used chunks by span in atoms
    pub used_histogram: BTreeMap<u64, u64>,
    /// Free chunks per size class
    pub free_classes: [u64; SIZE_CLASSES],
    /// Present when a tree was verified
    pub tree: Option<TreeStats>,
}

impl VerifyStats {
    /// Fraction of the data area that is free
    pub fn free_ratio(&self) -> f64 {
        let total = self.used_bytes + self.free_bytes;
        if total == 0 {
            return 0.0;
        }
        self.free_bytes as f64 / total as f64
    }

    /// Fraction of used bytes lost to padding
    pub fn waste_ratio(&self) -> f64 {
        if self.used_bytes == 0 {
            return 0.0;
        }
        self.padding_bytes as f64 / self.used_bytes as f64
    }
}

/// Shape of one verified tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TreeStats {
    /// Nodes of either kind
    pub nodes: u64,
    /// Leaf nodes
    pub leaves: u64,
    /// Internal nodes
    pub internal: u64,
    /// Levels from root to leaves; 0 for an empty tree
    pub height: u64,
    /// Entries found in the leaves
    pub entries: u64,
    /// Keys and values stored in chunks of their own
    pub spilled: u64,
    /// Chunks reachable from the root, meta cell excluded
    pub reachable_chunks: u64,
}
