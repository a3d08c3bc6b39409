//! # Stratum Verify
//!
//! Offline structural checker for Stratum stores.
//!
//! ## ⚠️ Internal Implementation Detail
//!
//! **This crate is an internal implementation detail of Stratum.**
//!
//! Users should depend on the main `stratum` crate instead, which provides
//! the stable public API.
//!
//! ---
//!
//! The verifier never writes to the store it checks. It keeps one mark
//! byte per atom in a separate scratch store and reaches every chunk by
//! up to four routes:
//!
//! ```text
//! 1. chunk walk     header after header from the data area to the end
//! 2. free lists     FLT head of every class along the next links
//! 3. handles        every head chunk, its chain and its redirect target
//! 4. tree           meta cell, nodes and spilled items from the root
//! ```
//!
//! A final pass over the marks requires the routes to agree: free chunks
//! are listed exactly once, used chunks are owned exactly once, and no
//! route points into the middle of a chunk. Any disagreement is an
//! [`Error::Inconsistent`] naming the offending handle.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod marks;
pub mod stats;
mod tree;

pub use stats::{TreeStats, VerifyStats};

use marks::{Marks, FREE, LISTED, OWNED, START, TREE};
use stratum_core::{Error, Handle, Result, Store};
use stratum_storage::chunk::{class_of, ATOM, DATA_START, SIZE_CLASSES, TRAILER};
use stratum_storage::{Allocator, ChunkInfo, ChunkKind, KeyComparator};
use tracing::info;
use tree::TreeWalk;

/// Checks an allocator's store, and optionally one tree inside it
pub struct Verifier<'a, S: Store> {
    alloc: &'a Allocator<S>,
    cmp: Option<&'a dyn KeyComparator>,
}

impl<'a, S: Store> Verifier<'a, S> {
    /// Verifier for `alloc`; tree keys are not order-checked
    pub fn new(alloc: &'a Allocator<S>) -> Self {
        Self { alloc, cmp: None }
    }

    /// Also check tree key order with `cmp`
    pub fn with_comparator(mut self, cmp: &'a dyn KeyComparator) -> Self {
        self.cmp = Some(cmp);
        self
    }

    /// Run every check, using `scratch` for bookkeeping. `tree` is the
    /// meta handle of a tree to walk as well.
    pub fn verify<M: Store>(&self, scratch: &mut M, tree: Option<Handle>) -> Result<VerifyStats> {
        let size = self.alloc.size()?;
        if size < DATA_START {
            return Err(Error::inconsistent(0, "store is smaller than its header"));
        }
        let mut marks = Marks::new(scratch, (size - DATA_START) / ATOM)?;
        let mut stats = VerifyStats {
            store_size: size,
            ..Default::default()
        };

        self.walk_chunks(&mut marks, &mut stats)?;
        self.walk_free_lists(&mut marks, &mut stats)?;
        if let Some(tree) = tree {
            stats.tree = Some(TreeWalk::new(self.alloc, &mut marks, self.cmp).run(tree)?);
        }
        cross_check(&marks)?;

        info!(
            size,
            chunks = stats.total_chunks,
            used = stats.used_chunks,
            free = stats.free_chunks,
            handles = stats.handles,
            "store verified"
        );
        Ok(stats)
    }

    /// Route 1 and 3: tile the data area and resolve every handle on the way
    fn walk_chunks<M: Store>(&self, marks: &mut Marks<'_, M>, stats: &mut VerifyStats) -> Result<()> {
        let mut previous_free: Option<Handle> = None;
        for chunk in self.alloc.chunks()? {
            let chunk = chunk.map_err(escalate)?;
            stats.total_chunks += 1;

            if chunk.kind() == ChunkKind::Free {
                if let Some(previous) = previous_free {
                    return Err(Error::inconsistent(
                        chunk.handle.raw(),
                        format!("free chunk follows free chunk {}", previous),
                    ));
                }
                previous_free = Some(chunk.handle);
                stats.free_chunks += 1;
                stats.free_bytes += chunk.span();
                marks.set(chunk.handle, START | FREE)?;
                continue;
            }

            previous_free = None;
            stats.used_chunks += 1;
            stats.used_bytes += chunk.span();
            stats.padding_bytes += padding(&chunk);
            *stats.used_histogram.entry(chunk.atoms()).or_insert(0) += 1;
            marks.set(chunk.handle, START)?;

            let is_handle = match chunk.kind() {
                ChunkKind::Short | ChunkKind::Long => !chunk.header.is_relocated(),
                ChunkKind::Redirect => true,
                _ => false,
            };
            if is_handle {
                self.check_handle(marks, stats, chunk.handle)?;
            }
        }
        Ok(())
    }

    fn check_handle<M: Store>(
        &self,
        marks: &mut Marks<'_, M>,
        stats: &mut VerifyStats,
        handle: Handle,
    ) -> Result<()> {
        let info = self.alloc.content_info(handle).map_err(escalate)?;
        for chunk in &info.chunks {
            if marks.set(chunk.handle, OWNED)? & OWNED != 0 {
                return Err(Error::inconsistent(
                    chunk.handle.raw(),
                    format!("chunk owned by more than one handle (again by {})", handle),
                ));
            }
        }

        stats.handles += 1;
        stats.content_bytes += info.content_len;
        if info.relocated_to.is_some() {
            stats.relocations += 1;
        }
        if info.compressed {
            stats.compressed += 1;
        }
        if info.chunks.iter().any(|c| c.kind() == ChunkKind::Long) {
            stats.long_chains += 1;
        }
        Ok(())
    }

    /// Route 2: every free list, with back links and classes checked
    fn walk_free_lists<M: Store>(&self, marks: &mut Marks<'_, M>, stats: &mut VerifyStats) -> Result<()> {
        for class in 0..SIZE_CLASSES {
            let mut previous = Handle::NULL;
            for entry in self.alloc.free_list(class)? {
                let entry = entry.map_err(escalate)?;
                if entry.header.prev != previous {
                    return Err(Error::inconsistent(
                        entry.handle.raw(),
                        format!(
                            "prev link is {} but the chunk was reached from {}",
                            entry.header.prev, previous
                        ),
                    ));
                }
                if class_of(entry.atoms()) != class {
                    return Err(Error::inconsistent(
                        entry.handle.raw(),
                        format!("free chunk of {} atoms on the list of class {}", entry.atoms(), class),
                    ));
                }
                if marks.set(entry.handle, LISTED)? & LISTED != 0 {
                    return Err(Error::inconsistent(entry.handle.raw(), "free chunk listed twice"));
                }
                stats.free_classes[class] += 1;
                previous = entry.handle;
            }
        }
        Ok(())
    }
}

/// Verify `alloc` and, if given, the tree whose meta cell is `tree`
pub fn verify<S: Store, M: Store>(
    alloc: &Allocator<S>,
    scratch: &mut M,
    tree: Option<Handle>,
) -> Result<VerifyStats> {
    Verifier::new(alloc).verify(scratch, tree)
}

/// Final pass: the routes must agree on every marked atom
fn cross_check<M: Store>(marks: &Marks<'_, M>) -> Result<()> {
    marks.scan(|handle, mark| {
        if mark & START == 0 {
            return Err(Error::inconsistent(handle.raw(), "reference into the middle of a chunk"));
        }
        if mark & FREE != 0 {
            if mark & LISTED == 0 {
                return Err(Error::inconsistent(handle.raw(), "free chunk is on no free list"));
            }
            if mark & (OWNED | TREE) != 0 {
                return Err(Error::inconsistent(handle.raw(), "free chunk is referenced as content"));
            }
        } else {
            if mark & LISTED != 0 {
                return Err(Error::inconsistent(handle.raw(), "used chunk is on a free list"));
            }
            if mark & OWNED == 0 {
                return Err(Error::inconsistent(handle.raw(), "used chunk is owned by no handle"));
            }
        }
        Ok(())
    })
}

/// Bytes of a used chunk that hold neither header, payload nor trailer
fn padding(chunk: &ChunkInfo) -> u64 {
    chunk
        .span()
        .saturating_sub(chunk.header.kind.header_len() + TRAILER + chunk.header.len as u64)
}

/// Structure errors found while verifying are inconsistencies of the store
pub(crate) fn escalate(err: Error) -> Error {
    match err {
        Error::CorruptChunk { handle, reason } | Error::InvalidHandle { handle, reason } => {
            Error::Inconsistent { handle, reason }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::MemStore;
    use stratum_storage::{BTree, BTreeConfig, Bytewise};

    #[test]
    fn test_empty_store() {
        let alloc = Allocator::new(MemStore::new()).unwrap();
        let stats = verify(&alloc, &mut MemStore::new(), None).unwrap();
        assert_eq!(stats.total_chunks, 0);
        assert_eq!(stats.store_size, DATA_START);
        assert_eq!(stats.free_ratio(), 0.0);
        assert!(stats.tree.is_none());
    }

    #[test]
    fn test_counts_after_mixed_operations() {
        let mut alloc = Allocator::new(MemStore::new()).unwrap();
        let a = alloc.allocate(&[1; 10], false).unwrap();
        let b = alloc.allocate(&[2; 5000], false).unwrap();
        let c = alloc.allocate(&[3; 4000], true).unwrap();
        let _d = alloc.allocate(b"pinned", false).unwrap();
        alloc.realloc(a, &[4; 300], false).unwrap();
        alloc.free(b).unwrap();

        let stats = verify(&alloc, &mut MemStore::new(), None).unwrap();
        assert_eq!(stats.handles, 3);
        assert_eq!(stats.relocations, 1);
        assert_eq!(stats.compressed, 1);
        assert_eq!(stats.long_chains, 0);
        assert_eq!(stats.content_bytes, 300 + 4000 + 6);
        assert_eq!(stats.free_classes.iter().sum::<u64>(), stats.free_chunks);
        assert_eq!(stats.used_bytes + stats.free_bytes, stats.store_size - DATA_START);
        assert_eq!(stats.used_histogram.values().sum::<u64>(), stats.used_chunks);
        assert!(alloc.content_info(c).unwrap().compressed);
    }

    #[test]
    fn test_tree_stats() {
        let mut alloc = Allocator::new(MemStore::new()).unwrap();
        let config = BTreeConfig::default().with_max_keys(4).with_inline_limit(8);
        let tree = BTree::create(&mut alloc, Bytewise, config).unwrap();
        for i in 0..60u32 {
            tree.set(&mut alloc, format!("{:04}", i).as_bytes(), &vec![7; 20]).unwrap();
        }

        let stats = Verifier::new(&alloc)
            .with_comparator(&Bytewise)
            .verify(&mut MemStore::new(), Some(tree.handle()))
            .unwrap();
        let shape = stats.tree.unwrap();
        assert_eq!(shape.entries, 60);
        assert_eq!(shape.spilled, 60);
        assert!(shape.height >= 3);
        assert_eq!(shape.nodes, shape.leaves + shape.internal);
        // The meta cell is the only used chunk outside the tree
        assert_eq!(shape.reachable_chunks + 1, stats.used_chunks);
    }

    #[test]
    fn test_escalate() {
        assert!(matches!(
            escalate(Error::corrupt(0x90, "x")),
            Error::Inconsistent { handle: 0x90, .. }
        ));
        assert!(matches!(escalate(Error::LockPoisoned), Error::LockPoisoned));
    }
}
