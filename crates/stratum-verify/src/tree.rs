// Tree walk
//
// Depth-first from the root, children left to right, so leaves are met in
// key order and the sibling chain can be checked against the visit order.

use crate::escalate;
use crate::marks::{Marks, TREE};
use crate::stats::TreeStats;
use std::cmp::Ordering;
use stratum_core::{Error, Handle, Result, Store};
use stratum_storage::btree::node::{item_bytes, load_node, Item, Node};
use stratum_storage::btree::{Meta, MAX_DEPTH};
use stratum_storage::{Allocator, ContentInfo, KeyComparator};

/// Key range a subtree must stay within: `lower <= key < upper`
#[derive(Clone, Default)]
struct Bounds {
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
}

pub struct TreeWalk<'a, 'm, 's, S: Store, M: Store> {
    alloc: &'a Allocator<S>,
    marks: &'m mut Marks<'s, M>,
    cmp: Option<&'a dyn KeyComparator>,
    stats: TreeStats,
}

impl<'a, 'm, 's, S: Store, M: Store> TreeWalk<'a, 'm, 's, S, M> {
    pub fn new(
        alloc: &'a Allocator<S>,
        marks: &'m mut Marks<'s, M>,
        cmp: Option<&'a dyn KeyComparator>,
    ) -> Self {
        Self {
            alloc,
            marks,
            cmp,
            stats: TreeStats::default(),
        }
    }

    pub fn run(mut self, tree: Handle) -> Result<TreeStats> {
        let meta = Meta::load(self.alloc, tree).map_err(escalate)?;
        self.claim(tree, false)?;

        if meta.root.is_null() {
            if meta.len != 0 {
                return Err(Error::inconsistent(
                    tree.raw(),
                    format!("empty tree claims {} entries", meta.len),
                ));
            }
            return Ok(self.stats);
        }

        let min = meta.config.min_keys();
        let max = meta.config.max_keys;
        let mut leaves: Vec<(Handle, Handle, Handle)> = Vec::new();
        let mut leaf_depth = None;
        let mut stack = vec![(meta.root, 0usize, Bounds::default())];

        while let Some((handle, depth, bounds)) = stack.pop() {
            if depth > MAX_DEPTH {
                return Err(Error::inconsistent(handle.raw(), "tree is deeper than any valid tree"));
            }
            self.claim(handle, true)?;
            let node = load_node(self.alloc, handle).map_err(escalate)?;
            self.stats.nodes += 1;

            let count = node.key_count();
            let is_root = depth == 0;
            if count > max || (!is_root && count < min) || (is_root && count == 0) {
                return Err(Error::inconsistent(
                    handle.raw(),
                    format!("node holds {} keys, allowed {}..={}", count, if is_root { 1 } else { min }, max),
                ));
            }

            match node {
                Node::Leaf(leaf) => {
                    match leaf_depth {
                        None => leaf_depth = Some(depth),
                        Some(expected) if expected != depth => {
                            return Err(Error::inconsistent(
                                handle.raw(),
                                format!("leaf at depth {}, other leaves at {}", depth, expected),
                            ));
                        }
                        Some(_) => {}
                    }
                    self.check_keys(handle, &leaf.keys, &bounds)?;
                    for value in &leaf.values {
                        self.check_item(handle, value)?;
                    }
                    self.stats.leaves += 1;
                    self.stats.entries += leaf.keys.len() as u64;
                    leaves.push((handle, leaf.prev(), leaf.next()));
                }
                Node::Internal(inner) => {
                    let keys = self.check_keys(handle, &inner.keys, &bounds)?;
                    self.stats.internal += 1;
                    // Pushed right to left so the leftmost child is visited first
                    for i in (0..inner.children.len()).rev() {
                        let child = Bounds {
                            lower: if i == 0 { bounds.lower.clone() } else { Some(keys[i - 1].clone()) },
                            upper: if i == keys.len() { bounds.upper.clone() } else { Some(keys[i].clone()) },
                        };
                        stack.push((inner.child(i), depth + 1, child));
                    }
                }
            }
        }

        check_sibling_chain(&leaves)?;
        if self.stats.entries != meta.len {
            return Err(Error::inconsistent(
                tree.raw(),
                format!(
                    "meta cell claims {} entries, leaves hold {}",
                    meta.len, self.stats.entries
                ),
            ));
        }
        self.stats.height = leaf_depth.map_or(0, |d| d as u64 + 1);
        Ok(self.stats)
    }

    /// Mark every chunk of `handle` as reached from the tree
    fn claim(&mut self, handle: Handle, count: bool) -> Result<ContentInfo> {
        let info = self.alloc.content_info(handle).map_err(escalate)?;
        for chunk in &info.chunks {
            if self.marks.set(chunk.handle, TREE)? & TREE != 0 {
                return Err(Error::inconsistent(
                    chunk.handle.raw(),
                    format!("reachable twice from the tree (again via {})", handle),
                ));
            }
            if count {
                self.stats.reachable_chunks += 1;
            }
        }
        Ok(info)
    }

    fn check_item(&mut self, node: Handle, item: &Item) -> Result<()> {
        let Some(handle) = item.spilled() else {
            return Ok(());
        };
        let info = self.claim(handle, true)?;
        if info.content_len != item.len() {
            return Err(Error::inconsistent(
                node.raw(),
                format!(
                    "spilled item {} holds {} bytes, node expects {}",
                    handle,
                    info.content_len,
                    item.len()
                ),
            ));
        }
        self.stats.spilled += 1;
        Ok(())
    }

    /// Check spilled keys, then key order inside the node and against the
    /// bounds inherited from the parent. Returns the key bytes.
    fn check_keys(&mut self, node: Handle, items: &[Item], bounds: &Bounds) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::with_capacity(items.len());
        for item in items {
            self.check_item(node, item)?;
            keys.push(item_bytes(self.alloc, item).map_err(escalate)?.into_owned());
        }

        let Some(cmp) = self.cmp else {
            return Ok(keys);
        };
        for pair in keys.windows(2) {
            if cmp.compare(&pair[0], &pair[1]) != Ordering::Less {
                return Err(Error::inconsistent(node.raw(), "keys out of order"));
            }
        }
        if let (Some(lower), Some(first)) = (&bounds.lower, keys.first()) {
            if cmp.compare(first, lower) == Ordering::Less {
                return Err(Error::inconsistent(node.raw(), "key below its separator"));
            }
        }
        if let (Some(upper), Some(last)) = (&bounds.upper, keys.last()) {
            if cmp.compare(last, upper) != Ordering::Less {
                return Err(Error::inconsistent(node.raw(), "key at or above the next separator"));
            }
        }
        Ok(keys)
    }
}

/// Leaves in visit order must be linked exactly that way
fn check_sibling_chain(leaves: &[(Handle, Handle, Handle)]) -> Result<()> {
    for (i, &(handle, prev, next)) in leaves.iter().enumerate() {
        let expected_prev = if i == 0 { Handle::NULL } else { leaves[i - 1].0 };
        let expected_next = leaves.get(i + 1).map_or(Handle::NULL, |l| l.0);
        if prev != expected_prev || next != expected_next {
            return Err(Error::inconsistent(
                handle.raw(),
                format!(
                    "leaf links ({}, {}) should be ({}, {})",
                    prev, next, expected_prev, expected_next
                ),
            ));
        }
    }
    Ok(())
}
