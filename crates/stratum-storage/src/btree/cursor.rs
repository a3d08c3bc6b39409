//! Bidirectional cursors over the leaf chain
//!
//! A cursor sits in a gap between two entries. [`Cursor::next`] returns the
//! entry after the gap and moves past it, [`Cursor::prev`] returns the one
//! before. Stepping across a leaf boundary follows the sibling links.
//!
//! The cursor caches the leaf it is positioned in. It does not observe
//! writes made after it was created: entries may be skipped or repeated,
//! and a step into a leaf that has since been freed returns an error.

use super::node::{item_bytes, load_leaf, LeafNode};
use crate::allocator::Allocator;
use stratum_core::{Error, Handle, Result, Store};

/// A position between two entries of a tree
#[derive(Debug, Clone)]
pub struct Cursor {
    leaf: Handle,
    node: Option<LeafNode>,
    index: usize,
}

impl Cursor {
    pub(crate) fn new(leaf: Handle, node: LeafNode, index: usize) -> Self {
        Self {
            leaf,
            node: Some(node),
            index,
        }
    }

    /// Cursor of an empty tree
    pub(crate) fn empty() -> Self {
        Self {
            leaf: Handle::NULL,
            node: None,
            index: 0,
        }
    }

    /// Leaf the cursor is currently in
    pub fn leaf(&self) -> Handle {
        self.leaf
    }

    /// Return the entry after the cursor and step over it
    pub fn next<S: Store>(&mut self, alloc: &Allocator<S>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let Some(node) = &self.node else {
                return Ok(None);
            };
            if self.index < node.keys.len() {
                let entry = read_entry(alloc, node, self.index)?;
                self.index += 1;
                return Ok(Some(entry));
            }
            let next = node.next();
            if next.is_null() {
                return Ok(None);
            }
            let leaf = load_sibling(alloc, next)?;
            self.node = Some(leaf);
            self.leaf = next;
            self.index = 0;
        }
    }

    /// Return the entry before the cursor and step back over it
    pub fn prev<S: Store>(&mut self, alloc: &Allocator<S>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let Some(node) = &self.node else {
                return Ok(None);
            };
            let gap = self.index.min(node.keys.len());
            if gap > 0 {
                let index = gap - 1;
                let entry = read_entry(alloc, node, index)?;
                self.index = index;
                return Ok(Some(entry));
            }
            let prev = node.prev();
            if prev.is_null() {
                return Ok(None);
            }
            let leaf = load_sibling(alloc, prev)?;
            self.index = leaf.keys.len();
            self.node = Some(leaf);
            self.leaf = prev;
        }
    }
}

/// Load a sibling leaf; only the root leaf of a tree may ever be empty
fn load_sibling<S: Store>(alloc: &Allocator<S>, handle: Handle) -> Result<LeafNode> {
    let leaf = load_leaf(alloc, handle)?;
    if leaf.keys.is_empty() {
        return Err(Error::corrupt(handle.raw(), "empty leaf in the sibling chain"));
    }
    Ok(leaf)
}

fn read_entry<S: Store>(alloc: &Allocator<S>, node: &LeafNode, index: usize) -> Result<(Vec<u8>, Vec<u8>)> {
    let key = item_bytes(alloc, &node.keys[index])?.into_owned();
    let value = item_bytes(alloc, &node.values[index])?.into_owned();
    Ok((key, value))
}

/// Iterator over a tree's entries in either direction.
///
/// Yields `Err` at most once; iteration stops after the first error.
pub struct Iter<'a, S: Store> {
    alloc: &'a Allocator<S>,
    cursor: Cursor,
    reverse: bool,
    done: bool,
}

impl<'a, S: Store> Iter<'a, S> {
    pub(crate) fn forward(alloc: &'a Allocator<S>, cursor: Cursor) -> Self {
        Self {
            alloc,
            cursor,
            reverse: false,
            done: false,
        }
    }

    pub(crate) fn backward(alloc: &'a Allocator<S>, cursor: Cursor) -> Self {
        Self {
            alloc,
            cursor,
            reverse: true,
            done: false,
        }
    }
}

impl<S: Store> Iterator for Iter<'_, S> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = if self.reverse {
            self.cursor.prev(self.alloc)
        } else {
            self.cursor.next(self.alloc)
        };
        match step {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
