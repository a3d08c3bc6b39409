//! B+Tree index built on allocator handles
//!
//! Every node is one allocator handle. Nodes are rewritten in place with
//! [`Allocator::realloc`], so a node's handle never changes and parents
//! only need rewriting when their own keys or children change. The tree
//! itself is named by the handle of its meta cell, a fixed 32-byte chunk
//! holding the root handle, the entry count and the tree's configuration.
//!
//! The tree keeps no state between calls besides the meta handle and the
//! comparator: every operation starts from the meta cell in the store, so
//! rolling the store back rolls the tree back too.
//!
//! ## Shape
//!
//! ```text
//!                 [ m ]                  internal: keys route, children+1
//!               /       \
//!      [ c  f ]           [ m  t ]       leaves: sorted keys, one value
//!      <----------------------->         each, doubly linked
//! ```
//!
//! A leaf split copies the right half's first key up as separator; an
//! internal split moves its median up. Underfull nodes borrow through the
//! parent from a sibling with spare keys, otherwise they merge with it.

mod cursor;
pub mod node;

pub use cursor::{Cursor, Iter};

use crate::allocator::Allocator;
use node::{
    clone_item, free_item, item_bytes, load_leaf, load_node, make_item, InternalNode, Item,
    LeafNode, Node,
};
use std::cmp::Ordering;
use stratum_core::format_version::{btree_version, magic, BTREE_FORMAT_VERSION};
use stratum_core::{Error, Handle, Result, Store};
use tracing::debug;

/// Default maximum keys per node
pub const DEFAULT_MAX_KEYS: usize = 32;

/// Default longest key or value kept inside a node
pub const DEFAULT_INLINE_LIMIT: usize = 64;

/// Size of the encoded meta cell
pub const META_SIZE: usize = 32;

/// Descents deeper than this mean the node graph has a cycle
pub const MAX_DEPTH: usize = 64;

/// Total order over keys.
///
/// Must stay the same for the lifetime of a tree; opening a tree with a
/// different comparator than it was built with gives meaningless results.
pub trait KeyComparator {
    /// Compare two keys
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

impl<F> KeyComparator for F
where
    F: Fn(&[u8], &[u8]) -> Ordering,
{
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self(a, b)
    }
}

/// Lexicographic byte order
#[derive(Debug, Clone, Copy, Default)]
pub struct Bytewise;

impl KeyComparator for Bytewise {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Tree configuration, fixed at creation and persisted in the meta cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeConfig {
    /// Most keys a node holds before it splits
    pub max_keys: usize,
    /// Keys and values longer than this get a chunk of their own
    pub inline_limit: usize,
    /// Compress nodes and spilled items
    pub compress: bool,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self {
            max_keys: DEFAULT_MAX_KEYS,
            inline_limit: DEFAULT_INLINE_LIMIT,
            compress: false,
        }
    }
}

impl BTreeConfig {
    /// Set the branching bound
    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys;
        self
    }

    /// Set the inline limit
    pub fn with_inline_limit(mut self, inline_limit: usize) -> Self {
        self.inline_limit = inline_limit;
        self
    }

    /// Enable or disable compression
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Fewest keys a non-root node may keep
    pub fn min_keys(&self) -> usize {
        self.max_keys / 2
    }

    /// Reject bounds the tree cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_keys < 3 || self.max_keys > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "max_keys must be between 3 and {}, got {}",
                u32::MAX,
                self.max_keys
            )));
        }
        if self.inline_limit > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "inline_limit {} does not fit the meta cell",
                self.inline_limit
            )));
        }
        Ok(())
    }
}

/// Decoded meta cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    /// Root node, null for an empty tree
    pub root: Handle,
    /// Number of entries
    pub len: u64,
    /// Configuration the tree was created with
    pub config: BTreeConfig,
}

impl Meta {
    /// Encode as `[magic u32][version u16][compress u8][0][root i64][len u64]
    /// [max_keys u32][inline_limit u32]`
    pub fn encode(&self) -> [u8; META_SIZE] {
        let mut buf = [0u8; META_SIZE];
        buf[0..4].copy_from_slice(&magic::BTREE.to_le_bytes());
        buf[4..6].copy_from_slice(&BTREE_FORMAT_VERSION.to_le_bytes());
        buf[6] = self.config.compress as u8;
        buf[8..16].copy_from_slice(&self.root.raw().to_le_bytes());
        buf[16..24].copy_from_slice(&self.len.to_le_bytes());
        buf[24..28].copy_from_slice(&(self.config.max_keys as u32).to_le_bytes());
        buf[28..32].copy_from_slice(&(self.config.inline_limit as u32).to_le_bytes());
        buf
    }

    /// Decode the meta cell stored at `handle`
    pub fn decode(handle: Handle, bytes: &[u8]) -> Result<Self> {
        let buf: &[u8; META_SIZE] = bytes.try_into().map_err(|_| {
            Error::corrupt(
                handle.raw(),
                format!("meta cell is {} bytes, expected {}", bytes.len(), META_SIZE),
            )
        })?;

        let mut word = [0u8; 4];
        word.copy_from_slice(&buf[0..4]);
        if u32::from_le_bytes(word) != magic::BTREE {
            return Err(Error::corrupt(handle.raw(), "meta cell magic mismatch"));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if !btree_version().can_read(version) {
            return Err(Error::InvalidState(format!(
                "tree format version {} not supported",
                version
            )));
        }
        if buf[6] > 1 || buf[7] != 0 {
            return Err(Error::corrupt(handle.raw(), "meta cell flags are invalid"));
        }

        let mut long = [0u8; 8];
        long.copy_from_slice(&buf[8..16]);
        let root = Handle::new(i64::from_le_bytes(long));
        long.copy_from_slice(&buf[16..24]);
        let len = u64::from_le_bytes(long);
        word.copy_from_slice(&buf[24..28]);
        let max_keys = u32::from_le_bytes(word) as usize;
        word.copy_from_slice(&buf[28..32]);
        let inline_limit = u32::from_le_bytes(word) as usize;

        let config = BTreeConfig {
            max_keys,
            inline_limit,
            compress: buf[6] == 1,
        };
        config
            .validate()
            .map_err(|e| Error::corrupt(handle.raw(), format!("meta cell: {}", e)))?;
        Ok(Self { root, len, config })
    }

    /// Read and decode the meta cell at `handle`
    pub fn load<S: Store>(alloc: &Allocator<S>, handle: Handle) -> Result<Self> {
        let bytes = alloc.read(handle)?;
        Self::decode(handle, &bytes)
    }
}

/// Internal nodes passed on the way down, with the child index taken
type Path = Vec<(Handle, InternalNode, usize)>;

/// An ordered byte-string map stored in an [`Allocator`]
pub struct BTree<C = Bytewise> {
    meta: Handle,
    config: BTreeConfig,
    cmp: C,
}

impl<C: KeyComparator> BTree<C> {
    /// Create an empty tree; its meta cell is allocated immediately
    pub fn create<S: Store>(alloc: &mut Allocator<S>, cmp: C, config: BTreeConfig) -> Result<Self> {
        config.validate()?;
        let meta = Meta {
            root: Handle::NULL,
            len: 0,
            config,
        };
        let handle = alloc.allocate(&meta.encode(), false)?;
        debug!(%handle, max_keys = config.max_keys, "created tree");
        Ok(Self {
            meta: handle,
            config,
            cmp,
        })
    }

    /// Open the tree whose meta cell is `handle`
    pub fn open<S: Store>(alloc: &Allocator<S>, cmp: C, handle: Handle) -> Result<Self> {
        let meta = Meta::load(alloc, handle)?;
        Ok(Self {
            meta: handle,
            config: meta.config,
            cmp,
        })
    }

    /// Handle of the meta cell; pass it to [`BTree::open`] later
    pub fn handle(&self) -> Handle {
        self.meta
    }

    /// Configuration the tree was created with
    pub fn config(&self) -> &BTreeConfig {
        &self.config
    }

    /// The key order
    pub fn comparator(&self) -> &C {
        &self.cmp
    }

    /// Current meta cell
    pub fn meta<S: Store>(&self, alloc: &Allocator<S>) -> Result<Meta> {
        Meta::load(alloc, self.meta)
    }

    /// Root node handle, null when the tree is empty
    pub fn root<S: Store>(&self, alloc: &Allocator<S>) -> Result<Handle> {
        Ok(self.meta(alloc)?.root)
    }

    /// Number of entries
    pub fn len<S: Store>(&self, alloc: &Allocator<S>) -> Result<u64> {
        Ok(self.meta(alloc)?.len)
    }

    /// True when the tree has no entries
    pub fn is_empty<S: Store>(&self, alloc: &Allocator<S>) -> Result<bool> {
        Ok(self.meta(alloc)?.root.is_null())
    }

    /// Value stored under `key`
    pub fn get<S: Store>(&self, alloc: &Allocator<S>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let meta = self.meta(alloc)?;
        if meta.root.is_null() {
            return Ok(None);
        }
        let (_, _, leaf) = self.descend(alloc, meta.root, key)?;
        match self.search(alloc, &leaf.keys, key)? {
            Ok(index) => Ok(Some(item_bytes(alloc, &leaf.values[index])?.into_owned())),
            Err(_) => Ok(None),
        }
    }

    /// Insert `key`, or overwrite its value if it is already present
    pub fn set<S: Store>(&self, alloc: &mut Allocator<S>, key: &[u8], value: &[u8]) -> Result<()> {
        let mut meta = self.meta(alloc)?;
        if meta.root.is_null() {
            let leaf = LeafNode {
                prev: 0,
                next: 0,
                keys: vec![self.make(alloc, key)?],
                values: vec![self.make(alloc, value)?],
            };
            meta.root = self.alloc_node(alloc, &Node::Leaf(leaf))?;
            meta.len = 1;
            return self.store_meta(alloc, &meta);
        }

        let (path, handle, mut leaf) = self.descend(alloc, meta.root, key)?;
        match self.search(alloc, &leaf.keys, key)? {
            Ok(index) => {
                let value = self.make(alloc, value)?;
                let old = std::mem::replace(&mut leaf.values[index], value);
                free_item(alloc, &old)?;
                self.write_node(alloc, handle, &Node::Leaf(leaf))
            }
            Err(index) => {
                leaf.keys.insert(index, self.make(alloc, key)?);
                leaf.values.insert(index, self.make(alloc, value)?);
                meta.len += 1;
                self.split_upward(alloc, &mut meta, path, handle, leaf)?;
                self.store_meta(alloc, &meta)
            }
        }
    }

    /// Remove `key`; returns whether it was present
    pub fn delete<S: Store>(&self, alloc: &mut Allocator<S>, key: &[u8]) -> Result<bool> {
        Ok(self.extract(alloc, key)?.is_some())
    }

    /// Remove `key` and return its value
    pub fn extract<S: Store>(&self, alloc: &mut Allocator<S>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut meta = self.meta(alloc)?;
        if meta.root.is_null() {
            return Ok(None);
        }

        let (path, handle, mut leaf) = self.descend(alloc, meta.root, key)?;
        let index = match self.search(alloc, &leaf.keys, key)? {
            Ok(index) => index,
            Err(_) => return Ok(None),
        };
        let key_item = leaf.keys.remove(index);
        let value_item = leaf.values.remove(index);
        let value = item_bytes(alloc, &value_item)?.into_owned();
        free_item(alloc, &key_item)?;
        free_item(alloc, &value_item)?;

        meta.len = meta.len.saturating_sub(1);
        self.rebalance(alloc, &mut meta, path, handle, Node::Leaf(leaf))?;
        self.store_meta(alloc, &meta)?;
        Ok(Some(value))
    }

    /// Read-modify-write: `f` gets the current value and returns the new
    /// one, or `None` to delete the key
    pub fn update<S, F>(&self, alloc: &mut Allocator<S>, key: &[u8], f: F) -> Result<()>
    where
        S: Store,
        F: FnOnce(Option<Vec<u8>>) -> Option<Vec<u8>>,
    {
        let current = self.get(alloc, key)?;
        let existed = current.is_some();
        match f(current) {
            Some(value) => self.set(alloc, key, &value),
            None if existed => self.delete(alloc, key).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Cursor just before the first key `>= key`
    pub fn seek<S: Store>(&self, alloc: &Allocator<S>, key: &[u8]) -> Result<Cursor> {
        let meta = self.meta(alloc)?;
        if meta.root.is_null() {
            return Ok(Cursor::empty());
        }
        let (_, handle, leaf) = self.descend(alloc, meta.root, key)?;
        let index = match self.search(alloc, &leaf.keys, key)? {
            Ok(index) | Err(index) => index,
        };
        Ok(Cursor::new(handle, leaf, index))
    }

    /// Cursor before the smallest key
    pub fn first<S: Store>(&self, alloc: &Allocator<S>) -> Result<Cursor> {
        self.edge(alloc, false)
    }

    /// Cursor after the largest key
    pub fn last<S: Store>(&self, alloc: &Allocator<S>) -> Result<Cursor> {
        self.edge(alloc, true)
    }

    /// Entries in ascending key order
    pub fn iter<'a, S: Store>(&self, alloc: &'a Allocator<S>) -> Result<Iter<'a, S>> {
        Ok(Iter::forward(alloc, self.first(alloc)?))
    }

    /// Entries in descending key order
    pub fn iter_rev<'a, S: Store>(&self, alloc: &'a Allocator<S>) -> Result<Iter<'a, S>> {
        Ok(Iter::backward(alloc, self.last(alloc)?))
    }

    /// Entries with keys `>= start` in ascending order
    pub fn iter_from<'a, S: Store>(&self, alloc: &'a Allocator<S>, start: &[u8]) -> Result<Iter<'a, S>> {
        Ok(Iter::forward(alloc, self.seek(alloc, start)?))
    }

    /// Free every node and spilled item; the meta cell stays
    pub fn clear<S: Store>(&self, alloc: &mut Allocator<S>) -> Result<()> {
        let mut meta = self.meta(alloc)?;
        let mut stack = Vec::new();
        if !meta.root.is_null() {
            stack.push((meta.root, 0usize));
        }

        let mut freed = 0u64;
        while let Some((handle, depth)) = stack.pop() {
            if depth > MAX_DEPTH {
                return Err(Error::corrupt(handle.raw(), "tree is deeper than any valid tree"));
            }
            match load_node(alloc, handle)? {
                Node::Leaf(leaf) => {
                    for item in leaf.keys.iter().chain(leaf.values.iter()) {
                        free_item(alloc, item)?;
                    }
                }
                Node::Internal(node) => {
                    for item in &node.keys {
                        free_item(alloc, item)?;
                    }
                    stack.extend(node.children.iter().map(|&c| (Handle::new(c), depth + 1)));
                }
            }
            alloc.free(handle)?;
            freed += 1;
        }

        meta.root = Handle::NULL;
        meta.len = 0;
        self.store_meta(alloc, &meta)?;
        debug!(tree = %self.meta, nodes = freed, "cleared tree");
        Ok(())
    }

    /// Free the whole tree including its meta cell
    pub fn remove<S: Store>(self, alloc: &mut Allocator<S>) -> Result<()> {
        self.clear(alloc)?;
        alloc.free(self.meta)
    }

    // ---- descent ----

    /// Walk from `root` to the leaf that does or would hold `key`
    fn descend<S: Store>(
        &self,
        alloc: &Allocator<S>,
        root: Handle,
        key: &[u8],
    ) -> Result<(Path, Handle, LeafNode)> {
        let mut path = Path::new();
        let mut handle = root;
        loop {
            match load_node(alloc, handle)? {
                Node::Leaf(leaf) => return Ok((path, handle, leaf)),
                Node::Internal(node) => {
                    if path.len() >= MAX_DEPTH {
                        return Err(Error::corrupt(handle.raw(), "tree is deeper than any valid tree"));
                    }
                    let index = match self.search(alloc, &node.keys, key)? {
                        Ok(index) => index + 1,
                        Err(index) => index,
                    };
                    let child = node.child(index);
                    path.push((handle, node, index));
                    handle = child;
                }
            }
        }
    }

    fn edge<S: Store>(&self, alloc: &Allocator<S>, last: bool) -> Result<Cursor> {
        let meta = self.meta(alloc)?;
        let mut handle = meta.root;
        if handle.is_null() {
            return Ok(Cursor::empty());
        }
        for _ in 0..=MAX_DEPTH {
            match load_node(alloc, handle)? {
                Node::Leaf(leaf) => {
                    let index = if last { leaf.keys.len() } else { 0 };
                    return Ok(Cursor::new(handle, leaf, index));
                }
                Node::Internal(node) => {
                    let index = if last { node.children.len() - 1 } else { 0 };
                    handle = node.child(index);
                }
            }
        }
        Err(Error::corrupt(handle.raw(), "tree is deeper than any valid tree"))
    }

    /// Binary search: `Ok(i)` if `keys[i] == key`, else `Err` with the
    /// insertion point
    fn search<S: Store>(
        &self,
        alloc: &Allocator<S>,
        keys: &[Item],
        key: &[u8],
    ) -> Result<std::result::Result<usize, usize>> {
        let (mut lo, mut hi) = (0, keys.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let candidate = item_bytes(alloc, &keys[mid])?;
            match self.cmp.compare(&candidate, key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    // ---- insertion ----

    /// Write back a leaf that just gained a key, splitting upward as far as
    /// nodes overflow
    fn split_upward<S: Store>(
        &self,
        alloc: &mut Allocator<S>,
        meta: &mut Meta,
        mut path: Path,
        handle: Handle,
        mut leaf: LeafNode,
    ) -> Result<()> {
        if leaf.keys.len() <= self.config.max_keys {
            return self.write_node(alloc, handle, &Node::Leaf(leaf));
        }

        let mid = leaf.keys.len() / 2;
        let right = LeafNode {
            prev: handle.raw(),
            next: leaf.next,
            keys: leaf.keys.split_off(mid),
            values: leaf.values.split_off(mid),
        };
        let mut separator = clone_item(alloc, &right.keys[0], self.config.compress)?;
        let mut right_handle = self.alloc_node(alloc, &Node::Leaf(right))?;

        let after = leaf.next();
        if !after.is_null() {
            let mut neighbour = load_leaf(alloc, after)?;
            neighbour.prev = right_handle.raw();
            self.write_node(alloc, after, &Node::Leaf(neighbour))?;
        }
        leaf.next = right_handle.raw();
        self.write_node(alloc, handle, &Node::Leaf(leaf))?;
        debug!(left = %handle, right = %right_handle, "split leaf");

        let mut left_handle = handle;
        loop {
            let Some((parent_handle, mut parent, index)) = path.pop() else {
                let root = InternalNode {
                    keys: vec![separator],
                    children: vec![left_handle.raw(), right_handle.raw()],
                };
                meta.root = self.alloc_node(alloc, &Node::Internal(root))?;
                debug!(root = %meta.root, "tree grew a level");
                return Ok(());
            };

            parent.keys.insert(index, separator);
            parent.children.insert(index + 1, right_handle.raw());
            if parent.keys.len() <= self.config.max_keys {
                return self.write_node(alloc, parent_handle, &Node::Internal(parent));
            }

            let mid = parent.keys.len() / 2;
            let right = InternalNode {
                keys: parent.keys.split_off(mid + 1),
                children: parent.children.split_off(mid + 1),
            };
            separator = parent.keys.pop().ok_or_else(|| {
                Error::corrupt(parent_handle.raw(), "internal node split without a median")
            })?;
            right_handle = self.alloc_node(alloc, &Node::Internal(right))?;
            self.write_node(alloc, parent_handle, &Node::Internal(parent))?;
            debug!(left = %parent_handle, right = %right_handle, "split internal node");
            left_handle = parent_handle;
        }
    }

    // ---- deletion ----

    /// Write back a node that just lost a key, fixing underflow upward
    fn rebalance<S: Store>(
        &self,
        alloc: &mut Allocator<S>,
        meta: &mut Meta,
        mut path: Path,
        mut handle: Handle,
        mut node: Node,
    ) -> Result<()> {
        let min = self.config.min_keys();
        loop {
            let Some((parent_handle, mut parent, index)) = path.pop() else {
                return self.settle_root(alloc, meta, handle, node);
            };
            if node.key_count() >= min {
                return self.write_node(alloc, handle, &node);
            }

            if index > 0 {
                let left_handle = parent.child(index - 1);
                let mut left = load_node(alloc, left_handle)?;
                if left.key_count() > min {
                    self.borrow_from_left(alloc, parent_handle, &mut parent, index, &mut left, &mut node)?;
                    self.write_node(alloc, left_handle, &left)?;
                    self.write_node(alloc, handle, &node)?;
                    return self.write_node(alloc, parent_handle, &Node::Internal(parent));
                }
                let merged = self.merge(
                    alloc,
                    parent_handle,
                    &mut parent,
                    index - 1,
                    (left_handle, left),
                    node,
                )?;
                self.write_node(alloc, left_handle, &merged)?;
                alloc.free(handle)?;
                debug!(into = %left_handle, from = %handle, "merged nodes");
            } else {
                let right_handle = parent.child(1);
                let mut right = load_node(alloc, right_handle)?;
                if right.key_count() > min {
                    self.borrow_from_right(alloc, parent_handle, &mut parent, &mut node, &mut right)?;
                    self.write_node(alloc, right_handle, &right)?;
                    self.write_node(alloc, handle, &node)?;
                    return self.write_node(alloc, parent_handle, &Node::Internal(parent));
                }
                let merged = self.merge(alloc, parent_handle, &mut parent, 0, (handle, node), right)?;
                self.write_node(alloc, handle, &merged)?;
                alloc.free(right_handle)?;
                debug!(into = %handle, from = %right_handle, "merged nodes");
            }

            handle = parent_handle;
            node = Node::Internal(parent);
        }
    }

    /// Write the root, or drop it when it has become empty or has a single
    /// child left
    fn settle_root<S: Store>(
        &self,
        alloc: &mut Allocator<S>,
        meta: &mut Meta,
        handle: Handle,
        node: Node,
    ) -> Result<()> {
        match node {
            Node::Leaf(leaf) if leaf.keys.is_empty() => {
                alloc.free(handle)?;
                meta.root = Handle::NULL;
                debug!(tree = %self.meta, "tree is empty");
                Ok(())
            }
            Node::Internal(inner) if inner.keys.is_empty() => {
                meta.root = inner.child(0);
                alloc.free(handle)?;
                debug!(root = %meta.root, "tree shrank a level");
                Ok(())
            }
            node => self.write_node(alloc, handle, &node),
        }
    }

    /// Move the last entry of the left sibling into `node` (at `index`)
    fn borrow_from_left<S: Store>(
        &self,
        alloc: &mut Allocator<S>,
        parent_handle: Handle,
        parent: &mut InternalNode,
        index: usize,
        left: &mut Node,
        node: &mut Node,
    ) -> Result<()> {
        let exhausted = || Error::corrupt(parent_handle.raw(), "sibling has no key to lend");
        match (left, node) {
            (Node::Leaf(left), Node::Leaf(node)) => {
                let key = left.keys.pop().ok_or_else(exhausted)?;
                let value = left.values.pop().ok_or_else(exhausted)?;
                node.keys.insert(0, key);
                node.values.insert(0, value);
                let separator = clone_item(alloc, &node.keys[0], self.config.compress)?;
                let old = std::mem::replace(&mut parent.keys[index - 1], separator);
                free_item(alloc, &old)
            }
            (Node::Internal(left), Node::Internal(node)) => {
                let key = left.keys.pop().ok_or_else(exhausted)?;
                let child = left.children.pop().ok_or_else(exhausted)?;
                let down = std::mem::replace(&mut parent.keys[index - 1], key);
                node.keys.insert(0, down);
                node.children.insert(0, child);
                Ok(())
            }
            _ => Err(mixed_levels(parent_handle)),
        }
    }

    /// Move the first entry of the right sibling into `node` (the first child)
    fn borrow_from_right<S: Store>(
        &self,
        alloc: &mut Allocator<S>,
        parent_handle: Handle,
        parent: &mut InternalNode,
        node: &mut Node,
        right: &mut Node,
    ) -> Result<()> {
        match (node, right) {
            (Node::Leaf(node), Node::Leaf(right)) => {
                node.keys.push(right.keys.remove(0));
                node.values.push(right.values.remove(0));
                let separator = clone_item(alloc, &right.keys[0], self.config.compress)?;
                let old = std::mem::replace(&mut parent.keys[0], separator);
                free_item(alloc, &old)
            }
            (Node::Internal(node), Node::Internal(right)) => {
                let key = right.keys.remove(0);
                let child = right.children.remove(0);
                let down = std::mem::replace(&mut parent.keys[0], key);
                node.keys.push(down);
                node.children.push(child);
                Ok(())
            }
            _ => Err(mixed_levels(parent_handle)),
        }
    }

    /// Fold `right` into `left`, dropping the parent separator at
    /// `separator` and the right child pointer after it
    fn merge<S: Store>(
        &self,
        alloc: &mut Allocator<S>,
        parent_handle: Handle,
        parent: &mut InternalNode,
        separator: usize,
        (left_handle, left): (Handle, Node),
        right: Node,
    ) -> Result<Node> {
        let key = parent.keys.remove(separator);
        parent.children.remove(separator + 1);
        match (left, right) {
            (Node::Leaf(mut left), Node::Leaf(right)) => {
                free_item(alloc, &key)?;
                left.keys.extend(right.keys);
                left.values.extend(right.values);
                left.next = right.next;
                let after = left.next();
                if !after.is_null() {
                    let mut neighbour = load_leaf(alloc, after)?;
                    neighbour.prev = left_handle.raw();
                    self.write_node(alloc, after, &Node::Leaf(neighbour))?;
                }
                Ok(Node::Leaf(left))
            }
            (Node::Internal(mut left), Node::Internal(right)) => {
                left.keys.push(key);
                left.keys.extend(right.keys);
                left.children.extend(right.children);
                Ok(Node::Internal(left))
            }
            _ => Err(mixed_levels(parent_handle)),
        }
    }

    // ---- storage ----

    fn make<S: Store>(&self, alloc: &mut Allocator<S>, bytes: &[u8]) -> Result<Item> {
        make_item(alloc, bytes, self.config.inline_limit, self.config.compress)
    }

    fn alloc_node<S: Store>(&self, alloc: &mut Allocator<S>, node: &Node) -> Result<Handle> {
        alloc.allocate(&node.encode()?, self.config.compress)
    }

    fn write_node<S: Store>(&self, alloc: &mut Allocator<S>, handle: Handle, node: &Node) -> Result<()> {
        alloc.realloc(handle, &node.encode()?, self.config.compress)
    }

    fn store_meta<S: Store>(&self, alloc: &mut Allocator<S>, meta: &Meta) -> Result<()> {
        alloc.realloc(self.meta, &meta.encode(), false)
    }
}

fn mixed_levels(parent: Handle) -> Error {
    Error::corrupt(parent.raw(), "children of one node are at different levels")
}
