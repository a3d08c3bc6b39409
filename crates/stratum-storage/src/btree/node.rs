//! B+Tree node encoding
//!
//! Nodes are serde structs encoded with bincode's varint options. Keys and
//! values up to the tree's inline limit live inside the node; longer ones
//! are spilled into chunks of their own and referenced by handle.

use crate::allocator::Allocator;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use stratum_core::{Error, Handle, Result, Store};

/// A key or value as stored in a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Item {
    /// Bytes kept inside the node
    Inline(Vec<u8>),
    /// Bytes in a chunk of their own
    Spilled {
        /// Raw handle of the chunk
        handle: i64,
        /// Content length, checked on every load
        len: u64,
    },
}

impl Item {
    /// Handle of the spilled chunk, if any
    pub fn spilled(&self) -> Option<Handle> {
        match self {
            Item::Inline(_) => None,
            Item::Spilled { handle, .. } => Some(Handle::new(*handle)),
        }
    }

    /// Logical length of the bytes this item stands for
    pub fn len(&self) -> u64 {
        match self {
            Item::Inline(bytes) => bytes.len() as u64,
            Item::Spilled { len, .. } => *len,
        }
    }

    /// True when the item stands for no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Leaf node: sorted keys with one value each, linked to its siblings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafNode {
    /// Raw handle of the previous leaf (0 for none)
    pub prev: i64,
    /// Raw handle of the next leaf (0 for none)
    pub next: i64,
    /// Sorted keys
    pub keys: Vec<Item>,
    /// `values[i]` belongs to `keys[i]`
    pub values: Vec<Item>,
}

impl LeafNode {
    /// Previous leaf
    pub fn prev(&self) -> Handle {
        Handle::new(self.prev)
    }

    /// Next leaf
    pub fn next(&self) -> Handle {
        Handle::new(self.next)
    }
}

/// Internal node: `children.len() == keys.len() + 1`; keys in
/// `children[i]` are below `keys[i]`, keys in `children[i + 1]` are at or
/// above it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalNode {
    /// Separator keys
    pub keys: Vec<Item>,
    /// Raw child handles
    pub children: Vec<i64>,
}

impl InternalNode {
    /// Child at `index`
    pub fn child(&self, index: usize) -> Handle {
        Handle::new(self.children[index])
    }
}

/// A decoded node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    /// Leaf
    Leaf(LeafNode),
    /// Internal
    Internal(InternalNode),
}

impl Node {
    /// An empty leaf with no siblings
    pub fn empty_leaf() -> Self {
        Node::Leaf(LeafNode {
            prev: 0,
            next: 0,
            keys: Vec::new(),
            values: Vec::new(),
        })
    }

    /// Number of keys
    pub fn key_count(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.keys.len(),
            Node::Internal(node) => node.keys.len(),
        }
    }

    /// True for leaves
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Serialize for storage
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::DefaultOptions::new()
            .serialize(self)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize the node stored at `handle` and check its shape
    pub fn decode(handle: Handle, bytes: &[u8]) -> Result<Self> {
        let node: Node = bincode::DefaultOptions::new()
            .with_limit(bytes.len() as u64)
            .deserialize(bytes)
            .map_err(|e| Error::corrupt(handle.raw(), format!("node does not decode: {}", e)))?;
        node.check(handle)?;
        Ok(node)
    }

    fn check(&self, handle: Handle) -> Result<()> {
        let has_null = |items: &[Item]| {
            items
                .iter()
                .any(|item| matches!(item, Item::Spilled { handle: 0, .. }))
        };
        match self {
            Node::Leaf(leaf) => {
                if leaf.keys.len() != leaf.values.len() {
                    return Err(Error::corrupt(
                        handle.raw(),
                        format!(
                            "leaf has {} keys but {} values",
                            leaf.keys.len(),
                            leaf.values.len()
                        ),
                    ));
                }
                if has_null(&leaf.keys) || has_null(&leaf.values) {
                    return Err(Error::corrupt(handle.raw(), "spilled item has a null handle"));
                }
            }
            Node::Internal(node) => {
                if node.keys.is_empty() || node.children.len() != node.keys.len() + 1 {
                    return Err(Error::corrupt(
                        handle.raw(),
                        format!(
                            "internal node has {} keys and {} children",
                            node.keys.len(),
                            node.children.len()
                        ),
                    ));
                }
                if node.children.contains(&0) {
                    return Err(Error::corrupt(handle.raw(), "internal node has a null child"));
                }
                if has_null(&node.keys) {
                    return Err(Error::corrupt(handle.raw(), "spilled item has a null handle"));
                }
            }
        }
        Ok(())
    }
}

/// Read and decode the node at `handle`
pub fn load_node<S: Store>(alloc: &Allocator<S>, handle: Handle) -> Result<Node> {
    let bytes = alloc.read(handle)?;
    Node::decode(handle, &bytes)
}

/// Read the node at `handle`, which must be a leaf
pub fn load_leaf<S: Store>(alloc: &Allocator<S>, handle: Handle) -> Result<LeafNode> {
    match load_node(alloc, handle)? {
        Node::Leaf(leaf) => Ok(leaf),
        Node::Internal(_) => Err(Error::corrupt(
            handle.raw(),
            "expected a leaf, found an internal node",
        )),
    }
}

/// The bytes an item stands for; spilled items are read from their chunk
pub fn item_bytes<'i, S: Store>(alloc: &Allocator<S>, item: &'i Item) -> Result<Cow<'i, [u8]>> {
    match item {
        Item::Inline(bytes) => Ok(Cow::Borrowed(bytes)),
        Item::Spilled { handle, len } => {
            let bytes = alloc.read(Handle::new(*handle))?;
            if bytes.len() as u64 != *len {
                return Err(Error::corrupt(
                    *handle,
                    format!("spilled item holds {} bytes, node expects {}", bytes.len(), len),
                ));
            }
            Ok(Cow::Owned(bytes))
        }
    }
}

/// Build an item for `bytes`, spilling it if it is longer than `inline_limit`
pub(crate) fn make_item<S: Store>(
    alloc: &mut Allocator<S>,
    bytes: &[u8],
    inline_limit: usize,
    compress: bool,
) -> Result<Item> {
    if bytes.len() <= inline_limit {
        return Ok(Item::Inline(bytes.to_vec()));
    }
    let handle = alloc.allocate(bytes, compress)?;
    Ok(Item::Spilled {
        handle: handle.raw(),
        len: bytes.len() as u64,
    })
}

/// An independent copy of `item` (spilled bytes get a chunk of their own)
pub(crate) fn clone_item<S: Store>(
    alloc: &mut Allocator<S>,
    item: &Item,
    compress: bool,
) -> Result<Item> {
    match item {
        Item::Inline(_) => Ok(item.clone()),
        Item::Spilled { len, .. } => {
            let bytes = item_bytes(alloc, item)?.into_owned();
            let handle = alloc.allocate(&bytes, compress)?;
            Ok(Item::Spilled {
                handle: handle.raw(),
                len: *len,
            })
        }
    }
}

/// Release the chunk behind a spilled item
pub(crate) fn free_item<S: Store>(alloc: &mut Allocator<S>, item: &Item) -> Result<()> {
    match item.spilled() {
        Some(handle) => alloc.free(handle),
        None => Ok(()),
    }
}
