//! # Stratum Storage Engine
//!
//! Chunk allocator and B+Tree index for Stratum.
//!
//! ## ⚠️ Internal Implementation Detail
//!
//! **This crate is an internal implementation detail of Stratum.**
//!
//! Users should depend on the main `stratum` crate instead, which provides
//! the stable public API. This crate's API may change without notice
//! between minor versions.
//!
//! ---
//!
//! The store is carved into chunks of 16-byte atoms. The allocator hands
//! out a stable [`Handle`](stratum_core::Handle) per allocation:
//!
//! - **Short chunks** hold content up to about 2 KiB
//! - **Chains** of long and continuation chunks hold anything larger
//! - **Redirects** keep a handle valid when its content has to move
//! - **Free chunks** sit on size-classed, doubly linked free lists and are
//!   coalesced with their neighbours on release
//!
//! The B+Tree stores every node in a chunk of its own and names itself by
//! the handle of its meta cell.
//!
//! ## Architecture
//!
//! ```text
//! BTree ─► nodes / spilled items ─► Allocator ─► Store (file, memory, WAL)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod btree;
pub mod chunk;
pub mod compression;

pub use allocator::{Allocator, AllocatorConfig, ChunkInfo, Chunks, ContentInfo, FreeList};
pub use btree::{BTree, BTreeConfig, Bytewise, Cursor, Iter, KeyComparator, Meta};
pub use chunk::{ChunkHeader, ChunkKind};
pub use compression::{Codec, Snappy};
