//! # Stratum Core
//!
//! Core types shared by every Stratum crate: the error taxonomy, chunk
//! handles, the backing-store contract and format version constants.
//!
//! ## ⚠️ Internal Implementation Detail
//!
//! **This crate is an internal implementation detail of Stratum.**
//!
//! Users should depend on the main `stratum` crate instead, which provides
//! the stable public API.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod format_version;
pub mod handle;
pub mod store;

pub use error::{Error, Result};
pub use handle::Handle;
pub use store::{FileStore, MemStore, Store};
