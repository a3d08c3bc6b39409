//! # Stratum
//!
//! An embedded key-value store kept in a single file: a chunk allocator
//! manages the space, a B+Tree orders the keys, and an undo log makes each
//! batch of changes atomic.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stratum::Database;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::open("./my_database")?;
//!
//!     db.put(b"user:1:name", b"Alice")?;
//!     db.put(b"user:1:email", b"alice@example.com")?;
//!
//!     if let Some(name) = db.get(b"user:1:name")? {
//!         println!("Name: {}", String::from_utf8_lossy(&name));
//!     }
//!
//!     for (key, value) in db.scan(b"user:1:", 10)? {
//!         println!("{} = {}", String::from_utf8_lossy(&key), String::from_utf8_lossy(&value));
//!     }
//!
//!     db.delete(b"user:1:email")?;
//!     Ok(())
//! }
//! ```
//!
//! ## Batches
//!
//! Every `put` and `delete` is atomic on its own. To group several, open a
//! batch explicitly:
//!
//! ```rust,no_run
//! use stratum::Database;
//!
//! let db = Database::open("./data")?;
//! db.begin()?;
//! db.put(b"account:a", b"90")?;
//! db.put(b"account:b", b"110")?;
//! db.commit()?;
//! # Ok::<(), stratum::Error>(())
//! ```
//!
//! A batch still open when the process dies is rolled back the next time
//! the database is opened.
//!
//! ## Layout
//!
//! A database directory holds two files: `data.stm`, the allocator's store,
//! and `data.wal`, the undo log. The tree's meta cell is always the first
//! chunk of the store.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod logging;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

// Re-export core types
pub use stratum_core::{Error, FileStore, Handle, MemStore, Result, Store};

// WAL components
pub use stratum_wal::{RecoveryStats, SyncMode, WalConfig, WalStore};

// Storage components
pub use stratum_storage::{
    Allocator, AllocatorConfig, BTree, BTreeConfig, Bytewise, Cursor, KeyComparator,
};

// Verifier components
pub use stratum_verify::{TreeStats, Verifier, VerifyStats};

use stratum_storage::chunk::DATA_START;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// File holding the allocator's store inside a database directory
pub const DATA_FILE: &str = "data.stm";

/// File holding the undo log inside a database directory
pub const LOG_FILE: &str = "data.wal";

/// Backing store of either file
pub type Backend = Box<dyn Store + Send>;

/// The allocator stack under a database
pub type Engine = Allocator<WalStore<Backend, Backend>>;

/// Configuration for a [`Database`]
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    /// Allocator limits and compression
    pub allocator: AllocatorConfig,
    /// Tree shape; only used when the database is created
    pub btree: BTreeConfig,
    /// Undo log paging and sync policy
    pub wal: WalConfig,
}

impl DatabaseConfig {
    /// Set the allocator configuration
    pub fn with_allocator(mut self, allocator: AllocatorConfig) -> Self {
        self.allocator = allocator;
        self
    }

    /// Set the tree configuration
    pub fn with_btree(mut self, btree: BTreeConfig) -> Self {
        self.btree = btree;
        self
    }

    /// Set the undo log configuration
    pub fn with_wal(mut self, wal: WalConfig) -> Self {
        self.wal = wal;
        self
    }
}

struct Inner {
    alloc: Engine,
    tree: BTree<Bytewise>,
}

/// The main database handle.
///
/// Cloning is cheap and every clone shares the same store. Callers are
/// serialised by an internal lock, so a batch opened through one clone
/// spans the writes of every clone until it is committed.
///
/// # Examples
///
/// ```rust,no_run
/// use stratum::Database;
///
/// let db = Database::open("./my_data")?;
/// db.put(b"key", b"value")?;
///
/// drop(db);
/// let db = Database::open("./my_data")?;
/// assert_eq!(db.get(b"key")?, Some(b"value".to_vec()));
/// # Ok::<(), stratum::Error>(())
/// ```
#[derive(Clone)]
pub struct Database {
    inner: Arc<Mutex<Inner>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Opens or creates a database in the directory `path`.
    ///
    /// An interrupted batch left by a previous session is rolled back
    /// before this returns; see [`Database::recovery_stats`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, DatabaseConfig::default())
    }

    /// Opens or creates a database with custom configuration.
    ///
    /// `config.btree` only matters when the database is created; an
    /// existing tree keeps the shape stored in its meta cell.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: DatabaseConfig) -> Result<Self> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;
        info!(path = %path.display(), "opening stratum database");

        let data = FileStore::open(path.join(DATA_FILE))?;
        let log = FileStore::open(path.join(LOG_FILE))?;
        let inner = Inner::open(Box::new(data), Box::new(log), config)?;
        Ok(Database {
            inner: Arc::new(Mutex::new(inner)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory database.
    ///
    /// Batches work as usual, but everything is lost when the last clone
    /// is dropped.
    ///
    /// ```rust
    /// use stratum::Database;
    ///
    /// let db = Database::in_memory()?;
    /// db.put(b"temp", b"data")?;
    /// assert_eq!(db.len()?, 1);
    /// # Ok::<(), stratum::Error>(())
    /// ```
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with_config(DatabaseConfig::default())
    }

    /// Creates an in-memory database with custom configuration.
    pub fn in_memory_with_config(config: DatabaseConfig) -> Result<Self> {
        let inner = Inner::open(Box::new(MemStore::new()), Box::new(MemStore::new()), config)?;
        Ok(Database {
            inner: Arc::new(Mutex::new(inner)),
            path: None,
        })
    }

    /// Inserts or replaces the value under `key`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(|alloc, tree| tree.set(alloc, key, value))
    }

    /// Value stored under `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.lock()?;
        inner.tree.get(&inner.alloc, key)
    }

    /// Removes `key`. Returns whether it was present.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.write(|alloc, tree| tree.delete(alloc, key))
    }

    /// Entry with the smallest key
    pub fn first(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let inner = self.lock()?;
        inner.tree.first(&inner.alloc)?.next(&inner.alloc)
    }

    /// Entry with the largest key
    pub fn last(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let inner = self.lock()?;
        inner.tree.last(&inner.alloc)?.prev(&inner.alloc)
    }

    /// Up to `limit` entries with keys `>= start`, in key order
    pub fn scan(&self, start: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let inner = self.lock()?;
        inner
            .tree
            .iter_from(&inner.alloc, start)?
            .take(limit)
            .collect()
    }

    /// Number of entries
    pub fn len(&self) -> Result<u64> {
        let inner = self.lock()?;
        inner.tree.len(&inner.alloc)
    }

    /// True when the database holds no entries
    pub fn is_empty(&self) -> Result<bool> {
        let inner = self.lock()?;
        inner.tree.is_empty(&inner.alloc)
    }

    /// Opens a batch. Until [`commit`](Self::commit) or
    /// [`rollback`](Self::rollback), every write joins it.
    ///
    /// A failing `put` or `delete` inside an explicit batch leaves the
    /// batch open; roll it back to discard the partial change.
    pub fn begin(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.alloc.store_mut().begin_batch()
    }

    /// Makes the open batch durable.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.alloc.store_mut().commit()
    }

    /// Discards every write of the open batch.
    pub fn rollback(&self) -> Result<RecoveryStats> {
        let mut inner = self.lock()?;
        inner.alloc.store_mut().rollback()
    }

    /// True while a batch opened with [`begin`](Self::begin) is pending
    pub fn in_batch(&self) -> Result<bool> {
        let inner = self.lock()?;
        Ok(inner.alloc.store().is_batch_open())
    }

    /// Checks the whole store and the tree, keys included.
    ///
    /// Runs under the lock, so it sees the effects of an open batch.
    pub fn verify(&self) -> Result<VerifyStats> {
        let inner = self.lock()?;
        Verifier::new(&inner.alloc)
            .with_comparator(inner.tree.comparator())
            .verify(&mut MemStore::new(), Some(inner.tree.handle()))
    }

    /// What the last open rolled back, if anything
    pub fn recovery_stats(&self) -> Result<RecoveryStats> {
        let inner = self.lock()?;
        Ok(inner.alloc.store().recovery_stats().clone())
    }

    /// Directory of a persistent database
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns whether this is a persistent database.
    pub fn is_persistent(&self) -> bool {
        self.path.is_some()
    }

    /// Forces the store to stable storage.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.alloc.store_mut().sync()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| Error::LockPoisoned)
    }

    /// Run `op` inside the open batch, or inside a batch of its own that is
    /// committed on success and rolled back on failure.
    fn write<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Engine, &BTree<Bytewise>) -> Result<T>,
    {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        if inner.alloc.store().is_batch_open() {
            return op(&mut inner.alloc, &inner.tree);
        }

        inner.alloc.store_mut().begin_batch()?;
        match op(&mut inner.alloc, &inner.tree) {
            Ok(value) => {
                finish_batch(&mut inner.alloc)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = inner.alloc.store_mut().rollback() {
                    warn!(error = %rollback, "rollback after failed write did not complete");
                }
                Err(err)
            }
        }
    }
}

impl Inner {
    fn open(data: Backend, log: Backend, config: DatabaseConfig) -> Result<Self> {
        let store = WalStore::open(data, log, config.wal)?;
        let recovery = store.recovery_stats();
        if recovery.rolled_back {
            warn!(
                records = recovery.records_applied,
                size = recovery.restored_size,
                "rolled back an interrupted batch"
            );
        }

        let mut alloc = Allocator::open(store, config.allocator)?;
        let root = Handle::from_offset(DATA_START);
        let tree = if alloc.size()? == DATA_START {
            alloc.store_mut().begin_batch()?;
            let tree = match BTree::create(&mut alloc, Bytewise, config.btree) {
                Ok(tree) => tree,
                Err(err) => {
                    alloc.store_mut().rollback()?;
                    return Err(err);
                }
            };
            finish_batch(&mut alloc)?;
            if tree.handle() != root {
                return Err(Error::InvalidState(format!(
                    "tree meta cell landed at {} instead of {}",
                    tree.handle(),
                    root
                )));
            }
            debug!(max_keys = tree.config().max_keys, "created tree");
            tree
        } else {
            BTree::open(&alloc, Bytewise, root)?
        };

        Ok(Self { alloc, tree })
    }
}

/// Commit the open batch, rolling it back if the commit fails
fn finish_batch(alloc: &mut Engine) -> Result<()> {
    let Err(err) = alloc.store_mut().commit() else {
        return Ok(());
    };
    if let Err(rollback) = alloc.store_mut().rollback() {
        warn!(error = %rollback, "rollback after failed commit did not complete");
    }
    Err(err)
}
