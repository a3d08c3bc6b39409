//! # Stratum WAL (Write-Ahead Log)
//!
//! Undo log that makes a batch of store writes atomic.
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
//! The log only ever holds one batch: a BEGIN record with the pre-batch
//! store size, followed by the original bytes of every page the batch
//! touched, captured before the first write to that page. Committing
//! empties the log. Opening a [`WalStore`] whose log is not empty rolls the
//! abandoned batch back before anything else can run.
//!
//! ```text
//! begin_batch ─► BEGIN ─► PRE_IMAGE* ─► commit   (log emptied)
//!                                   └─► rollback (pre-images written back
//!                                                 in reverse, store truncated)
//! ```

use serde::{Deserialize, Serialize};
use stratum_core::{Error, Result};

pub mod reader;
pub mod record;
pub mod recovery;
pub mod store;
pub mod writer;

pub use reader::WalReader;
pub use record::{RecordPayload, RecordType, WalRecord};
pub use recovery::RecoveryStats;
pub use store::WalStore;
pub use writer::WalWriter;

/// Default pre-image granularity
pub const DEFAULT_PAGE_SIZE: u64 = 512;

/// WAL configuration options
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Sync mode: sync, async, or none
    pub sync_mode: SyncMode,
    /// Size of the unit whose original bytes are captured on first write
    pub page_size: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::Sync,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl WalConfig {
    /// Set the sync mode
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Set the pre-image page size
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    /// Reject page sizes that are not a power of two of at least 16 bytes
    pub fn validate(&self) -> Result<()> {
        if self.page_size < 16 || !self.page_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "WAL page size must be a power of two >= 16, got {}",
                self.page_size
            )));
        }
        Ok(())
    }
}

/// Sync mode for WAL writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// fsync the log before every data write that follows a new pre-image
    /// (survives power loss at any point)
    Sync,
    /// fsync only at commit (an interrupted batch is recoverable after a
    /// process crash, not necessarily after power loss)
    Async,
    /// No fsync (fastest, unsafe for power loss)
    None,
}
