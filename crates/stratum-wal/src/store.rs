// Batching store wrapper
//
// WalStore sits between the allocator and the real data store. While a
// batch is open, the first write to every WAL page below the pre-batch
// size first copies that page's original bytes into the log. Growth past
// the pre-batch size needs no pre-image: rollback truncates it away.

use crate::recovery::{self, RecoveryStats};
use crate::record::WalRecord;
use crate::writer::WalWriter;
use crate::{SyncMode, WalConfig};
use std::collections::BTreeSet;
use stratum_core::{Error, Result, Store};
use tracing::debug;

/// State of the open batch
#[derive(Debug)]
struct Batch {
    id: u64,
    /// Store size when the batch began
    base_size: u64,
    /// Page numbers whose pre-image is already in the log
    captured: BTreeSet<u64>,
}

/// A [`Store`] that makes groups of writes atomic.
///
/// Writes outside a batch go straight to the data store and are not
/// protected. Only one batch may be open at a time.
pub struct WalStore<S: Store, L: Store> {
    data: S,
    writer: WalWriter<L>,
    config: WalConfig,
    batch: Option<Batch>,
    next_batch: u64,
    recovery: RecoveryStats,
}

impl<S: Store, L: Store> WalStore<S, L> {
    /// Wrap `data` with `log` as its undo log.
    ///
    /// If the log still holds a batch from a previous session, that batch
    /// is rolled back before this returns.
    pub fn open(mut data: S, log: L, config: WalConfig) -> Result<Self> {
        config.validate()?;

        let mut writer = WalWriter::new(log, config.sync_mode)?;
        let recovery = if writer.is_empty() {
            RecoveryStats {
                restored_size: data.size()?,
                ..Default::default()
            }
        } else {
            let stats = recovery::rollback(&mut data, writer.log())?;
            writer.reset()?;
            stats
        };

        let next_batch = recovery.batch + 1;
        Ok(Self {
            data,
            writer,
            config,
            batch: None,
            next_batch,
            recovery,
        })
    }

    /// Start a batch; every write until [`commit`](Self::commit) or
    /// [`rollback`](Self::rollback) can be undone.
    pub fn begin_batch(&mut self) -> Result<()> {
        if let Some(batch) = &self.batch {
            return Err(Error::InvalidState(format!(
                "batch {} is already open",
                batch.id
            )));
        }
        if !self.writer.is_empty() {
            return Err(Error::InvalidState(format!(
                "log still holds {} bytes of an unfinished batch",
                self.writer.len()
            )));
        }

        let base_size = self.data.size()?;
        let id = self.next_batch;
        self.next_batch += 1;

        self.writer.append(&WalRecord::begin(id, base_size))?;
        if self.config.sync_mode == SyncMode::Sync {
            self.writer.sync()?;
        }

        debug!(batch = id, base_size, "batch started");
        self.batch = Some(Batch {
            id,
            base_size,
            captured: BTreeSet::new(),
        });
        Ok(())
    }

    /// Record the original bytes of `[offset, offset + len)` unless they
    /// were already captured in this batch.
    ///
    /// Called automatically by `write_at` and `truncate`; exposed so callers
    /// can protect a range ahead of an out-of-band write.
    pub fn log_before_image(&mut self, offset: u64, len: u64) -> Result<()> {
        let (base_size, page_size) = match &self.batch {
            Some(batch) => (batch.base_size, self.config.page_size),
            None => return Ok(()),
        };
        if len == 0 || offset >= base_size {
            return Ok(());
        }

        let end = offset.saturating_add(len).min(base_size);
        let first = offset / page_size;
        let last = (end - 1) / page_size;

        let mut appended = false;
        for page in first..=last {
            let fresh = match self.batch.as_mut() {
                Some(batch) => batch.captured.insert(page),
                None => false,
            };
            if !fresh {
                continue;
            }
            let start = page * page_size;
            let stop = (start + page_size).min(base_size);
            let image = self.data.read_vec(start, (stop - start) as usize)?;
            self.writer.append(&WalRecord::pre_image(start, image))?;
            appended = true;
        }

        if appended && self.config.sync_mode == SyncMode::Sync {
            self.writer.sync()?;
        }
        Ok(())
    }

    /// Make the batch's writes permanent and discard its pre-images.
    ///
    /// If this fails the batch stays open with its pre-images intact, so
    /// it can still be rolled back.
    pub fn commit(&mut self) -> Result<()> {
        if self.batch.is_none() {
            return Err(Error::InvalidState("commit without an open batch".to_string()));
        }

        if self.config.sync_mode != SyncMode::None {
            self.data.sync()?;
        }
        self.writer.reset()?;

        if let Some(batch) = self.batch.take() {
            debug!(batch = batch.id, pages = batch.captured.len(), "batch committed");
        }
        Ok(())
    }

    /// Undo every write of the open batch.
    ///
    /// Rolling back is idempotent: after a failure the batch stays open and
    /// the call can be repeated.
    pub fn rollback(&mut self) -> Result<RecoveryStats> {
        if self.batch.is_none() {
            return Err(Error::InvalidState("rollback without an open batch".to_string()));
        }

        let stats = recovery::rollback(&mut self.data, self.writer.log())?;
        self.writer.reset()?;

        if let Some(batch) = self.batch.take() {
            debug!(batch = batch.id, records = stats.records_applied, "batch rolled back");
        }
        Ok(stats)
    }

    /// True while a batch is open
    pub fn is_batch_open(&self) -> bool {
        self.batch.is_some()
    }

    /// Number of pages captured by the open batch
    pub fn batch_pages(&self) -> usize {
        self.batch.as_ref().map_or(0, |b| b.captured.len())
    }

    /// What recovery did when this store was opened
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }

    /// Borrow the data store
    pub fn data(&self) -> &S {
        &self.data
    }

    /// Borrow the log store
    pub fn log(&self) -> &L {
        self.writer.log()
    }

    /// Configuration in effect
    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Give back both stores without committing.
    ///
    /// An open batch is abandoned exactly as if the process had stopped:
    /// its pre-images stay in the log and the next [`open`](Self::open)
    /// rolls it back.
    pub fn into_inner(self) -> (S, L) {
        (self.data, self.writer.into_inner())
    }
}

impl<S: Store, L: Store> Store for WalStore<S, L> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.data.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.log_before_image(offset, data.len() as u64)?;
        self.data.write_at(offset, data)
    }

    fn size(&self) -> Result<u64> {
        self.data.size()
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        let base_size = self.batch.as_ref().map(|b| b.base_size);
        if let Some(base) = base_size {
            if len < base {
                self.log_before_image(len, base - len)?;
            }
        }
        self.data.truncate(len)
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.sync()?;
        self.data.sync()
    }
}
