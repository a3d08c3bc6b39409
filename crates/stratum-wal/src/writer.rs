// WAL writer module - handles appending records to the log store
use crate::record::WalRecord;
use crate::SyncMode;
use stratum_core::{Result, Store};

pub struct WalWriter<L: Store> {
    log: L,
    /// Append position (end of the last complete record)
    offset: u64,
    sync_mode: SyncMode,
    sequence: u64,
}

impl<L: Store> WalWriter<L> {
    /// Wrap a log store, appending after its current contents
    pub fn new(log: L, sync_mode: SyncMode) -> Result<Self> {
        let offset = log.size()?;
        Ok(Self {
            log,
            offset,
            sync_mode,
            sequence: 0,
        })
    }

    /// Append a record; returns its sequence number within the current log
    ///
    /// The record is not durable until [`WalWriter::sync`] runs.
    pub fn append(&mut self, record: &WalRecord) -> Result<u64> {
        let encoded = record.encode()?;
        self.log.write_at(self.offset, &encoded)?;

        self.offset += encoded.len() as u64;
        self.sequence += 1;

        Ok(self.sequence)
    }

    /// Flush the log unless the sync mode disables it
    pub fn sync(&mut self) -> Result<()> {
        if self.sync_mode != SyncMode::None {
            self.log.sync()?;
        }
        Ok(())
    }

    /// Discard every record; the log becomes empty
    pub fn reset(&mut self) -> Result<()> {
        self.log.truncate(0)?;
        self.offset = 0;
        self.sequence = 0;
        self.sync()
    }

    /// Borrow the underlying log store
    pub fn log(&self) -> &L {
        &self.log
    }

    /// Current log size in bytes
    pub fn len(&self) -> u64 {
        self.offset
    }

    /// True when the log holds no records
    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    /// Number of records appended since the last reset
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Give back the log store
    pub fn into_inner(self) -> L {
        self.log
    }
}
