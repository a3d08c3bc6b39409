// WAL reader module - reads records back from a log store
//
// The reader handles:
// 1. Record framing - reading the length prefix, then the whole frame
// 2. CRC validation - verifying data integrity of each record
// 3. Torn tails - an incomplete or damaged final record ends the log

use crate::record::WalRecord;
use stratum_core::{Result, Store};
use tracing::warn;

/// WAL reader over a log store
pub struct WalReader<'a, L: Store> {
    log: &'a L,
    /// Size of the log when the reader was created
    size: u64,
    /// Byte offset of the next record
    offset: u64,
    /// Set once a damaged record stopped the scan
    torn: bool,
}

impl<'a, L: Store> WalReader<'a, L> {
    /// Create a reader positioned at the first record
    pub fn new(log: &'a L) -> Result<Self> {
        Ok(Self {
            log,
            size: log.size()?,
            offset: 0,
            torn: false,
        })
    }

    /// Read the next record from the WAL
    ///
    /// Returns `Ok(Some(record))` if a record was read successfully and
    /// `Ok(None)` at the end of the log. A truncated or CRC-failing record
    /// is treated as the end of the log and flagged via [`WalReader::is_torn`].
    pub fn next_record(&mut self) -> Result<Option<WalRecord>> {
        if self.torn || self.offset >= self.size {
            return Ok(None);
        }

        let remaining = self.size - self.offset;
        if remaining < 4 {
            return Ok(self.tear("incomplete length prefix"));
        }

        let mut prefix = [0u8; 4];
        self.log.read_at(self.offset, &mut prefix)?;
        let frame_len = WalRecord::frame_len(prefix) as u64;
        if frame_len > remaining {
            return Ok(self.tear("incomplete record frame"));
        }

        let frame = self.log.read_vec(self.offset, frame_len as usize)?;
        match WalRecord::decode(&frame) {
            Ok((record, consumed)) => {
                self.offset += consumed as u64;
                Ok(Some(record))
            }
            Err(e) => Ok(self.tear(&e.to_string())),
        }
    }

    /// Read every remaining record
    pub fn read_all(&mut self) -> Result<Vec<WalRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    /// True if the scan stopped at a damaged record
    pub fn is_torn(&self) -> bool {
        self.torn
    }

    /// Offset just past the last valid record
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn tear(&mut self, reason: &str) -> Option<WalRecord> {
        warn!(offset = self.offset, reason, "ignoring torn WAL tail");
        self.torn = true;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::MemStore;

    fn log_with(records: &[WalRecord]) -> MemStore {
        let mut log = MemStore::new();
        let mut offset = 0;
        for record in records {
            let bytes = record.encode().unwrap();
            log.write_at(offset, &bytes).unwrap();
            offset += bytes.len() as u64;
        }
        log
    }

    #[test]
    fn test_reads_records_in_order() {
        let records = vec![
            WalRecord::begin(1, 100),
            WalRecord::pre_image(0, vec![1, 2, 3]),
            WalRecord::pre_image(64, vec![4, 5]),
        ];
        let log = log_with(&records);

        let mut reader = WalReader::new(&log).unwrap();
        assert_eq!(reader.read_all().unwrap(), records);
        assert!(!reader.is_torn());
    }

    #[test]
    fn test_empty_log() {
        let log = MemStore::new();
        let mut reader = WalReader::new(&log).unwrap();
        assert!(reader.next_record().unwrap().is_none());
        assert!(!reader.is_torn());
    }

    #[test]
    fn test_truncated_tail_is_ignored() {
        let records = vec![WalRecord::begin(1, 100), WalRecord::pre_image(0, vec![9; 40])];
        let mut log = log_with(&records);
        let size = log.size().unwrap();
        log.truncate(size - 3).unwrap();

        let mut reader = WalReader::new(&log).unwrap();
        let read = reader.read_all().unwrap();
        assert_eq!(read, records[..1].to_vec());
        assert!(reader.is_torn());
    }

    #[test]
    fn test_corrupt_tail_is_ignored() {
        let records = vec![WalRecord::begin(1, 100), WalRecord::pre_image(0, vec![9; 40])];
        let mut log = log_with(&records);
        let size = log.size().unwrap();
        // Flip a payload byte of the last record
        log.write_at(size - 10, &[0xEE]).unwrap();

        let mut reader = WalReader::new(&log).unwrap();
        assert_eq!(reader.read_all().unwrap().len(), 1);
        assert!(reader.is_torn());
    }
}
