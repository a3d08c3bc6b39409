// WAL recovery module - undoes an interrupted batch
//
// Recovery is responsible for:
// 1. Reading the BEGIN record and every complete PRE_IMAGE after it
// 2. Writing the pre-images back in reverse capture order
// 3. Truncating the store back to its pre-batch size
// 4. Leaving the log untouched until the store has been restored, so a
//    crash during recovery simply repeats it on the next open

use crate::record::RecordPayload;
use crate::WalReader;
use stratum_core::format_version::{magic, wal_version};
use stratum_core::{Error, Result, Store};
use tracing::{info, warn};

/// Outcome of a rollback, either explicit or at open time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Whether an unfinished batch was found and undone
    pub rolled_back: bool,
    /// Batch number recorded in the BEGIN record
    pub batch: u64,
    /// Number of pre-images written back
    pub records_applied: u64,
    /// Bytes of pre-image data written back
    pub bytes_restored: u64,
    /// Whether the log ended in a damaged record
    pub torn_tail: bool,
    /// Store size after recovery
    pub restored_size: u64,
}

/// Rolls the data store back to the state described by `log`.
///
/// Does not clear the log; the caller resets it once this returns.
pub fn rollback<S: Store, L: Store>(data: &mut S, log: &L) -> Result<RecoveryStats> {
    let mut reader = WalReader::new(log)?;
    let mut stats = RecoveryStats::default();

    let (batch, store_size) = match reader.next_record()? {
        None => {
            // Only a torn BEGIN (or nothing) made it to the log: no data
            // write can have happened yet.
            stats.torn_tail = reader.is_torn();
            stats.restored_size = data.size()?;
            return Ok(stats);
        }
        Some(record) => match record.payload {
            RecordPayload::Begin {
                magic: m,
                version,
                batch,
                store_size,
            } => {
                if m != magic::WAL || !wal_version().can_read(version) {
                    return Err(Error::InvalidState(format!(
                        "WAL header magic {:#x} version {} not supported",
                        m, version
                    )));
                }
                (batch, store_size)
            }
            RecordPayload::PreImage { offset, .. } => {
                return Err(Error::InvalidState(format!(
                    "WAL starts with a pre-image at {} instead of BEGIN",
                    offset
                )));
            }
        },
    };

    let mut images = Vec::new();
    while let Some(record) = reader.next_record()? {
        match record.payload {
            RecordPayload::PreImage { offset, data } => images.push((offset, data)),
            RecordPayload::Begin { batch: other, .. } => {
                return Err(Error::InvalidState(format!(
                    "WAL holds a second BEGIN (batch {}) inside batch {}",
                    other, batch
                )));
            }
        }
    }
    stats.torn_tail = reader.is_torn();

    for (offset, bytes) in images.iter().rev() {
        data.write_at(*offset, bytes)?;
        stats.records_applied += 1;
        stats.bytes_restored += bytes.len() as u64;
    }
    data.truncate(store_size)?;
    data.sync()?;

    stats.rolled_back = true;
    stats.batch = batch;
    stats.restored_size = store_size;

    if stats.torn_tail {
        warn!(batch, "WAL tail was torn; its data write never happened");
    }
    info!(
        batch,
        records = stats.records_applied,
        bytes = stats.bytes_restored,
        size = store_size,
        "rolled back unfinished batch"
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::WalRecord;
    use stratum_core::MemStore;

    fn append(log: &mut MemStore, record: WalRecord) {
        let bytes = record.encode().unwrap();
        let end = log.size().unwrap();
        log.write_at(end, &bytes).unwrap();
    }

    #[test]
    fn test_rollback_restores_pre_images_and_size() {
        let mut data = MemStore::from_bytes(b"0123456789");
        let mut log = MemStore::new();
        append(&mut log, WalRecord::begin(3, 10));
        append(&mut log, WalRecord::pre_image(0, b"0123".to_vec()));

        // Batch overwrote the first page and grew the store
        data.write_at(0, b"xxxx").unwrap();
        data.write_at(10, b"tail").unwrap();

        let stats = rollback(&mut data, &log).unwrap();
        assert!(stats.rolled_back);
        assert_eq!(stats.batch, 3);
        assert_eq!(stats.records_applied, 1);
        assert_eq!(data.as_bytes(), b"0123456789");
    }

    #[test]
    fn test_reverse_order_wins_for_overlaps() {
        let mut data = MemStore::from_bytes(b"AAAA");
        let mut log = MemStore::new();
        append(&mut log, WalRecord::begin(1, 4));
        append(&mut log, WalRecord::pre_image(0, b"AAAA".to_vec()));
        append(&mut log, WalRecord::pre_image(0, b"BBBB".to_vec()));
        data.write_at(0, b"CCCC").unwrap();

        rollback(&mut data, &log).unwrap();
        // The earliest capture is applied last
        assert_eq!(data.as_bytes(), b"AAAA");
    }

    #[test]
    fn test_empty_log_is_a_no_op() {
        let mut data = MemStore::from_bytes(b"keep");
        let log = MemStore::new();
        let stats = rollback(&mut data, &log).unwrap();
        assert!(!stats.rolled_back);
        assert_eq!(data.as_bytes(), b"keep");
    }

    #[test]
    fn test_log_without_begin_is_rejected() {
        let mut data = MemStore::new();
        let mut log = MemStore::new();
        append(&mut log, WalRecord::pre_image(0, vec![1]));
        assert!(matches!(
            rollback(&mut data, &log),
            Err(Error::InvalidState(_))
        ));
    }
}
