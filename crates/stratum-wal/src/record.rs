// Undo log records
//
// Every record is one frame: [len u32 LE][type u8][payload][crc32 u32 LE],
// where len counts the type byte and the payload, and the CRC covers both.
//
// Types:
// - BEGIN (1): batch start, carries the pre-batch store size
// - PRE_IMAGE (2): original bytes of one page, captured before its first write

use bincode::Options;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use stratum_core::format_version::{magic, WAL_FORMAT_VERSION};
use stratum_core::{Error, Result};

/// Size of the framing around a payload: length, type byte and CRC
pub const FRAME_OVERHEAD: usize = 4 + 1 + 4;

/// Frame type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordType {
    /// Opens a batch
    Begin = 1,
    /// Bytes of one page as they were before the batch
    PreImage = 2,
}

impl TryFrom<u8> for RecordType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RecordType::Begin),
            2 => Ok(RecordType::PreImage),
            other => Err(Error::Serialization(format!("unknown WAL record type {}", other))),
        }
    }
}

/// Decoded frame body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum RecordPayload {
    /// `store_size` is what rollback truncates back to
    Begin {
        magic: u32,
        version: u16,
        batch: u64,
        store_size: u64,
    },
    /// `data` goes back to `offset` on rollback
    PreImage { offset: u64, data: Vec<u8> },
}

/// One frame of the undo log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Type byte of the frame
    pub record_type: RecordType,
    /// Frame body
    pub payload: RecordPayload,
}

impl WalRecord {
    /// Create a BEGIN record for batch `batch` over a store of `store_size` bytes
    pub fn begin(batch: u64, store_size: u64) -> Self {
        Self {
            record_type: RecordType::Begin,
            payload: RecordPayload::Begin {
                magic: magic::WAL,
                version: WAL_FORMAT_VERSION,
                batch,
                store_size,
            },
        }
    }

    /// Create a PRE_IMAGE record holding the original bytes at `offset`
    pub fn pre_image(offset: u64, data: Vec<u8>) -> Self {
        Self {
            record_type: RecordType::PreImage,
            payload: RecordPayload::PreImage { offset, data },
        }
    }

    /// Frame the record as `[len][type][payload][crc]`
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::DefaultOptions::new()
            .serialize(&self.payload)
            .map_err(|e| Error::Serialization(format!("WAL payload does not encode: {}", e)))?;
        let body_len = u32::try_from(payload.len() + 1).map_err(|_| {
            Error::Serialization(format!("WAL payload of {} bytes is too large", payload.len()))
        })?;

        let kind = self.record_type as u8;
        let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
        frame.extend_from_slice(&body_len.to_le_bytes());
        frame.push(kind);
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&checksum(kind, &payload).to_le_bytes());
        Ok(frame)
    }

    /// Total frame size announced by the length prefix at the start of `data`
    pub fn frame_len(prefix: [u8; 4]) -> usize {
        4 + u32::from_le_bytes(prefix) as usize + 4
    }

    /// Decode the frame at the start of `data`; returns the record and the
    /// number of bytes it occupied.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let prefix: [u8; 4] = match data.get(..4) {
            Some(bytes) if data.len() >= FRAME_OVERHEAD => [bytes[0], bytes[1], bytes[2], bytes[3]],
            _ => return Err(Error::Serialization("truncated WAL frame".to_string())),
        };
        let total = Self::frame_len(prefix);
        if total == 8 {
            return Err(Error::Serialization("WAL frame without a type byte".to_string()));
        }
        let Some(frame) = data.get(..total) else {
            return Err(Error::Serialization(format!(
                "truncated WAL frame: {} of {} bytes present",
                data.len(),
                total
            )));
        };

        let (body, crc) = frame[4..].split_at(total - 8);
        let (kind, payload) = (body[0], &body[1..]);
        let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if checksum(kind, payload) != stored {
            return Err(Error::Serialization(format!(
                "WAL frame checksum {:#010x} does not match its contents",
                stored
            )));
        }

        let record_type = RecordType::try_from(kind)?;
        let payload: RecordPayload = bincode::DefaultOptions::new()
            .with_limit(payload.len() as u64)
            .deserialize(payload)
            .map_err(|e| Error::Serialization(format!("WAL payload does not decode: {}", e)))?;

        match (record_type, &payload) {
            (RecordType::Begin, RecordPayload::Begin { .. })
            | (RecordType::PreImage, RecordPayload::PreImage { .. }) => Ok((
                WalRecord {
                    record_type,
                    payload,
                },
                total,
            )),
            _ => Err(Error::Serialization(format!(
                "{:?} frame carries a different payload",
                record_type
            ))),
        }
    }
}

fn checksum(kind: u8, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&[kind]);
    hasher.update(payload);
    hasher.finalize()
}
