//! Chunk framing - the on-disk layout the allocator manages
//!
//! The store is a 16-byte header, the free-list table, then a gapless run
//! of chunks. Every chunk is a whole number of 16-byte atoms and carries
//! its tag and size at both ends, so neighbours can be found in either
//! direction without an index.
//!
//! ## Store Layout
//!
//! ```text
//! 0        16                       144
//! +--------+------------------------+---------+---------+----
//! | header | FLT: 16 x i64 heads    | chunk   | chunk   | ...
//! +--------+------------------------+---------+---------+----
//! ```
//!
//! ## Chunk Layout
//!
//! ```text
//! short / redirect   [tag|0 0 0|atoms u32][len u32][crc u32] payload .. [trailer]
//! long / cont        [tag|0 0 0|atoms u32][len u32][crc u32][next i64][total u64] payload .. [trailer]
//! free               [0xFF|0 0 0|atoms u32][next i64][prev i64] .. [trailer]
//! trailer            [tag|0 0 0|atoms u32]
//! ```

use stratum_core::{Error, Handle, Result};

/// Allocation granularity in bytes
pub const ATOM: u64 = 16;

/// Size of the store header at offset 0
pub const STORE_HEADER_SIZE: u64 = 16;

/// Number of size classes (free-list table slots)
pub const SIZE_CLASSES: usize = 16;

/// Offset of the free-list table
pub const FLT_OFFSET: u64 = STORE_HEADER_SIZE;

/// Offset of the first chunk
pub const DATA_START: u64 = FLT_OFFSET + SIZE_CLASSES as u64 * 8;

/// Header bytes of a short or redirect chunk
pub const SHORT_HEADER: u64 = 16;

/// Header bytes of a chain chunk (long head or continuation)
pub const CHAIN_HEADER: u64 = 32;

/// Header bytes a free chunk needs for its list links
pub const FREE_HEADER: u64 = 24;

/// Trailer bytes at the end of every chunk
pub const TRAILER: u64 = 8;

/// Smallest chunk, and smallest remainder worth splitting off
pub const MIN_CHUNK_ATOMS: u64 = 2;

/// Largest single chunk
pub const MAX_CHUNK_ATOMS: u64 = 128;

/// Payload capacity of the largest short chunk
pub const MAX_SHORT_PAYLOAD: usize = (MAX_CHUNK_ATOMS * ATOM - SHORT_HEADER - TRAILER) as usize;

/// Payload carried by each full chunk of a chain
pub const MAX_CHAIN_PAYLOAD: usize = (MAX_CHUNK_ATOMS * ATOM - CHAIN_HEADER - TRAILER) as usize;

/// Lower bound (in atoms) of each size class
pub const CLASS_BOUNDS: [u64; SIZE_CLASSES] = [
    2, 3, 4, 5, 8, 16, 32, 64, 128, 256, 512, 1024, 4096, 16384, 65536, 262144,
];

/// Tag of a free chunk
pub const TAG_FREE: u8 = 0xFF;

const KIND_MASK: u8 = 0x0F;
const KIND_SHORT: u8 = 1;
const KIND_LONG: u8 = 2;
const KIND_CONTINUATION: u8 = 3;
const KIND_REDIRECT: u8 = 4;

/// Payload is Snappy-compressed
pub const FLAG_COMPRESSED: u8 = 0x10;
/// Chunk is the target of a redirect and not a handle of its own
pub const FLAG_RELOCATED: u8 = 0x20;
const FLAG_MASK: u8 = FLAG_COMPRESSED | FLAG_RELOCATED;

/// Size class holding chunks of `atoms` atoms
pub fn class_of(atoms: u64) -> usize {
    CLASS_BOUNDS
        .iter()
        .rposition(|&bound| atoms >= bound)
        .unwrap_or(0)
}

/// Atoms needed for a chunk with `header` bytes of header and `payload`
/// bytes of payload
pub fn atoms_for(header: u64, payload: usize) -> u64 {
    let bytes = header + payload as u64 + TRAILER;
    bytes.div_ceil(ATOM).max(MIN_CHUNK_ATOMS)
}

/// What a chunk holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkKind {
    /// On a free list
    Free,
    /// Whole content in one chunk
    Short,
    /// First chunk of a chain
    Long,
    /// Later chunk of a chain
    Continuation,
    /// Forwarding stub whose payload is the handle of a relocated target
    Redirect,
}

impl ChunkKind {
    fn code(self) -> u8 {
        match self {
            ChunkKind::Free => TAG_FREE,
            ChunkKind::Short => KIND_SHORT,
            ChunkKind::Long => KIND_LONG,
            ChunkKind::Continuation => KIND_CONTINUATION,
            ChunkKind::Redirect => KIND_REDIRECT,
        }
    }

    /// True for the two kinds that use the 32-byte chain header
    pub fn is_chain(self) -> bool {
        matches!(self, ChunkKind::Long | ChunkKind::Continuation)
    }

    /// Bytes of header before the payload
    pub fn header_len(self) -> u64 {
        match self {
            ChunkKind::Free => FREE_HEADER,
            ChunkKind::Long | ChunkKind::Continuation => CHAIN_HEADER,
            ChunkKind::Short | ChunkKind::Redirect => SHORT_HEADER,
        }
    }
}

/// Decoded chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Chunk kind
    pub kind: ChunkKind,
    /// `FLAG_*` bits (zero for free chunks)
    pub flags: u8,
    /// Span in atoms, header and trailer included
    pub atoms: u64,
    /// Stored payload bytes in this chunk
    pub len: u32,
    /// CRC32 of this chunk's stored payload
    pub crc: u32,
    /// Next free chunk in the class, or next chunk of the chain
    pub next: Handle,
    /// Previous free chunk in the class (free chunks only)
    pub prev: Handle,
    /// Stored length of the whole chain (long heads only)
    pub total: u64,
}

impl ChunkHeader {
    /// Header of a free chunk
    pub fn free(atoms: u64, next: Handle, prev: Handle) -> Self {
        Self {
            kind: ChunkKind::Free,
            flags: 0,
            atoms,
            len: 0,
            crc: 0,
            next,
            prev,
            total: 0,
        }
    }

    /// Header of a used chunk holding `payload`
    pub fn used(kind: ChunkKind, flags: u8, atoms: u64, payload: &[u8]) -> Self {
        Self {
            kind,
            flags,
            atoms,
            len: payload.len() as u32,
            crc: crc32fast::hash(payload),
            next: Handle::NULL,
            prev: Handle::NULL,
            total: 0,
        }
    }

    /// Tag byte as stored in the header and trailer
    pub fn tag(&self) -> u8 {
        match self.kind {
            ChunkKind::Free => TAG_FREE,
            kind => kind.code() | self.flags,
        }
    }

    /// Span in bytes
    pub fn span(&self) -> u64 {
        self.atoms * ATOM
    }

    /// Payload bytes this chunk can hold
    pub fn capacity(&self) -> u64 {
        self.span().saturating_sub(self.kind.header_len() + TRAILER)
    }

    /// True if the payload is compressed
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// True if the chunk is a redirect target
    pub fn is_relocated(&self) -> bool {
        self.flags & FLAG_RELOCATED != 0
    }

    /// Encode the header; only the first `kind.header_len()` bytes matter
    pub fn encode(&self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        buf[0] = self.tag();
        buf[4..8].copy_from_slice(&(self.atoms as u32).to_le_bytes());
        match self.kind {
            ChunkKind::Free => {
                buf[8..16].copy_from_slice(&self.next.raw().to_le_bytes());
                buf[16..24].copy_from_slice(&self.prev.raw().to_le_bytes());
            }
            kind => {
                buf[8..12].copy_from_slice(&self.len.to_le_bytes());
                buf[12..16].copy_from_slice(&self.crc.to_le_bytes());
                if kind.is_chain() {
                    buf[16..24].copy_from_slice(&self.next.raw().to_le_bytes());
                    buf[24..32].copy_from_slice(&self.total.to_le_bytes());
                }
            }
        }
        buf
    }

    /// Decode the header of the chunk at `handle` from its first 32 bytes
    pub fn decode(handle: Handle, buf: &[u8; 32]) -> Result<Self> {
        let (tag, atoms) = decode_tag_and_atoms(handle, &buf[..8])?;
        if tag == TAG_FREE {
            return Ok(Self::free(
                atoms,
                Handle::new(read_i64(&buf[8..16])),
                Handle::new(read_i64(&buf[16..24])),
            ));
        }

        let kind = match tag & KIND_MASK {
            KIND_SHORT => ChunkKind::Short,
            KIND_LONG => ChunkKind::Long,
            KIND_CONTINUATION => ChunkKind::Continuation,
            KIND_REDIRECT => ChunkKind::Redirect,
            other => {
                return Err(Error::corrupt(
                    handle.raw(),
                    format!("unknown chunk kind {:#x}", other),
                ))
            }
        };
        let flags = tag & !KIND_MASK;
        if flags & !FLAG_MASK != 0 {
            return Err(Error::corrupt(
                handle.raw(),
                format!("unknown chunk flags {:#x}", flags),
            ));
        }

        let mut header = Self {
            kind,
            flags,
            atoms,
            len: read_u32(&buf[8..12]),
            crc: read_u32(&buf[12..16]),
            next: Handle::NULL,
            prev: Handle::NULL,
            total: 0,
        };
        if header.span() < kind.header_len() + TRAILER {
            return Err(Error::corrupt(
                handle.raw(),
                format!("{:?} chunk of {} atoms cannot hold its own header", kind, atoms),
            ));
        }
        if kind.is_chain() {
            header.next = Handle::new(read_i64(&buf[16..24]));
            header.total = read_i64(&buf[24..32]) as u64;
        }
        if header.len as u64 > header.capacity() {
            return Err(Error::corrupt(
                handle.raw(),
                format!(
                    "payload length {} exceeds capacity {}",
                    header.len,
                    header.capacity()
                ),
            ));
        }
        Ok(header)
    }
}

/// Encode the 8-byte trailer for a chunk
pub fn encode_trailer(tag: u8, atoms: u64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0] = tag;
    buf[4..8].copy_from_slice(&(atoms as u32).to_le_bytes());
    buf
}

/// Decode a trailer into `(tag, atoms)`; `handle` names the chunk it ends
pub fn decode_trailer(handle: Handle, buf: &[u8; 8]) -> Result<(u8, u64)> {
    decode_tag_and_atoms(handle, buf)
}

fn decode_tag_and_atoms(handle: Handle, buf: &[u8]) -> Result<(u8, u64)> {
    if buf[1..4] != [0, 0, 0] {
        return Err(Error::corrupt(handle.raw(), "reserved tag bytes are not zero"));
    }
    let atoms = read_u32(&buf[4..8]) as u64;
    if atoms < MIN_CHUNK_ATOMS {
        return Err(Error::corrupt(
            handle.raw(),
            format!("chunk of {} atoms is below the minimum", atoms),
        ));
    }
    Ok((buf[0], atoms))
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    u32::from_le_bytes(raw)
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    i64::from_le_bytes(raw)
}
