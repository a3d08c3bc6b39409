//! Chunk allocator
//!
//! Manages variable-length chunks inside a [`Store`]. Free chunks sit on
//! one doubly linked list per size class, headed from the free-list table
//! at the start of the store. The table is never cached: every head is
//! read from and written to the store, so undoing the store's bytes (WAL
//! rollback) undoes the allocator state with it.
//!
//! ## Allocation
//!
//! ```text
//! need = atoms for header + payload + trailer
//!   1. best fit on the list of need's size class
//!   2. head of the first non-empty larger class
//!   3. append at the end of the store
//! split off the rest when it is at least MIN_CHUNK_ATOMS
//! ```
//!
//! Freed chunks are merged with both immediate neighbours when those are
//! free, so no two free chunks are ever adjacent. The store never shrinks.

use crate::chunk::{
    atoms_for, class_of, decode_trailer, encode_trailer, ChunkHeader, ChunkKind, ATOM,
    CHAIN_HEADER, DATA_START, FLAG_COMPRESSED, FLAG_RELOCATED, FLT_OFFSET, MAX_CHAIN_PAYLOAD,
    MAX_SHORT_PAYLOAD, MIN_CHUNK_ATOMS, SHORT_HEADER, SIZE_CLASSES, TAG_FREE, TRAILER,
};
use crate::compression::{Codec, Snappy};
use std::borrow::Cow;
use std::sync::Arc;
use stratum_core::format_version::{allocator_version, magic, ALLOCATOR_FORMAT_VERSION};
use stratum_core::{Error, Handle, Result, Store};
use tracing::debug;

/// Content shorter than this is stored as is
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 64;

/// Largest store the 32-bit atom count of a free chunk can describe
pub const MAX_STORE_SIZE: u64 = u32::MAX as u64 * ATOM;

/// Allocator configuration
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Minimum content length before compression is attempted
    pub compress_threshold: usize,
    /// Growing the store past this many bytes fails with `CapacityExceeded`
    pub max_store_size: u64,
    /// Compression strategy for payloads stored with `compress = true`
    pub codec: Arc<dyn Codec>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            max_store_size: MAX_STORE_SIZE,
            codec: Arc::new(Snappy),
        }
    }
}

impl AllocatorConfig {
    /// Set the compression threshold
    pub fn with_compress_threshold(mut self, threshold: usize) -> Self {
        self.compress_threshold = threshold;
        self
    }

    /// Set the store size limit
    pub fn with_max_store_size(mut self, max_store_size: u64) -> Self {
        self.max_store_size = max_store_size;
        self
    }

    /// Set the compression codec
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Reject limits the format cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.max_store_size < DATA_START + MIN_CHUNK_ATOMS * ATOM {
            return Err(Error::InvalidConfig(format!(
                "max_store_size {} leaves no room for a chunk",
                self.max_store_size
            )));
        }
        if self.max_store_size > MAX_STORE_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max_store_size {} exceeds the format limit {}",
                self.max_store_size, MAX_STORE_SIZE
            )));
        }
        Ok(())
    }
}

/// One chunk as found in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Where the chunk starts
    pub handle: Handle,
    /// Its decoded header
    pub header: ChunkHeader,
}

impl ChunkInfo {
    fn new(handle: Handle, header: ChunkHeader) -> Self {
        Self { handle, header }
    }

    /// Chunk kind
    pub fn kind(&self) -> ChunkKind {
        self.header.kind
    }

    /// Span in atoms
    pub fn atoms(&self) -> u64 {
        self.header.atoms
    }

    /// Span in bytes
    pub fn span(&self) -> u64 {
        self.header.span()
    }

    /// Offset just past the chunk
    pub fn end(&self) -> u64 {
        self.handle.offset() + self.header.span()
    }
}

/// Everything that makes up the content behind one handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    /// The handle that was resolved
    pub handle: Handle,
    /// Target chunk when `handle` is a redirect
    pub relocated_to: Option<Handle>,
    /// Every chunk owned by the handle: the redirect stub (if any), then
    /// the content head and its continuations in chain order
    pub chunks: Vec<ChunkInfo>,
    /// Stored (possibly compressed) length
    pub stored_len: u64,
    /// Logical length after decompression
    pub content_len: u64,
    /// Whether the payload is compressed
    pub compressed: bool,
}

/// Allocator over a backing store
pub struct Allocator<S: Store> {
    store: S,
    config: AllocatorConfig,
}

impl<S: Store> Allocator<S> {
    /// Open with the default configuration
    pub fn new(store: S) -> Result<Self> {
        Self::open(store, AllocatorConfig::default())
    }

    /// Open `store`, writing an empty header and free-list table if it has
    /// no bytes yet, or validating the existing header otherwise.
    pub fn open(mut store: S, config: AllocatorConfig) -> Result<Self> {
        config.validate()?;

        let size = store.size()?;
        if size == 0 {
            let mut header = [0u8; DATA_START as usize];
            header[..8].copy_from_slice(&magic::STORE);
            header[8..10].copy_from_slice(&ALLOCATOR_FORMAT_VERSION.to_le_bytes());
            store.write_at(0, &header)?;
            debug!("initialized empty store");
        } else {
            if size < DATA_START || (size - DATA_START) % ATOM != 0 {
                return Err(Error::corrupt(
                    0,
                    format!("store size {} is not a header plus whole atoms", size),
                ));
            }
            let mut header = [0u8; 16];
            store.read_at(0, &mut header)?;
            if header[..8] != magic::STORE {
                return Err(Error::corrupt(0, "store header magic mismatch"));
            }
            let version = u16::from_le_bytes([header[8], header[9]]);
            if !allocator_version().can_read(version) {
                return Err(Error::InvalidState(format!(
                    "store format version {} not supported",
                    version
                )));
            }
            debug!(size, version, "opened store");
        }

        Ok(Self { store, config })
    }

    /// Store `content` and return its handle.
    ///
    /// With `compress`, content at least `compress_threshold` long goes
    /// through the codec and is kept compressed only if that made it
    /// smaller. Content too long for one chunk becomes a chain.
    pub fn allocate(&mut self, content: &[u8], compress: bool) -> Result<Handle> {
        let (stored, flags) = self.encode_payload(content, compress);
        self.place(&stored, flags)
    }

    /// Release every chunk owned by `handle`
    pub fn free(&mut self, handle: Handle) -> Result<()> {
        let owned = self.owned_chunks(handle)?;
        for chunk in &owned {
            self.release(chunk.handle.offset(), chunk.atoms())?;
        }
        debug!(%handle, chunks = owned.len(), "freed");
        Ok(())
    }

    /// Logical content behind `handle`
    pub fn read(&self, handle: Handle) -> Result<Vec<u8>> {
        let (target, header) = self.resolve(handle)?;
        let chain = self.chain_of(target, &header)?;
        let stored = self.read_chain(&chain)?;
        self.decode_payload(target, &header, stored)
    }

    /// Replace the content behind `handle`, returning the handle that now
    /// holds it.
    ///
    /// Content that fits the handle's own chunk is rewritten in place and
    /// any unused tail is split off; otherwise the content is stored anew
    /// and the old handle freed.
    pub fn resize(&mut self, handle: Handle, content: &[u8], compress: bool) -> Result<Handle> {
        let own = self.read_used(handle)?;
        let (stored, flags) = self.encode_payload(content, compress);

        if own.kind != ChunkKind::Redirect && stored.len() as u64 <= short_capacity(own.atoms) {
            let tail = self.owned_chunks(handle)?;
            for chunk in tail.iter().skip(1) {
                self.release(chunk.handle.offset(), chunk.atoms())?;
            }
            self.rewrite(handle.offset(), own.atoms, ChunkKind::Short, flags, &stored)?;
            return Ok(handle);
        }

        let moved = self.place(&stored, flags)?;
        self.free(handle)?;
        Ok(moved)
    }

    /// Replace the content behind `handle` without changing the handle.
    ///
    /// If the new payload does not fit the handle's chunk, it goes to a
    /// relocated target and the handle's chunk becomes a redirect to it.
    /// A handle is never more than one redirect away from its content.
    pub fn realloc(&mut self, handle: Handle, content: &[u8], compress: bool) -> Result<()> {
        let own = self.read_used(handle)?;
        let (stored, flags) = self.encode_payload(content, compress);

        if stored.len() as u64 <= short_capacity(own.atoms) {
            self.release_tail(handle)?;
            return self.rewrite(handle.offset(), own.atoms, ChunkKind::Short, flags, &stored);
        }

        let target = self.place(&stored, flags | FLAG_RELOCATED)?;
        self.release_tail(handle)?;
        debug!(%handle, %target, "relocated content");
        self.rewrite(
            handle.offset(),
            own.atoms,
            ChunkKind::Redirect,
            0,
            &target.raw().to_le_bytes(),
        )
    }

    /// Length of the content behind `handle` after decompression
    pub fn content_len(&self, handle: Handle) -> Result<u64> {
        Ok(self.content_info(handle)?.content_len)
    }

    /// Resolve `handle` fully: follow the redirect, walk the chain, check
    /// every checksum and decompress.
    pub fn content_info(&self, handle: Handle) -> Result<ContentInfo> {
        let (target, header) = self.resolve(handle)?;
        let chain = self.chain_of(target, &header)?;
        let stored = self.read_chain(&chain)?;
        let stored_len = stored.len() as u64;
        let content_len = self.decode_payload(target, &header, stored)?.len() as u64;

        let mut chunks = Vec::with_capacity(chain.len() + 1);
        let relocated_to = if target != handle {
            chunks.push(ChunkInfo::new(handle, self.read_chunk(handle)?));
            Some(target)
        } else {
            None
        };
        chunks.extend(chain);

        Ok(ContentInfo {
            handle,
            relocated_to,
            chunks,
            stored_len,
            content_len,
            compressed: header.is_compressed(),
        })
    }

    /// Decoded header of the chunk starting at `handle`, of any kind
    pub fn inspect(&self, handle: Handle) -> Result<ChunkInfo> {
        Ok(ChunkInfo::new(handle, self.read_chunk(handle)?))
    }

    /// Walk every chunk from the start of the data area to the end of the
    /// store. Iteration stops after the first error.
    pub fn chunks(&self) -> Result<Chunks<'_, S>> {
        Ok(Chunks {
            alloc: self,
            offset: DATA_START,
            size: self.store.size()?,
            done: false,
        })
    }

    /// Walk the free list of size class `class` from its head
    pub fn free_list(&self, class: usize) -> Result<FreeList<'_, S>> {
        let size = self.store.size()?;
        Ok(FreeList {
            alloc: self,
            class,
            next: self.flt_head(class)?,
            prev: Handle::NULL,
            steps: 0,
            max_steps: size / (MIN_CHUNK_ATOMS * ATOM),
            done: false,
        })
    }

    /// Head of the free list for size class `class`
    pub fn flt_head(&self, class: usize) -> Result<Handle> {
        let mut raw = [0u8; 8];
        self.store.read_at(flt_slot(class)?, &mut raw)?;
        Ok(Handle::new(i64::from_le_bytes(raw)))
    }

    /// Current store size in bytes
    pub fn size(&self) -> Result<u64> {
        self.store.size()
    }

    /// Configuration in effect
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Borrow the backing store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mutably borrow the backing store (e.g. to open a WAL batch)
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Give back the backing store
    pub fn into_inner(self) -> S {
        self.store
    }

    // ---- payload encoding ----

    fn encode_payload<'c>(&self, content: &'c [u8], compress: bool) -> (Cow<'c, [u8]>, u8) {
        if compress && content.len() >= self.config.compress_threshold {
            if let Some(packed) = self.config.codec.compress(content) {
                if packed.len() < content.len() {
                    return (Cow::Owned(packed), FLAG_COMPRESSED);
                }
            }
        }
        (Cow::Borrowed(content), 0)
    }

    fn decode_payload(&self, handle: Handle, header: &ChunkHeader, stored: Vec<u8>) -> Result<Vec<u8>> {
        if !header.is_compressed() {
            return Ok(stored);
        }
        self.config
            .codec
            .decompress(&stored)
            .map_err(|e| Error::corrupt(handle.raw(), format!("decompression failed: {}", e)))
    }

    /// Store already-encoded bytes in a short chunk or a chain
    fn place(&mut self, stored: &[u8], flags: u8) -> Result<Handle> {
        if stored.len() <= MAX_SHORT_PAYLOAD {
            let (offset, atoms) = self.claim(atoms_for(SHORT_HEADER, stored.len()))?;
            let header = ChunkHeader::used(ChunkKind::Short, flags, atoms, stored);
            self.write_used(offset, &header, stored)?;
            return Ok(Handle::from_offset(offset));
        }

        let pieces: Vec<&[u8]> = stored.chunks(MAX_CHAIN_PAYLOAD).collect();
        let mut claimed = Vec::with_capacity(pieces.len());
        for piece in &pieces {
            match self.claim(atoms_for(CHAIN_HEADER, piece.len())) {
                Ok(chunk) => claimed.push(chunk),
                Err(e) => {
                    for (offset, atoms) in claimed {
                        self.release(offset, atoms)?;
                    }
                    return Err(e);
                }
            }
        }

        // Written back to front so each chunk knows its successor
        let mut next = Handle::NULL;
        for (i, (piece, &(offset, atoms))) in pieces.iter().zip(&claimed).enumerate().rev() {
            let mut header = if i == 0 {
                ChunkHeader::used(ChunkKind::Long, flags, atoms, piece)
            } else {
                ChunkHeader::used(ChunkKind::Continuation, 0, atoms, piece)
            };
            header.next = next;
            if i == 0 {
                header.total = stored.len() as u64;
            }
            self.write_used(offset, &header, piece)?;
            next = Handle::from_offset(offset);
        }

        debug!(handle = %next, chunks = pieces.len(), bytes = stored.len(), "stored chain");
        Ok(next)
    }

    /// Rewrite the chunk at `offset` in place, splitting off the unused tail
    fn rewrite(
        &mut self,
        offset: u64,
        atoms: u64,
        kind: ChunkKind,
        flags: u8,
        payload: &[u8],
    ) -> Result<()> {
        let need = atoms_for(kind.header_len(), payload.len());
        let spare = atoms.checked_sub(need).ok_or_else(|| {
            Error::corrupt(
                offset as i64,
                format!("{} payload bytes do not fit a chunk of {} atoms", payload.len(), atoms),
            )
        })?;
        let keep = if spare >= MIN_CHUNK_ATOMS { need } else { atoms };
        self.write_used(offset, &ChunkHeader::used(kind, flags, keep, payload), payload)?;
        if keep < atoms {
            self.release(offset + keep * ATOM, atoms - keep)?;
        }
        Ok(())
    }

    /// Free everything `handle` owns except its own chunk
    fn release_tail(&mut self, handle: Handle) -> Result<()> {
        let owned = self.owned_chunks(handle)?;
        for chunk in owned.iter().filter(|c| c.handle != handle) {
            self.release(chunk.handle.offset(), chunk.atoms())?;
        }
        Ok(())
    }

    // ---- resolution ----

    /// Header of `handle`, which must be a handle a caller may hold
    fn read_used(&self, handle: Handle) -> Result<ChunkHeader> {
        let header = self.read_chunk(handle)?;
        match header.kind {
            ChunkKind::Free => Err(Error::invalid_handle(handle.raw(), "chunk is free")),
            ChunkKind::Continuation => Err(Error::invalid_handle(
                handle.raw(),
                "continuation chunk is not a handle",
            )),
            _ if header.is_relocated() => Err(Error::invalid_handle(
                handle.raw(),
                "relocated chunk is only reachable through its redirect",
            )),
            _ => Ok(header),
        }
    }

    /// Follow a redirect; returns the chunk holding the first content bytes
    fn resolve(&self, handle: Handle) -> Result<(Handle, ChunkHeader)> {
        let header = self.read_used(handle)?;
        if header.kind != ChunkKind::Redirect {
            return Ok((handle, header));
        }

        let payload = self.read_payload(handle, &header)?;
        let raw: [u8; 8] = payload
            .as_slice()
            .try_into()
            .map_err(|_| Error::corrupt(handle.raw(), "redirect payload is not a handle"))?;
        let target = Handle::new(i64::from_le_bytes(raw));
        let target_header = self
            .read_chunk(target)
            .map_err(|e| broken_link(handle, target, e))?;
        if !matches!(target_header.kind, ChunkKind::Short | ChunkKind::Long)
            || !target_header.is_relocated()
        {
            return Err(Error::corrupt(
                handle.raw(),
                format!("redirect target {} is not a relocated chunk", target),
            ));
        }
        Ok((target, target_header))
    }

    /// `head` followed by its continuations, with the declared chain length
    /// checked against the sum of the chunk lengths
    fn chain_of(&self, head: Handle, header: &ChunkHeader) -> Result<Vec<ChunkInfo>> {
        let mut chain = vec![ChunkInfo::new(head, *header)];
        if header.kind != ChunkKind::Long {
            return Ok(chain);
        }

        let max_chunks = header.total / MAX_CHAIN_PAYLOAD as u64 + 1;
        let mut stored = header.len as u64;
        let mut next = header.next;
        while !next.is_null() {
            if chain.len() as u64 >= max_chunks {
                return Err(Error::corrupt(
                    head.raw(),
                    format!("chain has more than the {} chunks its length needs", max_chunks),
                ));
            }
            let link = self.read_chunk(next).map_err(|e| broken_link(head, next, e))?;
            if link.kind != ChunkKind::Continuation || link.flags != 0 {
                return Err(Error::corrupt(
                    head.raw(),
                    format!("chain link {} is not a continuation", next),
                ));
            }
            stored += link.len as u64;
            chain.push(ChunkInfo::new(next, link));
            next = link.next;
        }

        if stored != header.total {
            return Err(Error::corrupt(
                head.raw(),
                format!(
                    "declared length {} disagrees with chain length {}",
                    header.total, stored
                ),
            ));
        }
        Ok(chain)
    }

    fn read_chain(&self, chain: &[ChunkInfo]) -> Result<Vec<u8>> {
        let mut stored = Vec::new();
        for chunk in chain {
            stored.extend(self.read_payload(chunk.handle, &chunk.header)?);
        }
        Ok(stored)
    }

    /// Every chunk `handle` owns, redirect target and continuations included
    fn owned_chunks(&self, handle: Handle) -> Result<Vec<ChunkInfo>> {
        let (target, header) = self.resolve(handle)?;
        let mut owned = self.chain_of(target, &header)?;
        if target != handle {
            owned.push(ChunkInfo::new(handle, self.read_chunk(handle)?));
        }
        Ok(owned)
    }

    fn read_payload(&self, handle: Handle, header: &ChunkHeader) -> Result<Vec<u8>> {
        let start = handle.offset() + header.kind.header_len();
        let payload = self.store.read_vec(start, header.len as usize)?;
        if crc32fast::hash(&payload) != header.crc {
            return Err(Error::corrupt(handle.raw(), "payload checksum mismatch"));
        }
        Ok(payload)
    }

    // ---- chunk I/O ----

    /// Decode the chunk at `handle` after checking that the handle lies on
    /// an atom boundary inside the data area
    fn read_chunk(&self, handle: Handle) -> Result<ChunkHeader> {
        let size = self.store.size()?;
        locate(handle, size)?;
        self.read_chunk_at(handle, size)
    }

    /// Decode the chunk at `handle` and cross-check it against its trailer
    fn read_chunk_at(&self, handle: Handle, size: u64) -> Result<ChunkHeader> {
        let offset = handle.offset();
        if size.saturating_sub(offset) < MIN_CHUNK_ATOMS * ATOM {
            return Err(Error::corrupt(handle.raw(), "truncated chunk at end of store"));
        }
        let mut buf = [0u8; 32];
        self.store.read_at(offset, &mut buf)?;
        let header = ChunkHeader::decode(handle, &buf)?;

        let end = offset + header.span();
        if end > size {
            return Err(Error::corrupt(
                handle.raw(),
                format!("chunk of {} atoms runs past the end of the store", header.atoms),
            ));
        }
        let mut trailer = [0u8; 8];
        self.store.read_at(end - TRAILER, &mut trailer)?;
        let (tag, atoms) = decode_trailer(handle, &trailer)?;
        if tag != header.tag() || atoms != header.atoms {
            return Err(Error::corrupt(
                handle.raw(),
                format!(
                    "trailer ({:#x}, {} atoms) disagrees with header ({:#x}, {} atoms)",
                    tag,
                    atoms,
                    header.tag(),
                    header.atoms
                ),
            ));
        }
        Ok(header)
    }

    fn write_frame(&mut self, offset: u64, header: &ChunkHeader) -> Result<()> {
        let len = header.kind.header_len() as usize;
        self.store.write_at(offset, &header.encode()[..len])?;
        self.store.write_at(
            offset + header.span() - TRAILER,
            &encode_trailer(header.tag(), header.atoms),
        )
    }

    fn write_used(&mut self, offset: u64, header: &ChunkHeader, payload: &[u8]) -> Result<()> {
        let span = header.span() as usize;
        let start = header.kind.header_len() as usize;
        let mut buf = vec![0u8; span];
        buf[..start].copy_from_slice(&header.encode()[..start]);
        buf[start..start + payload.len()].copy_from_slice(payload);
        buf[span - TRAILER as usize..].copy_from_slice(&encode_trailer(header.tag(), header.atoms));
        self.store.write_at(offset, &buf)
    }

    fn set_flt_head(&mut self, class: usize, head: Handle) -> Result<()> {
        self.store.write_at(flt_slot(class)?, &head.raw().to_le_bytes())
    }

    // ---- free space ----

    /// Reserve a chunk of at least `need` atoms; returns its offset and
    /// actual atom count. The chunk is framed as an empty used chunk until
    /// the caller writes it.
    fn claim(&mut self, need: u64) -> Result<(u64, u64)> {
        let (offset, atoms) = match self.take_free(need)? {
            Some((offset, atoms)) if atoms.saturating_sub(need) >= MIN_CHUNK_ATOMS => {
                self.link_free(offset + need * ATOM, atoms - need)?;
                debug!(offset, atoms, need, "split free chunk");
                (offset, need)
            }
            Some(found) => found,
            None => {
                let offset = self.store.size()?;
                let limit = self.config.max_store_size;
                let end = offset
                    .checked_add(need * ATOM)
                    .filter(|&end| end <= limit)
                    .ok_or(Error::CapacityExceeded {
                        requested: offset.saturating_add(need * ATOM),
                        limit,
                    })?;
                debug!(offset, atoms = need, size = end, "growing store");
                (offset, need)
            }
        };
        self.write_frame(offset, &ChunkHeader::used(ChunkKind::Short, 0, atoms, &[]))?;
        Ok((offset, atoms))
    }

    /// Unlink and return the best free chunk for `need` atoms, if any
    fn take_free(&mut self, need: u64) -> Result<Option<(u64, u64)>> {
        let first = class_of(need);
        let size = self.store.size()?;
        let max_steps = size / (MIN_CHUNK_ATOMS * ATOM);

        let mut best: Option<(Handle, ChunkHeader)> = None;
        let mut cursor = self.flt_head(first)?;
        let mut steps = 0;
        while !cursor.is_null() {
            let header = self.read_free(cursor, size)?;
            if header.atoms >= need && best.map_or(true, |(_, b)| header.atoms < b.atoms) {
                best = Some((cursor, header));
                if header.atoms == need {
                    break;
                }
            }
            cursor = header.next;
            steps += 1;
            if steps > max_steps {
                return Err(Error::corrupt(cursor.raw(), "free list does not terminate"));
            }
        }

        if best.is_none() {
            for class in first + 1..SIZE_CLASSES {
                let head = self.flt_head(class)?;
                if !head.is_null() {
                    let header = self.read_free(head, size)?;
                    if header.atoms < need {
                        return Err(Error::corrupt(
                            head.raw(),
                            format!(
                                "free chunk of {} atoms heads size class {}",
                                header.atoms, class
                            ),
                        ));
                    }
                    best = Some((head, header));
                    break;
                }
            }
        }

        match best {
            Some((handle, header)) => {
                self.unlink(handle, &header)?;
                Ok(Some((handle.offset(), header.atoms)))
            }
            None => Ok(None),
        }
    }

    fn read_free(&self, handle: Handle, size: u64) -> Result<ChunkHeader> {
        locate(handle, size).map_err(|e| broken_link(handle, handle, e))?;
        let header = self.read_chunk_at(handle, size)?;
        if header.kind != ChunkKind::Free {
            return Err(Error::corrupt(handle.raw(), "free list entry is not free"));
        }
        Ok(header)
    }

    /// Push a free chunk onto the head of its class list
    fn link_free(&mut self, offset: u64, atoms: u64) -> Result<()> {
        let class = class_of(atoms);
        let handle = Handle::from_offset(offset);
        let head = self.flt_head(class)?;
        self.write_frame(offset, &ChunkHeader::free(atoms, head, Handle::NULL))?;
        if !head.is_null() {
            self.store.write_at(head.offset() + 16, &handle.raw().to_le_bytes())?;
        }
        self.set_flt_head(class, handle)
    }

    /// Take a free chunk off its class list
    fn unlink(&mut self, handle: Handle, header: &ChunkHeader) -> Result<()> {
        let class = class_of(header.atoms);
        let size = self.store.size()?;
        if header.prev.is_null() {
            if self.flt_head(class)? != handle {
                return Err(Error::corrupt(
                    handle.raw(),
                    "free chunk without a predecessor is not its list head",
                ));
            }
            self.set_flt_head(class, header.next)?;
        } else {
            self.read_free(header.prev, size)?;
            self.store
                .write_at(header.prev.offset() + 8, &header.next.raw().to_le_bytes())?;
        }
        if !header.next.is_null() {
            self.read_free(header.next, size)?;
            self.store
                .write_at(header.next.offset() + 16, &header.prev.raw().to_le_bytes())?;
        }
        Ok(())
    }

    /// Return `atoms` atoms at `offset` to the free lists, merging with
    /// free neighbours on both sides
    fn release(&mut self, offset: u64, atoms: u64) -> Result<()> {
        let size = self.store.size()?;
        let (mut start, mut total) = (offset, atoms);

        let end = offset + atoms * ATOM;
        if end < size {
            let next = Handle::from_offset(end);
            let header = self.read_chunk_at(next, size)?;
            if header.kind == ChunkKind::Free {
                self.unlink(next, &header)?;
                total += header.atoms;
            }
        }

        if offset > DATA_START {
            let mut raw = [0u8; 8];
            self.store.read_at(offset - TRAILER, &mut raw)?;
            let here = Handle::from_offset(offset);
            let (tag, prev_atoms) = decode_trailer(here, &raw)?;
            if tag == TAG_FREE {
                let prev_start = offset
                    .checked_sub(prev_atoms * ATOM)
                    .filter(|&p| p >= DATA_START)
                    .ok_or_else(|| {
                        Error::corrupt(here.raw(), "free predecessor starts before the data area")
                    })?;
                let prev = Handle::from_offset(prev_start);
                let header = self.read_free(prev, size)?;
                if header.atoms != prev_atoms {
                    return Err(Error::corrupt(prev.raw(), "free chunk size disagrees with its trailer"));
                }
                self.unlink(prev, &header)?;
                start = prev_start;
                total += prev_atoms;
            }
        }

        if total != atoms {
            debug!(offset, atoms, start, total, "coalesced free chunks");
        }
        self.link_free(start, total)
    }
}

/// Payload capacity of a short chunk of `atoms` atoms
fn short_capacity(atoms: u64) -> u64 {
    atoms * ATOM - SHORT_HEADER - TRAILER
}

/// Check that `handle` can address a chunk in a store of `size` bytes
fn locate(handle: Handle, size: u64) -> Result<()> {
    let raw = handle.raw();
    if handle.is_null() {
        return Err(Error::invalid_handle(raw, "null handle"));
    }
    if raw < DATA_START as i64 || raw % ATOM as i64 != 0 {
        return Err(Error::invalid_handle(raw, "not a chunk boundary"));
    }
    if size.saturating_sub(handle.offset()) < MIN_CHUNK_ATOMS * ATOM {
        return Err(Error::invalid_handle(raw, "beyond the end of the store"));
    }
    Ok(())
}

fn flt_slot(class: usize) -> Result<u64> {
    if class >= SIZE_CLASSES {
        return Err(Error::InvalidState(format!("no size class {}", class)));
    }
    Ok(FLT_OFFSET + class as u64 * 8)
}

/// A dangling link inside a structure is corruption of its owner
fn broken_link(owner: Handle, link: Handle, err: Error) -> Error {
    match err {
        Error::InvalidHandle { reason, .. } => {
            Error::corrupt(owner.raw(), format!("link {}: {}", link, reason))
        }
        other => other,
    }
}

/// Iterator over every chunk in store order
pub struct Chunks<'a, S: Store> {
    alloc: &'a Allocator<S>,
    offset: u64,
    size: u64,
    done: bool,
}

impl<S: Store> Iterator for Chunks<'_, S> {
    type Item = Result<ChunkInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.size {
            return None;
        }
        let handle = Handle::from_offset(self.offset);
        match self.alloc.read_chunk_at(handle, self.size) {
            Ok(header) => {
                self.offset += header.span();
                Some(Ok(ChunkInfo::new(handle, header)))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Iterator along one size class's free list
pub struct FreeList<'a, S: Store> {
    alloc: &'a Allocator<S>,
    class: usize,
    next: Handle,
    prev: Handle,
    steps: u64,
    max_steps: u64,
    done: bool,
}

impl<S: Store> FreeList<'_, S> {
    fn step(&mut self) -> Result<ChunkInfo> {
        let handle = self.next;
        self.steps += 1;
        if self.steps > self.max_steps {
            return Err(Error::corrupt(
                handle.raw(),
                format!("free list of class {} does not terminate", self.class),
            ));
        }
        let header = self
            .alloc
            .read_chunk(handle)
            .map_err(|e| broken_link(self.prev, handle, e))?;
        if header.kind != ChunkKind::Free {
            return Err(Error::corrupt(
                handle.raw(),
                format!("chunk on free list of class {} is not free", self.class),
            ));
        }
        self.prev = handle;
        self.next = header.next;
        Ok(ChunkInfo::new(handle, header))
    }
}

impl<S: Store> Iterator for FreeList<'_, S> {
    type Item = Result<ChunkInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next.is_null() {
            return None;
        }
        let item = self.step();
        if item.is_err() {
            self.done = true;
        }
        Some(item)
    }
}
