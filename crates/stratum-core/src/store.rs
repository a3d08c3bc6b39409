//! Backing store contract
//!
//! A store is a linear, byte-addressable medium. Everything above it (the
//! allocator, the WAL, the B+Tree) only ever talks to it through positioned
//! reads and writes.
//!
//! Two implementations ship with the core:
//! - [`MemStore`]: a growable in-memory buffer, used for tests and as the
//!   verifier's scratch space
//! - [`FileStore`]: positioned I/O on a regular file

use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Minimal random-access storage contract.
///
/// Writing past the current end grows the store; the gap, if any, reads
/// back as zeros.
pub trait Store {
    /// Fill `buf` with the bytes at `offset`.
    ///
    /// Fails with [`Error::ShortRead`] if the store ends before `buf` is full.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `offset`, growing the store if needed.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current size in bytes.
    fn size(&self) -> Result<u64>;

    /// Set the size to `len`, discarding or zero-extending.
    fn truncate(&mut self, len: u64) -> Result<()>;

    /// Flush buffered writes to durable media.
    fn sync(&mut self) -> Result<()>;

    /// Read `len` bytes at `offset` into a fresh vector.
    fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }
}

impl<S: Store + ?Sized> Store for Box<S> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        (**self).write_at(offset, data)
    }

    fn size(&self) -> Result<u64> {
        (**self).size()
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        (**self).truncate(len)
    }

    fn sync(&mut self) -> Result<()> {
        (**self).sync()
    }
}

/// In-memory store backed by a `Vec<u8>`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemStore {
    data: Vec<u8>,
}

impl MemStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding a copy of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
        }
    }

    /// Borrow the whole contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn bound(offset: u64, len: usize) -> Result<usize> {
        let end = offset
            .checked_add(len as u64)
            .ok_or(Error::ShortWrite {
                offset,
                len: len as u64,
            })?;
        usize::try_from(end).map_err(|_| Error::ShortWrite {
            offset,
            len: len as u64,
        })
    }
}

impl Store for MemStore {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let size = self.data.len() as u64;
        let end = offset.checked_add(buf.len() as u64);
        match end {
            Some(end) if end <= size => {
                let start = offset as usize;
                buf.copy_from_slice(&self.data[start..start + buf.len()]);
                Ok(())
            }
            _ => Err(Error::ShortRead {
                offset,
                len: buf.len() as u64,
                size,
            }),
        }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = Self::bound(offset, data.len())?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        let start = offset as usize;
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        let len = Self::bound(len, 0)?;
        self.data.resize(len, 0);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// File-backed store using positioned reads and writes.
///
/// Reads take `&self`, so the file handle sits behind a mutex to serialise
/// the seek + read pair.
#[derive(Debug)]
pub struct FileStore {
    file: Mutex<File>,
    path: PathBuf,
}

impl FileStore {
    /// Open or create the file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// Path of the underlying file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file.get_mut().map_err(|_| Error::LockPoisoned)
    }
}

impl Store for FileStore {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock().map_err(|_| Error::LockPoisoned)?;
        file.seek(SeekFrom::Start(offset))?;
        match file.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(Error::ShortRead {
                offset,
                len: buf.len() as u64,
                size: file.metadata()?.len(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data).map_err(|e| match e.kind() {
            ErrorKind::WriteZero => Error::ShortWrite {
                offset,
                len: data.len() as u64,
            },
            _ => Error::Io(e),
        })
    }

    fn size(&self) -> Result<u64> {
        let file = self.file.lock().map_err(|_| Error::LockPoisoned)?;
        Ok(file.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.file_mut()?.set_len(len)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file_mut()?.sync_all()?;
        Ok(())
    }
}
