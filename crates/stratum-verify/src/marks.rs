// Per-atom marks kept in the scratch store
//
// One byte per atom of the data area. The walk ORs bits in as it reaches
// chunks by different routes; the final scan compares the routes.

use stratum_core::{Error, Handle, Result, Store};
use stratum_storage::chunk::{ATOM, DATA_START};

/// A chunk header starts at this atom
pub const START: u8 = 0x01;
/// The chunk starting here is free
pub const FREE: u8 = 0x02;
/// Reached along a free list
pub const LISTED: u8 = 0x04;
/// Reached from a handle (head, continuation, redirect target)
pub const OWNED: u8 = 0x08;
/// Reached from the tree
pub const TREE: u8 = 0x10;

const SCAN_BLOCK: u64 = 64 * 1024;

pub struct Marks<'s, M: Store> {
    scratch: &'s mut M,
    atoms: u64,
}

impl<'s, M: Store> Marks<'s, M> {
    /// Reset `scratch` to one zeroed byte per atom
    pub fn new(scratch: &'s mut M, atoms: u64) -> Result<Self> {
        scratch.truncate(0)?;
        let zeros = vec![0u8; SCAN_BLOCK as usize];
        let mut offset = 0;
        while offset < atoms {
            let len = (atoms - offset).min(SCAN_BLOCK);
            scratch.write_at(offset, &zeros[..len as usize])?;
            offset += len;
        }
        Ok(Self { scratch, atoms })
    }

    fn index(&self, handle: Handle) -> Result<u64> {
        let raw = handle.raw();
        if raw < DATA_START as i64 || raw % ATOM as i64 != 0 {
            return Err(Error::inconsistent(raw, "not a chunk boundary"));
        }
        let index = (handle.offset() - DATA_START) / ATOM;
        if index >= self.atoms {
            return Err(Error::inconsistent(raw, "beyond the end of the store"));
        }
        Ok(index)
    }

    /// OR `bits` into the mark of `handle`, returning the previous mark
    pub fn set(&mut self, handle: Handle, bits: u8) -> Result<u8> {
        let index = self.index(handle)?;
        let mut mark = [0u8; 1];
        self.scratch.read_at(index, &mut mark)?;
        self.scratch.write_at(index, &[mark[0] | bits])?;
        Ok(mark[0])
    }

    /// Visit every atom with a nonzero mark in store order
    pub fn scan<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(Handle, u8) -> Result<()>,
    {
        let mut offset = 0;
        while offset < self.atoms {
            let len = (self.atoms - offset).min(SCAN_BLOCK);
            let block = self.scratch.read_vec(offset, len as usize)?;
            for (i, &mark) in block.iter().enumerate() {
                if mark != 0 {
                    let atom = offset + i as u64;
                    visit(Handle::from_offset(DATA_START + atom * ATOM), mark)?;
                }
            }
            offset += len;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::MemStore;

    #[test]
    fn test_marks_accumulate() {
        let mut scratch = MemStore::from_bytes(&[0xEE; 10]);
        let mut marks = Marks::new(&mut scratch, 4).unwrap();
        let second = Handle::from_offset(DATA_START + ATOM);

        assert_eq!(marks.set(second, START).unwrap(), 0);
        assert_eq!(marks.set(second, OWNED).unwrap(), START);

        let mut seen = Vec::new();
        marks
            .scan(|handle, mark| {
                seen.push((handle, mark));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![(second, START | OWNED)]);
    }

    #[test]
    fn test_marks_reject_foreign_offsets() {
        let mut scratch = MemStore::new();
        let mut marks = Marks::new(&mut scratch, 2).unwrap();
        assert!(marks.set(Handle::from_offset(DATA_START + 8), START).is_err());
        assert!(marks.set(Handle::from_offset(DATA_START + 2 * ATOM), START).is_err());
        assert!(marks.set(Handle::NULL, START).is_err());
    }
}
