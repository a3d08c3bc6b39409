//! Chunk handles

use std::fmt;

/// Opaque reference to a chunk: the byte offset of its header.
///
/// [`Handle::NULL`] (zero) means "no chunk". A handle stays valid until the
/// chunk it names is freed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Handle(i64);

impl Handle {
    /// The null handle
    pub const NULL: Handle = Handle(0);

    /// Wraps a raw handle value
    pub const fn new(raw: i64) -> Self {
        Handle(raw)
    }

    /// Builds a handle from a store offset
    pub fn from_offset(offset: u64) -> Self {
        Handle(offset as i64)
    }

    /// Raw signed value as stored on disk
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Store offset of the chunk header
    pub const fn offset(self) -> u64 {
        self.0 as u64
    }

    /// True for [`Handle::NULL`]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Handle(null)")
        } else {
            write!(f, "Handle({:#x})", self.0)
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
