//! File format versions for Stratum
//!
//! Every on-disk structure carries a magic number and a version. Mixing
//! versions inside one store is not supported.

/// Allocator (chunk layout) format version
pub const ALLOCATOR_FORMAT_VERSION: u16 = 1;

/// WAL format version
pub const WAL_FORMAT_VERSION: u16 = 1;

/// B+Tree meta cell and node format version
pub const BTREE_FORMAT_VERSION: u16 = 1;

/// Magic numbers for structure validation
pub mod magic {
    /// Store header magic, first 8 bytes of every allocator store
    pub const STORE: [u8; 8] = *b"STRATUM\0";

    /// WAL magic: "STWL" (STratum WaL)
    pub const WAL: u32 = 0x5354_574C;

    /// B+Tree meta cell magic: "STBT" (STratum B+Tree)
    pub const BTREE: u32 = 0x5354_4254;
}

/// Version compatibility information
pub struct FormatVersion {
    /// Current version of this format
    pub current: u16,
    /// Minimum supported version for reading
    pub min_read: u16,
}

impl FormatVersion {
    /// Check if a version can be read
    pub fn can_read(&self, version: u16) -> bool {
        version >= self.min_read && version <= self.current
    }
}

/// Allocator format version info
pub fn allocator_version() -> FormatVersion {
    FormatVersion {
        current: ALLOCATOR_FORMAT_VERSION,
        min_read: 1,
    }
}

/// WAL format version info
pub fn wal_version() -> FormatVersion {
    FormatVersion {
        current: WAL_FORMAT_VERSION,
        min_read: 1,
    }
}

/// B+Tree format version info
pub fn btree_version() -> FormatVersion {
    FormatVersion {
        current: BTREE_FORMAT_VERSION,
        min_read: 1,
    }
}
