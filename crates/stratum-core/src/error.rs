//! Error types for Stratum.

use thiserror::Error;

/// The main error type for Stratum operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from a backing store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The handle does not address a chunk of the expected kind
    #[error("invalid handle {handle:#x}: {reason}")]
    InvalidHandle {
        /// Offending handle
        handle: i64,
        /// What was wrong with it
        reason: String,
    },

    /// A chunk's structural fields disagree or fail to decode
    #[error("corrupt chunk at {handle:#x}: {reason}")]
    CorruptChunk {
        /// Offending handle
        handle: i64,
        /// What was inconsistent
        reason: String,
    },

    /// A global structural violation found by the verifier
    #[error("inconsistent store at {handle:#x}: {reason}")]
    Inconsistent {
        /// Offending handle
        handle: i64,
        /// What was inconsistent
        reason: String,
    },

    /// Growing the store would exceed the addressable range
    #[error("capacity exceeded: requested {requested} bytes, limit {limit}")]
    CapacityExceeded {
        /// Store size the operation would have needed
        requested: u64,
        /// Configured upper bound
        limit: u64,
    },

    /// Operation not allowed in the current state (e.g. nested batch)
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The store is smaller than the requested read
    #[error("short read: {len} bytes at offset {offset}, store size {size}")]
    ShortRead {
        /// Requested offset
        offset: u64,
        /// Requested length
        len: u64,
        /// Store size at the time of the read
        size: u64,
    },

    /// A write could not be completed
    #[error("short write: {len} bytes at offset {offset}")]
    ShortWrite {
        /// Requested offset
        offset: u64,
        /// Requested length
        len: u64,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Rejected configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A lock was poisoned (internal error)
    #[error("lock poisoned")]
    LockPoisoned,
}

impl Error {
    /// Builds an [`Error::InvalidHandle`].
    pub fn invalid_handle(handle: i64, reason: impl Into<String>) -> Self {
        Error::InvalidHandle {
            handle,
            reason: reason.into(),
        }
    }

    /// Builds an [`Error::CorruptChunk`].
    pub fn corrupt(handle: i64, reason: impl Into<String>) -> Self {
        Error::CorruptChunk {
            handle,
            reason: reason.into(),
        }
    }

    /// Builds an [`Error::Inconsistent`].
    pub fn inconsistent(handle: i64, reason: impl Into<String>) -> Self {
        Error::Inconsistent {
            handle,
            reason: reason.into(),
        }
    }

    /// True for errors that indicate a damaged on-disk structure.
    ///
    /// Callers must stop using the store after one of these.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::CorruptChunk { .. } | Error::Inconsistent { .. })
    }
}

/// A specialized `Result` type for Stratum operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_handle() {
        let err = Error::corrupt(0x90, "crc mismatch");
        assert_eq!(err.to_string(), "corrupt chunk at 0x90: crc mismatch");
        assert!(err.is_corruption());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(!err.is_corruption());
    }
}
