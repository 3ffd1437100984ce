// src/error.rs
//! Error types for pool and allocator operations.

use std::fmt;

/// Errors that can occur while managing pools and allocators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Rounding the requested size up to the node boundary overflowed.
    AllocationOverflow,
    /// The backing allocator (heap or mmap arena) could not supply memory.
    OutOfMemory,
    /// A `count * eltsize` style computation overflowed.
    SizeTooBig,
    /// The platform has no mmap arena support.
    MmapUnsupported,
    /// Creating the file-backed arena failed.
    MmapSetup(String),
    /// Growing the file-backed arena in place failed.
    MmapGrowth(String),
    /// An operation was attempted on a pool in an unusable state.
    InvalidState(String),
    /// I/O error (for compatibility)
    Io(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationOverflow => write!(f, "Allocation size overflow"),
            Self::OutOfMemory => write!(f, "Backing allocator exhausted"),
            Self::SizeTooBig => write!(f, "Requested size too big"),
            Self::MmapUnsupported => write!(f, "mmap arena not supported on this platform"),
            Self::MmapSetup(msg) => write!(f, "mmap arena setup failed: {}", msg),
            Self::MmapGrowth(msg) => write!(f, "mmap arena growth failed: {}", msg),
            Self::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for PoolError {}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

/// Convert PoolError to std::io::Error
impl From<PoolError> for std::io::Error {
    fn from(err: PoolError) -> Self {
        use std::io::ErrorKind;
        match err {
            PoolError::OutOfMemory | PoolError::AllocationOverflow => {
                std::io::Error::new(ErrorKind::OutOfMemory, err)
            }
            PoolError::MmapUnsupported => std::io::Error::new(ErrorKind::Unsupported, err),
            PoolError::Io(msg) => std::io::Error::other(msg),
            _ => std::io::Error::other(err),
        }
    }
}

/// Convert std::io::Error to PoolError
impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        PoolError::Io(err.to_string())
    }
}

/// Convert PoolError to anyhow::Error (for embedding hosts)
#[cfg(feature = "anyhow")]
impl From<PoolError> for anyhow::Error {
    fn from(err: PoolError) -> Self {
        anyhow::anyhow!("{}", err)
    }
}

/// Allow using ? with anyhow::Error
#[cfg(feature = "anyhow")]
impl From<anyhow::Error> for PoolError {
    fn from(err: anyhow::Error) -> Self {
        PoolError::InvalidState(err.to_string())
    }
}

/// Result type alias for pool operations.
///
/// Note: When using with other Result types (like anyhow::Result),
/// either qualify the type (`treepool::Result<T>`) or use the conversion
/// traits.
pub type Result<T> = std::result::Result<T, PoolError>;
