//! Error types for heap operations.

use crate::arena::ArenaId;

use thiserror::Error;

/// Result type alias using the crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by arenas, the heap and buffers.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested size is above the largest representable allocation.
    #[error("invalid allocation size {size}: sizes must be below {max}")]
    InvalidSize { size: usize, max: usize },

    /// The OS refused to create a mapping.
    #[error("failed to map {size} bytes: {source}")]
    Mapping {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    /// A named mapping already existed on creation or was missing on reopen.
    #[error("sharing violation on {name:?}: {reason}")]
    SharingViolation { name: String, reason: String },

    /// The block is not currently allocated by this heap (double free or foreign block).
    #[error("block {arena}[{start}..{stop}] is not allocated by this heap")]
    InvalidBlock {
        arena: ArenaId,
        start: usize,
        stop: usize,
    },
}

impl Error {
    pub(crate) fn mapping(size: usize) -> Self {
        Error::Mapping {
            size,
            source: std::io::Error::last_os_error(),
        }
    }

    pub(crate) fn sharing(name: &str, reason: impl Into<String>) -> Self {
        Error::SharingViolation {
            name: name.to_owned(),
            reason: reason.into(),
        }
    }
}
