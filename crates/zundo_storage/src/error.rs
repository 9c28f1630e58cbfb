//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current logical size.
        size: u64,
    },

    /// Attempted to read bytes that were already discarded.
    #[error("offset {offset} already discarded (discard point {discarded})")]
    Discarded {
        /// The requested read offset.
        offset: u64,
        /// The current discard point.
        discarded: u64,
    },

    /// A discard or truncate target lies outside the live window.
    #[error("offset {offset} outside live window [{discarded}, {size}]")]
    OutOfWindow {
        /// The requested offset.
        offset: u64,
        /// The current discard point.
        discarded: u64,
        /// The current logical size.
        size: u64,
    },

    /// The storage file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),
}
