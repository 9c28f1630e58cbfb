//! Error types for the undo engine.

use crate::types::{
    BlockNumber, ForkNumber, OffsetNumber, RelFileNode, RelationId, UndoLogNumber,
};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in undo discard and rollback.
///
/// A record that has already been discarded is not an error: fetches report
/// it as `Ok(None)` and rollback treats it as proof that the transaction is
/// already resolved.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] zundo_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An undo record could not be decoded.
    #[error("undo corruption: {message}")]
    UndoCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// An undo record carries an operation tag this engine does not know.
    ///
    /// This means the undo format and the engine disagree and is never
    /// skipped.
    #[error("unsupported undo record type {tag}")]
    UnsupportedUndoOperation {
        /// The raw tag byte.
        tag: u8,
    },

    /// The durability log is corrupted or invalid.
    #[error("WAL corruption: {message}")]
    WalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected in the durability log.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Writing a durability record failed.
    #[error("durability failure: {message}")]
    DurabilityFailure {
        /// Description of the failure.
        message: String,
    },

    /// Undo log does not exist.
    #[error("{log} not found")]
    UndoLogNotFound {
        /// The log that was requested.
        log: UndoLogNumber,
    },

    /// Relation is not known to the buffer manager.
    #[error("relation {relation} not found")]
    RelationNotFound {
        /// The relation that was requested.
        relation: RelationId,
    },

    /// Block does not exist in the relation fork.
    #[error("block {block} not found in {node} fork {fork:?}")]
    BlockNotFound {
        /// Relation file identity.
        node: RelFileNode,
        /// Fork that was read.
        fork: ForkNumber,
        /// Missing block.
        block: BlockNumber,
    },

    /// A line pointer is missing or in the wrong state for an undo action.
    #[error("invalid item {offset} on block {block}: {message}")]
    InvalidItem {
        /// Block holding the item.
        block: BlockNumber,
        /// Line pointer offset.
        offset: OffsetNumber,
        /// What was wrong.
        message: String,
    },

    /// A page image could not be decoded.
    #[error("page corruption: {message}")]
    PageCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Another discard actor already owns the global watermark.
    #[error("another undo discard actor is already running")]
    DiscardActorConflict,

    /// Invalid argument passed to an operation.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates an undo corruption error.
    pub fn undo_corruption(message: impl Into<String>) -> Self {
        Self::UndoCorruption {
            message: message.into(),
        }
    }

    /// Creates a WAL corruption error.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }

    /// Creates a durability failure error.
    pub fn durability_failure(message: impl Into<String>) -> Self {
        Self::DurabilityFailure {
            message: message.into(),
        }
    }

    /// Creates an invalid item error.
    pub fn invalid_item(
        block: BlockNumber,
        offset: OffsetNumber,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidItem {
            block,
            offset,
            message: message.into(),
        }
    }

    /// Creates a page corruption error.
    pub fn page_corruption(message: impl Into<String>) -> Self {
        Self::PageCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}
