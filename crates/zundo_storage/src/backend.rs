//! Storage backend trait definition.

use crate::error::StorageResult;

/// The byte space behind one undo log.
///
/// Backends are **opaque byte stores** addressed by logical offsets. The
/// live window is `[discarded(), size())`: appends extend it at the tail,
/// [`truncate`](Self::truncate) rewinds the tail and
/// [`discard_to`](Self::discard_to) drops the head.
///
/// # Invariants
///
/// - `append` returns the logical offset where data was written
/// - `read_at` returns exactly the bytes previously written at that offset,
///   as long as the offset is still inside the live window
/// - `discarded() <= size()` at all times
/// - A discarded offset never becomes readable again
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent logs
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at logical `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The offset is below the discard point
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data to the tail and returns the offset where it was written.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Flushes all pending writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the logical end of the log (where the next `append` lands).
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Returns the logical start of the live window.
    ///
    /// # Errors
    ///
    /// Returns an error if the discard point cannot be determined.
    fn discarded(&self) -> StorageResult<u64>;

    /// Syncs data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Rewinds the tail so that `new_size` becomes the next append offset.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` lies outside the live window or
    /// the truncation fails.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Drops every byte below `offset`.
    ///
    /// Discarding to a point at or below the current discard point is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if `offset` is beyond the current size or the
    /// discard point cannot be persisted.
    fn discard_to(&mut self, offset: u64) -> StorageResult<()>;
}
