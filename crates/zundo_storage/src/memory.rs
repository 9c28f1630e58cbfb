//! In-memory storage backend for testing.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct Window {
    /// Logical offset of `bytes[0]`.
    base: u64,
    bytes: Vec<u8>,
}

impl Window {
    fn end(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }
}

/// An in-memory undo-log backend.
///
/// Discarding drops the head of the buffer for real, so memory use tracks
/// the live window rather than everything ever appended.
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use zundo_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let offset = backend.append(b"test data").unwrap();
/// assert_eq!(offset, 0);
/// assert_eq!(backend.size().unwrap(), 9);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    window: RwLock<Window>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty backend whose first append lands at `start`.
    #[must_use]
    pub fn starting_at(start: u64) -> Self {
        Self {
            window: RwLock::new(Window {
                base: start,
                bytes: Vec::new(),
            }),
        }
    }

    /// Returns a copy of the live bytes.
    #[must_use]
    pub fn live_bytes(&self) -> Vec<u8> {
        self.window.read().bytes.clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let window = self.window.read();
        if offset < window.base {
            return Err(StorageError::Discarded {
                offset,
                discarded: window.base,
            });
        }

        let size = window.end();
        let end = offset.saturating_add(len as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        let start = (offset - window.base) as usize;
        Ok(window.bytes[start..start + len].to_vec())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut window = self.window.write();
        let offset = window.end();
        window.bytes.extend_from_slice(data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.window.read().end())
    }

    fn discarded(&self) -> StorageResult<u64> {
        Ok(self.window.read().base)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut window = self.window.write();
        let size = window.end();
        if new_size < window.base || new_size > size {
            return Err(StorageError::OutOfWindow {
                offset: new_size,
                discarded: window.base,
                size,
            });
        }

        let keep = (new_size - window.base) as usize;
        window.bytes.truncate(keep);
        Ok(())
    }

    fn discard_to(&mut self, offset: u64) -> StorageResult<()> {
        let mut window = self.window.write();
        let size = window.end();
        if offset > size {
            return Err(StorageError::OutOfWindow {
                offset,
                discarded: window.base,
                size,
            });
        }
        if offset <= window.base {
            return Ok(());
        }

        let drop = (offset - window.base) as usize;
        window.bytes.drain(..drop);
        window.base = offset;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_new_is_empty() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.size().unwrap(), 0);
        assert_eq!(backend.discarded().unwrap(), 0);
        assert!(backend.live_bytes().is_empty());
    }

    #[test]
    fn memory_append_returns_logical_offset() {
        let mut backend = InMemoryBackend::starting_at(100);

        assert_eq!(backend.append(b"hello").unwrap(), 100);
        assert_eq!(backend.append(b" world").unwrap(), 105);
        assert_eq!(backend.size().unwrap(), 111);
    }

    #[test]
    fn memory_read_after_discard_keeps_offsets() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello world").unwrap();
        backend.discard_to(6).unwrap();

        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
        assert_eq!(backend.live_bytes(), b"world");
        assert_eq!(backend.size().unwrap(), 11);
    }

    #[test]
    fn memory_read_discarded_fails() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello world").unwrap();
        backend.discard_to(6).unwrap();

        let result = backend.read_at(0, 5);
        assert!(matches!(
            result,
            Err(StorageError::Discarded { offset: 0, discarded: 6 })
        ));
    }

    #[test]
    fn memory_read_past_end_fails() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello").unwrap();

        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn memory_discard_is_idempotent() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"abcdef").unwrap();
        backend.discard_to(4).unwrap();
        backend.discard_to(2).unwrap();
        assert_eq!(backend.discarded().unwrap(), 4);
    }

    #[test]
    fn memory_discard_past_end_fails() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"abc").unwrap();
        assert!(matches!(
            backend.discard_to(10),
            Err(StorageError::OutOfWindow { .. })
        ));
    }

    #[test]
    fn memory_truncate_rewinds_tail() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello world").unwrap();

        backend.truncate(5).unwrap();
        assert_eq!(backend.size().unwrap(), 5);
        assert_eq!(backend.append(b"!").unwrap(), 5);
        assert_eq!(backend.read_at(0, 6).unwrap(), b"hello!");
    }

    #[test]
    fn memory_truncate_below_discard_fails() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello world").unwrap();
        backend.discard_to(6).unwrap();

        assert!(backend.truncate(3).is_err());
        assert!(backend.truncate(20).is_err());
    }

    #[test]
    fn memory_discard_everything() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"abc").unwrap();
        backend.discard_to(3).unwrap();

        assert_eq!(backend.discarded().unwrap(), backend.size().unwrap());
        assert_eq!(backend.append(b"d").unwrap(), 3);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn chunks() -> impl Strategy<Value = Vec<Vec<u8>>> {
            prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32), 1..12)
        }

        proptest! {
            #[test]
            fn live_window_matches_a_plain_buffer(
                chunks in chunks(),
                cuts in prop::collection::vec(0u64..400, 0..6),
            ) {
                let mut backend = InMemoryBackend::new();
                let mut all = Vec::new();
                for chunk in &chunks {
                    prop_assert_eq!(backend.append(chunk).unwrap(), all.len() as u64);
                    all.extend_from_slice(chunk);
                }

                let size = all.len() as u64;
                let mut base = 0;
                for cut in cuts {
                    let cut = cut % (size + 1);
                    backend.discard_to(cut).unwrap();
                    base = base.max(cut);
                    prop_assert_eq!(backend.discarded().unwrap(), base);
                }

                if base < size {
                    let live = backend.read_at(base, (size - base) as usize).unwrap();
                    prop_assert_eq!(&live[..], &all[base as usize..]);
                }
                prop_assert!(base == 0 || backend.read_at(base - 1, 1).is_err());
            }
        }
    }
}
