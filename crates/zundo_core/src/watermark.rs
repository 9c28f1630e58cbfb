//! The global undo watermark.
//!
//! One packed `(epoch, xid)` word: the oldest transaction in any undo log
//! that may still have undo to apply or reclaim. Readers load it without
//! locking. Only the single discard actor writes it, through a
//! [`WatermarkWriter`].

use crate::error::{CoreError, CoreResult};
use crate::types::FullTransactionId;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Shared cell holding the global watermark.
#[derive(Debug)]
pub struct UndoWatermark {
    value: AtomicU64,
    claimed: AtomicBool,
}

impl UndoWatermark {
    /// Creates the watermark with its starting value.
    #[must_use]
    pub fn new(initial: FullTransactionId) -> Self {
        Self {
            value: AtomicU64::new(initial.as_u64()),
            claimed: AtomicBool::new(false),
        }
    }

    /// Returns the current watermark.
    #[must_use]
    pub fn load(&self) -> FullTransactionId {
        FullTransactionId::from_u64(self.value.load(Ordering::Acquire))
    }

    /// Takes the only write handle.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DiscardActorConflict`] while another writer
    /// is alive.
    pub fn claim_writer(self: &Arc<Self>) -> CoreResult<WatermarkWriter> {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CoreError::DiscardActorConflict);
        }
        Ok(WatermarkWriter {
            cell: Arc::clone(self),
        })
    }
}

/// Exclusive write access to an [`UndoWatermark`].
///
/// Dropping the writer lets another actor claim it.
#[derive(Debug)]
pub struct WatermarkWriter {
    cell: Arc<UndoWatermark>,
}

impl WatermarkWriter {
    /// Publishes a new watermark.
    pub fn store(&self, value: FullTransactionId) {
        self.cell.value.store(value.as_u64(), Ordering::Release);
    }

    /// Returns the watermark this writer publishes to.
    #[must_use]
    pub fn watermark(&self) -> &Arc<UndoWatermark> {
        &self.cell
    }
}

impl Drop for WatermarkWriter {
    fn drop(&mut self) {
        self.cell.claimed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionId;

    #[test]
    fn single_writer() {
        let watermark = Arc::new(UndoWatermark::new(FullTransactionId::INVALID));
        let writer = watermark.claim_writer().unwrap();
        assert!(matches!(
            watermark.claim_writer(),
            Err(CoreError::DiscardActorConflict)
        ));

        let value = FullTransactionId::new(1, TransactionId::new(42));
        writer.store(value);
        assert_eq!(watermark.load(), value);

        drop(writer);
        assert!(watermark.claim_writer().is_ok());
    }

    #[test]
    fn readers_see_latest_store() {
        let watermark = Arc::new(UndoWatermark::new(FullTransactionId::INVALID));
        let writer = watermark.claim_writer().unwrap();
        let reader = Arc::clone(writer.watermark());

        let handle = std::thread::spawn(move || {
            for xid in 3..1000 {
                writer.store(FullTransactionId::new(0, TransactionId::new(xid)));
            }
        });
        handle.join().unwrap();
        assert_eq!(reader.load().xid(), TransactionId::new(999));
    }
}
