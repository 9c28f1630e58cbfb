//! Per-log control state.

use crate::types::{FullTransactionId, TransactionId, UndoLogNumber};
use crate::undo::pointer::UndoRecordPointer;
use parking_lot::Mutex;

/// Mutable state of one undo log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoLogMeta {
    /// First live record. Everything below has been physically discarded.
    pub discard: UndoRecordPointer,
    /// Where the next record will be written.
    pub insert: UndoRecordPointer,
    /// Length of the last record written, `0` if unknown.
    pub prevlen: u16,
    /// First record of the most recent transaction.
    pub last_xact_start: UndoRecordPointer,
    /// Transaction that wrote the most recent record.
    pub last_xid: TransactionId,
    /// Oldest transaction that may still have live undo here, as last
    /// recorded by the discard scanner. Invalid when unknown or empty.
    pub oldest: FullTransactionId,
}

impl UndoLogMeta {
    /// Returns `true` when there is no undo between discard and insert.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.discard == self.insert
    }

    /// Returns the oldest live transaction id.
    #[must_use]
    pub fn oldest_xid(&self) -> TransactionId {
        self.oldest.xid()
    }
}

/// Control block of one undo log.
///
/// The lock is held only while the fields are read or updated, never
/// across record I/O or page work.
#[derive(Debug)]
pub struct UndoLogControl {
    log: UndoLogNumber,
    meta: Mutex<UndoLogMeta>,
}

impl UndoLogControl {
    /// Creates the control block for a log whose live bytes span
    /// `discard..insert`.
    #[must_use]
    pub fn new(log: UndoLogNumber, discard: u64, insert: u64) -> Self {
        let discard = UndoRecordPointer::new(log, discard);
        Self {
            log,
            meta: Mutex::new(UndoLogMeta {
                discard,
                insert: UndoRecordPointer::new(log, insert),
                prevlen: 0,
                last_xact_start: discard,
                last_xid: TransactionId::INVALID,
                oldest: FullTransactionId::INVALID,
            }),
        }
    }

    /// Returns the log number.
    #[must_use]
    pub fn log(&self) -> UndoLogNumber {
        self.log
    }

    /// Returns a copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> UndoLogMeta {
        *self.meta.lock()
    }

    /// Records `oldest` as the oldest live transaction.
    ///
    /// The recorded value never moves backwards; an older id is ignored
    /// and the current one is returned.
    pub fn advance_oldest(&self, oldest: FullTransactionId) -> FullTransactionId {
        let mut meta = self.meta.lock();
        if !meta.oldest.is_valid() || meta.oldest <= oldest {
            meta.oldest = oldest;
        } else {
            tracing::warn!(
                log = %self.log,
                current = %meta.oldest,
                requested = %oldest,
                "ignoring attempt to move oldest live transaction backwards"
            );
        }
        meta.oldest
    }

    /// Forgets the oldest live transaction once the log has been emptied.
    pub fn reset_oldest(&self) {
        self.meta.lock().oldest = FullTransactionId::INVALID;
    }

    /// Runs `f` with the state locked.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut UndoLogMeta) -> R) -> R {
        f(&mut self.meta.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(xid: u32) -> FullTransactionId {
        FullTransactionId::new(0, TransactionId::new(xid))
    }

    #[test]
    fn new_log_is_empty() {
        let control = UndoLogControl::new(UndoLogNumber::new(1), 64, 64);
        let meta = control.snapshot();
        assert!(meta.is_empty());
        assert!(!meta.oldest.is_valid());
        assert_eq!(meta.last_xact_start, meta.discard);
    }

    #[test]
    fn oldest_only_moves_forward() {
        let control = UndoLogControl::new(UndoLogNumber::new(1), 0, 100);
        assert_eq!(control.advance_oldest(full(50)), full(50));
        assert_eq!(control.advance_oldest(full(40)), full(50));
        assert_eq!(control.advance_oldest(full(60)), full(60));

        control.reset_oldest();
        assert_eq!(control.snapshot().oldest_xid(), TransactionId::INVALID);
        assert_eq!(control.advance_oldest(full(10)), full(10));
    }
}
