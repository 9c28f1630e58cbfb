//! Undo engine statistics.
//!
//! # Usage
//!
//! ```rust,ignore
//! let executor = UndoActionExecutor::new(store, buffers, Some(wal));
//! executor.apply_range(from, UndoRecordPointer::INVALID, true)?;
//!
//! let stats = executor.stats().snapshot();
//! println!("pages applied: {}", stats.pages_applied);
//! println!("page images:   {}", stats.page_images_logged);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by undo replay and discard.
///
/// All counters are atomic and only ever increase.
#[derive(Debug, Default)]
pub struct UndoStats {
    // Replay
    pages_applied: AtomicU64,
    pages_skipped: AtomicU64,
    records_replayed: AtomicU64,
    page_images_logged: AtomicU64,
    transactions_rolled_back: AtomicU64,
    partial_rollbacks: AtomicU64,

    // Discard
    discard_cycles: AtomicU64,
    logs_discarded: AtomicU64,
    bytes_discarded: AtomicU64,
    unresolved_logs: AtomicU64,
}

impl UndoStats {
    /// Creates a new stats instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a page brought back by `records` undo records.
    pub(crate) fn record_page_applied(&self, records: usize, logged: bool) {
        self.pages_applied.fetch_add(1, Ordering::Relaxed);
        self.records_replayed
            .fetch_add(records as u64, Ordering::Relaxed);
        if logged {
            self.page_images_logged.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a page batch that needed no work.
    pub(crate) fn record_page_skipped(&self) {
        self.pages_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a finished rollback.
    pub(crate) fn record_rollback(&self, full: bool) {
        if full {
            self.transactions_rolled_back
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.partial_rollbacks.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a discard pass over all logs.
    pub(crate) fn record_discard_cycle(&self) {
        self.discard_cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a physical discard of `bytes` bytes.
    pub(crate) fn record_log_discarded(&self, bytes: u64) {
        self.logs_discarded.fetch_add(1, Ordering::Relaxed);
        self.bytes_discarded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a log whose end could not be resolved.
    pub(crate) fn record_unresolved_log(&self) {
        self.unresolved_logs.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of pages changed by undo replay.
    pub fn pages_applied(&self) -> u64 {
        self.pages_applied.load(Ordering::Relaxed)
    }

    /// Returns the number of page batches skipped as already applied.
    pub fn pages_skipped(&self) -> u64 {
        self.pages_skipped.load(Ordering::Relaxed)
    }

    /// Returns the number of undo records replayed onto pages.
    pub fn records_replayed(&self) -> u64 {
        self.records_replayed.load(Ordering::Relaxed)
    }

    /// Returns the number of full-page images written.
    pub fn page_images_logged(&self) -> u64 {
        self.page_images_logged.load(Ordering::Relaxed)
    }

    /// Returns the number of full-transaction rollbacks.
    pub fn transactions_rolled_back(&self) -> u64 {
        self.transactions_rolled_back.load(Ordering::Relaxed)
    }

    /// Returns the number of partial rollbacks.
    pub fn partial_rollbacks(&self) -> u64 {
        self.partial_rollbacks.load(Ordering::Relaxed)
    }

    /// Returns the number of discard passes.
    pub fn discard_cycles(&self) -> u64 {
        self.discard_cycles.load(Ordering::Relaxed)
    }

    /// Returns the number of physical log discards.
    pub fn logs_discarded(&self) -> u64 {
        self.logs_discarded.load(Ordering::Relaxed)
    }

    /// Returns the number of undo bytes physically discarded.
    pub fn bytes_discarded(&self) -> u64 {
        self.bytes_discarded.load(Ordering::Relaxed)
    }

    /// Returns how often a log was left unresolved.
    pub fn unresolved_logs(&self) -> u64 {
        self.unresolved_logs.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> UndoStatsSnapshot {
        UndoStatsSnapshot {
            pages_applied: self.pages_applied(),
            pages_skipped: self.pages_skipped(),
            records_replayed: self.records_replayed(),
            page_images_logged: self.page_images_logged(),
            transactions_rolled_back: self.transactions_rolled_back(),
            partial_rollbacks: self.partial_rollbacks(),
            discard_cycles: self.discard_cycles(),
            logs_discarded: self.logs_discarded(),
            bytes_discarded: self.bytes_discarded(),
            unresolved_logs: self.unresolved_logs(),
        }
    }
}

/// A point-in-time copy of [`UndoStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UndoStatsSnapshot {
    /// Pages changed by undo replay.
    pub pages_applied: u64,
    /// Page batches skipped as already applied.
    pub pages_skipped: u64,
    /// Undo records replayed onto pages.
    pub records_replayed: u64,
    /// Full-page images written.
    pub page_images_logged: u64,
    /// Full-transaction rollbacks.
    pub transactions_rolled_back: u64,
    /// Partial rollbacks.
    pub partial_rollbacks: u64,
    /// Discard passes.
    pub discard_cycles: u64,
    /// Physical log discards.
    pub logs_discarded: u64,
    /// Undo bytes physically discarded.
    pub bytes_discarded: u64,
    /// Times a log was left unresolved.
    pub unresolved_logs: u64,
}
