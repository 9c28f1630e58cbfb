//! Undo discard.
//!
//! The scanner visits every undo log once per cycle. Starting at a log's
//! discard point it steps through the log one transaction at a time:
//!
//! - transactions older than the horizon are finished; aborted ones are
//!   rolled back in a transaction of their own, committed ones need nothing
//! - the first transaction that is not older than the horizon stops the
//!   scan; everything before it is discarded and it becomes the log's
//!   oldest live transaction
//! - if every transaction in the log is older than the horizon, the whole
//!   log is discarded up to its insert point
//!
//! Afterwards the global watermark is set to the oldest transaction that
//! still has undo in any log. When no log holds undo it keeps its value.

use crate::action::UndoActionExecutor;
use crate::config::Config;
use crate::error::CoreResult;
use crate::types::{FullTransactionId, TransactionId, UndoLogNumber};
use crate::undo::{UndoLogControl, UndoRecordPointer, UndoRecordStore, UnpackedUndoRecord};
use crate::watermark::{UndoWatermark, WatermarkWriter};
use crate::xact::{TransactionRunner, TransactionStatusOracle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a discard cycle did with one log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogScanState {
    /// Nothing between the discard and insert points.
    Empty,
    /// The recorded oldest transaction is not older than the horizon.
    AlreadySafe,
    /// The log was scanned.
    Scanned,
    /// The end of the last transaction could not be found. The log is
    /// retried next cycle.
    Unresolved,
}

/// Result of a discard cycle for one log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDiscardReport {
    /// The log.
    pub log: UndoLogNumber,
    /// What happened.
    pub state: LogScanState,
    /// Oldest transaction still holding undo in the log, invalid if none.
    pub oldest: FullTransactionId,
    /// New discard point, if the log was physically discarded.
    pub discarded_to: Option<UndoRecordPointer>,
    /// Aborted transactions rolled back during the scan.
    pub rolled_back: usize,
}

impl LogDiscardReport {
    fn new(log: UndoLogNumber, state: LogScanState, oldest: FullTransactionId) -> Self {
        Self {
            log,
            state,
            oldest,
            discarded_to: None,
            rolled_back: 0,
        }
    }
}

/// Result of a discard cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscardOutcome {
    /// `true` if no log had work to do.
    pub hibernate: bool,
    /// The global watermark after the cycle. Unchanged from before the
    /// cycle when no log reported a live transaction.
    pub oldest_xid_having_undo: FullTransactionId,
    /// Per-log results, in log order.
    pub logs: Vec<LogDiscardReport>,
}

/// Walks undo logs, rolls back aborted transactions and discards undo that
/// no snapshot can need.
///
/// Only one scanner may exist per watermark; it holds the watermark's
/// writer for its whole life.
pub struct UndoDiscardScanner {
    executor: Arc<UndoActionExecutor>,
    oracle: Arc<dyn TransactionStatusOracle>,
    runner: Arc<dyn TransactionRunner>,
    writer: WatermarkWriter,
}

impl UndoDiscardScanner {
    /// Creates the scanner.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::DiscardActorConflict`] if another scanner
    /// already publishes to `watermark`.
    pub fn new(
        executor: Arc<UndoActionExecutor>,
        oracle: Arc<dyn TransactionStatusOracle>,
        runner: Arc<dyn TransactionRunner>,
        watermark: &Arc<UndoWatermark>,
    ) -> CoreResult<Self> {
        Ok(Self {
            executor,
            oracle,
            runner,
            writer: watermark.claim_writer()?,
        })
    }

    /// Returns the executor used for rollbacks.
    pub fn executor(&self) -> &Arc<UndoActionExecutor> {
        &self.executor
    }

    /// Returns the watermark this scanner publishes.
    pub fn watermark(&self) -> &Arc<UndoWatermark> {
        self.writer.watermark()
    }

    fn store(&self) -> &dyn UndoRecordStore {
        self.executor.store().as_ref()
    }

    /// Runs one discard cycle against `horizon`, the oldest transaction any
    /// snapshot may still see.
    ///
    /// # Errors
    ///
    /// Returns an error if undo cannot be read, a rollback fails or a
    /// discard cannot be made durable. Logs whose end cannot be resolved
    /// are reported, not treated as errors.
    pub fn discard(&self, horizon: FullTransactionId) -> CoreResult<DiscardOutcome> {
        let mut hibernate = true;
        let mut oldest_xid_having_undo = FullTransactionId::INVALID;
        let mut logs = Vec::new();

        for control in self.store().logs() {
            let report = self.discard_log(&control, horizon)?;
            if matches!(report.state, LogScanState::Scanned | LogScanState::Unresolved) {
                hibernate = false;
            }
            oldest_xid_having_undo = oldest_xid_having_undo.older_of(report.oldest);
            logs.push(report);
        }

        if oldest_xid_having_undo.is_valid() {
            self.writer.store(oldest_xid_having_undo);
        } else {
            oldest_xid_having_undo = self.watermark().load();
        }
        self.executor.stats().record_discard_cycle();
        tracing::debug!(
            %horizon,
            watermark = %oldest_xid_having_undo,
            hibernate,
            "undo discard cycle finished"
        );
        Ok(DiscardOutcome {
            hibernate,
            oldest_xid_having_undo,
            logs,
        })
    }

    fn discard_log(
        &self,
        control: &UndoLogControl,
        horizon: FullTransactionId,
    ) -> CoreResult<LogDiscardReport> {
        let log = control.log();
        let meta = control.snapshot();
        if meta.is_empty() {
            return Ok(LogDiscardReport::new(log, LogScanState::Empty, FullTransactionId::INVALID));
        }
        if meta.oldest.is_valid() && meta.oldest >= horizon {
            return Ok(LogDiscardReport::new(log, LogScanState::AlreadySafe, meta.oldest));
        }

        let store = self.store();
        let mut report =
            LogDiscardReport::new(log, LogScanState::Scanned, FullTransactionId::INVALID);
        let mut cursor = meta.discard;
        let mut latest_discard_xid = TransactionId::INVALID;
        let Some(mut record) = store.fetch(cursor)? else {
            report.oldest = meta.oldest;
            return Ok(self.unresolved(report, cursor, "first live record is missing"));
        };

        loop {
            let full = record.full_xid();
            if full >= horizon {
                report.oldest = control.advance_oldest(full);
                if cursor > meta.discard {
                    self.discard_to(control, cursor, latest_discard_xid, &mut report)?;
                }
                return Ok(report);
            }

            let next = self.next_transaction(control, cursor, &record)?;

            if !self.oracle.did_commit(record.xid) {
                let last = match &next {
                    Some((ptr, next_record)) => ptr.step_back(next_record.prevlen),
                    None => {
                        let end = store.next_insert_pointer_for_transaction(log, record.xid)?;
                        if end.is_valid() {
                            end.step_back(store.last_chain_length(log)?)
                        } else {
                            None
                        }
                    }
                };
                let Some(last) = last else {
                    report.oldest = full;
                    let reason = "cannot find the last record of an aborted transaction";
                    return Ok(self.unresolved(report, cursor, reason));
                };

                let executor = &self.executor;
                let first = cursor;
                self.runner
                    .run_in_own_transaction(&mut || executor.apply_range(last, first, true))?;
                report.rolled_back += 1;
                tracing::debug!(
                    %log,
                    xid = %record.xid,
                    from = %last,
                    to = %first,
                    "aborted transaction rolled back"
                );
            }

            latest_discard_xid = record.xid;
            match next {
                Some((ptr, next_record)) => {
                    cursor = ptr;
                    record = next_record;
                }
                None => {
                    let end = store.next_insert_pointer_for_transaction(log, record.xid)?;
                    if !end.is_valid() {
                        report.oldest = full;
                        return Ok(self.unresolved(report, cursor, "log end moved during the scan"));
                    }
                    control.reset_oldest();
                    self.discard_to(control, end, latest_discard_xid, &mut report)?;
                    return Ok(report);
                }
            }
        }
    }

    /// Finds the first record after `record`'s transaction, or `None` when
    /// the transaction runs to the insert point.
    fn next_transaction(
        &self,
        control: &UndoLogControl,
        start: UndoRecordPointer,
        record: &UnpackedUndoRecord,
    ) -> CoreResult<Option<(UndoRecordPointer, UnpackedUndoRecord)>> {
        let insert = control.snapshot().insert;
        let mut ptr = start.step_forward(record.encoded_len());
        while ptr < insert {
            let Some(next) = self.store().fetch(ptr)? else {
                return Ok(None);
            };
            if next.xid != record.xid {
                return Ok(Some((ptr, next)));
            }
            ptr = ptr.step_forward(next.encoded_len());
        }
        Ok(None)
    }

    fn discard_to(
        &self,
        control: &UndoLogControl,
        end: UndoRecordPointer,
        last_xid: TransactionId,
        report: &mut LogDiscardReport,
    ) -> CoreResult<()> {
        let before = control.snapshot().discard;
        self.store().discard(end, last_xid)?;
        let bytes = end.offset().saturating_sub(before.offset());
        self.executor.stats().record_log_discarded(bytes);
        report.discarded_to = Some(end);
        tracing::info!(log = %control.log(), to = %end, bytes, "undo log discarded");
        Ok(())
    }

    fn unresolved(
        &self,
        mut report: LogDiscardReport,
        at: UndoRecordPointer,
        reason: &str,
    ) -> LogDiscardReport {
        report.state = LogScanState::Unresolved;
        self.executor.stats().record_unresolved_log();
        tracing::warn!(log = %report.log, ptr = %at, reason, "undo log left for the next cycle");
        report
    }
}

impl std::fmt::Debug for UndoDiscardScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoDiscardScanner")
            .field("watermark", &self.watermark().load())
            .finish_non_exhaustive()
    }
}

const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Runs discard cycles until told to stop.
#[derive(Debug)]
pub struct UndoDiscardWorker {
    scanner: UndoDiscardScanner,
    config: Config,
}

impl UndoDiscardWorker {
    /// Creates a worker around `scanner`.
    pub fn new(scanner: UndoDiscardScanner, config: Config) -> Self {
        Self { scanner, config }
    }

    /// Returns the scanner.
    pub fn scanner(&self) -> &UndoDiscardScanner {
        &self.scanner
    }

    /// Runs cycles until `shutdown` is set and returns how many ran.
    ///
    /// `horizon` is asked for the current horizon before every cycle. A
    /// failed cycle is logged and retried after the normal nap.
    pub fn run(&self, shutdown: &AtomicBool, horizon: &dyn Fn() -> FullTransactionId) -> u64 {
        let mut cycles = 0;
        while !shutdown.load(Ordering::Acquire) {
            let hibernate = match self.scanner.discard(horizon()) {
                Ok(outcome) => outcome.hibernate,
                Err(e) => {
                    tracing::error!(error = %e, "undo discard cycle failed");
                    false
                }
            };
            cycles += 1;
            nap(shutdown, self.config.naptime(hibernate));
        }
        tracing::info!(cycles, "undo discard worker stopped");
        cycles
    }
}

fn nap(shutdown: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !shutdown.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}
