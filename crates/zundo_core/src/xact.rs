//! Transaction status and independent transactions.

use crate::error::CoreResult;
use crate::types::{FullTransactionId, TransactionId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

/// Resolves whether a transaction committed.
pub trait TransactionStatusOracle: Send + Sync {
    /// Returns `true` if `xid` committed. In-progress, aborted and unknown
    /// transactions all return `false`.
    fn did_commit(&self, xid: TransactionId) -> bool;
}

/// Runs work inside a transaction of its own.
///
/// The discard scanner rolls back aborted transactions through this, so the
/// rollback persists whatever happens to the transaction that drives the
/// scanner.
pub trait TransactionRunner: Send + Sync {
    /// Runs `work` in a new transaction and commits it if `work` succeeds.
    ///
    /// # Errors
    ///
    /// Returns the error of `work`, after the transaction has been abandoned.
    fn run_in_own_transaction(
        &self,
        work: &mut dyn FnMut() -> CoreResult<()>,
    ) -> CoreResult<()>;
}

/// Outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XactStatus {
    /// Still running.
    InProgress,
    /// Committed.
    Committed,
    /// Aborted, explicitly or by a crash.
    Aborted,
}

#[derive(Debug)]
struct Allocator {
    next: FullTransactionId,
    running: Vec<FullTransactionId>,
}

/// In-memory commit log and transaction id allocator.
///
/// Ids are handed out from [`TransactionId::FIRST_NORMAL`] upwards. When
/// the 32-bit counter wraps, the epoch is incremented and the special ids
/// are skipped.
#[derive(Debug)]
pub struct CommitLog {
    status: RwLock<HashMap<TransactionId, XactStatus>>,
    alloc: Mutex<Allocator>,
}

impl Default for CommitLog {
    fn default() -> Self {
        Self::starting_at(FullTransactionId::new(0, TransactionId::FIRST_NORMAL))
    }
}

impl CommitLog {
    /// Creates an empty commit log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a commit log whose first transaction is `next`.
    #[must_use]
    pub fn starting_at(next: FullTransactionId) -> Self {
        let next = if next.xid().is_normal() {
            next
        } else {
            FullTransactionId::new(next.epoch(), TransactionId::FIRST_NORMAL)
        };
        Self {
            status: RwLock::new(HashMap::new()),
            alloc: Mutex::new(Allocator {
                next,
                running: Vec::new(),
            }),
        }
    }

    /// Starts a transaction and returns its id.
    pub fn begin(&self) -> FullTransactionId {
        let mut alloc = self.alloc.lock();
        let full = alloc.next;

        let raw = full.xid().as_u32().wrapping_add(1);
        alloc.next = if raw < TransactionId::FIRST_NORMAL.as_u32() {
            FullTransactionId::new(full.epoch().wrapping_add(1), TransactionId::FIRST_NORMAL)
        } else {
            FullTransactionId::new(full.epoch(), TransactionId::new(raw))
        };
        alloc.running.push(full);
        drop(alloc);

        self.status.write().insert(full.xid(), XactStatus::InProgress);
        tracing::trace!(xid = %full, "transaction started");
        full
    }

    /// Marks `xid` committed.
    pub fn set_committed(&self, xid: TransactionId) {
        self.finish(xid, XactStatus::Committed);
    }

    /// Marks `xid` aborted.
    pub fn set_aborted(&self, xid: TransactionId) {
        self.finish(xid, XactStatus::Aborted);
    }

    /// Returns the status of `xid`, or `None` if it was never started here.
    #[must_use]
    pub fn status(&self, xid: TransactionId) -> Option<XactStatus> {
        self.status.read().get(&xid).copied()
    }

    /// Returns the id the next transaction will get.
    #[must_use]
    pub fn next_xid(&self) -> FullTransactionId {
        self.alloc.lock().next
    }

    /// Returns the oldest transaction that may still be running.
    ///
    /// With nothing running this is the next id to be handed out.
    #[must_use]
    pub fn oldest_running(&self) -> FullTransactionId {
        let alloc = self.alloc.lock();
        alloc.running.iter().copied().min().unwrap_or(alloc.next)
    }

    /// Marks every running transaction aborted, as a crash would.
    pub fn abort_all_running(&self) {
        let running = std::mem::take(&mut self.alloc.lock().running);
        let mut status = self.status.write();
        for full in running {
            status.insert(full.xid(), XactStatus::Aborted);
        }
    }

    fn finish(&self, xid: TransactionId, outcome: XactStatus) {
        self.alloc.lock().running.retain(|full| full.xid() != xid);
        self.status.write().insert(xid, outcome);
        tracing::trace!(%xid, ?outcome, "transaction finished");
    }
}

impl TransactionStatusOracle for CommitLog {
    fn did_commit(&self, xid: TransactionId) -> bool {
        self.status(xid) == Some(XactStatus::Committed)
    }
}

/// Runs work directly, treating success as commit.
///
/// Every run gets its own tracing span so the work it logs can be told
/// apart from the caller's.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateRunner;

impl TransactionRunner for ImmediateRunner {
    fn run_in_own_transaction(
        &self,
        work: &mut dyn FnMut() -> CoreResult<()>,
    ) -> CoreResult<()> {
        let span = tracing::debug_span!("independent_transaction");
        let _enter = span.enter();
        let result = work();
        if let Err(e) = &result {
            tracing::warn!(error = %e, "independent transaction aborted");
        }
        result
    }
}
