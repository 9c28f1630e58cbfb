//! # Zundo Core
//!
//! Undo discard and rollback engine for an in-place-update storage layer.
//!
//! This crate provides:
//! - Undo record pointers, the undo record wire codec and an undo log store
//! - Pages with per-page transaction slots, and a buffer pool
//! - A durability log (WAL) that carries full-page images and discards
//! - [`UndoActionExecutor`]: replays undo onto pages to roll back
//!   transactions, fully or partially
//! - [`UndoDiscardScanner`]: rolls back aborted transactions and reclaims
//!   undo no snapshot can need, publishing the global [`UndoWatermark`]

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod action;
mod buffer;
mod config;
mod discard;
mod error;
mod stats;
mod types;
mod watermark;
mod xact;

pub mod page;
pub mod undo;
pub mod wal;

pub use action::{PageApplyOutcome, PageBatch, UndoActionExecutor};
pub use buffer::{
    Buffer, BufferManager, BufferPool, BufferTag, PageCriticalSection, Persistence, Relation,
};
pub use config::Config;
pub use discard::{
    DiscardOutcome, LogDiscardReport, LogScanState, UndoDiscardScanner, UndoDiscardWorker,
};
pub use error::{CoreError, CoreResult};
pub use stats::{UndoStats, UndoStatsSnapshot};
pub use types::{
    BlockNumber, ForkNumber, FullTransactionId, ItemPointer, Lsn, OffsetNumber, RelFileNode,
    RelationId, TransactionId, UndoLogNumber, INVALID_BLOCK_NUMBER, INVALID_OFFSET_NUMBER,
};
pub use watermark::{UndoWatermark, WatermarkWriter};
pub use xact::{CommitLog, ImmediateRunner, TransactionRunner, TransactionStatusOracle, XactStatus};
