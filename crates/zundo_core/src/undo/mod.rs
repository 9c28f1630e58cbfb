//! Undo logs and undo records.
//!
//! An undo log is an append-only byte stream of [`UnpackedUndoRecord`]s.
//! Each record knows the length of the record written before it, so a
//! transaction's records can be walked backwards from its newest record,
//! and the record that last touched the same block (`blkprev`), so a page
//! can be rewound one transaction at a time.
//!
//! ```text
//!   discard                                         insert
//!      |                                               |
//!      v                                               v
//!      [ xid 10 ][ xid 10 ][ xid 12 ][ xid 12 ][ xid 12 ]
//!                  <-prevlen-  <-prevlen-  <-prevlen-
//! ```

mod log;
mod pointer;
mod record;
mod store;

pub use log::{UndoLogControl, UndoLogMeta};
pub use pointer::UndoRecordPointer;
pub use record::{
    BlockTarget, PriorTuple, UndoOperation, UndoRecordKind, UnpackedUndoRecord,
    MAX_UNDO_RECORD_SIZE, PRIOR_TUPLE_LENGTH_SIZE, PRIOR_TUPLE_PREFIX_SIZE, UNDO_HEADER_SIZE,
    UNDO_LENGTH_PROBE_SIZE,
};
pub use store::{UndoLogStore, UndoRecordStore};
