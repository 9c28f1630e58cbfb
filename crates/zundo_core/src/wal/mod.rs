//! Durability log (WAL) for undo actions and discards.
//!
//! Every page changed by undo replay is logged as one full-page image, and
//! every physical undo discard can be logged as well. After a crash a page
//! is recovered by reinstalling its newest image, never by re-deriving it
//! from undo. Replaying images is outside this crate; the iterator here
//! exists so the log can be inspected and verified.
//!
//! ## Record Format
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! ## Reading Policy
//!
//! - **Truncated header or payload** at the tail is a torn write and ends
//!   iteration cleanly.
//! - **CRC mismatch, bad magic, unknown version or type** is corruption and
//!   is returned as an error.

mod insert;
mod reader;
mod record;
mod writer;

pub use insert::{DurabilityLog, WalInsert};
pub use reader::WalRecords;
pub use record::{compute_crc32, WalRecord, WalRecordType, WAL_MAGIC, WAL_VERSION};
pub use writer::WalManager;
