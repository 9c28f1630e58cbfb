//! Page model used by undo replay.
//!
//! A [`Page`] holds line pointers, the tuples they point at and a small
//! [`TransactionSlots`] array. Each slot anchors the newest undo record a
//! transaction wrote for the page, which is what makes replay idempotent:
//! once a slot is rewound past a batch of records, replaying that batch
//! again finds nothing to do.

mod layout;
mod slots;

pub use layout::{
    infomask, ItemId, ItemState, Page, Tuple, TupleHeader, PAGE_MAGIC, TUPLE_HEADER_SIZE,
};
pub use slots::{TransactionSlot, TransactionSlots, MAX_PAGE_TRANS_INFO_SLOTS};
