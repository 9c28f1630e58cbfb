//! Core type definitions.

use std::cmp::Ordering;
use std::fmt;

/// Block number inside a relation fork.
pub type BlockNumber = u32;

/// One-based line pointer number inside a page. `0` is invalid.
pub type OffsetNumber = u16;

/// Block number meaning "no block".
pub const INVALID_BLOCK_NUMBER: BlockNumber = u32::MAX;

/// Offset number meaning "no item".
pub const INVALID_OFFSET_NUMBER: OffsetNumber = 0;

/// A 32-bit transaction id that wraps around.
///
/// Ids below [`TransactionId::FIRST_NORMAL`] are special and compare by raw
/// value. Normal ids compare modulo 2^32: `a` precedes `b` when `a - b`,
/// taken as a signed 32-bit number, is negative. Use [`precedes`] and
/// friends rather than `<` whenever two ids may be far apart.
///
/// [`precedes`]: TransactionId::precedes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransactionId(pub u32);

impl TransactionId {
    /// The invalid transaction id.
    pub const INVALID: Self = Self(0);
    /// Id used while bootstrapping a cluster.
    pub const BOOTSTRAP: Self = Self(1);
    /// Id of frozen tuples.
    pub const FROZEN: Self = Self(2);
    /// First id handed out to ordinary transactions.
    pub const FIRST_NORMAL: Self = Self(3);

    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns `true` unless this is [`TransactionId::INVALID`].
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Returns `true` for ordinary (non-special) ids.
    #[must_use]
    pub const fn is_normal(self) -> bool {
        self.0 >= Self::FIRST_NORMAL.0
    }

    /// Wraparound-aware "is older than".
    #[must_use]
    pub fn precedes(self, other: Self) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 < other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    /// Wraparound-aware "is newer than or equal to".
    #[must_use]
    pub fn follows_or_equals(self, other: Self) -> bool {
        !self.precedes(other)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xid:{}", self.0)
    }
}

/// A transaction id paired with its wraparound epoch.
///
/// Packed as `epoch << 32 | xid`, so plain integer order is the true
/// chronological order across wraparounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FullTransactionId(u64);

impl FullTransactionId {
    /// The invalid full transaction id.
    pub const INVALID: Self = Self(0);

    /// Creates a full transaction id from its parts.
    #[must_use]
    pub const fn new(epoch: u32, xid: TransactionId) -> Self {
        Self(((epoch as u64) << 32) | xid.0 as u64)
    }

    /// Creates a full transaction id from its packed form.
    #[must_use]
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Returns the packed form.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the wraparound epoch.
    #[must_use]
    pub const fn epoch(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns the 32-bit transaction id.
    #[must_use]
    pub const fn xid(self) -> TransactionId {
        TransactionId(self.0 as u32)
    }

    /// Returns `true` if the xid part is valid.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.xid().is_valid()
    }

    /// Returns the older of two ids, ignoring invalid ones.
    #[must_use]
    pub fn older_of(self, other: Self) -> Self {
        match (self.is_valid(), other.is_valid()) {
            (false, _) => other,
            (_, false) => self,
            _ => match self.cmp(&other) {
                Ordering::Greater => other,
                _ => self,
            },
        }
    }
}

impl fmt::Display for FullTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xid:{}:{}", self.epoch(), self.xid().0)
    }
}

/// Position in the durability log just past a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The invalid log position.
    pub const INVALID: Self = Self(0);

    /// Creates a new log position.
    #[must_use]
    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    /// Returns the raw position.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` if the page was ever logged.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

/// Catalog identifier of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelationId(pub u32);

impl RelationId {
    /// Creates a new relation ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rel:{}", self.0)
    }
}

/// Physical identity of a relation: tablespace plus file node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RelFileNode {
    /// Tablespace holding the relation.
    pub tablespace: u32,
    /// File node number within the tablespace.
    pub relfilenode: u32,
}

impl RelFileNode {
    /// Creates a new relation file identity.
    #[must_use]
    pub const fn new(tablespace: u32, relfilenode: u32) -> Self {
        Self {
            tablespace,
            relfilenode,
        }
    }
}

impl fmt::Display for RelFileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tablespace, self.relfilenode)
    }
}

/// Fork of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum ForkNumber {
    /// Main data fork.
    #[default]
    Main = 0,
    /// Free space map.
    FreeSpaceMap = 1,
    /// Visibility map.
    VisibilityMap = 2,
    /// Init fork of unlogged relations.
    Init = 3,
}

impl ForkNumber {
    /// Converts a byte to a fork number.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Main),
            1 => Some(Self::FreeSpaceMap),
            2 => Some(Self::VisibilityMap),
            3 => Some(Self::Init),
            _ => None,
        }
    }

    /// Converts the fork number to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Physical location of a tuple: block plus line pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemPointer {
    /// Block holding the tuple.
    pub block: BlockNumber,
    /// One-based line pointer number.
    pub offset: OffsetNumber,
}

impl ItemPointer {
    /// Creates a new item pointer.
    #[must_use]
    pub const fn new(block: BlockNumber, offset: OffsetNumber) -> Self {
        Self { block, offset }
    }
}

impl fmt::Display for ItemPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.block, self.offset)
    }
}

/// Number of an undo log. Log numbers start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UndoLogNumber(pub u32);

impl UndoLogNumber {
    /// Largest log number that fits in an undo record pointer.
    pub const MAX: u32 = (1 << 24) - 1;

    /// Creates a new log number.
    #[must_use]
    pub const fn new(log: u32) -> Self {
        Self(log)
    }

    /// Returns the raw log number.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for UndoLogNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "undo:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn special_ids_compare_by_value() {
        assert!(TransactionId::INVALID.precedes(TransactionId::FROZEN));
        assert!(TransactionId::FROZEN.precedes(TransactionId::new(100)));
        assert!(!TransactionId::new(100).precedes(TransactionId::BOOTSTRAP));
    }

    #[test]
    fn normal_ids_wrap_around() {
        let old = TransactionId::new(u32::MAX - 10);
        let new = TransactionId::new(20);
        assert!(old.precedes(new));
        assert!(!new.precedes(old));
        assert!(new.follows_or_equals(old));
    }

    #[test]
    fn full_transaction_id_orders_by_epoch_first() {
        let a = FullTransactionId::new(1, TransactionId::new(u32::MAX - 1));
        let b = FullTransactionId::new(2, TransactionId::new(5));
        assert!(a < b);
        assert_eq!(b.epoch(), 2);
        assert_eq!(b.xid(), TransactionId::new(5));
    }

    #[test]
    fn older_of_ignores_invalid() {
        let a = FullTransactionId::new(0, TransactionId::new(50));
        assert_eq!(a.older_of(FullTransactionId::INVALID), a);
        assert_eq!(FullTransactionId::INVALID.older_of(a), a);
        let b = FullTransactionId::new(0, TransactionId::new(40));
        assert_eq!(a.older_of(b), b);
    }

    #[test]
    fn fork_number_roundtrip() {
        for fork in [
            ForkNumber::Main,
            ForkNumber::FreeSpaceMap,
            ForkNumber::VisibilityMap,
            ForkNumber::Init,
        ] {
            assert_eq!(ForkNumber::from_byte(fork.as_byte()), Some(fork));
        }
        assert_eq!(ForkNumber::from_byte(9), None);
    }

    #[test]
    fn lsn_display() {
        assert_eq!(Lsn::new(0x1_0000_00A0).to_string(), "1/A0");
    }

    proptest! {
        #[test]
        fn precedes_is_antisymmetric(a in 3u32.., delta in 1u32..(1 << 31)) {
            let x = TransactionId::new(a);
            let y = TransactionId::new(a.wrapping_add(delta));
            prop_assume!(y.is_normal());
            prop_assert!(x.precedes(y));
            prop_assert!(!y.precedes(x));
        }
    }
}
