//! Undo record pointers.

use crate::types::UndoLogNumber;
use std::fmt;

const OFFSET_BITS: u32 = 40;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// Location of an undo record: log number plus byte offset in that log.
///
/// Packed into a `u64` with the log in the high 24 bits, so ordering the
/// packed value orders by log first and then by offset. Within one log that
/// is insertion order. `0` is the invalid pointer; since log numbers start
/// at 1, no real record ever packs to `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct UndoRecordPointer(u64);

impl UndoRecordPointer {
    /// The invalid pointer.
    pub const INVALID: Self = Self(0);

    /// Largest byte offset a pointer can address.
    pub const MAX_OFFSET: u64 = OFFSET_MASK;

    /// Creates a pointer to `offset` in `log`.
    #[must_use]
    pub const fn new(log: UndoLogNumber, offset: u64) -> Self {
        Self(((log.0 as u64) << OFFSET_BITS) | (offset & OFFSET_MASK))
    }

    /// Creates a pointer from its packed form.
    #[must_use]
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Returns the packed form.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` unless this is [`UndoRecordPointer::INVALID`].
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Returns the log this pointer addresses.
    #[must_use]
    pub const fn log(self) -> UndoLogNumber {
        UndoLogNumber((self.0 >> OFFSET_BITS) as u32)
    }

    /// Returns the byte offset inside the log.
    #[must_use]
    pub const fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }

    /// Steps back over a record of `len` bytes that ends where this one starts.
    ///
    /// Returns `None` when `len` is zero (chain start) or would step before
    /// the start of the log.
    #[must_use]
    pub fn step_back(self, len: u16) -> Option<Self> {
        if len == 0 {
            return None;
        }
        self.offset()
            .checked_sub(u64::from(len))
            .map(|offset| Self::new(self.log(), offset))
    }

    /// Steps forward over a record of `len` bytes that starts here.
    #[must_use]
    pub fn step_forward(self, len: usize) -> Self {
        Self::new(self.log(), self.offset() + len as u64)
    }
}

impl fmt::Display for UndoRecordPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}@{:X}", self.log().0, self.offset())
        } else {
            f.write_str("invalid")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_parts() {
        let ptr = UndoRecordPointer::new(UndoLogNumber::new(3), 0x1234);
        assert_eq!(ptr.log(), UndoLogNumber::new(3));
        assert_eq!(ptr.offset(), 0x1234);
        assert!(ptr.is_valid());
        assert!(!UndoRecordPointer::INVALID.is_valid());
    }

    #[test]
    fn pointers_order_by_log_then_offset() {
        let log1 = UndoLogNumber::new(1);
        let log2 = UndoLogNumber::new(2);
        assert!(UndoRecordPointer::new(log1, 500) < UndoRecordPointer::new(log2, 0));
        assert!(UndoRecordPointer::new(log1, 10) < UndoRecordPointer::new(log1, 11));
        assert!(UndoRecordPointer::INVALID < UndoRecordPointer::new(log1, 0));
    }

    #[test]
    fn step_back_and_forward() {
        let log = UndoLogNumber::new(1);
        let ptr = UndoRecordPointer::new(log, 100);

        assert_eq!(ptr.step_back(40), Some(UndoRecordPointer::new(log, 60)));
        assert_eq!(ptr.step_back(0), None);
        assert_eq!(ptr.step_back(101), None);
        assert_eq!(ptr.step_forward(8), UndoRecordPointer::new(log, 108));
    }

    #[test]
    fn display() {
        let ptr = UndoRecordPointer::new(UndoLogNumber::new(1), 0xFF);
        assert_eq!(ptr.to_string(), "1@FF");
        assert_eq!(UndoRecordPointer::INVALID.to_string(), "invalid");
    }
}
