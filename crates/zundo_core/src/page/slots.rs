//! Per-page transaction slots.

use crate::error::{CoreError, CoreResult};
use crate::types::TransactionId;
use crate::undo::UndoRecordPointer;

/// Number of transaction slots on every page.
pub const MAX_PAGE_TRANS_INFO_SLOTS: usize = 4;

/// One transaction slot: a transaction and its newest undo on the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionSlot {
    /// Owning transaction, invalid when the slot is free.
    pub xid: TransactionId,
    /// Newest undo record of `xid` that touched the page.
    pub undo: UndoRecordPointer,
}

impl TransactionSlot {
    /// A free slot.
    pub const FREE: Self = Self {
        xid: TransactionId::INVALID,
        undo: UndoRecordPointer::INVALID,
    };

    /// Returns `true` if no transaction owns the slot.
    #[must_use]
    pub fn is_free(&self) -> bool {
        !self.xid.is_valid()
    }
}

/// The fixed slot array of a page.
///
/// Rollback only ever moves a slot's pointer backwards or frees the slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionSlots {
    slots: [TransactionSlot; MAX_PAGE_TRANS_INFO_SLOTS],
}

impl TransactionSlots {
    /// Creates a slot array with every slot free.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index of the slot owned by `xid`.
    #[must_use]
    pub fn find(&self, xid: TransactionId) -> Option<usize> {
        if !xid.is_valid() {
            return None;
        }
        self.slots.iter().position(|slot| slot.xid == xid)
    }

    /// Returns the slot at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&TransactionSlot> {
        self.slots.get(index)
    }

    /// Returns the slot owned by `xid`, if any.
    #[must_use]
    pub fn lookup(&self, xid: TransactionId) -> Option<&TransactionSlot> {
        self.find(xid).and_then(|index| self.get(index))
    }

    /// Returns the slot of `xid`, claiming a free one if needed.
    ///
    /// Returns `None` when every slot is owned by another transaction.
    pub fn reserve(&mut self, xid: TransactionId) -> Option<usize> {
        if let Some(index) = self.find(xid) {
            return Some(index);
        }
        let index = self.slots.iter().position(TransactionSlot::is_free)?;
        self.slots[index] = TransactionSlot {
            xid,
            undo: UndoRecordPointer::INVALID,
        };
        Some(index)
    }

    /// Records a new undo pointer for the owner of slot `index`.
    ///
    /// Used when a modification adds undo for the page.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot does not exist or is free.
    pub fn set_pointer(&mut self, index: usize, ptr: UndoRecordPointer) -> CoreResult<()> {
        let slot = self.owned_mut(index)?;
        slot.undo = ptr;
        Ok(())
    }

    /// Rewinds slot `index` to `ptr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is free or `ptr` is newer than the
    /// slot's current pointer.
    pub fn rewind(&mut self, index: usize, ptr: UndoRecordPointer) -> CoreResult<()> {
        let slot = self.owned_mut(index)?;
        if ptr > slot.undo {
            return Err(CoreError::invalid_operation(format!(
                "cannot move slot {index} of {} forward from {} to {ptr}",
                slot.xid, slot.undo
            )));
        }
        slot.undo = ptr;
        Ok(())
    }

    /// Frees slot `index`.
    pub fn clear(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = TransactionSlot::FREE;
        }
    }

    /// Returns `true` if any slot is owned by `xid`.
    #[must_use]
    pub fn references(&self, xid: TransactionId) -> bool {
        self.find(xid).is_some()
    }

    /// Iterates over all slots, free ones included.
    pub fn iter(&self) -> impl Iterator<Item = &TransactionSlot> {
        self.slots.iter()
    }

    pub(crate) fn restore(&mut self, index: usize, slot: TransactionSlot) {
        if let Some(target) = self.slots.get_mut(index) {
            *target = slot;
        }
    }

    fn owned_mut(&mut self, index: usize) -> CoreResult<&mut TransactionSlot> {
        match self.slots.get_mut(index) {
            Some(slot) if !slot.is_free() => Ok(slot),
            Some(_) => Err(CoreError::invalid_operation(format!(
                "transaction slot {index} is free"
            ))),
            None => Err(CoreError::invalid_argument(format!(
                "transaction slot {index} out of range"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UndoLogNumber;
    use proptest::prelude::*;

    fn ptr(offset: u64) -> UndoRecordPointer {
        UndoRecordPointer::new(UndoLogNumber::new(1), offset)
    }

    #[test]
    fn reserve_reuses_and_fills() {
        let mut slots = TransactionSlots::new();
        let a = slots.reserve(TransactionId::new(10)).unwrap();
        assert_eq!(slots.reserve(TransactionId::new(10)), Some(a));

        for xid in 11..14 {
            assert!(slots.reserve(TransactionId::new(xid)).is_some());
        }
        assert_eq!(slots.reserve(TransactionId::new(99)), None);

        slots.clear(a);
        assert!(!slots.references(TransactionId::new(10)));
        assert!(slots.reserve(TransactionId::new(99)).is_some());
    }

    #[test]
    fn invalid_xid_never_matches_free_slot() {
        let slots = TransactionSlots::new();
        assert_eq!(slots.find(TransactionId::INVALID), None);
    }

    #[test]
    fn rewind_refuses_to_move_forward() {
        let mut slots = TransactionSlots::new();
        let index = slots.reserve(TransactionId::new(10)).unwrap();
        slots.set_pointer(index, ptr(200)).unwrap();

        slots.rewind(index, ptr(100)).unwrap();
        assert_eq!(slots.get(index).unwrap().undo, ptr(100));
        assert!(slots.rewind(index, ptr(150)).is_err());
        slots.rewind(index, UndoRecordPointer::INVALID).unwrap();
    }

    #[test]
    fn free_slot_cannot_be_rewound() {
        let mut slots = TransactionSlots::new();
        assert!(slots.rewind(0, ptr(1)).is_err());
        assert!(slots.set_pointer(MAX_PAGE_TRANS_INFO_SLOTS, ptr(1)).is_err());
    }

    proptest! {
        #[test]
        fn rewinds_only_move_backwards(start in 1u64..10_000, targets in prop::collection::vec(0u64..10_000, 1..20)) {
            let mut slots = TransactionSlots::new();
            let index = slots.reserve(TransactionId::new(5)).unwrap();
            slots.set_pointer(index, ptr(start)).unwrap();

            let mut current = ptr(start);
            for target in targets {
                let result = slots.rewind(index, ptr(target));
                prop_assert_eq!(result.is_ok(), ptr(target) <= current);
                current = slots.get(index).unwrap().undo;
                prop_assert!(current <= ptr(start));
            }
        }
    }
}
