//! Page, line pointer and tuple layout.
//!
//! Only the parts that undo replay touches are modelled: line pointer
//! state, the tuple header flags, the prune hint and the slot array.
//!
//! ## Page Image Format
//!
//! ```text
//! | magic (4) | lsn (8) | prune_xid (4) | flags (1) |
//! | slots: 4 x (xid (4) | undo (8)) |
//! | item count (2) | items... |
//! ```
//!
//! Each item is `| state (1) | invalid_xact (1) | tuple len (4) | tuple |`,
//! where a length of `u32::MAX` means the item has no storage.

use crate::error::{CoreError, CoreResult};
use crate::page::slots::{TransactionSlot, TransactionSlots, MAX_PAGE_TRANS_INFO_SLOTS};
use crate::types::{Lsn, OffsetNumber, TransactionId};
use crate::undo::UndoRecordPointer;

/// Magic bytes at the start of a page image.
pub const PAGE_MAGIC: [u8; 4] = *b"ZPG1";

/// Encoded size of a [`TupleHeader`].
pub const TUPLE_HEADER_SIZE: usize = 5;

/// Tuple infomask bits.
pub mod infomask {
    /// The tuple was deleted.
    pub const DELETED: u16 = 0x0001;
    /// The tuple was updated in place.
    pub const INPLACE_UPDATED: u16 = 0x0002;
    /// The tuple was updated out of place.
    pub const UPDATED: u16 = 0x0004;
    /// The tuple is locked for share.
    pub const XID_LOCK_ONLY: u16 = 0x0008;
    /// The tuple's transaction slot was reused; its owner is unknown.
    pub const INVALID_XACT_SLOT: u16 = 0x0800;
}

const FLAG_HAS_FREE_LINE_POINTERS: u8 = 0x01;
const NO_STORAGE: u32 = u32::MAX;

/// Header fields of a tuple that a lock or unlock rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TupleHeader {
    /// Attribute count and slot bits.
    pub infomask2: u16,
    /// Visibility flags, see [`infomask`].
    pub infomask: u16,
    /// Offset of the data.
    pub hoff: u8,
}

/// A tuple stored on a page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tuple {
    /// Header fields.
    pub header: TupleHeader,
    /// User data.
    pub data: Vec<u8>,
}

impl Tuple {
    /// Creates a tuple with a default header.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            header: TupleHeader {
                hoff: TUPLE_HEADER_SIZE as u8,
                ..TupleHeader::default()
            },
            data,
        }
    }

    /// Encodes the tuple as stored in undo records.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TUPLE_HEADER_SIZE + self.data.len());
        buf.extend_from_slice(&self.header.infomask2.to_le_bytes());
        buf.extend_from_slice(&self.header.infomask.to_le_bytes());
        buf.push(self.header.hoff);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decodes the header of an encoded tuple.
    ///
    /// # Errors
    ///
    /// Returns an error if `image` is shorter than a header.
    pub fn decode_header(image: &[u8]) -> CoreResult<TupleHeader> {
        if image.len() < TUPLE_HEADER_SIZE {
            return Err(CoreError::page_corruption(format!(
                "tuple image of {} bytes has no header",
                image.len()
            )));
        }
        Ok(TupleHeader {
            infomask2: u16::from_le_bytes([image[0], image[1]]),
            infomask: u16::from_le_bytes([image[2], image[3]]),
            hoff: image[4],
        })
    }

    /// Decodes an encoded tuple.
    ///
    /// # Errors
    ///
    /// Returns an error if `image` is shorter than a header.
    pub fn decode(image: &[u8]) -> CoreResult<Self> {
        let header = Self::decode_header(image)?;
        Ok(Self {
            header,
            data: image[TUPLE_HEADER_SIZE..].to_vec(),
        })
    }

    /// Returns the encoded length.
    #[must_use]
    pub fn len(&self) -> usize {
        TUPLE_HEADER_SIZE + self.data.len()
    }

    /// Returns `true` if the tuple has no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// State of a line pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemState {
    /// Free for reuse.
    Unused = 0,
    /// Points at a tuple.
    Normal = 1,
    /// Tuple storage reclaimed; index entries may still point here.
    Dead = 2,
    /// Tuple pruned after a delete; the line pointer keeps the slot info.
    Deleted = 3,
}

impl ItemState {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Unused),
            1 => Some(Self::Normal),
            2 => Some(Self::Dead),
            3 => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// A line pointer and the tuple it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemId {
    /// Line pointer state.
    pub state: ItemState,
    /// Invalid-transaction-slot marker on a deleted line pointer.
    pub invalid_xact: bool,
    /// Tuple storage, present for normal items.
    pub tuple: Option<Tuple>,
}

impl ItemId {
    /// Creates a normal line pointer.
    #[must_use]
    pub fn normal(tuple: Tuple) -> Self {
        Self {
            state: ItemState::Normal,
            invalid_xact: false,
            tuple: Some(tuple),
        }
    }

    /// Returns `true` for a normal line pointer.
    #[must_use]
    pub fn is_normal(&self) -> bool {
        self.state == ItemState::Normal
    }

    /// Marks the item unused and drops its storage.
    pub fn set_unused(&mut self) {
        self.state = ItemState::Unused;
        self.invalid_xact = false;
        self.tuple = None;
    }

    /// Marks the item dead and drops its storage.
    pub fn set_dead(&mut self) {
        self.state = ItemState::Dead;
        self.tuple = None;
    }
}

/// An in-memory page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Page {
    /// Position of the last durability record for this page.
    pub lsn: Lsn,
    /// Oldest transaction that left prunable items, invalid if none.
    pub prune_xid: TransactionId,
    /// Hint that some line pointer is unused.
    pub has_free_line_pointers: bool,
    /// Transaction slots.
    pub slots: TransactionSlots,
    items: Vec<ItemId>,
}

impl Page {
    /// Creates an empty page.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a normal item holding `tuple`, reusing an unused line pointer
    /// when the page hints that one exists.
    pub fn add_item(&mut self, tuple: Tuple) -> OffsetNumber {
        if self.has_free_line_pointers {
            if let Some(index) = self
                .items
                .iter()
                .position(|item| item.state == ItemState::Unused)
            {
                self.items[index] = ItemId::normal(tuple);
                return index_to_offset(index);
            }
            self.has_free_line_pointers = false;
        }
        self.items.push(ItemId::normal(tuple));
        index_to_offset(self.items.len() - 1)
    }

    /// Returns the number of line pointers.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Returns the item at one-based `offset`.
    #[must_use]
    pub fn item(&self, offset: OffsetNumber) -> Option<&ItemId> {
        offset_to_index(offset).and_then(|index| self.items.get(index))
    }

    /// Returns the item at one-based `offset` for modification.
    pub fn item_mut(&mut self, offset: OffsetNumber) -> Option<&mut ItemId> {
        offset_to_index(offset).and_then(|index| self.items.get_mut(index))
    }

    /// Iterates over `(offset, item)` pairs.
    pub fn items(&self) -> impl Iterator<Item = (OffsetNumber, &ItemId)> {
        self.items
            .iter()
            .enumerate()
            .map(|(index, item)| (index_to_offset(index), item))
    }

    /// Records that `xid` left prunable items, keeping the oldest such
    /// transaction.
    pub fn set_prunable(&mut self, xid: TransactionId) {
        if !self.prune_xid.is_valid() || xid.precedes(self.prune_xid) {
            self.prune_xid = xid;
        }
    }

    /// Encodes the full page image.
    #[must_use]
    pub fn to_image(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&PAGE_MAGIC);
        buf.extend_from_slice(&self.lsn.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.prune_xid.as_u32().to_le_bytes());
        buf.push(if self.has_free_line_pointers {
            FLAG_HAS_FREE_LINE_POINTERS
        } else {
            0
        });

        for slot in self.slots.iter() {
            buf.extend_from_slice(&slot.xid.as_u32().to_le_bytes());
            buf.extend_from_slice(&slot.undo.as_u64().to_le_bytes());
        }

        // Offsets are 16 bits, so the item count always fits.
        buf.extend_from_slice(&(self.items.len() as u16).to_le_bytes());
        for item in &self.items {
            buf.push(item.state as u8);
            buf.push(u8::from(item.invalid_xact));
            match &item.tuple {
                Some(tuple) => {
                    buf.extend_from_slice(&(tuple.len() as u32).to_le_bytes());
                    buf.extend_from_slice(&tuple.encode());
                }
                None => buf.extend_from_slice(&NO_STORAGE.to_le_bytes()),
            }
        }
        buf
    }

    /// Decodes a full page image.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PageCorruption`] for a malformed image.
    pub fn from_image(image: &[u8]) -> CoreResult<Self> {
        let mut cursor = ImageCursor { buf: image, pos: 0 };

        if cursor.take(4)? != PAGE_MAGIC {
            return Err(CoreError::page_corruption("invalid page magic"));
        }
        let lsn = Lsn::new(u64::from_le_bytes(cursor.array()?));
        let prune_xid = TransactionId::new(u32::from_le_bytes(cursor.array()?));
        let flags = cursor.take(1)?[0];

        let mut slots = TransactionSlots::new();
        for index in 0..MAX_PAGE_TRANS_INFO_SLOTS {
            let slot = TransactionSlot {
                xid: TransactionId::new(u32::from_le_bytes(cursor.array()?)),
                undo: UndoRecordPointer::from_u64(u64::from_le_bytes(cursor.array()?)),
            };
            slots.restore(index, slot);
        }

        let count = u16::from_le_bytes(cursor.array()?) as usize;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let state_byte = cursor.take(1)?[0];
            let state = ItemState::from_byte(state_byte).ok_or_else(|| {
                CoreError::page_corruption(format!("unknown item state {state_byte}"))
            })?;
            let invalid_xact = cursor.take(1)?[0] != 0;
            let len = u32::from_le_bytes(cursor.array()?);
            let tuple = if len == NO_STORAGE {
                None
            } else {
                Some(Tuple::decode(cursor.take(len as usize)?)?)
            };
            items.push(ItemId {
                state,
                invalid_xact,
                tuple,
            });
        }

        if cursor.pos != image.len() {
            return Err(CoreError::page_corruption(format!(
                "trailing bytes in page image: expected {} bytes, got {}",
                cursor.pos,
                image.len()
            )));
        }

        Ok(Self {
            lsn,
            prune_xid,
            has_free_line_pointers: flags & FLAG_HAS_FREE_LINE_POINTERS != 0,
            slots,
            items,
        })
    }
}

fn index_to_offset(index: usize) -> OffsetNumber {
    // add_item never grows past u16::MAX - 1 items in practice.
    (index + 1) as OffsetNumber
}

fn offset_to_index(offset: OffsetNumber) -> Option<usize> {
    usize::from(offset).checked_sub(1)
}

struct ImageCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ImageCursor<'a> {
    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| CoreError::page_corruption("unexpected end of page image"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        self.take(N)?
            .try_into()
            .map_err(|_| CoreError::page_corruption("invalid field width"))
    }
}
