//! Undo record types and wire format.
//!
//! ## Record Format
//!
//! Every record starts with a fixed 34-byte little-endian header:
//!
//! ```text
//! | kind (1) | epoch (4) | xid (4) | prevlen (2) | blkprev (8) |
//! | block (4) | offset (2) | relfilenode (4) | tablespace (4) | fork (1) |
//! ```
//!
//! The payload depends on the kind:
//!
//! - `Insert`, `InvalidXactSlot`: empty
//! - `MultiInsert`: first offset (2), last offset (2), inclusive
//! - `Delete`, `Update`, `InplaceUpdate`, `XidLockOnly`: image length (4),
//!   prior ctid block (4), prior ctid offset (2), table oid (4), then the
//!   raw prior tuple image
//!
//! The record carries no total length of its own. A reader decodes the
//! header and, for tuple-carrying kinds, the image length to learn how many
//! bytes to fetch ([`UnpackedUndoRecord::record_len`]).

use crate::error::{CoreError, CoreResult};
use crate::types::{
    BlockNumber, ForkNumber, FullTransactionId, ItemPointer, OffsetNumber, RelFileNode,
    TransactionId,
};
use crate::undo::pointer::UndoRecordPointer;

/// Size of the fixed record header.
pub const UNDO_HEADER_SIZE: usize = 34;

/// Size of the prefix in front of a prior tuple image: tuple length (4),
/// prior location (block 4, offset 2) and owning table oid (4).
pub const PRIOR_TUPLE_PREFIX_SIZE: usize = 14;

/// Size of the length word in front of a prior tuple buffer.
pub const PRIOR_TUPLE_LENGTH_SIZE: usize = 4;

/// Bytes a reader needs before it can compute the full record length.
pub const UNDO_LENGTH_PROBE_SIZE: usize = UNDO_HEADER_SIZE + PRIOR_TUPLE_LENGTH_SIZE;

/// Largest encoded record; the chain length field is 16 bits wide.
pub const MAX_UNDO_RECORD_SIZE: usize = u16::MAX as usize;

/// Operation tag stored in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UndoRecordKind {
    /// A tuple was inserted.
    Insert = 1,
    /// A contiguous range of tuples was inserted.
    MultiInsert = 2,
    /// A tuple was deleted.
    Delete = 3,
    /// A tuple was updated in place.
    InplaceUpdate = 4,
    /// A tuple was updated out of place.
    Update = 5,
    /// A tuple was locked without being modified.
    XidLockOnly = 6,
    /// A tuple or line pointer was marked as having an invalid slot.
    InvalidXactSlot = 7,
}

impl UndoRecordKind {
    /// Converts a tag byte to a kind.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnsupportedUndoOperation`] for any unknown tag.
    pub fn from_byte(b: u8) -> CoreResult<Self> {
        match b {
            1 => Ok(Self::Insert),
            2 => Ok(Self::MultiInsert),
            3 => Ok(Self::Delete),
            4 => Ok(Self::InplaceUpdate),
            5 => Ok(Self::Update),
            6 => Ok(Self::XidLockOnly),
            7 => Ok(Self::InvalidXactSlot),
            tag => Err(CoreError::UnsupportedUndoOperation { tag }),
        }
    }

    /// Converts the kind to its tag byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns `true` for kinds whose payload holds a prior tuple.
    #[must_use]
    pub const fn carries_tuple(self) -> bool {
        matches!(
            self,
            Self::Delete | Self::InplaceUpdate | Self::Update | Self::XidLockOnly
        )
    }
}

/// The version of a tuple before the logged change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorTuple {
    /// Where the prior version lived.
    pub ctid: ItemPointer,
    /// Table that owned the prior version.
    pub table_oid: u32,
    /// Encoded prior tuple: header followed by data.
    pub image: Vec<u8>,
}

impl PriorTuple {
    /// Creates a prior tuple from its parts.
    #[must_use]
    pub fn new(ctid: ItemPointer, table_oid: u32, image: Vec<u8>) -> Self {
        Self {
            ctid,
            table_oid,
            image,
        }
    }

    /// Length of the stored buffer: prefix plus image.
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        PRIOR_TUPLE_PREFIX_SIZE + self.image.len()
    }
}

/// What a record undoes, with the data needed to undo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoOperation {
    /// Undo an insert at the record's offset.
    Insert,
    /// Undo inserts at every offset in `first..=last`.
    MultiInsert {
        /// First inserted offset.
        first: OffsetNumber,
        /// Last inserted offset.
        last: OffsetNumber,
    },
    /// Undo a delete by restoring the prior tuple.
    Delete(PriorTuple),
    /// Undo an out-of-place update by restoring the prior tuple.
    Update(PriorTuple),
    /// Undo an in-place update by restoring the prior tuple.
    InplaceUpdate(PriorTuple),
    /// Undo a lock by restoring the prior tuple header only.
    XidLockOnly(PriorTuple),
    /// Clear the invalid-transaction-slot marker.
    InvalidXactSlot,
}

impl UndoOperation {
    /// Returns the tag for this operation.
    #[must_use]
    pub fn kind(&self) -> UndoRecordKind {
        match self {
            Self::Insert => UndoRecordKind::Insert,
            Self::MultiInsert { .. } => UndoRecordKind::MultiInsert,
            Self::Delete(_) => UndoRecordKind::Delete,
            Self::Update(_) => UndoRecordKind::Update,
            Self::InplaceUpdate(_) => UndoRecordKind::InplaceUpdate,
            Self::XidLockOnly(_) => UndoRecordKind::XidLockOnly,
            Self::InvalidXactSlot => UndoRecordKind::InvalidXactSlot,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::Insert | Self::InvalidXactSlot => 0,
            Self::MultiInsert { .. } => 4,
            Self::Delete(t) | Self::Update(t) | Self::InplaceUpdate(t) | Self::XidLockOnly(t) => {
                PRIOR_TUPLE_LENGTH_SIZE + t.buffer_len()
            }
        }
    }
}

/// The page an undo record applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockTarget {
    /// Relation file identity.
    pub node: RelFileNode,
    /// Fork of the relation.
    pub fork: ForkNumber,
    /// Block inside the fork.
    pub block: BlockNumber,
}

/// A decoded undo record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedUndoRecord {
    /// Transaction that wrote the record.
    pub xid: TransactionId,
    /// Epoch of `xid`.
    pub epoch: u32,
    /// Target relation.
    pub node: RelFileNode,
    /// Target fork.
    pub fork: ForkNumber,
    /// Target block.
    pub block: BlockNumber,
    /// Target line pointer.
    pub offset: OffsetNumber,
    /// Length of the record written just before this one in the same log.
    /// `0` for the first record of a log.
    pub prevlen: u16,
    /// Previous record that touched the same block.
    pub blkprev: UndoRecordPointer,
    /// The logged operation.
    pub operation: UndoOperation,
}

impl UnpackedUndoRecord {
    /// Returns the operation tag.
    #[must_use]
    pub fn kind(&self) -> UndoRecordKind {
        self.operation.kind()
    }

    /// Returns the transaction id together with its epoch.
    #[must_use]
    pub fn full_xid(&self) -> FullTransactionId {
        FullTransactionId::new(self.epoch, self.xid)
    }

    /// Returns the page this record applies to.
    #[must_use]
    pub fn target(&self) -> BlockTarget {
        BlockTarget {
            node: self.node,
            fork: self.fork,
            block: self.block,
        }
    }

    /// Returns the size of the encoded record.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        UNDO_HEADER_SIZE + self.operation.payload_len()
    }

    /// Encodes the record.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoded record would exceed
    /// [`MAX_UNDO_RECORD_SIZE`].
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let len = self.encoded_len();
        if len > MAX_UNDO_RECORD_SIZE {
            return Err(CoreError::invalid_argument(format!(
                "undo record too large: {len} bytes exceeds maximum of {MAX_UNDO_RECORD_SIZE} bytes"
            )));
        }

        let mut buf = Vec::with_capacity(len);
        buf.push(self.kind().as_byte());
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        buf.extend_from_slice(&self.xid.as_u32().to_le_bytes());
        buf.extend_from_slice(&self.prevlen.to_le_bytes());
        buf.extend_from_slice(&self.blkprev.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.block.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.node.relfilenode.to_le_bytes());
        buf.extend_from_slice(&self.node.tablespace.to_le_bytes());
        buf.push(self.fork.as_byte());

        match &self.operation {
            UndoOperation::Insert | UndoOperation::InvalidXactSlot => {}
            UndoOperation::MultiInsert { first, last } => {
                buf.extend_from_slice(&first.to_le_bytes());
                buf.extend_from_slice(&last.to_le_bytes());
            }
            UndoOperation::Delete(t)
            | UndoOperation::Update(t)
            | UndoOperation::InplaceUpdate(t)
            | UndoOperation::XidLockOnly(t) => {
                // Bounded by MAX_UNDO_RECORD_SIZE above.
                buf.extend_from_slice(&(t.buffer_len() as u32).to_le_bytes());
                buf.extend_from_slice(&(t.image.len() as u32).to_le_bytes());
                buf.extend_from_slice(&t.ctid.block.to_le_bytes());
                buf.extend_from_slice(&t.ctid.offset.to_le_bytes());
                buf.extend_from_slice(&t.table_oid.to_le_bytes());
                buf.extend_from_slice(&t.image);
            }
        }

        debug_assert_eq!(buf.len(), len);
        Ok(buf)
    }

    /// Computes the full record length from its leading bytes.
    ///
    /// `probe` must hold the header and, for tuple-carrying kinds, the
    /// length of the prior tuple buffer that follows it. Up to [`UNDO_LENGTH_PROBE_SIZE`]
    /// bytes are enough for every kind.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown tags or a probe that is too short.
    pub fn record_len(probe: &[u8]) -> CoreResult<usize> {
        let Some(&tag) = probe.first() else {
            return Err(CoreError::undo_corruption("empty undo record"));
        };
        let kind = UndoRecordKind::from_byte(tag)?;
        match kind {
            UndoRecordKind::Insert | UndoRecordKind::InvalidXactSlot => Ok(UNDO_HEADER_SIZE),
            UndoRecordKind::MultiInsert => Ok(UNDO_HEADER_SIZE + 4),
            _ => {
                let mut reader = Reader::new(probe);
                reader.skip(UNDO_HEADER_SIZE)?;
                let buffer_len = reader.u32()? as usize;
                Ok(UNDO_HEADER_SIZE + PRIOR_TUPLE_LENGTH_SIZE + buffer_len)
            }
        }
    }

    /// Decodes a record that occupies exactly `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnsupportedUndoOperation`] for unknown tags and
    /// [`CoreError::UndoCorruption`] for truncated or malformed records.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let mut reader = Reader::new(bytes);

        let kind = UndoRecordKind::from_byte(reader.u8()?)?;
        let epoch = reader.u32()?;
        let xid = TransactionId::new(reader.u32()?);
        let prevlen = reader.u16()?;
        let blkprev = UndoRecordPointer::from_u64(reader.u64()?);
        let block = reader.u32()?;
        let offset = reader.u16()?;
        let relfilenode = reader.u32()?;
        let tablespace = reader.u32()?;
        let fork_byte = reader.u8()?;
        let fork = ForkNumber::from_byte(fork_byte)
            .ok_or_else(|| CoreError::undo_corruption(format!("unknown fork {fork_byte}")))?;

        let operation = match kind {
            UndoRecordKind::Insert => UndoOperation::Insert,
            UndoRecordKind::InvalidXactSlot => UndoOperation::InvalidXactSlot,
            UndoRecordKind::MultiInsert => {
                let first = reader.u16()?;
                let last = reader.u16()?;
                if first > last {
                    return Err(CoreError::undo_corruption(format!(
                        "multi-insert range {first}..={last} is empty"
                    )));
                }
                UndoOperation::MultiInsert { first, last }
            }
            UndoRecordKind::Delete
            | UndoRecordKind::Update
            | UndoRecordKind::InplaceUpdate
            | UndoRecordKind::XidLockOnly => {
                let buffer_len = reader.u32()? as usize;
                let image_len = reader.u32()? as usize;
                if buffer_len != PRIOR_TUPLE_PREFIX_SIZE + image_len {
                    return Err(CoreError::undo_corruption(format!(
                        "prior tuple buffer of {buffer_len} bytes holds a {image_len} byte tuple"
                    )));
                }
                let ctid = ItemPointer::new(reader.u32()?, reader.u16()?);
                let table_oid = reader.u32()?;
                let image = reader.bytes(image_len)?.to_vec();
                let tuple = PriorTuple::new(ctid, table_oid, image);
                match kind {
                    UndoRecordKind::Delete => UndoOperation::Delete(tuple),
                    UndoRecordKind::Update => UndoOperation::Update(tuple),
                    UndoRecordKind::InplaceUpdate => UndoOperation::InplaceUpdate(tuple),
                    _ => UndoOperation::XidLockOnly(tuple),
                }
            }
        };

        if !reader.is_empty() {
            return Err(CoreError::undo_corruption(format!(
                "trailing bytes in {kind:?} record: expected {} bytes, got {}",
                reader.position(),
                bytes.len()
            )));
        }

        Ok(Self {
            xid,
            epoch,
            node: RelFileNode::new(tablespace, relfilenode),
            fork,
            block,
            offset,
            prevlen,
            blkprev,
            operation,
        })
    }
}

/// Little-endian cursor over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn bytes(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                CoreError::undo_corruption(format!(
                    "unexpected end of record at byte {} (wanted {len} more)",
                    self.pos
                ))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn skip(&mut self, len: usize) -> CoreResult<()> {
        self.bytes(len).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        let bytes = self.bytes(N)?;
        bytes
            .try_into()
            .map_err(|_| CoreError::undo_corruption("invalid field width"))
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> CoreResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UndoLogNumber;
    use proptest::prelude::*;

    fn record(operation: UndoOperation) -> UnpackedUndoRecord {
        UnpackedUndoRecord {
            xid: TransactionId::new(812),
            epoch: 2,
            node: RelFileNode::new(1663, 16384),
            fork: ForkNumber::Main,
            block: 7,
            offset: 3,
            prevlen: 48,
            blkprev: UndoRecordPointer::new(UndoLogNumber::new(1), 120),
            operation,
        }
    }

    #[test]
    fn header_layout() {
        let bytes = record(UndoOperation::Insert).encode().unwrap();
        assert_eq!(bytes.len(), UNDO_HEADER_SIZE);
        assert_eq!(bytes[0], UndoRecordKind::Insert.as_byte());
        assert_eq!(&bytes[1..5], &2u32.to_le_bytes());
        assert_eq!(&bytes[5..9], &812u32.to_le_bytes());
        assert_eq!(&bytes[9..11], &48u16.to_le_bytes());
        assert_eq!(&bytes[19..23], &7u32.to_le_bytes());
        assert_eq!(&bytes[23..25], &3u16.to_le_bytes());
        assert_eq!(&bytes[25..29], &16384u32.to_le_bytes());
        assert_eq!(&bytes[29..33], &1663u32.to_le_bytes());
        assert_eq!(bytes[33], 0);
    }

    #[test]
    fn tuple_payload_has_fourteen_byte_prefix() {
        let tuple = PriorTuple::new(ItemPointer::new(7, 3), 16385, vec![0xAA; 9]);
        let rec = record(UndoOperation::Delete(tuple));
        let bytes = rec.encode().unwrap();

        assert_eq!(bytes.len(), UNDO_HEADER_SIZE + 4 + 14 + 9);
        assert_eq!(&bytes[34..38], &23u32.to_le_bytes());
        assert_eq!(&bytes[38..42], &9u32.to_le_bytes());
        assert_eq!(&bytes[42..46], &7u32.to_le_bytes());
        assert_eq!(&bytes[46..48], &3u16.to_le_bytes());
        assert_eq!(&bytes[48..52], &16385u32.to_le_bytes());
        assert_eq!(&bytes[52..], &[0xAA; 9]);
        assert_eq!(UnpackedUndoRecord::decode(&bytes).unwrap(), rec);
    }

    #[test]
    fn delete_with_three_byte_image_is_fifty_five_bytes() {
        let tuple = PriorTuple::new(ItemPointer::new(2, 5), 16384, b"abc".to_vec());
        let bytes = record(UndoOperation::Delete(tuple)).encode().unwrap();
        assert_eq!(bytes.len(), 55);
        let probe = &bytes[..UNDO_LENGTH_PROBE_SIZE];
        assert_eq!(UnpackedUndoRecord::record_len(probe).unwrap(), 55);
    }

    #[test]
    fn mismatched_tuple_lengths_are_corruption() {
        let tuple = PriorTuple::new(ItemPointer::new(2, 5), 16384, b"abc".to_vec());
        let mut bytes = record(UndoOperation::Update(tuple)).encode().unwrap();
        bytes[38] = 4;
        assert!(matches!(
            UnpackedUndoRecord::decode(&bytes),
            Err(CoreError::UndoCorruption { .. })
        ));
    }

    #[test]
    fn record_len_from_probe() {
        let insert = record(UndoOperation::Insert).encode().unwrap();
        assert_eq!(UnpackedUndoRecord::record_len(&insert).unwrap(), insert.len());

        let multi = record(UndoOperation::MultiInsert { first: 2, last: 5 })
            .encode()
            .unwrap();
        assert_eq!(UnpackedUndoRecord::record_len(&multi).unwrap(), multi.len());

        let tuple = PriorTuple::new(ItemPointer::new(1, 1), 1, vec![1; 300]);
        let update = record(UndoOperation::Update(tuple)).encode().unwrap();
        let probe = &update[..UNDO_LENGTH_PROBE_SIZE];
        assert_eq!(UnpackedUndoRecord::record_len(probe).unwrap(), update.len());
    }

    #[test]
    fn unknown_tag_is_unsupported() {
        let mut bytes = record(UndoOperation::Insert).encode().unwrap();
        bytes[0] = 42;
        assert!(matches!(
            UnpackedUndoRecord::decode(&bytes),
            Err(CoreError::UnsupportedUndoOperation { tag: 42 })
        ));
        assert!(matches!(
            UnpackedUndoRecord::record_len(&bytes),
            Err(CoreError::UnsupportedUndoOperation { tag: 42 })
        ));
    }

    #[test]
    fn truncated_and_trailing_bytes_are_corruption() {
        let bytes = record(UndoOperation::MultiInsert { first: 1, last: 4 })
            .encode()
            .unwrap();
        assert!(matches!(
            UnpackedUndoRecord::decode(&bytes[..bytes.len() - 1]),
            Err(CoreError::UndoCorruption { .. })
        ));

        let mut longer = bytes.clone();
        longer.push(0);
        assert!(matches!(
            UnpackedUndoRecord::decode(&longer),
            Err(CoreError::UndoCorruption { .. })
        ));
    }

    #[test]
    fn unknown_fork_is_corruption() {
        let mut bytes = record(UndoOperation::Insert).encode().unwrap();
        bytes[33] = 9;
        assert!(matches!(
            UnpackedUndoRecord::decode(&bytes),
            Err(CoreError::UndoCorruption { .. })
        ));
    }

    #[test]
    fn oversized_record_is_rejected() {
        let tuple = PriorTuple::new(ItemPointer::new(1, 1), 1, vec![0; MAX_UNDO_RECORD_SIZE]);
        assert!(matches!(
            record(UndoOperation::InplaceUpdate(tuple)).encode(),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    fn arb_operation() -> impl Strategy<Value = UndoOperation> {
        let tuple = (any::<u32>(), 1u16..200, any::<u32>(), prop::collection::vec(any::<u8>(), 0..64))
            .prop_map(|(block, offset, oid, image)| {
                PriorTuple::new(ItemPointer::new(block, offset), oid, image)
            });
        prop_oneof![
            Just(UndoOperation::Insert),
            Just(UndoOperation::InvalidXactSlot),
            (1u16..100, 0u16..50).prop_map(|(first, n)| UndoOperation::MultiInsert {
                first,
                last: first + n
            }),
            tuple.clone().prop_map(UndoOperation::Delete),
            tuple.clone().prop_map(UndoOperation::Update),
            tuple.clone().prop_map(UndoOperation::InplaceUpdate),
            tuple.prop_map(UndoOperation::XidLockOnly),
        ]
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(op in arb_operation(), xid in any::<u32>(), prevlen in any::<u16>()) {
            let mut rec = record(op);
            rec.xid = TransactionId::new(xid);
            rec.prevlen = prevlen;
            let bytes = rec.encode().unwrap();
            prop_assert_eq!(bytes.len(), rec.encoded_len());
            prop_assert_eq!(UnpackedUndoRecord::record_len(&bytes).unwrap(), bytes.len());
            prop_assert_eq!(UnpackedUndoRecord::decode(&bytes).unwrap(), rec);
        }
    }
}
