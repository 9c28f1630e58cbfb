//! Durability record types and serialization.

use crate::error::{CoreError, CoreResult};
use crate::types::{BlockNumber, ForkNumber, RelFileNode, TransactionId, UndoLogNumber};
use crate::undo::UndoRecordPointer;

/// Magic bytes identifying a durability record.
pub const WAL_MAGIC: [u8; 4] = *b"ZUWL";

/// Current durability log format version.
pub const WAL_VERSION: u16 = 1;

/// Type of durability record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    /// Full image of a page after undo was applied to it.
    UndoPage = 1,
    /// Physical discard of an undo log prefix.
    UndoDiscard = 2,
}

impl WalRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::UndoPage),
            2 => Some(Self::UndoDiscard),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A durability record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Full page image written after undo actions changed the page.
    UndoPage {
        /// Relation file identity.
        node: RelFileNode,
        /// Fork of the page.
        fork: ForkNumber,
        /// Block number of the page.
        block: BlockNumber,
        /// Encoded page, see [`crate::page::Page::to_image`].
        image: Vec<u8>,
    },

    /// An undo log prefix was dropped.
    UndoDiscard {
        /// Log that was discarded.
        log: UndoLogNumber,
        /// New discard point.
        discard: UndoRecordPointer,
        /// Newest transaction whose undo was dropped.
        last_xid: TransactionId,
    },
}

impl WalRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> WalRecordType {
        match self {
            Self::UndoPage { .. } => WalRecordType::UndoPage,
            Self::UndoDiscard { .. } => WalRecordType::UndoDiscard,
        }
    }

    /// Maximum size of a page image in a record.
    pub const MAX_IMAGE_SIZE: usize = u32::MAX as usize - 64;

    /// Serializes the record payload (without envelope).
    ///
    /// # Errors
    ///
    /// Returns an error if a page image exceeds [`Self::MAX_IMAGE_SIZE`].
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();

        match self {
            Self::UndoPage {
                node,
                fork,
                block,
                image,
            } => {
                if image.len() > Self::MAX_IMAGE_SIZE {
                    return Err(CoreError::invalid_argument(format!(
                        "page image too large: {} bytes exceeds maximum of {} bytes",
                        image.len(),
                        Self::MAX_IMAGE_SIZE
                    )));
                }
                buf.extend_from_slice(&node.tablespace.to_le_bytes());
                buf.extend_from_slice(&node.relfilenode.to_le_bytes());
                buf.push(fork.as_byte());
                buf.extend_from_slice(&block.to_le_bytes());
                buf.extend_from_slice(&(image.len() as u32).to_le_bytes());
                buf.extend_from_slice(image);
            }

            Self::UndoDiscard {
                log,
                discard,
                last_xid,
            } => {
                buf.extend_from_slice(&log.as_u32().to_le_bytes());
                buf.extend_from_slice(&discard.as_u64().to_le_bytes());
                buf.extend_from_slice(&last_xid.as_u32().to_le_bytes());
            }
        }

        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    pub fn decode_payload(record_type: WalRecordType, payload: &[u8]) -> CoreResult<Self> {
        let mut cursor = 0;
        let take = |cursor: &mut usize, len: usize| take_bytes(payload, cursor, len);

        let record = match record_type {
            WalRecordType::UndoPage => {
                let tablespace = le_u32(take(&mut cursor, 4)?)?;
                let relfilenode = le_u32(take(&mut cursor, 4)?)?;
                let fork_byte = take(&mut cursor, 1)?[0];
                let fork = ForkNumber::from_byte(fork_byte).ok_or_else(|| {
                    CoreError::wal_corruption(format!("unknown fork {fork_byte}"))
                })?;
                let block = le_u32(take(&mut cursor, 4)?)?;
                let len = le_u32(take(&mut cursor, 4)?)? as usize;
                let image = take(&mut cursor, len)?.to_vec();
                Self::UndoPage {
                    node: RelFileNode::new(tablespace, relfilenode),
                    fork,
                    block,
                    image,
                }
            }

            WalRecordType::UndoDiscard => {
                let log = UndoLogNumber::new(le_u32(take(&mut cursor, 4)?)?);
                let discard = UndoRecordPointer::from_u64(le_u64(take(&mut cursor, 8)?)?);
                let last_xid = TransactionId::new(le_u32(take(&mut cursor, 4)?)?);
                Self::UndoDiscard {
                    log,
                    discard,
                    last_xid,
                }
            }
        };

        if cursor != payload.len() {
            return Err(CoreError::wal_corruption(format!(
                "trailing bytes in {record_type:?} record: expected {} bytes, got {}",
                cursor,
                payload.len()
            )));
        }

        Ok(record)
    }
}

fn take_bytes<'a>(payload: &'a [u8], cursor: &mut usize, len: usize) -> CoreResult<&'a [u8]> {
    let end = cursor
        .checked_add(len)
        .filter(|end| *end <= payload.len())
        .ok_or_else(|| CoreError::wal_corruption("unexpected end of payload"))?;
    let bytes = &payload[*cursor..end];
    *cursor = end;
    Ok(bytes)
}

fn le_u32(bytes: &[u8]) -> CoreResult<u32> {
    bytes
        .try_into()
        .map(u32::from_le_bytes)
        .map_err(|_| CoreError::wal_corruption("invalid u32"))
}

fn le_u64(bytes: &[u8]) -> CoreResult<u64> {
    bytes
        .try_into()
        .map(u64::from_le_bytes)
        .map_err(|_| CoreError::wal_corruption("invalid u64"))
}

/// Computes CRC32 checksum for data.
pub fn compute_crc32(data: &[u8]) -> u32 {
    // CRC32 with the IEEE polynomial
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_record() -> WalRecord {
        WalRecord::UndoPage {
            node: RelFileNode::new(1663, 16384),
            fork: ForkNumber::Main,
            block: 12,
            image: vec![0xCA, 0xFE, 0xBA, 0xBE],
        }
    }

    #[test]
    fn record_type_roundtrip() {
        for t in [WalRecordType::UndoPage, WalRecordType::UndoDiscard] {
            assert_eq!(WalRecordType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(WalRecordType::from_byte(0), None);
    }

    #[test]
    fn undo_page_record_roundtrip() {
        let record = page_record();
        let payload = record.encode_payload().unwrap();
        let decoded = WalRecord::decode_payload(WalRecordType::UndoPage, &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn undo_discard_record_roundtrip() {
        let record = WalRecord::UndoDiscard {
            log: UndoLogNumber::new(3),
            discard: UndoRecordPointer::new(UndoLogNumber::new(3), 4096),
            last_xid: TransactionId::new(900),
        };
        let payload = record.encode_payload().unwrap();
        assert_eq!(payload.len(), 16);
        let decoded = WalRecord::decode_payload(WalRecordType::UndoDiscard, &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn truncated_payload_is_corruption() {
        let payload = page_record().encode_payload().unwrap();
        let result = WalRecord::decode_payload(WalRecordType::UndoPage, &payload[..payload.len() - 1]);
        assert!(matches!(result, Err(CoreError::WalCorruption { .. })));
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let mut payload = page_record().encode_payload().unwrap();
        payload.push(0);
        let result = WalRecord::decode_payload(WalRecordType::UndoPage, &payload);
        assert!(matches!(result, Err(CoreError::WalCorruption { .. })));
    }

    #[test]
    fn crc32_known_value() {
        // Known test vector: "123456789" should give 0xCBF43926
        let crc = compute_crc32(b"123456789");
        assert_eq!(crc, 0xCBF4_3926);
    }

    #[test]
    fn crc32_empty() {
        let crc = compute_crc32(b"");
        assert_eq!(crc, 0x0000_0000);
    }
}
