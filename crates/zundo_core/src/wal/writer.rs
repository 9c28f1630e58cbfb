//! Durability log writer.

use crate::error::{CoreError, CoreResult};
use crate::types::Lsn;
use crate::wal::reader::WalRecords;
use crate::wal::record::{compute_crc32, WalRecord, WalRecordType, WAL_MAGIC, WAL_VERSION};
use crate::wal::DurabilityLog;
use parking_lot::Mutex;
use zundo_storage::StorageBackend;

/// magic (4) + version (2) + type (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;

/// Envelope in front of every record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub(crate) record_type: WalRecordType,
    pub(crate) payload_len: u32,
}

impl FrameHeader {
    /// Bytes taken by the whole frame, CRC included.
    pub(crate) fn frame_len(self) -> u64 {
        (HEADER_SIZE + CRC_SIZE) as u64 + u64::from(self.payload_len)
    }

    fn write_to(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&WAL_MAGIC);
        out.extend_from_slice(&WAL_VERSION.to_le_bytes());
        out.push(self.record_type.as_byte());
        out.extend_from_slice(&self.payload_len.to_le_bytes());
    }

    /// Parses the header of the frame starting at log offset `at`.
    pub(crate) fn parse(bytes: &[u8], at: u64) -> CoreResult<Self> {
        if bytes.len() < HEADER_SIZE || bytes[..4] != WAL_MAGIC {
            return Err(CoreError::wal_corruption(format!("invalid magic at offset {at}")));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version > WAL_VERSION {
            return Err(CoreError::wal_corruption(format!(
                "unsupported version {version} at offset {at}"
            )));
        }
        let record_type = WalRecordType::from_byte(bytes[6]).ok_or_else(|| {
            CoreError::wal_corruption(format!("unknown record type {} at offset {at}", bytes[6]))
        })?;
        let payload_len = u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);
        Ok(Self {
            record_type,
            payload_len,
        })
    }
}

/// Encodes `record` as header, payload and a CRC over both.
fn frame(record: &WalRecord) -> CoreResult<Vec<u8>> {
    let payload = record.encode_payload()?;
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| CoreError::invalid_operation("durability record payload too large"))?;
    let header = FrameHeader {
        record_type: record.record_type(),
        payload_len,
    };

    let mut bytes = Vec::with_capacity(header.frame_len() as usize);
    header.write_to(&mut bytes);
    bytes.extend_from_slice(&payload);
    let crc = compute_crc32(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());
    Ok(bytes)
}

/// Appends page images and discard records to one storage backend.
///
/// Every record is addressed by the [`Lsn`] just past its frame. A page
/// stamped with that position is covered by its own image and everything
/// logged before it.
pub struct WalManager {
    backend: Mutex<Box<dyn StorageBackend>>,
    sync_on_write: bool,
}

impl WalManager {
    /// Creates a log over `backend`. With `sync_on_write` every record is
    /// flushed before [`append`](Self::append) returns.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_write: bool) -> Self {
        Self {
            backend: Mutex::new(backend),
            sync_on_write,
        }
    }

    /// Appends a record and returns the position just past it.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not fit a frame or the backend
    /// write or flush fails.
    pub fn append(&self, record: &WalRecord) -> CoreResult<Lsn> {
        let bytes = frame(record)?;
        let mut backend = self.backend.lock();
        let start = backend.append(&bytes)?;
        if self.sync_on_write {
            backend.flush()?;
        }
        let lsn = Lsn::new(start + bytes.len() as u64);
        tracing::trace!(%lsn, kind = ?record.record_type(), "durability record appended");
        Ok(lsn)
    }

    /// Flushes buffered records to durable storage.
    pub fn flush(&self) -> CoreResult<()> {
        self.backend.lock().flush()?;
        Ok(())
    }

    /// Returns the position the next record will start at.
    pub fn end_lsn(&self) -> CoreResult<Lsn> {
        Ok(Lsn::new(self.backend.lock().size()?))
    }

    /// Returns the records in log order, each with the position just past
    /// it.
    ///
    /// Appends wait until the iterator is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn records(&self) -> CoreResult<WalRecords<'_>> {
        WalRecords::new(self.backend.lock())
    }

    /// Collects every record.
    pub fn read_all(&self) -> CoreResult<Vec<(Lsn, WalRecord)>> {
        self.records()?.collect()
    }

    #[cfg(test)]
    pub(crate) fn with_backend<R>(&self, f: impl FnOnce(&mut dyn StorageBackend) -> R) -> R {
        let mut backend = self.backend.lock();
        f(&mut **backend)
    }
}

impl DurabilityLog for WalManager {
    fn insert(&self, record: &WalRecord) -> CoreResult<Lsn> {
        self.append(record)
    }
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager")
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ForkNumber, RelFileNode, TransactionId, UndoLogNumber};
    use crate::undo::UndoRecordPointer;
    use zundo_storage::InMemoryBackend;

    fn wal() -> WalManager {
        WalManager::new(Box::new(InMemoryBackend::new()), false)
    }

    fn image(block: u32) -> WalRecord {
        WalRecord::UndoPage {
            node: RelFileNode::new(1663, 16384),
            fork: ForkNumber::Main,
            block,
            image: vec![block as u8; 40],
        }
    }

    fn discard(offset: u64) -> WalRecord {
        WalRecord::UndoDiscard {
            log: UndoLogNumber::new(1),
            discard: UndoRecordPointer::new(UndoLogNumber::new(1), offset),
            last_xid: TransactionId::new(7),
        }
    }

    #[test]
    fn records_carry_the_positions_append_returned() {
        let wal = wal();
        let written = [image(1), discard(64), image(2)];
        let lsns: Vec<Lsn> = written.iter().map(|r| wal.append(r).unwrap()).collect();

        let read = wal.read_all().unwrap();
        assert_eq!(read.len(), 3);
        let expected = lsns.iter().zip(&written);
        for ((lsn, record), (expected_lsn, expected)) in read.iter().zip(expected) {
            assert_eq!((lsn, record), (expected_lsn, expected));
        }
        assert_eq!(wal.end_lsn().unwrap(), lsns[2]);
    }

    #[test]
    fn frame_length_matches_header() {
        let bytes = frame(&image(5)).unwrap();
        let header = FrameHeader::parse(&bytes, 0).unwrap();
        assert_eq!(header.record_type, WalRecordType::UndoPage);
        assert_eq!(header.frame_len(), bytes.len() as u64);
    }

    #[test]
    fn empty_log_has_no_records() {
        let wal = wal();
        assert!(wal.read_all().unwrap().is_empty());
        assert_eq!(wal.end_lsn().unwrap(), Lsn::INVALID);
    }

    #[test]
    fn torn_tail_ends_the_log() {
        let wal = wal();
        let end = wal.append(&image(1)).unwrap();
        wal.append(&image(2)).unwrap();
        wal.with_backend(|backend| backend.truncate(end.as_u64() + 7).unwrap());

        let records = wal.read_all().unwrap();
        assert_eq!(records, vec![(end, image(1))]);
    }

    #[test]
    fn unknown_version_is_corruption() {
        let mut bytes = frame(&discard(8)).unwrap();
        bytes[4] = 0xFF;
        assert!(matches!(
            FrameHeader::parse(&bytes, 0),
            Err(CoreError::WalCorruption { .. })
        ));
    }
}
