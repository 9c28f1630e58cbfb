//! Reading the durability log back.

use crate::error::{CoreError, CoreResult};
use crate::types::Lsn;
use crate::wal::record::{compute_crc32, WalRecord};
use crate::wal::writer::{FrameHeader, CRC_SIZE, HEADER_SIZE};
use parking_lot::MutexGuard;
use zundo_storage::StorageBackend;

/// Iterator over durability records, yielding `(end position, record)`.
///
/// A frame cut short by the end of the log is a torn write and ends the
/// iteration without an error. Bad magic, an unknown version or type, and
/// CRC mismatches are returned as errors, after which the iterator is
/// exhausted.
pub struct WalRecords<'a> {
    backend: MutexGuard<'a, Box<dyn StorageBackend>>,
    position: u64,
    end: u64,
    done: bool,
}

impl<'a> WalRecords<'a> {
    pub(crate) fn new(backend: MutexGuard<'a, Box<dyn StorageBackend>>) -> CoreResult<Self> {
        let end = backend.size()?;
        Ok(Self {
            backend,
            position: 0,
            end,
            done: false,
        })
    }

    fn read_frame(&mut self) -> CoreResult<Option<(Lsn, WalRecord)>> {
        let start = self.position;
        if self.end - start < HEADER_SIZE as u64 {
            return Ok(None);
        }
        let header = FrameHeader::parse(&self.backend.read_at(start, HEADER_SIZE)?, start)?;
        let len = header.frame_len();
        if self.end - start < len {
            tracing::debug!(offset = start, "torn durability record at the tail");
            return Ok(None);
        }

        let bytes = self.backend.read_at(start, len as usize)?;
        let (body, crc) = bytes.split_at(bytes.len() - CRC_SIZE);
        let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        let computed = compute_crc32(body);
        if stored != computed {
            return Err(CoreError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let record = WalRecord::decode_payload(header.record_type, &body[HEADER_SIZE..])?;
        self.position = start + len;
        Ok(Some((Lsn::new(self.position), record)))
    }
}

impl Iterator for WalRecords<'_> {
    type Item = CoreResult<(Lsn, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.read_frame().transpose();
        if !matches!(next, Some(Ok(_))) {
            self.done = true;
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ForkNumber, RelFileNode};
    use crate::wal::WalManager;
    use zundo_storage::InMemoryBackend;

    fn image(block: u32, len: usize) -> WalRecord {
        WalRecord::UndoPage {
            node: RelFileNode::new(1663, 16384),
            fork: ForkNumber::Init,
            block,
            image: vec![0xAB; len],
        }
    }

    fn wal_with(records: &[WalRecord]) -> WalManager {
        let wal = WalManager::new(Box::new(InMemoryBackend::new()), false);
        for record in records {
            wal.append(record).unwrap();
        }
        wal
    }

    #[test]
    fn reads_many_and_large_images() {
        let mut records: Vec<_> = (0..50).map(|i| image(i, 500)).collect();
        records.push(image(99, 128 * 1024));
        let wal = wal_with(&records);

        let read: Vec<_> = wal.records().unwrap().map(|r| r.unwrap().1).collect();
        assert_eq!(read, records);
    }

    #[test]
    fn crc_mismatch_stops_iteration() {
        let wal = wal_with(&[image(1, 16), image(2, 16)]);
        wal.with_backend(|backend| {
            let size = backend.size().unwrap();
            let mut bytes = backend.read_at(0, size as usize).unwrap();
            bytes[HEADER_SIZE + 3] ^= 0xFF;
            backend.truncate(0).unwrap();
            backend.append(&bytes).unwrap();
        });

        let mut records = wal.records().unwrap();
        assert!(matches!(
            records.next(),
            Some(Err(CoreError::ChecksumMismatch { .. }))
        ));
        assert!(records.next().is_none());
    }

    #[test]
    fn bad_magic_is_corruption() {
        let wal = wal_with(&[]);
        wal.with_backend(|backend| backend.append(b"NOPE\x01\x00\x01\x00\x00\x00\x00").unwrap());

        let result: CoreResult<Vec<_>> = wal.records().unwrap().collect();
        assert!(matches!(result, Err(CoreError::WalCorruption { .. })));
    }
}
