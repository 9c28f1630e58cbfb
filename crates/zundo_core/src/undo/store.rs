//! Undo record storage.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::types::{TransactionId, UndoLogNumber};
use crate::undo::log::UndoLogControl;
use crate::undo::pointer::UndoRecordPointer;
use crate::undo::record::{UnpackedUndoRecord, UNDO_LENGTH_PROBE_SIZE};
use crate::wal::{DurabilityLog, WalRecord};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use zundo_storage::{InMemoryBackend, StorageBackend, StorageError};

/// Access to undo records, as needed by rollback and discard.
///
/// A record below its log's discard point, or at or beyond its insert
/// point, does not exist: [`fetch`](Self::fetch) returns `Ok(None)` for it.
pub trait UndoRecordStore: Send + Sync {
    /// Returns the control blocks of every log, in log order.
    fn logs(&self) -> Vec<Arc<UndoLogControl>>;

    /// Returns the control block of `log`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UndoLogNotFound`] for an unknown log.
    fn control(&self, log: UndoLogNumber) -> CoreResult<Arc<UndoLogControl>>;

    /// Fetches the record at `ptr`, or `None` if it no longer exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or decoded.
    fn fetch(&self, ptr: UndoRecordPointer) -> CoreResult<Option<UnpackedUndoRecord>>;

    /// Returns the insert pointer of `log` if `xid` wrote its latest record,
    /// otherwise the invalid pointer.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown log.
    fn next_insert_pointer_for_transaction(
        &self,
        log: UndoLogNumber,
        xid: TransactionId,
    ) -> CoreResult<UndoRecordPointer>;

    /// Physically discards everything in `ptr`'s log below `ptr`.
    ///
    /// `last_xid` is the newest transaction whose undo is being dropped.
    /// Discarding to or below the current discard point is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if `ptr` lies beyond the insert point or the
    /// discard cannot be made durable.
    fn discard(&self, ptr: UndoRecordPointer, last_xid: TransactionId) -> CoreResult<()>;

    /// Moves `ptr`'s log insert point back to `ptr` and restores the
    /// length of the record that now ends the log.
    ///
    /// # Errors
    ///
    /// Returns an error if `ptr` lies outside the live part of the log.
    fn rewind_insert(&self, ptr: UndoRecordPointer, prevlen: u16) -> CoreResult<()>;

    /// Returns the length of the last record written to `log`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown log.
    fn last_chain_length(&self, log: UndoLogNumber) -> CoreResult<u16> {
        Ok(self.control(log)?.snapshot().prevlen)
    }

    /// Returns the first record of the latest transaction in `log`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown log.
    fn last_transaction_start(&self, log: UndoLogNumber) -> CoreResult<UndoRecordPointer> {
        Ok(self.control(log)?.snapshot().last_xact_start)
    }

    /// Returns where the next record of `log` will be written.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown log.
    fn insert_pointer(&self, log: UndoLogNumber) -> CoreResult<UndoRecordPointer> {
        Ok(self.control(log)?.snapshot().insert)
    }
}

struct UndoLog {
    control: Arc<UndoLogControl>,
    backend: Mutex<Box<dyn StorageBackend>>,
}

/// Undo logs kept in [`StorageBackend`]s.
///
/// Record pointers address backend offsets directly, so a pointer stays
/// valid for as long as its bytes are not discarded or rewound.
pub struct UndoLogStore {
    logs: RwLock<BTreeMap<UndoLogNumber, Arc<UndoLog>>>,
    next_log: Mutex<u32>,
    wal: Option<Arc<dyn DurabilityLog>>,
    log_discards: bool,
}

impl UndoLogStore {
    /// Creates a store with no logs.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            logs: RwLock::new(BTreeMap::new()),
            next_log: Mutex::new(1),
            wal: None,
            log_discards: config.log_discards,
        }
    }

    /// Writes discard records to `wal`.
    #[must_use]
    pub fn with_wal(mut self, wal: Arc<dyn DurabilityLog>) -> Self {
        self.wal = Some(wal);
        self
    }

    /// Creates a new in-memory log.
    ///
    /// # Errors
    ///
    /// Returns an error if the log number space is exhausted.
    pub fn create_log(&self) -> CoreResult<UndoLogNumber> {
        self.attach_log(Box::new(InMemoryBackend::new()))
    }

    /// Adds a log backed by `backend`, picking up its existing live window.
    ///
    /// The length of the last record and the transaction that wrote it are
    /// not known for an existing backend, so the first rollback or discard
    /// that needs them treats the log end as unresolved.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried or the log number
    /// space is exhausted.
    pub fn attach_log(&self, backend: Box<dyn StorageBackend>) -> CoreResult<UndoLogNumber> {
        let discard = backend.discarded()?;
        let insert = backend.size()?;
        if insert > UndoRecordPointer::MAX_OFFSET {
            return Err(CoreError::invalid_argument(format!(
                "undo log of {insert} bytes exceeds addressable size"
            )));
        }

        let log = {
            let mut next = self.next_log.lock();
            if *next > UndoLogNumber::MAX {
                return Err(CoreError::invalid_operation("undo log numbers exhausted"));
            }
            let log = UndoLogNumber::new(*next);
            *next += 1;
            log
        };

        let entry = Arc::new(UndoLog {
            control: Arc::new(UndoLogControl::new(log, discard, insert)),
            backend: Mutex::new(backend),
        });
        self.logs.write().insert(log, entry);
        tracing::debug!(%log, discard, insert, "undo log attached");
        Ok(log)
    }

    /// Appends `record` to `log` and returns its pointer.
    ///
    /// Sets `record.prevlen` to the length of the record it follows.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or written.
    pub fn insert(
        &self,
        log: UndoLogNumber,
        record: &mut UnpackedUndoRecord,
    ) -> CoreResult<UndoRecordPointer> {
        let entry = self.entry(log)?;
        let mut backend = entry.backend.lock();

        let meta = entry.control.snapshot();
        record.prevlen = meta.prevlen;
        let bytes = record.encode()?;
        let len = bytes.len();
        if meta.insert.offset() + len as u64 > UndoRecordPointer::MAX_OFFSET {
            return Err(CoreError::invalid_operation(format!("{log} is full")));
        }

        let offset = backend.append(&bytes)?;
        if offset != meta.insert.offset() {
            return Err(CoreError::undo_corruption(format!(
                "{log} appended at {offset}, expected {}",
                meta.insert.offset()
            )));
        }

        let ptr = meta.insert;
        entry.control.update(|meta| {
            meta.insert = ptr.step_forward(len);
            // Guarded by the size check above.
            meta.prevlen = len as u16;
            if meta.last_xid != record.xid {
                meta.last_xid = record.xid;
                meta.last_xact_start = ptr;
            }
        });
        tracing::trace!(
            %log,
            %ptr,
            xid = %record.xid,
            kind = ?record.kind(),
            "undo record inserted"
        );
        Ok(ptr)
    }

    /// Syncs the backend of `log`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is unknown or the sync fails.
    pub fn sync(&self, log: UndoLogNumber) -> CoreResult<()> {
        self.entry(log)?.backend.lock().sync()?;
        Ok(())
    }

    fn entry(&self, log: UndoLogNumber) -> CoreResult<Arc<UndoLog>> {
        self.logs
            .read()
            .get(&log)
            .cloned()
            .ok_or(CoreError::UndoLogNotFound { log })
    }
}

/// Reads live bytes, mapping a discarded range to `None`.
fn read_live(
    backend: &dyn StorageBackend,
    offset: u64,
    len: usize,
) -> CoreResult<Option<Vec<u8>>> {
    match backend.read_at(offset, len) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(StorageError::Discarded { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl UndoRecordStore for UndoLogStore {
    fn logs(&self) -> Vec<Arc<UndoLogControl>> {
        self.logs
            .read()
            .values()
            .map(|entry| Arc::clone(&entry.control))
            .collect()
    }

    fn control(&self, log: UndoLogNumber) -> CoreResult<Arc<UndoLogControl>> {
        Ok(Arc::clone(&self.entry(log)?.control))
    }

    fn fetch(&self, ptr: UndoRecordPointer) -> CoreResult<Option<UnpackedUndoRecord>> {
        if !ptr.is_valid() {
            return Ok(None);
        }
        let entry = self.entry(ptr.log())?;
        let meta = entry.control.snapshot();
        if ptr < meta.discard || ptr >= meta.insert {
            return Ok(None);
        }

        let available = (meta.insert.offset() - ptr.offset()) as usize;
        let backend = entry.backend.lock();
        let Some(probe) = read_live(
            &**backend,
            ptr.offset(),
            available.min(UNDO_LENGTH_PROBE_SIZE),
        )?
        else {
            return Ok(None);
        };

        let len = UnpackedUndoRecord::record_len(&probe)?;
        if len > available {
            return Err(CoreError::undo_corruption(format!(
                "record at {ptr} claims {len} bytes but only {available} are live"
            )));
        }

        let record = if len <= probe.len() {
            UnpackedUndoRecord::decode(&probe[..len])?
        } else {
            let Some(bytes) = read_live(&**backend, ptr.offset(), len)? else {
                return Ok(None);
            };
            UnpackedUndoRecord::decode(&bytes)?
        };
        Ok(Some(record))
    }

    fn next_insert_pointer_for_transaction(
        &self,
        log: UndoLogNumber,
        xid: TransactionId,
    ) -> CoreResult<UndoRecordPointer> {
        let meta = self.entry(log)?.control.snapshot();
        Ok(if meta.last_xid == xid {
            meta.insert
        } else {
            UndoRecordPointer::INVALID
        })
    }

    fn discard(&self, ptr: UndoRecordPointer, last_xid: TransactionId) -> CoreResult<()> {
        let log = ptr.log();
        let entry = self.entry(log)?;
        let mut backend = entry.backend.lock();

        let meta = entry.control.snapshot();
        if ptr <= meta.discard {
            return Ok(());
        }
        if ptr > meta.insert {
            return Err(CoreError::invalid_argument(format!(
                "cannot discard {log} to {ptr}: insert point is {}",
                meta.insert
            )));
        }

        if self.log_discards {
            if let Some(wal) = &self.wal {
                wal.insert(&WalRecord::UndoDiscard {
                    log,
                    discard: ptr,
                    last_xid,
                })?;
            }
        }

        backend.discard_to(ptr.offset())?;
        entry.control.update(|meta| {
            meta.discard = ptr;
            if meta.last_xact_start < ptr {
                meta.last_xact_start = ptr;
            }
        });
        tracing::debug!(
            %log,
            from = %meta.discard,
            to = %ptr,
            last_xid = %last_xid,
            "undo discarded"
        );
        Ok(())
    }

    fn rewind_insert(&self, ptr: UndoRecordPointer, prevlen: u16) -> CoreResult<()> {
        let log = ptr.log();
        let entry = self.entry(log)?;
        let mut backend = entry.backend.lock();

        let meta = entry.control.snapshot();
        if ptr < meta.discard || ptr > meta.insert {
            return Err(CoreError::invalid_argument(format!(
                "cannot rewind {log} to {ptr}: live range is {}..{}",
                meta.discard, meta.insert
            )));
        }

        backend.truncate(ptr.offset())?;
        entry.control.update(|meta| {
            meta.insert = ptr;
            meta.prevlen = prevlen;
            if meta.last_xact_start > ptr {
                meta.last_xact_start = ptr;
            }
        });
        tracing::debug!(%log, from = %meta.insert, to = %ptr, prevlen, "undo insert point rewound");
        Ok(())
    }
}

impl std::fmt::Debug for UndoLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoLogStore")
            .field("logs", &self.logs.read().len())
            .field("log_discards", &self.log_discards)
            .finish_non_exhaustive()
    }
}
