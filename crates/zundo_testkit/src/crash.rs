//! Crash and fault injection for the durability path.
//!
//! Undo replay logs a full page image before it installs a page. These
//! helpers make that log fail at chosen points so tests can check that a
//! failed rollback leaves the page as it was, and that the images which did
//! reach the log are enough to rebuild the pages.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use zundo_testkit::crash::{CrashableBackend, recover_pages};
//!
//! let (backend, switch) = CrashableBackend::new(Box::new(InMemoryBackend::new()));
//! let engine = TestEngine::with_wal_backend(config, Box::new(backend));
//! switch.crash_after(0);
//! assert!(txn.rollback().is_err());
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use zundo_core::page::Page;
use zundo_core::undo::BlockTarget;
use zundo_core::wal::{DurabilityLog, WalManager, WalRecord};
use zundo_core::{CoreError, CoreResult, Lsn};
use zundo_storage::{StorageBackend, StorageError, StorageResult};

/// Shared controls for a [`CrashableBackend`].
///
/// The backend is usually boxed away inside a log manager, so tests keep
/// this handle to arm it.
#[derive(Debug)]
pub struct CrashSwitch {
    crash_after_bytes: AtomicU64,
    bytes_written: AtomicU64,
    crashed: AtomicBool,
    fail_on_flush: AtomicBool,
}

impl CrashSwitch {
    fn new() -> Self {
        Self {
            crash_after_bytes: AtomicU64::new(u64::MAX),
            bytes_written: AtomicU64::new(0),
            crashed: AtomicBool::new(false),
            fail_on_flush: AtomicBool::new(false),
        }
    }

    /// Crashes once `bytes` more bytes have been written.
    pub fn crash_after(&self, bytes: u64) {
        let written = self.bytes_written.load(Ordering::SeqCst);
        self.crash_after_bytes
            .store(written.saturating_add(bytes), Ordering::SeqCst);
    }

    /// Sets whether flush and sync should fail.
    pub fn set_fail_on_flush(&self, fail: bool) {
        self.fail_on_flush.store(fail, Ordering::SeqCst);
    }

    /// Disarms the switch.
    pub fn reset(&self) {
        self.crash_after_bytes.store(u64::MAX, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.fail_on_flush.store(false, Ordering::SeqCst);
    }

    /// Returns whether the backend has crashed.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    fn simulated(&self, what: &str) -> StorageError {
        self.crashed.store(true, Ordering::SeqCst);
        StorageError::Io(std::io::Error::other(format!("simulated crash during {what}")))
    }
}

/// A storage backend wrapper that can simulate crashes.
///
/// A write that crosses the crash threshold is torn: the bytes up to the
/// threshold reach the inner backend and the write fails.
pub struct CrashableBackend {
    inner: Box<dyn StorageBackend>,
    switch: Arc<CrashSwitch>,
}

impl CrashableBackend {
    /// Wraps `inner` and returns the switch that arms it.
    pub fn new(inner: Box<dyn StorageBackend>) -> (Self, Arc<CrashSwitch>) {
        let switch = Arc::new(CrashSwitch::new());
        let backend = Self {
            inner,
            switch: Arc::clone(&switch),
        };
        (backend, switch)
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let len = data.len() as u64;
        let current = self.switch.bytes_written.fetch_add(len, Ordering::SeqCst);
        let threshold = self.switch.crash_after_bytes.load(Ordering::SeqCst);

        if current >= threshold {
            return Err(self.switch.simulated("write"));
        }
        if current + len > threshold {
            // Guarded: threshold - current < len <= usize::MAX.
            let partial = (threshold - current) as usize;
            tracing::debug!(written = partial, requested = len, "tearing write");
            self.inner.append(&data[..partial])?;
            return Err(self.switch.simulated("partial write"));
        }
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.switch.fail_on_flush.load(Ordering::SeqCst) {
            return Err(self.switch.simulated("flush"));
        }
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn discarded(&self) -> StorageResult<u64> {
        self.inner.discarded()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.switch.fail_on_flush.load(Ordering::SeqCst) {
            return Err(self.switch.simulated("sync"));
        }
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }

    fn discard_to(&mut self, offset: u64) -> StorageResult<()> {
        self.inner.discard_to(offset)
    }
}

/// A durability log that accepts a fixed number of records, then fails.
pub struct FailingLog {
    inner: Arc<WalManager>,
    remaining: AtomicUsize,
}

impl FailingLog {
    /// Forwards `accepted` records to `inner` and fails every one after.
    pub fn new(inner: Arc<WalManager>, accepted: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(accepted),
        }
    }
}

impl DurabilityLog for FailingLog {
    fn insert(&self, record: &WalRecord) -> CoreResult<Lsn> {
        let accepted = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !accepted {
            return Err(CoreError::durability_failure("log refused the record"));
        }
        self.inner.insert(record)
    }
}

/// Rebuilds pages from the full-page images in `wal`.
///
/// Later images replace earlier ones. A torn record at the tail ends the
/// log and is ignored.
///
/// # Errors
///
/// Returns an error if the log is corrupt or an image cannot be decoded.
pub fn recover_pages(wal: &WalManager) -> CoreResult<HashMap<BlockTarget, Page>> {
    let mut pages = HashMap::new();
    for entry in wal.records()? {
        let (_, record) = entry?;
        if let WalRecord::UndoPage {
            node,
            fork,
            block,
            image,
        } = record
        {
            pages.insert(BlockTarget { node, fork, block }, Page::from_image(&image)?);
        }
    }
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestEngine;
    use zundo_core::undo::UndoRecordStore;
    use zundo_core::{BufferManager, Config, UndoActionExecutor};
    use zundo_storage::InMemoryBackend;

    fn target_of(buffer: &zundo_core::Buffer) -> BlockTarget {
        let tag = buffer.tag();
        BlockTarget {
            node: tag.node,
            fork: tag.fork,
            block: tag.block,
        }
    }

    #[test]
    fn torn_page_image_leaves_page_untouched() {
        let (backend, switch) = CrashableBackend::new(Box::new(InMemoryBackend::new()));
        let config = Config::default().wal_sync_on_write(false);
        let engine = TestEngine::with_wal_backend(config, Box::new(backend));
        let rel = engine.create_relation(false);
        let page = engine.new_page(&rel);

        let mut txn = engine.begin();
        txn.insert(&page, b"doomed").unwrap();
        let before = page.read_page();

        switch.crash_after(8);
        assert!(txn.rollback().is_err());
        assert!(switch.has_crashed());
        assert_eq!(page.read_page(), before);
        assert!(recover_pages(&engine.wal).unwrap().is_empty());
    }

    #[test]
    fn recovered_pages_match_memory() {
        let engine = TestEngine::memory();
        let rel = engine.create_relation(false);
        let first = engine.new_page(&rel);
        let second = engine.new_page(&rel);

        let mut txn = engine.begin();
        txn.insert(&first, b"a").unwrap();
        txn.insert(&second, b"b").unwrap();
        txn.insert(&first, b"c").unwrap();
        txn.rollback().unwrap();

        let pages = recover_pages(&engine.wal).unwrap();
        assert_eq!(pages.len(), 2);
        for buffer in [&first, &second] {
            let recovered = &pages[&target_of(buffer)];
            let mut live = buffer.read_page();
            live.lsn = recovered.lsn;
            assert_eq!(recovered, &live);
        }
    }

    #[test]
    fn failing_log_stops_mid_rollback() {
        let engine = TestEngine::memory();
        let rel = engine.create_relation(false);
        let first = engine.new_page(&rel);
        let second = engine.new_page(&rel);

        let mut txn = engine.begin();
        txn.insert(&first, b"a").unwrap();
        txn.insert(&second, b"b").unwrap();
        let (from, to) = (txn.last(), txn.first());
        let xid = txn.abort();

        let executor = UndoActionExecutor::new(
            Arc::clone(&engine.store) as Arc<dyn UndoRecordStore>,
            Arc::clone(&engine.pool) as Arc<dyn BufferManager>,
            Some(Arc::new(FailingLog::new(Arc::clone(&engine.wal), 1)) as Arc<dyn DurabilityLog>),
        );
        assert!(matches!(
            executor.apply_range(from, to, true),
            Err(CoreError::DurabilityFailure { .. })
        ));

        // Newest page first: the second page was rolled back, the first not.
        assert!(second.read_page().slots.lookup(xid.xid()).is_none());
        assert!(first.read_page().slots.lookup(xid.xid()).is_some());

        // A retry with a working log finishes the job.
        engine.executor.apply_range(from, to, true).unwrap();
        assert!(first.read_page().slots.lookup(xid.xid()).is_none());
    }

    #[test]
    fn flush_failure_surfaces() {
        let (mut backend, switch) = CrashableBackend::new(Box::new(InMemoryBackend::new()));
        switch.set_fail_on_flush(true);
        assert!(backend.flush().is_err());
        assert!(backend.sync().is_err());
        switch.reset();
        assert!(backend.flush().is_ok());
        assert!(!switch.has_crashed());
    }
}
