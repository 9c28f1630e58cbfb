//! Test fixtures and engine helpers.
//!
//! [`TestEngine`] wires an undo log store, a buffer pool, a durability log
//! and a commit log together. [`Workload`] plays the part of the heap: it
//! changes pages and writes the undo for each change, keeping the page's
//! transaction slot and the `blkprev` chain in step.
//!
//! Transactions writing to the same undo log must not interleave; give
//! concurrent workloads their own log with [`TestEngine::create_log`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use zundo_core::page::{infomask, ItemState, Page, Tuple};
use zundo_core::undo::{
    PriorTuple, UndoLogMeta, UndoLogStore, UndoOperation, UndoRecordPointer, UndoRecordStore,
    UnpackedUndoRecord,
};
use zundo_core::wal::{DurabilityLog, WalManager, WalRecord};
use zundo_core::{
    Buffer, BufferManager, BufferPool, CommitLog, Config, CoreError, CoreResult,
    FullTransactionId, ImmediateRunner, ItemPointer, OffsetNumber, Persistence, RelFileNode,
    Relation, RelationId, TransactionStatusOracle, UndoActionExecutor, UndoDiscardScanner,
    UndoLogNumber, UndoStats, UndoWatermark,
};
use zundo_storage::{FileBackend, InMemoryBackend, StorageBackend};

/// Tablespace used for every test relation.
pub const TEST_TABLESPACE: u32 = 1663;

/// A fully wired undo engine with automatic cleanup.
pub struct TestEngine {
    /// Engine configuration.
    pub config: Config,
    /// Undo logs.
    pub store: Arc<UndoLogStore>,
    /// Pages.
    pub pool: Arc<BufferPool>,
    /// Durability log shared by page images and discards.
    pub wal: Arc<WalManager>,
    /// Transaction status.
    pub clog: Arc<CommitLog>,
    /// Counters shared by the executor and scanners.
    pub stats: Arc<UndoStats>,
    /// Undo replay.
    pub executor: Arc<UndoActionExecutor>,
    /// Global watermark.
    pub watermark: Arc<UndoWatermark>,
    log: UndoLogNumber,
    next_relation: AtomicU32,
    temp_dir: Option<TempDir>,
}

impl TestEngine {
    /// Creates an engine with every log in memory.
    pub fn memory() -> Self {
        Self::with_config(Config::default().wal_sync_on_write(false))
    }

    /// Creates an in-memory engine with `config`.
    pub fn with_config(config: Config) -> Self {
        Self::build(config, Box::new(InMemoryBackend::new()), None, None)
            .expect("Failed to build in-memory engine")
    }

    /// Creates an engine whose durability log is written to `wal_backend`.
    pub fn with_wal_backend(config: Config, wal_backend: Box<dyn StorageBackend>) -> Self {
        Self::build(config, wal_backend, None, None).expect("Failed to build engine")
    }

    /// Creates an engine whose durability log and first undo log are files
    /// in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let wal = FileBackend::open_with_create_dirs(&temp_dir.path().join("wal.log"))
            .expect("Failed to create WAL backend");
        let undo = FileBackend::open_with_create_dirs(&temp_dir.path().join("undo_1.log"))
            .expect("Failed to create undo backend");
        Self::build(Config::default(), Box::new(wal), Some(Box::new(undo)), Some(temp_dir))
            .expect("Failed to build file engine")
    }

    fn build(
        config: Config,
        wal_backend: Box<dyn StorageBackend>,
        undo_backend: Option<Box<dyn StorageBackend>>,
        temp_dir: Option<TempDir>,
    ) -> CoreResult<Self> {
        let wal = Arc::new(WalManager::new(wal_backend, config.wal_sync_on_write));
        let store = Arc::new(
            UndoLogStore::new(&config).with_wal(Arc::clone(&wal) as Arc<dyn DurabilityLog>),
        );
        let log = match undo_backend {
            Some(backend) => store.attach_log(backend)?,
            None => store.create_log()?,
        };
        let pool = Arc::new(BufferPool::new());
        let stats = Arc::new(UndoStats::new());
        let executor = Arc::new(
            UndoActionExecutor::new(
                Arc::clone(&store) as Arc<dyn UndoRecordStore>,
                Arc::clone(&pool) as Arc<dyn BufferManager>,
                Some(Arc::clone(&wal) as Arc<dyn DurabilityLog>),
            )
            .with_stats(Arc::clone(&stats)),
        );
        Ok(Self {
            config,
            store,
            pool,
            wal,
            clog: Arc::new(CommitLog::new()),
            stats,
            executor,
            watermark: Arc::new(UndoWatermark::new(FullTransactionId::INVALID)),
            log,
            next_relation: AtomicU32::new(16384),
            temp_dir,
        })
    }

    /// Returns the temporary directory of a file engine.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().to_path_buf())
    }

    /// Returns the default undo log.
    pub fn log(&self) -> UndoLogNumber {
        self.log
    }

    /// Adds an in-memory undo log.
    pub fn create_log(&self) -> UndoLogNumber {
        self.store.create_log().expect("Failed to create undo log")
    }

    /// Returns the state of `log`.
    pub fn meta(&self, log: UndoLogNumber) -> UndoLogMeta {
        self.store
            .control(log)
            .expect("Unknown undo log")
            .snapshot()
    }

    /// Creates a logged relation.
    pub fn create_relation(&self, has_index: bool) -> Arc<Relation> {
        self.create_relation_with(has_index, Persistence::Permanent)
    }

    /// Creates a relation with the given persistence.
    pub fn create_relation_with(&self, has_index: bool, persistence: Persistence) -> Arc<Relation> {
        let id = self.next_relation.fetch_add(1, Ordering::Relaxed);
        self.pool
            .create_relation(Relation {
                id: RelationId::new(id),
                node: RelFileNode::new(TEST_TABLESPACE, id),
                has_index,
                persistence,
            })
            .expect("Failed to create relation")
    }

    /// Appends an empty page to `relation`.
    pub fn new_page(&self, relation: &Relation) -> Arc<Buffer> {
        self.pool.extend(relation, zundo_core::ForkNumber::Main)
    }

    /// Starts a transaction writing to the default log.
    pub fn begin(&self) -> Workload<'_> {
        self.begin_in(self.log)
    }

    /// Starts a transaction writing to `log`.
    pub fn begin_in(&self, log: UndoLogNumber) -> Workload<'_> {
        Workload {
            engine: self,
            log,
            xid: self.clog.begin(),
            first: UndoRecordPointer::INVALID,
            last: UndoRecordPointer::INVALID,
        }
    }

    /// Creates the discard scanner. Fails if one already exists.
    pub fn scanner(&self) -> CoreResult<UndoDiscardScanner> {
        UndoDiscardScanner::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.clog) as Arc<dyn TransactionStatusOracle>,
            Arc::new(ImmediateRunner),
            &self.watermark,
        )
    }

    /// Returns the oldest transaction that may still be running.
    pub fn horizon(&self) -> FullTransactionId {
        self.clog.oldest_running()
    }

    /// Aborts every running transaction without rolling anything back.
    pub fn crash(&self) {
        self.clog.abort_all_running();
    }

    /// Returns every durability record.
    pub fn wal_records(&self) -> Vec<WalRecord> {
        self.wal
            .read_all()
            .expect("Failed to read durability log")
            .into_iter()
            .map(|(_, record)| record)
            .collect()
    }

    /// Returns how many full-page images have been logged.
    pub fn page_images(&self) -> usize {
        self.wal_records()
            .iter()
            .filter(|record| matches!(record, WalRecord::UndoPage { .. }))
            .count()
    }

    /// Prunes a deleted tuple, leaving a deleted line pointer behind.
    pub fn prune(&self, buffer: &Buffer, offset: OffsetNumber) -> CoreResult<()> {
        buffer.modify(|page| {
            let item = page.item_mut(offset).ok_or_else(|| {
                CoreError::invalid_item(buffer.tag().block, offset, "no such line pointer")
            })?;
            item.state = ItemState::Deleted;
            item.tuple = None;
            Ok(())
        })
    }
}

impl std::fmt::Debug for TestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEngine")
            .field("log", &self.log)
            .field("file", &self.temp_dir.is_some())
            .finish_non_exhaustive()
    }
}

/// A transaction that changes pages and writes their undo.
///
/// Dropping a workload leaves its transaction running, as a crash would.
pub struct Workload<'e> {
    engine: &'e TestEngine,
    log: UndoLogNumber,
    xid: FullTransactionId,
    first: UndoRecordPointer,
    last: UndoRecordPointer,
}

impl<'e> Workload<'e> {
    /// Returns the transaction id.
    pub fn xid(&self) -> FullTransactionId {
        self.xid
    }

    /// Returns the undo log written to.
    pub fn log(&self) -> UndoLogNumber {
        self.log
    }

    /// Returns the first undo record, invalid if none was written.
    pub fn first(&self) -> UndoRecordPointer {
        self.first
    }

    /// Returns the newest undo record, invalid if none was written.
    pub fn last(&self) -> UndoRecordPointer {
        self.last
    }

    /// Inserts a tuple.
    pub fn insert(
        &mut self,
        buffer: &Buffer,
        data: &[u8],
    ) -> CoreResult<(OffsetNumber, UndoRecordPointer)> {
        let mut inserted = 0;
        let ptr = self.write(buffer, |page, _| {
            inserted = page.add_item(Tuple::new(data.to_vec()));
            Ok((inserted, UndoOperation::Insert))
        })?;
        Ok((inserted, ptr))
    }

    /// Inserts tuples at consecutive line pointers under one undo record.
    pub fn multi_insert(
        &mut self,
        buffer: &Buffer,
        rows: &[&[u8]],
    ) -> CoreResult<(OffsetNumber, OffsetNumber, UndoRecordPointer)> {
        let mut range = (0, 0);
        let ptr = self.write(buffer, |page, block| {
            let (first_row, rest) = rows
                .split_first()
                .ok_or_else(|| CoreError::invalid_argument("multi-insert needs rows"))?;
            let first = page.add_item(Tuple::new(first_row.to_vec()));
            let mut last = first;
            for row in rest {
                let offset = page.add_item(Tuple::new(row.to_vec()));
                if offset != last + 1 {
                    return Err(CoreError::invalid_item(
                        block,
                        offset,
                        "multi-insert needs consecutive line pointers",
                    ));
                }
                last = offset;
            }
            range = (first, last);
            Ok((first, UndoOperation::MultiInsert { first, last }))
        })?;
        Ok((range.0, range.1, ptr))
    }

    /// Marks a tuple deleted.
    pub fn delete(
        &mut self,
        buffer: &Buffer,
        offset: OffsetNumber,
    ) -> CoreResult<UndoRecordPointer> {
        self.change_tuple(buffer, offset, UndoOperation::Delete, |tuple| {
            tuple.header.infomask |= infomask::DELETED;
        })
    }

    /// Replaces a tuple with a new version.
    pub fn update(
        &mut self,
        buffer: &Buffer,
        offset: OffsetNumber,
        data: &[u8],
    ) -> CoreResult<UndoRecordPointer> {
        self.change_tuple(buffer, offset, UndoOperation::Update, |tuple| {
            tuple.header.infomask |= infomask::UPDATED;
            tuple.data = data.to_vec();
        })
    }

    /// Overwrites a tuple in place.
    pub fn inplace_update(
        &mut self,
        buffer: &Buffer,
        offset: OffsetNumber,
        data: &[u8],
    ) -> CoreResult<UndoRecordPointer> {
        self.change_tuple(buffer, offset, UndoOperation::InplaceUpdate, |tuple| {
            tuple.header.infomask |= infomask::INPLACE_UPDATED;
            tuple.data = data.to_vec();
        })
    }

    /// Locks a tuple without changing its data.
    pub fn lock(&mut self, buffer: &Buffer, offset: OffsetNumber) -> CoreResult<UndoRecordPointer> {
        self.change_tuple(buffer, offset, UndoOperation::XidLockOnly, |tuple| {
            tuple.header.infomask |= infomask::XID_LOCK_ONLY;
        })
    }

    /// Sets the invalid-transaction-slot marker on an item.
    pub fn mark_invalid_xact(
        &mut self,
        buffer: &Buffer,
        offset: OffsetNumber,
    ) -> CoreResult<UndoRecordPointer> {
        self.write(buffer, |page, block| {
            let item = page
                .item_mut(offset)
                .ok_or_else(|| CoreError::invalid_item(block, offset, "no such line pointer"))?;
            if item.state == ItemState::Deleted {
                item.invalid_xact = true;
            } else {
                let tuple = item
                    .tuple
                    .as_mut()
                    .ok_or_else(|| CoreError::invalid_item(block, offset, "item has no storage"))?;
                tuple.header.infomask |= infomask::INVALID_XACT_SLOT;
            }
            Ok((offset, UndoOperation::InvalidXactSlot))
        })
    }

    /// Returns where this transaction's next undo record will go.
    ///
    /// Rolling back to a savepoint undoes everything written after it.
    pub fn savepoint(&self) -> CoreResult<UndoRecordPointer> {
        self.engine.store.insert_pointer(self.log)
    }

    /// Rolls back everything written since `savepoint`. The transaction
    /// stays open.
    pub fn rollback_to(&mut self, savepoint: UndoRecordPointer) -> CoreResult<()> {
        if !self.last.is_valid() || self.last < savepoint {
            return Ok(());
        }
        self.engine
            .executor
            .apply_range(self.last, savepoint, false)?;
        if savepoint <= self.first {
            self.first = UndoRecordPointer::INVALID;
            self.last = UndoRecordPointer::INVALID;
        } else {
            let len = self.engine.store.last_chain_length(self.log)?;
            self.last = savepoint
                .step_back(len)
                .unwrap_or(UndoRecordPointer::INVALID);
        }
        Ok(())
    }

    /// Commits the transaction.
    pub fn commit(self) -> FullTransactionId {
        self.engine.clog.set_committed(self.xid.xid());
        self.xid
    }

    /// Aborts the transaction and leaves its undo for the discard scanner.
    pub fn abort(self) -> FullTransactionId {
        self.engine.clog.set_aborted(self.xid.xid());
        self.xid
    }

    /// Aborts the transaction and rolls it back immediately.
    pub fn rollback(self) -> CoreResult<FullTransactionId> {
        self.engine.clog.set_aborted(self.xid.xid());
        self.engine
            .executor
            .apply_range(self.last, self.first, true)?;
        Ok(self.xid)
    }

    fn change_tuple(
        &mut self,
        buffer: &Buffer,
        offset: OffsetNumber,
        operation: fn(PriorTuple) -> UndoOperation,
        change: impl FnOnce(&mut Tuple),
    ) -> CoreResult<UndoRecordPointer> {
        let table_oid = buffer.tag().node.relfilenode;
        self.write(buffer, |page, block| {
            let tuple = page
                .item_mut(offset)
                .filter(|item| item.is_normal())
                .and_then(|item| item.tuple.as_mut())
                .ok_or_else(|| CoreError::invalid_item(block, offset, "not a normal tuple"))?;
            let prior = PriorTuple::new(ItemPointer::new(block, offset), table_oid, tuple.encode());
            change(tuple);
            Ok((offset, operation(prior)))
        })
    }

    /// Applies `change` to a copy of the page, logs its undo, then installs
    /// the copy. The page is unchanged if anything fails.
    fn write(
        &mut self,
        buffer: &Buffer,
        change: impl FnOnce(&mut Page, u32) -> CoreResult<(OffsetNumber, UndoOperation)>,
    ) -> CoreResult<UndoRecordPointer> {
        let tag = buffer.tag();
        let xid = self.xid;
        let store = &self.engine.store;
        let log = self.log;

        let ptr = buffer.modify(|page| {
            let mut staged = page.clone();
            let index = staged
                .slots
                .reserve(xid.xid())
                .ok_or_else(|| CoreError::invalid_operation("no free transaction slot"))?;
            let blkprev = staged
                .slots
                .get(index)
                .map_or(UndoRecordPointer::INVALID, |slot| slot.undo);
            let (offset, operation) = change(&mut staged, tag.block)?;

            let mut record = UnpackedUndoRecord {
                xid: xid.xid(),
                epoch: xid.epoch(),
                node: tag.node,
                fork: tag.fork,
                block: tag.block,
                offset,
                prevlen: 0,
                blkprev,
                operation,
            };
            let ptr = store.insert(log, &mut record)?;
            staged.slots.set_pointer(index, ptr)?;
            *page = staged;
            Ok::<_, CoreError>(ptr)
        })?;

        if !self.first.is_valid() {
            self.first = ptr;
        }
        self.last = ptr;
        Ok(ptr)
    }
}

impl std::fmt::Debug for Workload<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workload")
            .field("xid", &self.xid)
            .field("log", &self.log)
            .field("first", &self.first)
            .field("last", &self.last)
            .finish()
    }
}

/// Returns the data of the tuple at `offset`, if it has storage.
pub fn tuple_data(buffer: &Buffer, offset: OffsetNumber) -> Option<Vec<u8>> {
    buffer
        .read_page()
        .item(offset)
        .and_then(|item| item.tuple.as_ref())
        .map(|tuple| tuple.data.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_links_block_chain() {
        let engine = TestEngine::memory();
        let rel = engine.create_relation(false);
        let page = engine.new_page(&rel);
        let mut txn = engine.begin();

        let (offset, first) = txn.insert(&page, b"a").unwrap();
        let second = txn.update(&page, offset, b"b").unwrap();

        let record = engine.store.fetch(second).unwrap().unwrap();
        assert_eq!(record.blkprev, first);
        let slot = *page.read_page().slots.lookup(txn.xid().xid()).unwrap();
        assert_eq!(slot.undo, second);
        assert_eq!(txn.first(), first);
        assert_eq!(txn.last(), second);
    }

    #[test]
    fn failed_change_leaves_page_alone() {
        let engine = TestEngine::memory();
        let rel = engine.create_relation(false);
        let page = engine.new_page(&rel);
        let before = page.read_page();
        let mut txn = engine.begin();

        assert!(txn.delete(&page, 3).is_err());
        assert_eq!(page.read_page(), before);
        assert!(!txn.last().is_valid());
    }

    #[test]
    fn slots_run_out() {
        let engine = TestEngine::memory();
        let rel = engine.create_relation(false);
        let page = engine.new_page(&rel);
        for _ in 0..zundo_core::page::MAX_PAGE_TRANS_INFO_SLOTS {
            let log = engine.create_log();
            engine.begin_in(log).insert(&page, b"x").unwrap();
        }
        let log = engine.create_log();
        let result = engine.begin_in(log).insert(&page, b"x");
        assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));
    }

    #[test]
    fn file_engine_uses_temp_dir() {
        let engine = TestEngine::file();
        let rel = engine.create_relation(false);
        let page = engine.new_page(&rel);
        let mut txn = engine.begin();
        txn.insert(&page, b"persisted").unwrap();
        txn.rollback().unwrap();

        let dir = engine.path().unwrap();
        assert!(dir.join("wal.log").exists());
        assert!(dir.join("undo_1.log").exists());
        assert_eq!(engine.page_images(), 1);
    }
}
