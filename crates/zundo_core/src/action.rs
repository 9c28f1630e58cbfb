//! Undo replay.
//!
//! [`UndoActionExecutor::apply_range`] walks a transaction's undo chain
//! from its newest record back to an older one and reverses each record on
//! the page it targets. Consecutive records for the same page are applied
//! as one [`PageBatch`] under one page lock, producing one full-page image.
//!
//! Replay is idempotent. Each page's transaction slot tells how far that
//! page has already been rolled back; a batch whose rewind point the slot
//! has already reached is skipped. This lets an explicit abort and the
//! background discard scanner race over the same chain, and lets replay
//! restart after a crash.

use crate::buffer::{BufferManager, PageCriticalSection, Relation};
use crate::error::{CoreError, CoreResult};
use crate::page::{infomask, ItemId, ItemState, Page, Tuple};
use crate::stats::UndoStats;
use crate::types::{Lsn, OffsetNumber, TransactionId};
use crate::undo::{
    BlockTarget, UndoOperation, UndoRecordPointer, UndoRecordStore, UnpackedUndoRecord,
};
use crate::wal::DurabilityLog;
use std::sync::Arc;

/// Undo records of one transaction for one page, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBatch {
    /// Page the records apply to.
    pub target: BlockTarget,
    /// Transaction that wrote the records.
    pub xid: TransactionId,
    /// Records in replay order.
    pub records: Vec<UnpackedUndoRecord>,
    /// Where the page's slot points once the batch is applied: the
    /// `blkprev` of the oldest record in the batch.
    pub rewind: UndoRecordPointer,
    /// Whether the batch unwinds the transaction's last undo on the page.
    pub chain_complete: bool,
}

impl PageBatch {
    /// Starts a batch with `record`.
    #[must_use]
    pub fn new(record: UnpackedUndoRecord) -> Self {
        Self {
            target: record.target(),
            xid: record.xid,
            rewind: record.blkprev,
            records: vec![record],
            chain_complete: false,
        }
    }

    /// Returns `true` if `record` belongs in this batch.
    #[must_use]
    pub fn accepts(&self, record: &UnpackedUndoRecord) -> bool {
        self.target == record.target() && self.xid == record.xid
    }

    /// Adds an older record to the batch.
    pub fn push(&mut self, record: UnpackedUndoRecord) {
        self.rewind = record.blkprev;
        self.records.push(record);
    }
}

/// What happened to a page batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageApplyOutcome {
    /// The page was changed. `lsn` is the position of its image, `None`
    /// for relations that are not logged.
    Applied {
        /// Position of the page image.
        lsn: Option<Lsn>,
    },
    /// The slot showed the batch was applied before.
    AlreadyApplied,
    /// The relation no longer exists.
    UnknownRelation,
}

/// Replays undo records onto pages.
pub struct UndoActionExecutor {
    store: Arc<dyn UndoRecordStore>,
    buffers: Arc<dyn BufferManager>,
    wal: Option<Arc<dyn DurabilityLog>>,
    stats: Arc<UndoStats>,
}

impl UndoActionExecutor {
    /// Creates an executor. Page images of logged relations go to `wal`.
    pub fn new(
        store: Arc<dyn UndoRecordStore>,
        buffers: Arc<dyn BufferManager>,
        wal: Option<Arc<dyn DurabilityLog>>,
    ) -> Self {
        Self {
            store,
            buffers,
            wal,
            stats: Arc::new(UndoStats::new()),
        }
    }

    /// Shares `stats` with other components.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<UndoStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Returns the undo record store.
    pub fn store(&self) -> &Arc<dyn UndoRecordStore> {
        &self.store
    }

    /// Returns the statistics.
    pub fn stats(&self) -> &Arc<UndoStats> {
        &self.stats
    }

    /// Rolls back the undo records from `from` back to `to`, both included.
    ///
    /// An invalid `to` means the start of the last transaction in `from`'s
    /// log. With `full` unset the log's insert point is then moved back to
    /// `to`, dropping the rolled back records.
    ///
    /// If a record in the range has already been discarded the transaction
    /// is known to be resolved and the call returns without further work.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be decoded, a page cannot be
    /// read or changed, or a page image cannot be logged.
    pub fn apply_range(
        &self,
        from: UndoRecordPointer,
        to: UndoRecordPointer,
        full: bool,
    ) -> CoreResult<()> {
        if !from.is_valid() {
            return Ok(());
        }
        let to = if to.is_valid() {
            to
        } else {
            self.store.last_transaction_start(from.log())?
        };
        if to.log() != from.log() {
            return Err(CoreError::invalid_argument(format!(
                "undo range {from}..{to} spans two logs"
            )));
        }
        tracing::debug!(%from, %to, full, "applying undo range");

        let mut cursor = Some(from);
        let mut batch: Option<PageBatch> = None;
        while let Some(ptr) = cursor.filter(|ptr| *ptr >= to) {
            let Some(record) = self.store.fetch(ptr)? else {
                tracing::debug!(%ptr, "undo already discarded, nothing to roll back");
                return Ok(());
            };
            cursor = ptr.step_back(record.prevlen);

            match batch.as_mut() {
                Some(current) if current.accepts(&record) => current.push(record),
                _ => {
                    if let Some(done) = batch.replace(PageBatch::new(record)) {
                        self.flush(done, to, full)?;
                    }
                }
            }
        }
        if let Some(done) = batch {
            self.flush(done, to, full)?;
        }

        if !full {
            let Some(first) = self.store.fetch(to)? else {
                return Ok(());
            };
            self.store.rewind_insert(to, first.prevlen)?;
        }
        self.stats.record_rollback(full);
        Ok(())
    }

    fn flush(&self, mut batch: PageBatch, to: UndoRecordPointer, full: bool) -> CoreResult<()> {
        batch.chain_complete = full && (!batch.rewind.is_valid() || batch.rewind < to);
        self.apply_page(&batch, full)?;
        Ok(())
    }

    /// Applies one batch to its page.
    ///
    /// The page's slot for the batch's transaction is freed when
    /// `batch.chain_complete` is set and rewound to `batch.rewind`
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the page cannot be read, a record does not fit
    /// the page, or the page image cannot be logged.
    pub fn apply_page(&self, batch: &PageBatch, full: bool) -> CoreResult<PageApplyOutcome> {
        let target = batch.target;
        let Some(relation_id) = self.buffers.relation_for_node(target.node) else {
            tracing::warn!(
                node = %target.node,
                block = target.block,
                xid = %batch.xid,
                "ignoring undo for a relation that no longer exists"
            );
            self.stats.record_page_skipped();
            return Ok(PageApplyOutcome::UnknownRelation);
        };
        let relation = self.buffers.open_relation(relation_id)?;
        let buffer = self
            .buffers
            .read_buffer(&relation, target.fork, target.block)?;

        let section = PageCriticalSection::enter(&buffer);
        let slot_index = section.page().slots.find(batch.xid);
        let slot = slot_index.and_then(|index| section.page().slots.get(index).copied());
        let (Some(index), Some(slot)) = (slot_index, slot) else {
            tracing::debug!(
                block = target.block,
                xid = %batch.xid,
                "no slot, undo already applied"
            );
            self.stats.record_page_skipped();
            return Ok(PageApplyOutcome::AlreadyApplied);
        };
        if slot.undo <= batch.rewind {
            tracing::debug!(
                block = target.block,
                xid = %batch.xid,
                slot = %slot.undo,
                rewind = %batch.rewind,
                "undo already applied"
            );
            self.stats.record_page_skipped();
            return Ok(PageApplyOutcome::AlreadyApplied);
        }

        let mut page = section.stage();
        for record in &batch.records {
            replay(&mut page, &relation, record, full)?;
        }
        if batch.chain_complete {
            page.slots.clear(index);
        } else {
            page.slots.rewind(index, batch.rewind)?;
        }

        let wal = if relation.needs_wal() {
            self.wal.as_deref()
        } else {
            None
        };
        let lsn = section.commit(page, wal)?;
        self.stats
            .record_page_applied(batch.records.len(), lsn.is_some());
        tracing::trace!(
            block = target.block,
            xid = %batch.xid,
            records = batch.records.len(),
            cleared = batch.chain_complete,
            "undo applied to page"
        );
        Ok(PageApplyOutcome::Applied { lsn })
    }
}

impl std::fmt::Debug for UndoActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoActionExecutor")
            .field("wal", &self.wal.is_some())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

fn replay(
    page: &mut Page,
    relation: &Relation,
    record: &UnpackedUndoRecord,
    full: bool,
) -> CoreResult<()> {
    let block = record.block;
    match &record.operation {
        UndoOperation::Insert => {
            undo_insert(page, relation, block, record.offset)?;
            page.set_prunable(record.xid);
        }
        UndoOperation::MultiInsert { first, last } => {
            for offset in *first..=*last {
                undo_insert(page, relation, block, offset)?;
            }
            page.set_prunable(record.xid);
        }
        UndoOperation::Delete(prior)
        | UndoOperation::Update(prior)
        | UndoOperation::InplaceUpdate(prior) => {
            let tuple = Tuple::decode(&prior.image)?;
            *item_at(page, block, record.offset)? = ItemId::normal(tuple);
        }
        UndoOperation::XidLockOnly(prior) => {
            let header = Tuple::decode_header(&prior.image)?;
            let offset = record.offset;
            let tuple = item_at(page, block, offset)?
                .tuple
                .as_mut()
                .ok_or_else(|| {
                    CoreError::invalid_item(block, offset, "lock undo on an item without storage")
                })?;
            tuple.header = header;
        }
        UndoOperation::InvalidXactSlot => {
            if !full {
                let offset = record.offset;
                let item = item_at(page, block, offset)?;
                if item.state == ItemState::Deleted {
                    item.invalid_xact = false;
                } else {
                    let tuple = item.tuple.as_mut().ok_or_else(|| {
                        CoreError::invalid_item(block, offset, "marker on an item without storage")
                    })?;
                    tuple.header.infomask &= !infomask::INVALID_XACT_SLOT;
                }
            }
        }
    }
    Ok(())
}

fn undo_insert(
    page: &mut Page,
    relation: &Relation,
    block: u32,
    offset: OffsetNumber,
) -> CoreResult<()> {
    let item = item_at(page, block, offset)?;
    if relation.has_index {
        item.set_dead();
    } else {
        item.set_unused();
        page.has_free_line_pointers = true;
    }
    Ok(())
}

fn item_at(page: &mut Page, block: u32, offset: OffsetNumber) -> CoreResult<&mut ItemId> {
    page.item_mut(offset)
        .ok_or_else(|| CoreError::invalid_item(block, offset, "no such line pointer"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, BufferPool, Persistence};
    use crate::config::Config;
    use crate::types::{ForkNumber, ItemPointer, RelFileNode, RelationId, UndoLogNumber};
    use crate::undo::{PriorTuple, UndoLogStore};
    use crate::wal::WalManager;
    use zundo_storage::InMemoryBackend;

    struct Harness {
        store: Arc<UndoLogStore>,
        pool: Arc<BufferPool>,
        wal: Arc<WalManager>,
        executor: UndoActionExecutor,
        relation: Arc<Relation>,
        log: UndoLogNumber,
    }

    impl Harness {
        fn new(has_index: bool) -> Self {
            let wal = Arc::new(WalManager::new(Box::new(InMemoryBackend::new()), false));
            let store = Arc::new(UndoLogStore::new(&Config::default()));
            let log = store.create_log().unwrap();
            let pool = Arc::new(BufferPool::new());
            let relation = pool
                .create_relation(Relation {
                    id: RelationId::new(16384),
                    node: RelFileNode::new(1663, 16384),
                    has_index,
                    persistence: Persistence::Permanent,
                })
                .unwrap();
            let executor = UndoActionExecutor::new(
                Arc::clone(&store) as Arc<dyn UndoRecordStore>,
                Arc::clone(&pool) as Arc<dyn BufferManager>,
                Some(Arc::clone(&wal) as Arc<dyn DurabilityLog>),
            );
            Self {
                store,
                pool,
                wal,
                executor,
                relation,
                log,
            }
        }

        fn page(&self) -> Arc<Buffer> {
            self.pool.extend(&self.relation, ForkNumber::Main)
        }

        /// Changes the page with `change` and logs `operation` as its undo.
        fn write(
            &self,
            buffer: &Buffer,
            xid: u32,
            offset: OffsetNumber,
            operation: UndoOperation,
        ) -> UndoRecordPointer {
            let xid = TransactionId::new(xid);
            buffer.modify(|page| {
                let index = page.slots.reserve(xid).unwrap();
                let blkprev = page.slots.get(index).unwrap().undo;
                let mut record = UnpackedUndoRecord {
                    xid,
                    epoch: 0,
                    node: self.relation.node,
                    fork: ForkNumber::Main,
                    block: buffer.tag().block,
                    offset,
                    prevlen: 0,
                    blkprev,
                    operation,
                };
                let ptr = self.store.insert(self.log, &mut record).unwrap();
                page.slots.set_pointer(index, ptr).unwrap();
                ptr
            })
        }

        fn insert(&self, buffer: &Buffer, xid: u32, data: &[u8]) -> (OffsetNumber, UndoRecordPointer) {
            let offset = buffer.modify(|page| page.add_item(Tuple::new(data.to_vec())));
            (offset, self.write(buffer, xid, offset, UndoOperation::Insert))
        }

        fn update(&self, buffer: &Buffer, xid: u32, offset: OffsetNumber, data: &[u8]) -> UndoRecordPointer {
            let prior = buffer.modify(|page| {
                let item = page.item_mut(offset).unwrap();
                let tuple = item.tuple.as_mut().unwrap();
                let image = tuple.encode();
                tuple.data = data.to_vec();
                tuple.header.infomask |= infomask::INPLACE_UPDATED;
                image
            });
            let block = buffer.tag().block;
            self.write(
                buffer,
                xid,
                offset,
                UndoOperation::InplaceUpdate(PriorTuple::new(ItemPointer::new(block, offset), 16384, prior)),
            )
        }
    }

    fn data_at(buffer: &Buffer, offset: OffsetNumber) -> Option<Vec<u8>> {
        buffer
            .read_page()
            .item(offset)
            .and_then(|item| item.tuple.as_ref())
            .map(|tuple| tuple.data.clone())
    }

    #[test]
    fn full_rollback_of_inserts_frees_line_pointers() {
        let h = Harness::new(false);
        let buffer = h.page();
        let (o1, first) = h.insert(&buffer, 10, b"a");
        let (o2, last) = h.insert(&buffer, 10, b"b");

        h.executor.apply_range(last, first, true).unwrap();

        let page = buffer.read_page();
        assert_eq!(page.item(o1).unwrap().state, ItemState::Unused);
        assert_eq!(page.item(o2).unwrap().state, ItemState::Unused);
        assert!(page.has_free_line_pointers);
        assert_eq!(page.prune_xid, TransactionId::new(10));
        assert!(!page.slots.references(TransactionId::new(10)));
        assert_eq!(h.wal.read_all().unwrap().len(), 1);
    }

    #[test]
    fn insert_rollback_with_index_leaves_dead_items() {
        let h = Harness::new(true);
        let buffer = h.page();
        let (offset, ptr) = h.insert(&buffer, 10, b"a");

        h.executor
            .apply_range(ptr, UndoRecordPointer::INVALID, true)
            .unwrap();

        let page = buffer.read_page();
        assert_eq!(page.item(offset).unwrap().state, ItemState::Dead);
        assert!(!page.has_free_line_pointers);
    }

    #[test]
    fn update_rollback_restores_prior_image() {
        let h = Harness::new(false);
        let buffer = h.page();
        let offset = buffer.modify(|page| page.add_item(Tuple::new(b"v1".to_vec())));
        let first = h.update(&buffer, 20, offset, b"v2");
        let last = h.update(&buffer, 20, offset, b"v3");
        assert_eq!(data_at(&buffer, offset).unwrap(), b"v3");

        h.executor.apply_range(last, first, true).unwrap();

        let page = buffer.read_page();
        let tuple = page.item(offset).unwrap().tuple.as_ref().unwrap();
        assert_eq!(tuple.data, b"v1");
        assert_eq!(tuple.header.infomask & infomask::INPLACE_UPDATED, 0);
    }

    #[test]
    fn lock_rollback_restores_header_only() {
        let h = Harness::new(false);
        let buffer = h.page();
        let offset = buffer.modify(|page| page.add_item(Tuple::new(b"row".to_vec())));
        let prior = buffer.modify(|page| {
            let tuple = page.item_mut(offset).unwrap().tuple.as_mut().unwrap();
            let image = tuple.encode();
            tuple.header.infomask |= infomask::XID_LOCK_ONLY;
            image
        });
        let ptr = h.write(
            &buffer,
            30,
            offset,
            UndoOperation::XidLockOnly(PriorTuple::new(ItemPointer::new(0, offset), 16384, prior)),
        );
        // Data changed under the lock is not part of the undo.
        buffer.modify(|page| {
            page.item_mut(offset).unwrap().tuple.as_mut().unwrap().data = b"ROW".to_vec();
        });

        h.executor.apply_range(ptr, ptr, true).unwrap();

        let page = buffer.read_page();
        let tuple = page.item(offset).unwrap().tuple.as_ref().unwrap();
        assert_eq!(tuple.header, Tuple::new(Vec::new()).header);
        assert_eq!(tuple.data, b"ROW");
    }

    #[test]
    fn slot_marker_cleared_only_on_partial_rollback() {
        let h = Harness::new(false);
        let buffer = h.page();
        let (offset, _) = h.insert(&buffer, 40, b"row");
        buffer.modify(|page| {
            let tuple = page.item_mut(offset).unwrap().tuple.as_mut().unwrap();
            tuple.header.infomask |= infomask::INVALID_XACT_SLOT;
        });
        let marker = h.write(&buffer, 40, offset, UndoOperation::InvalidXactSlot);

        h.executor.apply_range(marker, marker, false).unwrap();

        let page = buffer.read_page();
        let tuple = page.item(offset).unwrap().tuple.as_ref().unwrap();
        assert_eq!(tuple.header.infomask & infomask::INVALID_XACT_SLOT, 0);
        assert_eq!(h.store.insert_pointer(h.log).unwrap(), marker);
    }

    #[test]
    fn slot_marker_on_deleted_line_pointer() {
        let h = Harness::new(false);
        let buffer = h.page();
        let (offset, _) = h.insert(&buffer, 41, b"row");
        buffer.modify(|page| {
            let item = page.item_mut(offset).unwrap();
            item.state = ItemState::Deleted;
            item.invalid_xact = true;
        });
        let marker = h.write(&buffer, 41, offset, UndoOperation::InvalidXactSlot);

        let batch = PageBatch::new(h.store.fetch(marker).unwrap().unwrap());
        h.executor.apply_page(&batch, false).unwrap();

        assert!(!buffer.read_page().item(offset).unwrap().invalid_xact);
    }

    #[test]
    fn second_application_is_a_no_op() {
        let h = Harness::new(false);
        let buffer = h.page();
        let (_, first) = h.insert(&buffer, 50, b"a");
        let (_, last) = h.insert(&buffer, 50, b"b");

        h.executor.apply_range(last, first, true).unwrap();
        let once = buffer.read_page();
        h.executor.apply_range(last, first, true).unwrap();

        assert_eq!(buffer.read_page(), once);
        assert_eq!(h.wal.read_all().unwrap().len(), 1);
        assert_eq!(h.executor.stats().pages_skipped(), 1);
    }

    #[test]
    fn batches_split_by_page() {
        let h = Harness::new(false);
        let a = h.page();
        let b = h.page();
        let (_, first) = h.insert(&a, 60, b"a1");
        h.insert(&b, 60, b"b1");
        let (_, last) = h.insert(&a, 60, b"a2");

        h.executor.apply_range(last, first, true).unwrap();

        for buffer in [&a, &b] {
            let page = buffer.read_page();
            assert!(!page.slots.references(TransactionId::new(60)));
            assert!(page.items().all(|(_, item)| item.state == ItemState::Unused));
        }
        // a2, then b1, then a1 again.
        assert_eq!(h.executor.stats().pages_applied(), 3);
        assert_eq!(h.wal.read_all().unwrap().len(), 3);
    }

    #[test]
    fn partial_rollback_rewinds_log_and_slot() {
        let h = Harness::new(false);
        let buffer = h.page();
        let ptrs: Vec<_> = (0..4).map(|i| h.insert(&buffer, 70, &[i]).1).collect();

        h.executor.apply_range(ptrs[3], ptrs[2], false).unwrap();

        let page = buffer.read_page();
        let slot = page.slots.lookup(TransactionId::new(70)).unwrap();
        assert_eq!(slot.undo, ptrs[1]);
        assert_eq!(page.item(1).unwrap().state, ItemState::Normal);
        assert_eq!(page.item(3).unwrap().state, ItemState::Unused);
        assert_eq!(h.store.insert_pointer(h.log).unwrap(), ptrs[2]);
        let len = h.store.fetch(ptrs[1]).unwrap().unwrap().encoded_len();
        assert_eq!(h.store.last_chain_length(h.log).unwrap() as usize, len);
        assert_eq!(h.executor.stats().partial_rollbacks(), 1);
    }

    #[test]
    fn discarded_record_ends_rollback_silently() {
        let h = Harness::new(false);
        let buffer = h.page();
        let (offset, ptr) = h.insert(&buffer, 80, b"a");
        let end = h.store.insert_pointer(h.log).unwrap();
        h.store.discard(end, TransactionId::new(80)).unwrap();

        h.executor.apply_range(ptr, ptr, true).unwrap();

        assert_eq!(buffer.read_page().item(offset).unwrap().state, ItemState::Normal);
        assert_eq!(h.executor.stats().pages_applied(), 0);
    }

    #[test]
    fn unknown_relation_is_skipped() {
        let h = Harness::new(false);
        let buffer = h.page();
        let (_, ptr) = h.insert(&buffer, 90, b"a");
        h.pool.drop_relation(h.relation.id);

        h.executor.apply_range(ptr, ptr, true).unwrap();
        assert_eq!(h.executor.stats().pages_skipped(), 1);
        assert!(h.wal.read_all().unwrap().is_empty());
    }

    #[test]
    fn missing_line_pointer_is_an_error() {
        let h = Harness::new(false);
        let buffer = h.page();
        let ptr = h.write(&buffer, 95, 7, UndoOperation::Insert);

        let result = h.executor.apply_range(ptr, ptr, true);
        assert!(matches!(result, Err(CoreError::InvalidItem { offset: 7, .. })));
        assert!(buffer.read_page().slots.references(TransactionId::new(95)));
    }

    #[test]
    fn unlogged_relation_writes_no_image() {
        let h = Harness::new(false);
        let relation = h
            .pool
            .create_relation(Relation {
                id: RelationId::new(20000),
                node: RelFileNode::new(1663, 20000),
                has_index: false,
                persistence: Persistence::Unlogged,
            })
            .unwrap();
        let buffer = h.pool.extend(&relation, ForkNumber::Main);
        let offset = buffer.modify(|page| page.add_item(Tuple::new(b"x".to_vec())));
        let ptr = buffer.modify(|page| {
            let xid = TransactionId::new(99);
            let index = page.slots.reserve(xid).unwrap();
            let mut record = UnpackedUndoRecord {
                xid,
                epoch: 0,
                node: relation.node,
                fork: ForkNumber::Main,
                block: 0,
                offset,
                prevlen: 0,
                blkprev: UndoRecordPointer::INVALID,
                operation: UndoOperation::Insert,
            };
            let ptr = h.store.insert(h.log, &mut record).unwrap();
            page.slots.set_pointer(index, ptr).unwrap();
            ptr
        });

        h.executor.apply_range(ptr, ptr, true).unwrap();
        assert_eq!(buffer.read_page().item(offset).unwrap().state, ItemState::Unused);
        assert!(h.wal.read_all().unwrap().is_empty());
        assert_eq!(h.executor.stats().page_images_logged(), 0);
    }
}
