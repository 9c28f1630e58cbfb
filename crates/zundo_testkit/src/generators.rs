//! Property-based test generators using proptest.
//!
//! Record strategies produce values the codec accepts. Workload steps drive
//! a [`Workload`] against one page; [`apply_step`] skips steps that do not
//! fit the page's current state, so any generated sequence is valid.

use crate::fixtures::Workload;
use proptest::prelude::*;
use zundo_core::page::{infomask, Tuple};
use zundo_core::undo::{PriorTuple, UndoOperation, UndoRecordPointer, UnpackedUndoRecord};
use zundo_core::{
    Buffer, CoreResult, ForkNumber, FullTransactionId, ItemPointer, OffsetNumber, RelFileNode,
    TransactionId, UndoLogNumber,
};

/// Strategy for normal transaction ids with an epoch.
pub fn full_xid_strategy() -> impl Strategy<Value = FullTransactionId> {
    (0u32..4, TransactionId::FIRST_NORMAL.as_u32()..u32::MAX)
        .prop_map(|(epoch, xid)| FullTransactionId::new(epoch, TransactionId::new(xid)))
}

/// Strategy for pointers into live undo logs.
pub fn undo_pointer_strategy() -> impl Strategy<Value = UndoRecordPointer> {
    (1u32..16, 0u64..1 << 32)
        .prop_map(|(log, offset)| UndoRecordPointer::new(UndoLogNumber::new(log), offset))
}

/// Strategy for tuple payloads.
pub fn tuple_data_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

/// Strategy for forks.
pub fn fork_strategy() -> impl Strategy<Value = ForkNumber> {
    prop_oneof![
        Just(ForkNumber::Main),
        Just(ForkNumber::FreeSpaceMap),
        Just(ForkNumber::VisibilityMap),
        Just(ForkNumber::Init),
    ]
}

fn prior_tuple_strategy() -> impl Strategy<Value = PriorTuple> {
    (any::<u32>(), 1u16..64, any::<u32>(), any::<u16>(), tuple_data_strategy()).prop_map(
        |(block, offset, table_oid, infomask, data)| {
            let mut tuple = Tuple::new(data);
            tuple.header.infomask = infomask;
            PriorTuple::new(ItemPointer::new(block, offset), table_oid, tuple.encode())
        },
    )
}

/// Strategy for undo operations of every kind.
pub fn undo_operation_strategy() -> impl Strategy<Value = UndoOperation> {
    prop_oneof![
        Just(UndoOperation::Insert),
        (1u16..32, 0u16..32).prop_map(|(first, extra)| UndoOperation::MultiInsert {
            first,
            last: first + extra,
        }),
        prior_tuple_strategy().prop_map(UndoOperation::Delete),
        prior_tuple_strategy().prop_map(UndoOperation::Update),
        prior_tuple_strategy().prop_map(UndoOperation::InplaceUpdate),
        prior_tuple_strategy().prop_map(UndoOperation::XidLockOnly),
        Just(UndoOperation::InvalidXactSlot),
    ]
}

/// Strategy for complete undo records.
pub fn undo_record_strategy() -> impl Strategy<Value = UnpackedUndoRecord> {
    (
        full_xid_strategy(),
        (any::<u32>(), any::<u32>()),
        fork_strategy(),
        (any::<u32>(), 1u16..256),
        any::<u16>(),
        prop::option::of(undo_pointer_strategy()),
        undo_operation_strategy(),
    )
        .prop_map(
            |(xid, (tablespace, relfilenode), fork, (block, offset), prevlen, blkprev, operation)| {
                UnpackedUndoRecord {
                    xid: xid.xid(),
                    epoch: xid.epoch(),
                    node: RelFileNode::new(tablespace, relfilenode),
                    fork,
                    block,
                    offset,
                    prevlen,
                    blkprev: blkprev.unwrap_or(UndoRecordPointer::INVALID),
                    operation,
                }
            },
        )
}

/// One change made by a generated workload.
///
/// Indexes pick among the tuples the workload inserted, modulo their count.
#[derive(Debug, Clone)]
pub enum WorkloadStep {
    /// Insert a tuple.
    Insert(Vec<u8>),
    /// Insert several tuples under one record.
    MultiInsert(Vec<Vec<u8>>),
    /// Delete a tuple.
    Delete(usize),
    /// Update a tuple out of place.
    Update(usize, Vec<u8>),
    /// Update a tuple in place.
    InplaceUpdate(usize, Vec<u8>),
    /// Lock a tuple.
    Lock(usize),
    /// Mark a tuple's slot as invalid.
    MarkInvalidXact(usize),
}

/// Strategy for a single workload step.
pub fn workload_step_strategy() -> impl Strategy<Value = WorkloadStep> {
    prop_oneof![
        3 => tuple_data_strategy().prop_map(WorkloadStep::Insert),
        1 => prop::collection::vec(tuple_data_strategy(), 1..4).prop_map(WorkloadStep::MultiInsert),
        1 => any::<usize>().prop_map(WorkloadStep::Delete),
        2 => (any::<usize>(), tuple_data_strategy()).prop_map(|(i, d)| WorkloadStep::Update(i, d)),
        2 => (any::<usize>(), tuple_data_strategy())
            .prop_map(|(i, d)| WorkloadStep::InplaceUpdate(i, d)),
        1 => any::<usize>().prop_map(WorkloadStep::Lock),
        1 => any::<usize>().prop_map(WorkloadStep::MarkInvalidXact),
    ]
}

/// Strategy for a sequence of workload steps.
pub fn workload_strategy(max_steps: usize) -> impl Strategy<Value = Vec<WorkloadStep>> {
    prop::collection::vec(workload_step_strategy(), 1..=max_steps)
}

/// Applies `step` to `buffer` through `workload`.
///
/// `tuples` holds the offsets of live tuples the workload can touch. Steps
/// that have no tuple to act on, and markers on a tuple that already
/// carries one, are skipped and return `Ok(false)`.
///
/// # Errors
///
/// Returns any error from the workload.
pub fn apply_step(
    workload: &mut Workload<'_>,
    buffer: &Buffer,
    step: &WorkloadStep,
    tuples: &mut Vec<OffsetNumber>,
) -> CoreResult<bool> {
    match step {
        WorkloadStep::Insert(data) => {
            let (offset, _) = workload.insert(buffer, data)?;
            tuples.push(offset);
        }
        WorkloadStep::MultiInsert(rows) => {
            let rows: Vec<&[u8]> = rows.iter().map(Vec::as_slice).collect();
            let (first, last, _) = workload.multi_insert(buffer, &rows)?;
            tuples.extend(first..=last);
        }
        WorkloadStep::Delete(index) => {
            let Some(offset) = pick(tuples, *index) else {
                return Ok(false);
            };
            workload.delete(buffer, offset)?;
            tuples.retain(|o| *o != offset);
        }
        WorkloadStep::Update(index, data) => {
            let Some(offset) = pick(tuples, *index) else {
                return Ok(false);
            };
            workload.update(buffer, offset, data)?;
        }
        WorkloadStep::InplaceUpdate(index, data) => {
            let Some(offset) = pick(tuples, *index) else {
                return Ok(false);
            };
            workload.inplace_update(buffer, offset, data)?;
        }
        WorkloadStep::Lock(index) => {
            let Some(offset) = pick(tuples, *index) else {
                return Ok(false);
            };
            workload.lock(buffer, offset)?;
        }
        WorkloadStep::MarkInvalidXact(index) => {
            let Some(offset) = pick(tuples, *index) else {
                return Ok(false);
            };
            if carries_marker(buffer, offset) {
                return Ok(false);
            }
            workload.mark_invalid_xact(buffer, offset)?;
        }
    }
    Ok(true)
}

fn carries_marker(buffer: &Buffer, offset: OffsetNumber) -> bool {
    buffer
        .read_page()
        .item(offset)
        .and_then(|item| item.tuple.as_ref())
        .is_some_and(|tuple| tuple.header.infomask & infomask::INVALID_XACT_SLOT != 0)
}

fn pick(tuples: &[OffsetNumber], index: usize) -> Option<OffsetNumber> {
    (!tuples.is_empty()).then(|| tuples[index % tuples.len()])
}
