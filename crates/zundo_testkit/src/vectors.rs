//! Undo record wire-format test vectors.
//!
//! Every vector is a complete encoded record in hex. Valid vectors pair with
//! an expected [`UnpackedUndoRecord`] from [`expected_record`]; invalid ones
//! name a fragment of the error the decoder must return. The JSON form lets
//! other tools check their readers against the same bytes.

use serde::{Deserialize, Serialize};
use zundo_core::page::{infomask, Tuple, TupleHeader, TUPLE_HEADER_SIZE};
use zundo_core::undo::{PriorTuple, UndoOperation, UndoRecordPointer, UnpackedUndoRecord};
use zundo_core::{ForkNumber, ItemPointer, RelFileNode, TransactionId, UndoLogNumber};

/// A test vector that can be shared with other readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoRecordVector {
    /// Unique identifier for this vector.
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// Encoded record (hex).
    pub record_hex: String,
    /// Fragment of the expected error, if decoding must fail.
    pub expected_error: Option<String>,
}

impl UndoRecordVector {
    fn valid(id: &str, description: &str, record_hex: &str) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            record_hex: record_hex.into(),
            expected_error: None,
        }
    }

    fn invalid(id: &str, description: &str, record_hex: &str, error: &str) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            record_hex: record_hex.into(),
            expected_error: Some(error.into()),
        }
    }
}

/// Undo record vectors, one per record kind plus malformed records.
pub fn undo_record_vectors() -> Vec<UndoRecordVector> {
    vec![
        UndoRecordVector::valid(
            "undo_insert",
            "Insert at (7,3), first record of its log",
            "01000000006400000000000000000000000000070000000300004000007f06000000",
        ),
        UndoRecordVector::valid(
            "undo_multi_insert",
            "Multi-insert of offsets 1..=4 in epoch 1, chained to an earlier record",
            "02010000006500000022004000000000010000000000000100004000007f0600000001000400",
        ),
        UndoRecordVector::valid(
            "undo_delete",
            "Delete of (2,5) carrying the prior tuple 'abc'",
            "03000000006600000026000000000000000000020000000500004000007f060000001600000008000000020000000500004000000000000005616263",
        ),
        UndoRecordVector::valid(
            "undo_inplace_update",
            "In-place update of (2,5) carrying the prior tuple 'xy'",
            "04000000006700000038002200000000010000020000000500004000007f0600000015000000070000000200000005000040000000000200057879",
        ),
        UndoRecordVector::valid(
            "undo_update",
            "Out-of-place update of (9,1) carrying the prior tuple 'abc'",
            "05000000006800000000000000000000000000090000000100004000007f060000001600000008000000090000000100004000000000000005616263",
        ),
        UndoRecordVector::valid(
            "undo_lock",
            "Lock of (3,2) in epoch 2 carrying a header-only prior tuple",
            "06020000006900000000000000000000000000030000000200004000007f060000001300000005000000030000000200004000000300000005",
        ),
        UndoRecordVector::valid(
            "undo_invalid_xact_slot",
            "Invalid-slot marker on the free space map fork",
            "07000000006a00000030000001000000020000040000000600004000007f06000001",
        ),
        UndoRecordVector::invalid(
            "undo_unknown_tag",
            "Record type 9 does not exist",
            "09000000006400000000000000000000000000070000000300004000007f06000000",
            "unsupported undo record type 9",
        ),
        UndoRecordVector::invalid(
            "undo_unknown_fork",
            "Fork 9 does not exist",
            "01000000006400000000000000000000000000070000000300004000007f06000009",
            "unknown fork 9",
        ),
        UndoRecordVector::invalid(
            "undo_truncated_image",
            "Delete record missing the last two image bytes",
            "03000000006600000026000000000000000000020000000500004000007f06000000160000000800000002000000050000400000000000000561",
            "unexpected end of record",
        ),
        UndoRecordVector::invalid(
            "undo_tuple_length_mismatch",
            "Delete record whose buffer length disagrees with its tuple length",
            "03000000006600000026000000000000000000020000000500004000007f060000001700000008000000020000000500004000000000000005616263",
            "prior tuple buffer of 23 bytes",
        ),
    ]
}

/// Returns the record a valid vector decodes to.
pub fn expected_record(id: &str) -> Option<UnpackedUndoRecord> {
    let node = RelFileNode::new(1663, 16384);
    let record = |xid: u32, epoch: u32, block: u32, offset: u16, operation: UndoOperation| {
        UnpackedUndoRecord {
            xid: TransactionId::new(xid),
            epoch,
            node,
            fork: ForkNumber::Main,
            block,
            offset,
            prevlen: 0,
            blkprev: UndoRecordPointer::INVALID,
            operation,
        }
    };
    let prior = |block: u32, offset: u16, header: TupleHeader, data: &[u8]| {
        let tuple = Tuple {
            header,
            data: data.to_vec(),
        };
        PriorTuple::new(ItemPointer::new(block, offset), node.relfilenode, tuple.encode())
    };
    let header = |infomask2: u16, infomask: u16| TupleHeader {
        infomask2,
        infomask,
        hoff: TUPLE_HEADER_SIZE as u8,
    };
    let ptr = |log: u32, offset: u64| UndoRecordPointer::new(UndoLogNumber::new(log), offset);

    let expected = match id {
        "undo_insert" => record(100, 0, 7, 3, UndoOperation::Insert),
        "undo_multi_insert" => UnpackedUndoRecord {
            prevlen: 34,
            blkprev: ptr(1, 0x40),
            ..record(101, 1, 0, 1, UndoOperation::MultiInsert { first: 1, last: 4 })
        },
        "undo_delete" => UnpackedUndoRecord {
            prevlen: 38,
            ..record(102, 0, 2, 5, UndoOperation::Delete(prior(2, 5, header(0, 0), b"abc")))
        },
        "undo_inplace_update" => UnpackedUndoRecord {
            prevlen: 56,
            blkprev: ptr(1, 0x22),
            ..record(
                103,
                0,
                2,
                5,
                UndoOperation::InplaceUpdate(prior(
                    2,
                    5,
                    header(0, infomask::INPLACE_UPDATED),
                    b"xy",
                )),
            )
        },
        "undo_update" => record(104, 0, 9, 1, UndoOperation::Update(prior(9, 1, header(0, 0), b"abc"))),
        "undo_lock" => record(105, 2, 3, 2, UndoOperation::XidLockOnly(prior(3, 2, header(3, 0), b""))),
        "undo_invalid_xact_slot" => UnpackedUndoRecord {
            fork: ForkNumber::FreeSpaceMap,
            prevlen: 48,
            blkprev: ptr(2, 0x100),
            ..record(106, 0, 4, 6, UndoOperation::InvalidXactSlot)
        },
        _ => return None,
    };
    Some(expected)
}

/// Container for all test vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllTestVectors {
    /// Undo record vectors.
    pub undo_records: Vec<UndoRecordVector>,
}

/// Exports all test vectors as JSON.
pub fn all_vectors_json() -> String {
    let vectors = AllTestVectors {
        undo_records: undo_record_vectors(),
    };

    serde_json::to_string_pretty(&vectors).expect("Failed to serialize vectors")
}

/// Encodes bytes as lowercase hex.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Decodes a hex string, ignoring whitespace.
///
/// # Panics
///
/// Panics on malformed hex.
pub fn hex_decode(hex: &str) -> Vec<u8> {
    let digits: Vec<u8> = hex.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    digits
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).expect("Invalid hex");
            u8::from_str_radix(pair, 16).expect("Invalid hex")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_vectors_decode_and_encode() {
        for vector in undo_record_vectors()
            .into_iter()
            .filter(|v| v.expected_error.is_none())
        {
            let bytes = hex_decode(&vector.record_hex);
            let expected = expected_record(&vector.id)
                .unwrap_or_else(|| panic!("no expected record for {}", vector.id));

            let decoded = UnpackedUndoRecord::decode(&bytes)
                .unwrap_or_else(|e| panic!("{} failed to decode: {e}", vector.id));
            assert_eq!(decoded, expected, "Vector {} failed: {}", vector.id, vector.description);
            assert_eq!(hex_encode(&expected.encode().unwrap()), vector.record_hex);
            assert_eq!(UnpackedUndoRecord::record_len(&bytes).unwrap(), bytes.len());
        }
    }

    #[test]
    fn invalid_vectors_are_rejected() {
        for vector in undo_record_vectors() {
            let Some(fragment) = &vector.expected_error else {
                continue;
            };
            let err = UnpackedUndoRecord::decode(&hex_decode(&vector.record_hex))
                .expect_err(&vector.id);
            assert!(
                err.to_string().contains(fragment.as_str()),
                "Vector {}: {err} does not mention {fragment}",
                vector.id
            );
        }
    }

    #[test]
    fn all_vectors_json_round_trips() {
        let json = all_vectors_json();
        let parsed: AllTestVectors = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.undo_records.len(), undo_record_vectors().len());
        assert!(json.contains("undo_multi_insert"));
    }
}
