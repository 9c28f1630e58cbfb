//! Building durability records for modified pages.

use crate::error::{CoreError, CoreResult};
use crate::page::Page;
use crate::types::{BlockNumber, ForkNumber, Lsn, RelFileNode};
use crate::wal::WalRecord;

/// Anything that can make a record durable and return its position.
pub trait DurabilityLog: Send + Sync {
    /// Writes `record` and returns the position just past it.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    fn insert(&self, record: &WalRecord) -> CoreResult<Lsn>;
}

/// Assembles one full-page-image record.
///
/// ```ignore
/// let lsn = WalInsert::begin(wal)
///     .register_full_page_image(node, fork, block, &page)
///     .insert()?;
/// ```
pub struct WalInsert<'a> {
    log: &'a dyn DurabilityLog,
    record: Option<WalRecord>,
}

impl<'a> WalInsert<'a> {
    /// Starts a new record.
    #[must_use]
    pub fn begin(log: &'a dyn DurabilityLog) -> Self {
        Self { log, record: None }
    }

    /// Registers the full image of `page`.
    #[must_use]
    pub fn register_full_page_image(
        mut self,
        node: RelFileNode,
        fork: ForkNumber,
        block: BlockNumber,
        page: &Page,
    ) -> Self {
        self.record = Some(WalRecord::UndoPage {
            node,
            fork,
            block,
            image: page.to_image(),
        });
        self
    }

    /// Writes the record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DurabilityFailure`] if nothing was registered or
    /// the write fails.
    pub fn insert(self) -> CoreResult<Lsn> {
        let record = self
            .record
            .ok_or_else(|| CoreError::durability_failure("no page image registered"))?;
        self.log.insert(&record).map_err(|e| match e {
            CoreError::DurabilityFailure { .. } => e,
            other => CoreError::durability_failure(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::WalManager;
    use zundo_storage::InMemoryBackend;

    struct BrokenLog;

    impl DurabilityLog for BrokenLog {
        fn insert(&self, _record: &WalRecord) -> CoreResult<Lsn> {
            Err(CoreError::Io(std::io::Error::other("disk full")))
        }
    }

    #[test]
    fn insert_logs_page_image() {
        let wal = WalManager::new(Box::new(InMemoryBackend::new()), false);
        let page = Page::new();
        let lsn = WalInsert::begin(&wal)
            .register_full_page_image(RelFileNode::new(1, 2), ForkNumber::Main, 5, &page)
            .insert()
            .unwrap();

        assert_eq!(lsn, wal.end_lsn().unwrap());
        let records = wal.read_all().unwrap();
        assert!(matches!(
            &records[0].1,
            WalRecord::UndoPage { block: 5, image, .. } if *image == page.to_image()
        ));
    }

    #[test]
    fn write_failure_is_durability_failure() {
        let result = WalInsert::begin(&BrokenLog)
            .register_full_page_image(RelFileNode::new(1, 2), ForkNumber::Main, 0, &Page::new())
            .insert();
        assert!(matches!(result, Err(CoreError::DurabilityFailure { .. })));
    }

    #[test]
    fn empty_insert_is_rejected() {
        assert!(WalInsert::begin(&BrokenLog).insert().is_err());
    }
}
