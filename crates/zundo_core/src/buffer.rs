//! Relations, page buffers and the page critical section.
//!
//! Undo replay changes a page only inside a [`PageCriticalSection`]:
//!
//! 1. [`enter`](PageCriticalSection::enter) takes the buffer's exclusive lock
//! 2. the caller edits a staged copy of the page
//! 3. [`commit`](PageCriticalSection::commit) logs the staged image,
//!    stamps it with the log position, installs it and marks the buffer dirty
//! 4. dropping the section releases the lock
//!
//! If logging fails the staged copy is thrown away, so a buffer is never
//! dirtied without its image in the log.

use crate::error::{CoreError, CoreResult};
use crate::page::Page;
use crate::types::{BlockNumber, ForkNumber, Lsn, RelFileNode, RelationId};
use crate::wal::{DurabilityLog, WalInsert};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How long a relation's contents survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// Logged and crash-safe.
    Permanent,
    /// Not logged; emptied after a crash.
    Unlogged,
    /// Private to one session; never logged.
    Temporary,
}

/// Catalog view of a relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    /// Catalog id.
    pub id: RelationId,
    /// Physical identity.
    pub node: RelFileNode,
    /// Whether the relation has at least one index.
    pub has_index: bool,
    /// Persistence of the relation.
    pub persistence: Persistence,
}

impl Relation {
    /// Returns `true` if changes to this relation must be logged.
    #[must_use]
    pub fn needs_wal(&self) -> bool {
        self.persistence == Persistence::Permanent
    }
}

/// Identity of a buffered page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferTag {
    /// Relation file identity.
    pub node: RelFileNode,
    /// Fork.
    pub fork: ForkNumber,
    /// Block.
    pub block: BlockNumber,
}

/// A page held in memory.
#[derive(Debug)]
pub struct Buffer {
    tag: BufferTag,
    page: RwLock<Page>,
    dirty: AtomicBool,
    in_critical_section: AtomicBool,
}

impl Buffer {
    fn new(tag: BufferTag, page: Page) -> Self {
        Self {
            tag,
            page: RwLock::new(page),
            dirty: AtomicBool::new(false),
            in_critical_section: AtomicBool::new(false),
        }
    }

    /// Returns the page identity.
    #[must_use]
    pub fn tag(&self) -> BufferTag {
        self.tag
    }

    /// Returns a copy of the page under a shared lock.
    #[must_use]
    pub fn read_page(&self) -> Page {
        self.page.read().clone()
    }

    /// Runs `f` on the page under the exclusive lock.
    ///
    /// This is the path for ordinary page modifications; undo replay uses
    /// [`PageCriticalSection`] instead.
    pub fn modify<R>(&self, f: impl FnOnce(&mut Page) -> R) -> R {
        let mut page = self.page.write();
        let result = f(&mut page);
        self.mark_dirty();
        result
    }

    /// Returns `true` if the page changed since it was last cleaned.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Marks the page as changed.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Returns `true` while a critical section holds this buffer.
    #[must_use]
    pub fn is_in_critical_section(&self) -> bool {
        self.in_critical_section.load(Ordering::Acquire)
    }
}

/// Exclusive, all-or-nothing modification of one page.
pub struct PageCriticalSection<'a> {
    buffer: &'a Buffer,
    page: RwLockWriteGuard<'a, Page>,
}

impl<'a> PageCriticalSection<'a> {
    /// Takes the exclusive lock on `buffer`.
    ///
    /// Blocks until every other reader and writer of the page is gone.
    pub fn enter(buffer: &'a Buffer) -> Self {
        let page = buffer.page.write();
        let was_held = buffer.in_critical_section.swap(true, Ordering::AcqRel);
        debug_assert!(!was_held, "two critical sections on {:?}", buffer.tag);
        Self { buffer, page }
    }

    /// Returns the page as it is now.
    #[must_use]
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Returns a copy of the page to edit.
    #[must_use]
    pub fn stage(&self) -> Page {
        self.page.clone()
    }

    /// Logs `staged` when `wal` is given, then installs it.
    ///
    /// Returns the log position stamped on the page, or `None` when the
    /// change was not logged.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DurabilityFailure`] if the image cannot be
    /// logged. The installed page is left unchanged in that case.
    pub fn commit(
        mut self,
        mut staged: Page,
        wal: Option<&dyn DurabilityLog>,
    ) -> CoreResult<Option<Lsn>> {
        let tag = self.buffer.tag;
        let lsn = match wal {
            Some(wal) => {
                let lsn = WalInsert::begin(wal)
                    .register_full_page_image(tag.node, tag.fork, tag.block, &staged)
                    .insert()?;
                staged.lsn = lsn;
                Some(lsn)
            }
            None => None,
        };

        *self.page = staged;
        self.buffer.mark_dirty();
        Ok(lsn)
    }
}

impl Drop for PageCriticalSection<'_> {
    fn drop(&mut self) {
        self.buffer
            .in_critical_section
            .store(false, Ordering::Release);
    }
}

/// Relation lookup and page access used by undo replay.
pub trait BufferManager: Send + Sync {
    /// Maps a physical relation identity to its catalog id.
    fn relation_for_node(&self, node: RelFileNode) -> Option<RelationId>;

    /// Opens a relation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RelationNotFound`] if the relation does not exist.
    fn open_relation(&self, id: RelationId) -> CoreResult<Arc<Relation>>;

    /// Reads a page of `relation`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::BlockNotFound`] if the block does not exist.
    fn read_buffer(
        &self,
        relation: &Relation,
        fork: ForkNumber,
        block: BlockNumber,
    ) -> CoreResult<Arc<Buffer>>;
}

#[derive(Debug, Default)]
struct PoolState {
    relations: HashMap<RelationId, Arc<Relation>>,
    by_node: HashMap<RelFileNode, RelationId>,
    buffers: HashMap<BufferTag, Arc<Buffer>>,
    nblocks: HashMap<(RelFileNode, ForkNumber), BlockNumber>,
}

/// An in-memory buffer manager.
#[derive(Debug, Default)]
pub struct BufferPool {
    state: RwLock<PoolState>,
}

impl BufferPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a relation.
    ///
    /// # Errors
    ///
    /// Returns an error if the id or file node is already in use.
    pub fn create_relation(&self, relation: Relation) -> CoreResult<Arc<Relation>> {
        let mut state = self.state.write();
        if state.relations.contains_key(&relation.id) || state.by_node.contains_key(&relation.node)
        {
            return Err(CoreError::invalid_argument(format!(
                "relation {} ({}) already exists",
                relation.id, relation.node
            )));
        }
        let relation = Arc::new(relation);
        state.by_node.insert(relation.node, relation.id);
        state.relations.insert(relation.id, Arc::clone(&relation));
        Ok(relation)
    }

    /// Drops a relation and all of its pages.
    pub fn drop_relation(&self, id: RelationId) {
        let mut state = self.state.write();
        if let Some(relation) = state.relations.remove(&id) {
            state.by_node.remove(&relation.node);
            state.buffers.retain(|tag, _| tag.node != relation.node);
            state.nblocks.retain(|(node, _), _| *node != relation.node);
        }
    }

    /// Appends an empty page to a relation fork.
    pub fn extend(&self, relation: &Relation, fork: ForkNumber) -> Arc<Buffer> {
        let mut state = self.state.write();
        let next = state.nblocks.entry((relation.node, fork)).or_insert(0);
        let block = *next;
        *next += 1;

        let tag = BufferTag {
            node: relation.node,
            fork,
            block,
        };
        let buffer = Arc::new(Buffer::new(tag, Page::new()));
        state.buffers.insert(tag, Arc::clone(&buffer));
        buffer
    }

    /// Returns the number of blocks in a relation fork.
    #[must_use]
    pub fn nblocks(&self, relation: &Relation, fork: ForkNumber) -> BlockNumber {
        self.state
            .read()
            .nblocks
            .get(&(relation.node, fork))
            .copied()
            .unwrap_or(0)
    }
}

impl BufferManager for BufferPool {
    fn relation_for_node(&self, node: RelFileNode) -> Option<RelationId> {
        self.state.read().by_node.get(&node).copied()
    }

    fn open_relation(&self, id: RelationId) -> CoreResult<Arc<Relation>> {
        self.state
            .read()
            .relations
            .get(&id)
            .cloned()
            .ok_or(CoreError::RelationNotFound { relation: id })
    }

    fn read_buffer(
        &self,
        relation: &Relation,
        fork: ForkNumber,
        block: BlockNumber,
    ) -> CoreResult<Arc<Buffer>> {
        let tag = BufferTag {
            node: relation.node,
            fork,
            block,
        };
        self.state
            .read()
            .buffers
            .get(&tag)
            .cloned()
            .ok_or(CoreError::BlockNotFound {
                node: relation.node,
                fork,
                block,
            })
    }
}
