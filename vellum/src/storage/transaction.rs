//! Read and write transactions.
//!
//! A read transaction is a registered snapshot: it captures the committed
//! `{root page, next page}` pair under the shared lock and is lock-free
//! afterwards. The single write transaction copies pages on first touch,
//! so every page reachable from an older snapshot stays untouched until no
//! reader can still observe it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::MutexGuard;

use crate::storage::env::Environment;
use crate::storage::freespace::{FreeSpaceError, SECTION_PAGES, is_reserved_page};
use crate::storage::header::FileHeader;
use crate::storage::page::{Page, PageId};
use crate::storage::pager::{PagerError, PagerState};

/// Largest contiguous run a transaction can allocate.
///
/// Every section starts with its reserved bitmap page, so no contiguous
/// run of free pages can ever span a full section.
pub const MAX_RUN_PAGES: u64 = SECTION_PAGES - 1;

/// Uniform page access for tree reads over either transaction kind.
pub trait PageSource {
    /// Read a page visible to this transaction.
    fn page(&self, page_number: PageId) -> Result<Page, TransactionError>;

    /// Root page of the root tree in this snapshot.
    fn root_tree_page(&self) -> PageId;

    /// The environment's page size.
    fn page_size(&self) -> usize;
}

/// A registered snapshot of the committed store.
pub struct ReadTransaction<'env> {
    env: &'env Environment,
    root_tree_page: PageId,
    next_page: u64,
    global_etag: u64,
    snapshot_generation: u64,
    pager_state: Arc<PagerState>,
}

impl<'env> ReadTransaction<'env> {
    pub(crate) fn begin(env: &'env Environment) -> Result<Self, TransactionError> {
        let (root_tree_page, next_page, global_etag, snapshot_generation) = {
            let mut shared = env.lock_shared();
            let generation = shared.generation;
            *shared.readers.entry(generation).or_insert(0) += 1;
            (
                shared.root_tree_page,
                shared.next_page,
                shared.global_etag,
                generation,
            )
        };
        Ok(Self {
            env,
            root_tree_page,
            next_page,
            global_etag,
            snapshot_generation,
            pager_state: env.pager().state(),
        })
    }

    /// The last committed etag visible to this snapshot.
    #[must_use]
    pub const fn global_etag(&self) -> u64 {
        self.global_etag
    }

    /// The snapshot's commit generation.
    #[must_use]
    pub const fn snapshot_generation(&self) -> u64 {
        self.snapshot_generation
    }

    /// The pager state captured at begin; held so a grow cannot retire the
    /// extent under this reader.
    #[must_use]
    pub fn pager_state(&self) -> &PagerState {
        &self.pager_state
    }
}

impl PageSource for ReadTransaction<'_> {
    fn page(&self, page_number: PageId) -> Result<Page, TransactionError> {
        if page_number >= self.next_page {
            return Err(TransactionError::Pager(PagerError::OutOfBounds {
                page: page_number,
                allocated: self.next_page,
            }));
        }
        Ok(self.env.pager().read_page(page_number)?)
    }

    fn root_tree_page(&self) -> PageId {
        self.root_tree_page
    }

    fn page_size(&self) -> usize {
        self.env.page_size()
    }
}

impl Drop for ReadTransaction<'_> {
    fn drop(&mut self) {
        self.env.release_reader(self.snapshot_generation);
    }
}

/// The single live write transaction.
///
/// Holds the environment's writer slot for its lifetime. Dropping without
/// `commit` rolls back.
pub struct WriteTransaction<'env> {
    env: &'env Environment,
    _slot: MutexGuard<'env, ()>,
    root_tree_page: PageId,
    next_page: u64,
    global_etag: u64,
    base_generation: u64,
    dirty: HashMap<PageId, Page>,
    /// Runs taken from the free map, to be returned on rollback.
    from_map: Vec<(PageId, u64)>,
    /// Pages scheduled to be freed at commit.
    freed: Vec<PageId>,
    finished: bool,
}

impl<'env> WriteTransaction<'env> {
    #[allow(clippy::expect_used)] // lock poisoning indicates unrecoverable state
    pub(crate) fn begin(env: &'env Environment, block: bool) -> Result<Self, TransactionError> {
        let slot = if block {
            env.write_slot.lock().expect("lock poisoned")
        } else {
            match env.write_slot.try_lock() {
                Ok(slot) => slot,
                Err(std::sync::TryLockError::WouldBlock) => {
                    return Err(TransactionError::Concurrent);
                }
                Err(std::sync::TryLockError::Poisoned(_)) => {
                    return Err(TransactionError::Faulted);
                }
            }
        };

        let (root_tree_page, next_page, global_etag, base_generation) = {
            let mut shared = env.lock_shared();
            // Recycle pages no reader can still see; every pending
            // generation's header is durable by now.
            Environment::drain_pending(&mut shared, u64::MAX)?;
            (
                shared.root_tree_page,
                shared.next_page,
                shared.global_etag,
                shared.generation,
            )
        };

        Ok(Self {
            env,
            _slot: slot,
            root_tree_page,
            next_page,
            global_etag,
            base_generation,
            dirty: HashMap::new(),
            from_map: Vec::new(),
            freed: Vec::new(),
            finished: false,
        })
    }

    /// Allocate a run of `count` contiguous pages: from the free map when a
    /// run exists, otherwise by extending the file past `next_page`,
    /// stepping over reserved bitmap slots.
    ///
    /// Runs are capped at [`MAX_RUN_PAGES`]; the section bitmap pages make
    /// longer runs impossible.
    pub fn allocate(&mut self, count: u64) -> Result<PageId, TransactionError> {
        debug_assert!(count > 0, "allocation of zero pages");
        if count > MAX_RUN_PAGES {
            return Err(TransactionError::RunTooLarge {
                requested: count,
                max: MAX_RUN_PAGES,
            });
        }
        {
            let mut shared = self.env.lock_shared();
            if let Some(first) = shared.free.try_allocate(count) {
                drop(shared);
                self.from_map.push((first, count));
                return Ok(first);
            }
        }

        let mut first = self.next_page;
        loop {
            match (first..first + count).find(|page| is_reserved_page(*page)) {
                Some(reserved) => first = reserved + 1,
                None => break,
            }
        }
        self.env.pager().ensure_continuous(first, count)?;
        self.next_page = first + count;
        Ok(first)
    }

    /// Register a page built by this transaction as dirty.
    pub fn put_page(&mut self, page: Page) {
        let page_number = page.page_number();
        debug_assert!(!is_reserved_page(page_number), "writing a reserved page");
        self.dirty.insert(page_number, page);
    }

    /// Copy a committed page on first touch, returning the writable page's
    /// number. A page already dirty in this transaction is returned as-is.
    pub fn copy_on_write(&mut self, page_number: PageId) -> Result<PageId, TransactionError> {
        if self.dirty.contains_key(&page_number) {
            return Ok(page_number);
        }
        let mut page = self.page(page_number)?;
        let new_page = self.allocate(1)?;
        page.set_page_number(new_page);
        self.dirty.insert(new_page, page);
        self.freed.push(page_number);
        Ok(new_page)
    }

    /// Mutable access to a dirty page.
    pub fn page_mut(&mut self, page_number: PageId) -> Option<&mut Page> {
        self.dirty.get_mut(&page_number)
    }

    /// Schedule a page to be freed at commit.
    pub fn free_page(&mut self, page_number: PageId) {
        self.dirty.remove(&page_number);
        self.freed.push(page_number);
    }

    /// Schedule a contiguous run to be freed at commit.
    pub fn free_run(&mut self, first: PageId, count: u64) {
        for page in first..first + count {
            self.free_page(page);
        }
    }

    /// Assign the next etag.
    pub const fn next_etag(&mut self) -> u64 {
        self.global_etag += 1;
        self.global_etag
    }

    /// The last assigned etag as seen by this transaction.
    #[must_use]
    pub const fn global_etag(&self) -> u64 {
        self.global_etag
    }

    /// Point the header at a new root tree page.
    pub const fn set_root_tree_page(&mut self, page_number: PageId) {
        self.root_tree_page = page_number;
    }

    /// Next page number this transaction would extend from.
    #[must_use]
    pub const fn next_page(&self) -> u64 {
        self.next_page
    }

    /// Flush dirty pages, persist the free-space bitmap, publish the new
    /// header and make the commit visible.
    pub fn commit(mut self) -> Result<(), TransactionError> {
        self.finished = true;
        let pager = self.env.pager();

        for (page_number, page) in &self.dirty {
            if let Err(e) = pager.write_page(*page_number, page) {
                self.env.mark_faulted();
                return Err(e.into());
            }
        }

        // Free-space accounting, device flush and publication stay under
        // one lock so a reader cannot register against a root whose pages
        // were already recycled.
        let commit_generation = self.base_generation + 1;
        let mut shared = self.env.lock_shared();
        shared.free.expand(self.next_page);
        if !self.freed.is_empty() {
            shared
                .pending_free
                .entry(commit_generation)
                .or_default()
                .append(&mut self.freed);
        }
        // This commit's own frees stay pending: until the header below is
        // durable, a crash recovers the previous header, whose root still
        // reaches them. They are drained at the next begin or reader
        // release.
        if let Err(e) = Environment::drain_pending(&mut shared, commit_generation) {
            self.env.mark_faulted();
            return Err(e.into());
        }

        for section in shared.free.take_dirty_sections() {
            let page = shared.free.section_page(section, self.env.page_size());
            if let Err(e) = pager.write_page(page.page_number(), &page) {
                self.env.mark_faulted();
                return Err(e.into());
            }
        }
        if let Err(e) = pager.sync() {
            self.env.mark_faulted();
            return Err(e.into());
        }

        #[allow(clippy::cast_possible_truncation)]
        let header = FileHeader {
            format_version: crate::storage::header::FORMAT_VERSION,
            page_size: self.env.page_size() as u32,
            root_tree_page: self.root_tree_page,
            next_page: self.next_page,
            global_etag: self.global_etag,
            generation: commit_generation,
            schema_version: self.env.schema_version(),
        };
        if let Err(e) = pager.write_page(header.slot(), &header.to_page()) {
            self.env.mark_faulted();
            return Err(e.into());
        }
        if let Err(e) = pager.sync() {
            self.env.mark_faulted();
            return Err(e.into());
        }

        shared.root_tree_page = self.root_tree_page;
        shared.next_page = self.next_page;
        shared.global_etag = self.global_etag;
        shared.generation = commit_generation;
        Ok(())
    }

    /// Discard all work: dirty pages are dropped and free-map allocations
    /// returned. The previous root stays visible.
    pub fn rollback(mut self) {
        self.rollback_inner();
    }

    fn rollback_inner(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.dirty.clear();
        self.freed.clear();
        let mut shared = self.env.lock_shared();
        for (first, count) in self.from_map.drain(..) {
            for page in first..first + count {
                if shared.free.free_page(page).is_err() {
                    self.env.mark_faulted();
                    return;
                }
            }
        }
    }
}

impl PageSource for WriteTransaction<'_> {
    fn page(&self, page_number: PageId) -> Result<Page, TransactionError> {
        if let Some(page) = self.dirty.get(&page_number) {
            return Ok(page.clone());
        }
        if page_number >= self.next_page {
            return Err(TransactionError::Pager(PagerError::OutOfBounds {
                page: page_number,
                allocated: self.next_page,
            }));
        }
        Ok(self.env.pager().read_page(page_number)?)
    }

    fn root_tree_page(&self) -> PageId {
        self.root_tree_page
    }

    fn page_size(&self) -> usize {
        self.env.page_size()
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        self.rollback_inner();
    }
}

/// Errors raised by transaction operations.
#[derive(Debug)]
pub enum TransactionError {
    /// Pager failure.
    Pager(PagerError),
    /// Free-space bitmap failure.
    FreeSpace(FreeSpaceError),
    /// A second write transaction was requested without blocking.
    Concurrent,
    /// The environment has been marked faulted by an earlier I/O failure.
    Faulted,
    /// A contiguous run larger than a section was requested.
    RunTooLarge { requested: u64, max: u64 },
}

impl std::fmt::Display for TransactionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pager(e) => write!(f, "pager error: {e}"),
            Self::FreeSpace(e) => write!(f, "free-space error: {e}"),
            Self::Concurrent => write!(f, "another write transaction is live"),
            Self::Faulted => write!(f, "environment is faulted"),
            Self::RunTooLarge { requested, max } => {
                write!(f, "allocation run too large: {requested} pages (max {max})")
            }
        }
    }
}

impl std::error::Error for TransactionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Pager(e) => Some(e),
            Self::FreeSpace(e) => Some(e),
            Self::Concurrent | Self::Faulted | Self::RunTooLarge { .. } => None,
        }
    }
}

impl From<PagerError> for TransactionError {
    fn from(e: PagerError) -> Self {
        Self::Pager(e)
    }
}

impl From<FreeSpaceError> for TransactionError {
    fn from(e: FreeSpaceError) -> Self {
        Self::FreeSpace(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::options::Options;

    fn memory_env() -> Arc<Environment> {
        Environment::open(Options::memory()).expect("open")
    }

    fn write_marker(tx: &mut WriteTransaction<'_>, marker: u64) -> PageId {
        let page_id = tx.allocate(1).expect("allocate");
        let mut page = Page::new(tx.page_size());
        page.set_page_number(page_id);
        page.write_u64(100, marker);
        tx.put_page(page);
        page_id
    }

    #[test]
    fn test_commit_is_visible_to_later_readers() {
        let env = memory_env();
        let mut tx = env.begin_write().expect("begin");
        let page_id = write_marker(&mut tx, 7);
        tx.commit().expect("commit");

        let read = env.begin_read().expect("read");
        assert_eq!(read.page(page_id).expect("page").read_u64(100), 7);
    }

    #[test]
    fn test_rollback_leaves_previous_root() {
        let env = memory_env();
        {
            let mut tx = env.begin_write().expect("begin");
            let _ = write_marker(&mut tx, 1);
            tx.rollback();
        }
        let info = env.info();
        assert_eq!(info.generation, 0);
        assert_eq!(info.next_page, 3);
    }

    #[test]
    fn test_drop_without_commit_rolls_back() {
        let env = memory_env();
        {
            let mut tx = env.begin_write().expect("begin");
            let _ = write_marker(&mut tx, 1);
        }
        assert_eq!(env.info().generation, 0);
    }

    #[test]
    fn test_single_writer() {
        let env = memory_env();
        let tx = env.begin_write().expect("begin");
        assert!(matches!(
            env.try_begin_write(),
            Err(TransactionError::Concurrent)
        ));
        drop(tx);
        assert!(env.try_begin_write().is_ok());
    }

    #[test]
    fn test_copy_on_write_preserves_reader_snapshot() {
        let env = memory_env();

        let mut tx = env.begin_write().expect("begin");
        let page_id = write_marker(&mut tx, 1);
        tx.commit().expect("commit");

        let reader = env.begin_read().expect("read");

        // Overwrite via COW in a later transaction.
        let mut tx = env.begin_write().expect("begin");
        let new_id = tx.copy_on_write(page_id).expect("cow");
        assert_ne!(new_id, page_id);
        tx.page_mut(new_id).expect("dirty").write_u64(100, 2);
        tx.commit().expect("commit");

        // The old snapshot still observes the original value.
        assert_eq!(reader.page(page_id).expect("page").read_u64(100), 1);

        // A fresh snapshot observes the new page.
        let fresh = env.begin_read().expect("read");
        assert_eq!(fresh.page(new_id).expect("page").read_u64(100), 2);
    }

    #[test]
    fn test_freed_pages_wait_for_readers() {
        let env = memory_env();

        let mut tx = env.begin_write().expect("begin");
        let page_id = write_marker(&mut tx, 1);
        tx.commit().expect("commit");

        let reader = env.begin_read().expect("read");

        let mut tx = env.begin_write().expect("begin");
        tx.free_page(page_id);
        tx.commit().expect("commit");

        // The reader still holds the old snapshot, so the page is pending.
        assert!(!env.all_free_pages().contains(&page_id));

        drop(reader);
        assert!(env.all_free_pages().contains(&page_id));
    }

    #[test]
    fn test_freed_pages_recycle_at_next_transaction_begin() {
        let env = memory_env();

        let mut tx = env.begin_write().expect("begin");
        let page_id = write_marker(&mut tx, 1);
        tx.commit().expect("commit");

        let mut tx = env.begin_write().expect("begin");
        tx.free_page(page_id);
        tx.commit().expect("commit");

        // Not reclaimed by the freeing commit itself: the previous header
        // could still be the one recovered after a crash.
        assert!(!env.all_free_pages().contains(&page_id));

        // The next transaction drains it and reuses it rather than
        // growing the file.
        let next_before = env.info().next_page;
        let mut tx = env.begin_write().expect("begin");
        assert!(env.all_free_pages().contains(&page_id));
        assert_eq!(tx.allocate(1).expect("allocate"), page_id);
        tx.rollback();
        assert_eq!(env.info().next_page, next_before);
    }

    #[test]
    fn test_allocation_run_is_bounded_to_a_section() {
        let env = memory_env();
        let mut tx = env.begin_write().expect("begin");
        assert!(tx.allocate(MAX_RUN_PAGES / 8).is_ok());
        assert!(matches!(
            tx.allocate(MAX_RUN_PAGES + 1),
            Err(TransactionError::RunTooLarge { .. })
        ));
        tx.rollback();
    }

    #[test]
    fn test_no_double_allocation_of_reachable_pages() {
        let env = memory_env();

        let mut tx = env.begin_write().expect("begin");
        let live = write_marker(&mut tx, 42);
        tx.commit().expect("commit");

        let mut tx = env.begin_write().expect("begin");
        let mut seen = std::collections::HashSet::new();
        for _ in 0..32 {
            let page = tx.allocate(1).expect("allocate");
            assert_ne!(page, live, "live page handed out again");
            assert!(seen.insert(page), "page handed out twice");
        }
        tx.rollback();
    }

    #[test]
    fn test_write_tx_reads_its_own_writes() {
        let env = memory_env();
        let mut tx = env.begin_write().expect("begin");
        let page_id = write_marker(&mut tx, 99);
        assert_eq!(tx.page(page_id).expect("page").read_u64(100), 99);
        tx.rollback();
    }

    #[test]
    fn test_etag_counter_is_contiguous_across_commits() {
        let env = memory_env();
        for expected in 1..=5u64 {
            let mut tx = env.begin_write().expect("begin");
            assert_eq!(tx.next_etag(), expected);
            tx.commit().expect("commit");
        }
        assert_eq!(env.global_etag(), 5);
    }

    #[test]
    fn test_reader_keeps_pager_state_alive() {
        let env = memory_env();
        let reader = env.begin_read().expect("read");
        let generation_before = reader.pager_state().generation;

        let mut tx = env.begin_write().expect("begin");
        // Force a grow well past the current extent.
        let _ = tx.allocate(64).expect("allocate");
        tx.commit().expect("commit");

        // The reader's captured state is unchanged.
        assert_eq!(reader.pager_state().generation, generation_before);
    }
}
