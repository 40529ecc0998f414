//! The storage environment: one page file, one writer, many readers.
//!
//! An [`Environment`] owns the pager, the committed store state (root tree
//! page, next page number, global etag) and the free-space map. Write
//! transactions serialize on the writer slot; read transactions register
//! their snapshot so freed pages are only recycled once no reader can still
//! observe them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::storage::freespace::{FreeSpaceError, FreeSpaceMap, bitmap_page};
use crate::storage::header::{FileHeader, HeaderError};
use crate::storage::options::Options;
use crate::storage::page::PageId;
use crate::storage::pager::{FilePager, MemoryPager, Pager, PagerError};
use crate::storage::transaction::{ReadTransaction, TransactionError, WriteTransaction};

/// Committed state shared by all transactions, guarded by one lock.
pub(crate) struct SharedState {
    pub(crate) root_tree_page: PageId,
    pub(crate) next_page: u64,
    pub(crate) global_etag: u64,
    pub(crate) generation: u64,
    pub(crate) free: FreeSpaceMap,
    /// Pages freed by a commit, keyed by the committing generation; drained
    /// once the oldest live reader is at least that new.
    pub(crate) pending_free: BTreeMap<u64, Vec<PageId>>,
    /// Live reader snapshots: generation -> count.
    pub(crate) readers: BTreeMap<u64, usize>,
}

/// A single-file transactional page store.
pub struct Environment {
    pager: Arc<dyn Pager>,
    options: Options,
    pub(crate) shared: Mutex<SharedState>,
    pub(crate) write_slot: Mutex<()>,
    faulted: AtomicBool,
}

impl Environment {
    /// Open an environment, creating the store when the backing region is
    /// empty.
    pub fn open(options: Options) -> Result<Arc<Self>, EnvError> {
        options.validate().map_err(EnvError::InvalidOptions)?;

        let pager: Arc<dyn Pager> = match &options.path {
            None => Arc::new(MemoryPager::new(
                options.page_size,
                options.min_increase(),
                options.max_increase(),
            )),
            Some(path) => Arc::new(FilePager::open(
                path,
                options.page_size,
                options.min_increase(),
                options.max_increase(),
            )?),
        };

        let fresh = pager.num_allocated_pages() == 0;
        let (header, free) = if fresh {
            Self::initialize(&*pager, &options)?
        } else {
            let header = FileHeader::read_current(&*pager)?;
            if header.page_size as usize != options.page_size {
                return Err(EnvError::Header(HeaderError::PageSizeMismatch {
                    stored: header.page_size,
                    actual: options.page_size as u32,
                }));
            }
            let free = FreeSpaceMap::load(&*pager, header.next_page)?;
            (header, free)
        };

        tracing::info!(
            path = %options.path.as_deref().map_or_else(|| "<memory>".into(), |p| p.display().to_string()),
            page_size = options.page_size,
            next_page = header.next_page,
            generation = header.generation,
            "opened storage environment"
        );

        Ok(Arc::new(Self {
            pager,
            options,
            shared: Mutex::new(SharedState {
                root_tree_page: header.root_tree_page,
                next_page: header.next_page,
                global_etag: header.global_etag,
                generation: header.generation,
                free,
                pending_free: BTreeMap::new(),
                readers: BTreeMap::new(),
            }),
            write_slot: Mutex::new(()),
            faulted: AtomicBool::new(false),
        }))
    }

    /// Lay down the header and the first section bitmap of a fresh store.
    fn initialize(
        pager: &dyn Pager,
        options: &Options,
    ) -> Result<(FileHeader, FreeSpaceMap), EnvError> {
        pager.ensure_continuous(0, 4)?;

        #[allow(clippy::cast_possible_truncation)]
        let header = FileHeader::new(options.page_size as u32, options.schema_version);

        let mut free = FreeSpaceMap::new(header.next_page);
        for section in free.take_dirty_sections() {
            let page = free.section_page(section, options.page_size);
            pager.write_page(bitmap_page(section), &page)?;
        }
        pager.write_page(header.slot(), &header.to_page())?;
        pager.sync()?;
        Ok((header, free))
    }

    /// The fixed page size.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.options.page_size
    }

    /// The caller schema version.
    #[must_use]
    pub fn schema_version(&self) -> u64 {
        self.options.schema_version
    }

    pub(crate) fn pager(&self) -> &dyn Pager {
        &*self.pager
    }

    #[allow(clippy::expect_used)] // lock poisoning indicates unrecoverable state
    pub(crate) fn lock_shared(&self) -> MutexGuard<'_, SharedState> {
        self.shared.lock().expect("lock poisoned")
    }

    pub(crate) fn mark_faulted(&self) {
        self.faulted.store(true, Ordering::Release);
    }

    pub(crate) fn check_usable(&self) -> Result<(), TransactionError> {
        if self.faulted.load(Ordering::Acquire) {
            return Err(TransactionError::Faulted);
        }
        Ok(())
    }

    /// Begin a read transaction on the current committed snapshot.
    pub fn begin_read(&self) -> Result<ReadTransaction<'_>, TransactionError> {
        self.check_usable()?;
        ReadTransaction::begin(self)
    }

    /// Begin the write transaction, blocking while another is live.
    pub fn begin_write(&self) -> Result<WriteTransaction<'_>, TransactionError> {
        self.check_usable()?;
        WriteTransaction::begin(self, true)
    }

    /// Begin the write transaction, failing with `Concurrent` if another is
    /// live.
    pub fn try_begin_write(&self) -> Result<WriteTransaction<'_>, TransactionError> {
        self.check_usable()?;
        WriteTransaction::begin(self, false)
    }

    /// Unregister a reader snapshot and recycle newly unreferenced pages.
    pub(crate) fn release_reader(&self, snapshot_generation: u64) {
        let mut shared = self.lock_shared();
        if let Some(count) = shared.readers.get_mut(&snapshot_generation) {
            *count -= 1;
            if *count == 0 {
                shared.readers.remove(&snapshot_generation);
            }
        }
        if Self::drain_pending(&mut shared, u64::MAX).is_err() {
            self.mark_faulted();
        }
    }

    /// Move pending frees into the free map: only generations below
    /// `before_generation` whose committing generation is visible to every
    /// live reader.
    ///
    /// A committing transaction passes its own generation as the bound. Its
    /// freed pages must stay pending until its header slot is durable: the
    /// bitmap pages are rewritten in place, so releasing them earlier would
    /// let a crash recover the previous header while its reachable pages
    /// are marked free.
    pub(crate) fn drain_pending(
        shared: &mut SharedState,
        before_generation: u64,
    ) -> Result<(), FreeSpaceError> {
        let min_reader = shared.readers.keys().next().copied();
        let eligible: Vec<u64> = shared
            .pending_free
            .keys()
            .copied()
            .filter(|generation| {
                *generation < before_generation
                    && min_reader.is_none_or(|min| min >= *generation)
            })
            .collect();
        for generation in eligible {
            if let Some(pages) = shared.pending_free.remove(&generation) {
                for page in pages {
                    shared.free.free_page(page)?;
                }
            }
        }
        Ok(())
    }

    /// The last committed etag.
    #[must_use]
    pub fn global_etag(&self) -> u64 {
        self.lock_shared().global_etag
    }

    /// All currently free pages, sorted ascending. Pages still pending a
    /// reader release are not included.
    #[must_use]
    pub fn all_free_pages(&self) -> Vec<PageId> {
        self.lock_shared().free.all_free_pages()
    }

    /// A point-in-time view of the environment's bookkeeping.
    #[must_use]
    pub fn info(&self) -> EnvInfo {
        let shared = self.lock_shared();
        EnvInfo {
            page_size: self.options.page_size,
            next_page: shared.next_page,
            free_pages: shared.free.free_count(),
            generation: shared.generation,
            global_etag: shared.global_etag,
        }
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let _ = self.pager.dispose();
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("page_size", &self.options.page_size)
            .field("path", &self.options.path)
            .finish_non_exhaustive()
    }
}

/// Bookkeeping counters exposed for callers and tests.
#[derive(Debug, Clone, Copy)]
pub struct EnvInfo {
    pub page_size: usize,
    pub next_page: u64,
    pub free_pages: u64,
    pub generation: u64,
    pub global_etag: u64,
}

/// Errors raised while opening or operating an environment.
#[derive(Debug)]
pub enum EnvError {
    /// Pager failure.
    Pager(PagerError),
    /// No usable header; the store is corrupt or incompatible.
    Header(HeaderError),
    /// Free-space bitmap failure.
    FreeSpace(FreeSpaceError),
    /// Invalid creation options.
    InvalidOptions(&'static str),
}

impl std::fmt::Display for EnvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pager(e) => write!(f, "pager error: {e}"),
            Self::Header(e) => write!(f, "header error: {e}"),
            Self::FreeSpace(e) => write!(f, "free-space error: {e}"),
            Self::InvalidOptions(reason) => write!(f, "invalid options: {reason}"),
        }
    }
}

impl std::error::Error for EnvError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Pager(e) => Some(e),
            Self::Header(e) => Some(e),
            Self::FreeSpace(e) => Some(e),
            Self::InvalidOptions(_) => None,
        }
    }
}

impl From<PagerError> for EnvError {
    fn from(e: PagerError) -> Self {
        Self::Pager(e)
    }
}

impl From<HeaderError> for EnvError {
    fn from(e: HeaderError) -> Self {
        Self::Header(e)
    }
}

impl From<FreeSpaceError> for EnvError {
    fn from(e: FreeSpaceError) -> Self {
        Self::FreeSpace(e)
    }
}
