//! Page-granular storage over a growable backing region.
//!
//! Two implementations share the [`Pager`] contract: [`MemoryPager`]
//! (heap-backed, for memory-only environments) and [`FilePager`]
//! (positional I/O over a growable, exclusively-locked file).
//!
//! Callers address pages by number. A refcounted [`PagerState`] snapshot is
//! captured by every transaction; growing the region installs a new state
//! while readers holding an older one remain valid, because growth only
//! appends.

#![allow(clippy::cast_possible_truncation)]

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use fs2::FileExt as LockExt;

use crate::storage::page::{Page, PageId};

/// Initial growth increment, in pages.
const INITIAL_INCREMENT_PAGES: u64 = 16;

/// Default cap on the growth increment, in pages (1 GiB at 4 KiB pages).
pub const DEFAULT_MAX_INCREMENT_PAGES: u64 = 262_144;

/// Two grows closer together than this double the increment.
const FAST_GROW_WINDOW: Duration = Duration::from_secs(30);

/// Two grows further apart than this halve the increment.
const SLOW_GROW_WINDOW: Duration = Duration::from_secs(120);

/// A snapshot of the pager's mapped extent.
///
/// Transactions hold an `Arc<PagerState>` for their lifetime; the pager
/// holds the current one and replaces it on growth.
#[derive(Debug)]
pub struct PagerState {
    /// Number of pages currently backed by the region.
    pub num_pages: u64,
    /// Bumped once per remap/grow.
    pub generation: u64,
}

/// The pager contract shared by memory-backed and file-backed stores.
pub trait Pager: Send + Sync {
    /// The fixed page size in bytes.
    fn page_size(&self) -> usize;

    /// Number of pages currently backed by the region.
    fn num_allocated_pages(&self) -> u64;

    /// The current refcounted state snapshot.
    fn state(&self) -> Arc<PagerState>;

    /// Read a page into an owned buffer.
    fn read_page(&self, page_number: PageId) -> Result<Page, PagerError>;

    /// Write a page at the given position.
    ///
    /// The position is explicit because header pages do not carry the
    /// common page header.
    fn write_page(&self, page_number: PageId, page: &Page) -> Result<(), PagerError>;

    /// Write raw bytes at an absolute byte position.
    fn write_direct(&self, src: &[u8], pos: u64) -> Result<(), PagerError>;

    /// Grow the region, if needed, so pages `[first, first + count)` exist.
    fn ensure_continuous(&self, first: PageId, count: u64) -> Result<(), PagerError>;

    /// Flush pending writes to the backing device.
    fn sync(&self) -> Result<(), PagerError>;

    /// Release the backing region. All subsequent operations fail.
    fn dispose(&self) -> Result<(), PagerError>;
}

/// Adaptive growth sizing shared by both pager implementations.
///
/// The increment starts small, doubles under sustained growth and decays
/// when growth is rare, and is always limited to a quarter of the current
/// region length, rounded up to a power of two.
pub struct GrowthPolicy {
    page_size: u64,
    min_increase: u64,
    max_increase: u64,
    state: Mutex<GrowthState>,
}

struct GrowthState {
    increment: u64,
    last_grow: Option<Instant>,
}

impl GrowthPolicy {
    /// Create a policy. `min_increase`/`max_increase` are in bytes.
    #[must_use]
    pub fn new(page_size: usize, min_increase: u64, max_increase: u64) -> Self {
        let page_size = page_size as u64;
        let min_increase = min_increase.max(page_size);
        Self {
            page_size,
            min_increase,
            max_increase: max_increase.max(min_increase),
            state: Mutex::new(GrowthState {
                increment: (INITIAL_INCREMENT_PAGES * page_size).max(min_increase),
                last_grow: None,
            }),
        }
    }

    /// Policy with the default floor and cap for a page size.
    #[must_use]
    pub fn with_defaults(page_size: usize) -> Self {
        let min = INITIAL_INCREMENT_PAGES * page_size as u64;
        let max = DEFAULT_MAX_INCREMENT_PAGES * page_size as u64;
        Self::new(page_size, min, max)
    }

    /// Compute the new region length for a grow from `current_len` that must
    /// reach at least `required_len`. Both in bytes; the result is a page
    /// multiple covering `required_len`.
    #[allow(clippy::expect_used)] // lock poisoning indicates unrecoverable state
    pub fn next_length(&self, current_len: u64, required_len: u64) -> u64 {
        let mut state = self.state.lock().expect("lock poisoned");

        let now = Instant::now();
        if let Some(last) = state.last_grow {
            let elapsed = now.duration_since(last);
            if elapsed < FAST_GROW_WINDOW {
                state.increment = (state.increment.saturating_mul(2)).min(self.max_increase);
            } else if elapsed > SLOW_GROW_WINDOW {
                state.increment = (state.increment / 2).max(self.min_increase);
            }
        }
        state.last_grow = Some(now);

        let quarter = current_len / 4;
        let actual = state
            .increment
            .min(quarter.max(self.min_increase))
            .next_power_of_two();

        let new_len = (current_len + actual).max(required_len);
        new_len.div_ceil(self.page_size) * self.page_size
    }
}

/// A heap-backed pager for memory-only environments.
pub struct MemoryPager {
    page_size: usize,
    growth: GrowthPolicy,
    data: RwLock<Vec<u8>>,
    state: Mutex<Arc<PagerState>>,
    disposed: AtomicBool,
}

impl MemoryPager {
    /// Create an empty memory pager.
    #[must_use]
    pub fn new(page_size: usize, min_increase: u64, max_increase: u64) -> Self {
        Self {
            page_size,
            growth: GrowthPolicy::new(page_size, min_increase, max_increase),
            data: RwLock::new(Vec::new()),
            state: Mutex::new(Arc::new(PagerState {
                num_pages: 0,
                generation: 0,
            })),
            disposed: AtomicBool::new(false),
        }
    }

    fn check_disposed(&self) -> Result<(), PagerError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(PagerError::Disposed);
        }
        Ok(())
    }

    #[allow(clippy::expect_used)] // lock poisoning indicates unrecoverable state
    fn install_state(&self, num_pages: u64) {
        let mut state = self.state.lock().expect("lock poisoned");
        let generation = state.generation + 1;
        *state = Arc::new(PagerState {
            num_pages,
            generation,
        });
    }
}

#[allow(clippy::expect_used)] // lock poisoning indicates unrecoverable state
impl Pager for MemoryPager {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn num_allocated_pages(&self) -> u64 {
        self.state.lock().expect("lock poisoned").num_pages
    }

    fn state(&self) -> Arc<PagerState> {
        Arc::clone(&self.state.lock().expect("lock poisoned"))
    }

    fn read_page(&self, page_number: PageId) -> Result<Page, PagerError> {
        self.check_disposed()?;
        let data = self.data.read().expect("lock poisoned");
        let offset = page_number as usize * self.page_size;
        if offset + self.page_size > data.len() {
            return Err(PagerError::OutOfBounds {
                page: page_number,
                allocated: data.len() as u64 / self.page_size as u64,
            });
        }
        let mut page = Page::new(self.page_size);
        page.as_bytes_mut()
            .copy_from_slice(&data[offset..offset + self.page_size]);
        Ok(page)
    }

    fn write_page(&self, page_number: PageId, page: &Page) -> Result<(), PagerError> {
        self.check_disposed()?;
        let mut data = self.data.write().expect("lock poisoned");
        let offset = page_number as usize * self.page_size;
        if offset + self.page_size > data.len() {
            return Err(PagerError::OutOfBounds {
                page: page_number,
                allocated: data.len() as u64 / self.page_size as u64,
            });
        }
        data[offset..offset + self.page_size].copy_from_slice(page.as_bytes());
        Ok(())
    }

    fn write_direct(&self, src: &[u8], pos: u64) -> Result<(), PagerError> {
        self.check_disposed()?;
        let mut data = self.data.write().expect("lock poisoned");
        let pos = pos as usize;
        if pos + src.len() > data.len() {
            return Err(PagerError::OutOfBounds {
                page: (pos + src.len()) as u64 / self.page_size as u64,
                allocated: data.len() as u64 / self.page_size as u64,
            });
        }
        data[pos..pos + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn ensure_continuous(&self, first: PageId, count: u64) -> Result<(), PagerError> {
        self.check_disposed()?;
        let required_pages = first + count;
        let mut data = self.data.write().expect("lock poisoned");
        let current_len = data.len() as u64;
        let required_len = required_pages * self.page_size as u64;
        if required_len <= current_len {
            return Ok(());
        }
        let new_len = self.growth.next_length(current_len, required_len);
        data.resize(new_len as usize, 0);
        let num_pages = new_len / self.page_size as u64;
        drop(data);
        self.install_state(num_pages);
        Ok(())
    }

    fn sync(&self) -> Result<(), PagerError> {
        self.check_disposed()
    }

    fn dispose(&self) -> Result<(), PagerError> {
        self.disposed.store(true, Ordering::Release);
        Ok(())
    }
}

struct FileExtent {
    len: u64,
    state: Arc<PagerState>,
}

/// A file-backed pager using positional reads and writes.
///
/// The file is exclusively locked for the lifetime of the pager so two
/// processes cannot share one store.
pub struct FilePager {
    path: PathBuf,
    file: File,
    page_size: usize,
    growth: GrowthPolicy,
    extent: Mutex<FileExtent>,
    disposed: AtomicBool,
}

impl FilePager {
    /// Open (creating if absent) the backing file at `path`.
    pub fn open(
        path: &Path,
        page_size: usize,
        min_increase: u64,
        max_increase: u64,
    ) -> Result<Self, PagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(PagerError::Io)?;

        if file.try_lock_exclusive().is_err() {
            return Err(PagerError::Locked(path.to_path_buf()));
        }

        let len = file.metadata().map_err(PagerError::Io)?.len();
        let num_pages = len / page_size as u64;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            page_size,
            growth: GrowthPolicy::new(page_size, min_increase, max_increase),
            extent: Mutex::new(FileExtent {
                len,
                state: Arc::new(PagerState {
                    num_pages,
                    generation: 0,
                }),
            }),
            disposed: AtomicBool::new(false),
        })
    }

    /// The path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_disposed(&self) -> Result<(), PagerError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(PagerError::Disposed);
        }
        Ok(())
    }

    #[allow(clippy::expect_used)] // lock poisoning indicates unrecoverable state
    fn current_len(&self) -> u64 {
        self.extent.lock().expect("lock poisoned").len
    }
}

#[allow(clippy::expect_used)] // lock poisoning indicates unrecoverable state
impl Pager for FilePager {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn num_allocated_pages(&self) -> u64 {
        self.extent.lock().expect("lock poisoned").state.num_pages
    }

    fn state(&self) -> Arc<PagerState> {
        Arc::clone(&self.extent.lock().expect("lock poisoned").state)
    }

    fn read_page(&self, page_number: PageId) -> Result<Page, PagerError> {
        self.check_disposed()?;
        let len = self.current_len();
        let offset = page_number * self.page_size as u64;
        if offset + self.page_size as u64 > len {
            return Err(PagerError::OutOfBounds {
                page: page_number,
                allocated: len / self.page_size as u64,
            });
        }
        let mut page = Page::new(self.page_size);
        self.file
            .read_exact_at(page.as_bytes_mut(), offset)
            .map_err(PagerError::Io)?;
        Ok(page)
    }

    fn write_page(&self, page_number: PageId, page: &Page) -> Result<(), PagerError> {
        self.check_disposed()?;
        let len = self.current_len();
        let offset = page_number * self.page_size as u64;
        if offset + self.page_size as u64 > len {
            return Err(PagerError::OutOfBounds {
                page: page_number,
                allocated: len / self.page_size as u64,
            });
        }
        self.file
            .write_all_at(page.as_bytes(), offset)
            .map_err(PagerError::Io)
    }

    fn write_direct(&self, src: &[u8], pos: u64) -> Result<(), PagerError> {
        self.check_disposed()?;
        let len = self.current_len();
        if pos + src.len() as u64 > len {
            return Err(PagerError::OutOfBounds {
                page: (pos + src.len() as u64) / self.page_size as u64,
                allocated: len / self.page_size as u64,
            });
        }
        self.file.write_all_at(src, pos).map_err(PagerError::Io)
    }

    fn ensure_continuous(&self, first: PageId, count: u64) -> Result<(), PagerError> {
        self.check_disposed()?;
        let required_len = (first + count) * self.page_size as u64;
        let mut extent = self.extent.lock().expect("lock poisoned");
        if required_len <= extent.len {
            return Ok(());
        }
        let new_len = self.growth.next_length(extent.len, required_len);
        self.file.set_len(new_len).map_err(PagerError::Io)?;
        let generation = extent.state.generation + 1;
        extent.len = new_len;
        extent.state = Arc::new(PagerState {
            num_pages: new_len / self.page_size as u64,
            generation,
        });
        Ok(())
    }

    fn sync(&self) -> Result<(), PagerError> {
        self.check_disposed()?;
        self.file.sync_all().map_err(PagerError::Io)
    }

    fn dispose(&self) -> Result<(), PagerError> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Err(PagerError::Disposed);
        }
        let _ = LockExt::unlock(&self.file);
        Ok(())
    }
}

impl Drop for FilePager {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::Acquire) {
            let _ = LockExt::unlock(&self.file);
        }
    }
}

/// Errors surfaced by the pager.
#[derive(Debug)]
pub enum PagerError {
    /// The pager has been disposed.
    Disposed,
    /// Page access beyond the allocated region without `ensure_continuous`.
    OutOfBounds { page: PageId, allocated: u64 },
    /// Backing I/O error.
    Io(std::io::Error),
    /// Another process holds the store file lock.
    Locked(PathBuf),
}

impl std::fmt::Display for PagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disposed => write!(f, "pager has been disposed"),
            Self::OutOfBounds { page, allocated } => {
                write!(f, "page {page} out of bounds (allocated pages: {allocated})")
            }
            Self::Io(e) => write!(f, "backing I/O error: {e}"),
            Self::Locked(p) => write!(f, "store file is locked: {}", p.display()),
        }
    }
}

impl std::error::Error for PagerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Disposed | Self::OutOfBounds { .. } | Self::Locked(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::DEFAULT_PAGE_SIZE;
    use tempfile::tempdir;

    fn memory_pager() -> MemoryPager {
        MemoryPager::new(DEFAULT_PAGE_SIZE, 0, u64::MAX)
    }

    #[test]
    fn test_memory_roundtrip() {
        let pager = memory_pager();
        pager.ensure_continuous(0, 4).expect("grow");
        assert!(pager.num_allocated_pages() >= 4);

        let mut page = Page::new(DEFAULT_PAGE_SIZE);
        page.set_page_number(2);
        page.write_bytes(100, b"vellum");
        pager.write_page(2, &page).expect("write");

        let read = pager.read_page(2).expect("read");
        assert_eq!(read.read_bytes(100, 6), b"vellum");
    }

    #[test]
    fn test_memory_out_of_bounds() {
        let pager = memory_pager();
        let result = pager.read_page(100);
        assert!(matches!(result, Err(PagerError::OutOfBounds { .. })));
    }

    #[test]
    fn test_memory_disposed() {
        let pager = memory_pager();
        pager.ensure_continuous(0, 1).expect("grow");
        pager.dispose().expect("dispose");
        assert!(matches!(pager.read_page(0), Err(PagerError::Disposed)));
        assert!(matches!(
            pager.ensure_continuous(0, 2),
            Err(PagerError::Disposed)
        ));
    }

    #[test]
    fn test_state_generation_advances_on_grow() {
        let pager = memory_pager();
        let before = pager.state();
        pager.ensure_continuous(0, 4).expect("grow");
        let after = pager.state();
        assert!(after.generation > before.generation);
        assert!(after.num_pages >= 4);
        // The old snapshot is still readable by its holders.
        assert_eq!(before.num_pages, 0);
    }

    #[test]
    fn test_file_roundtrip_and_persistence() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("test.vellum");

        {
            let pager =
                FilePager::open(&path, DEFAULT_PAGE_SIZE, 0, u64::MAX).expect("open");
            pager.ensure_continuous(0, 8).expect("grow");

            let mut page = Page::new(DEFAULT_PAGE_SIZE);
            page.set_page_number(5);
            page.write_u64(64, 0xDEAD_BEEF_CAFE_BABE);
            pager.write_page(5, &page).expect("write");
            pager.sync().expect("sync");
            pager.dispose().expect("dispose");
        }

        {
            let pager =
                FilePager::open(&path, DEFAULT_PAGE_SIZE, 0, u64::MAX).expect("reopen");
            let page = pager.read_page(5).expect("read");
            assert_eq!(page.read_u64(64), 0xDEAD_BEEF_CAFE_BABE);
        }
    }

    #[test]
    fn test_file_lock_is_exclusive() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("test.vellum");

        let first = FilePager::open(&path, DEFAULT_PAGE_SIZE, 0, u64::MAX).expect("open");
        let second = FilePager::open(&path, DEFAULT_PAGE_SIZE, 0, u64::MAX);
        assert!(matches!(second, Err(PagerError::Locked(_))));
        drop(first);

        // Released on drop.
        let third = FilePager::open(&path, DEFAULT_PAGE_SIZE, 0, u64::MAX);
        assert!(third.is_ok());
    }

    #[test]
    fn test_write_direct() {
        let pager = memory_pager();
        pager.ensure_continuous(0, 2).expect("grow");
        pager
            .write_direct(b"direct", DEFAULT_PAGE_SIZE as u64 + 10)
            .expect("write");
        let page = pager.read_page(1).expect("read");
        assert_eq!(page.read_bytes(10, 6), b"direct");
    }

    #[test]
    fn test_growth_covers_request_and_page_aligns() {
        let policy = GrowthPolicy::with_defaults(DEFAULT_PAGE_SIZE);
        let required = 1000 * DEFAULT_PAGE_SIZE as u64;
        let new_len = policy.next_length(0, required);
        assert!(new_len >= required);
        assert_eq!(new_len % DEFAULT_PAGE_SIZE as u64, 0);
    }

    #[test]
    fn test_growth_increment_doubles_under_pressure() {
        let policy = GrowthPolicy::with_defaults(DEFAULT_PAGE_SIZE);
        let page = DEFAULT_PAGE_SIZE as u64;

        // Repeated immediate grows of a large region: the applied increment
        // should double each round until the cap.
        let mut len = 1024 * 1024 * 1024; // 1 GiB region, quarter is large
        let mut last_delta = 0;
        for round in 0..4 {
            let new_len = policy.next_length(len, len + page);
            let delta = new_len - len;
            if round > 0 {
                assert!(delta >= last_delta, "increment should not shrink");
            }
            last_delta = delta;
            len = new_len;
        }
        assert!(last_delta >= 2 * 16 * page);
    }

    #[test]
    fn test_growth_quarter_limit_for_small_regions() {
        let policy = GrowthPolicy::with_defaults(DEFAULT_PAGE_SIZE);
        let page = DEFAULT_PAGE_SIZE as u64;
        // A small region grows by at least the minimum even though a
        // quarter of it is below the floor.
        let new_len = policy.next_length(8 * page, 9 * page);
        assert!(new_len >= 9 * page);
        assert!(new_len - 8 * page >= 16 * page);
    }
}
