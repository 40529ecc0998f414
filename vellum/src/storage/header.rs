//! The double-buffered file header.
//!
//! Pages 0 and 1 each hold a full copy of the header. A commit writes the
//! slot `generation % 2`, so the previous header survives a torn write.
//! On open, the valid header is the one with the highest generation whose
//! checksum verifies; if neither verifies the store is corrupt and refuses
//! to open.

#![allow(clippy::cast_possible_truncation)]

use crate::storage::page::{Page, PageId};
use crate::storage::pager::{Pager, PagerError};

/// Magic number identifying a vellum store file.
pub const MAGIC: [u8; 8] = *b"VELLUMPG";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Header field offsets.
mod offsets {
    pub const MAGIC: usize = 0;
    pub const FORMAT_VERSION: usize = 8;
    pub const PAGE_SIZE: usize = 12;
    pub const ROOT_TREE_PAGE: usize = 16;
    pub const NEXT_PAGE: usize = 24;
    pub const GLOBAL_ETAG: usize = 32;
    pub const GENERATION: usize = 40;
    pub const SCHEMA_VERSION: usize = 48;
    pub const CHECKSUM: usize = 56;
    // 64+: reserved
}

/// The store-wide metadata published atomically by each commit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Format version number.
    pub format_version: u32,
    /// Page size in bytes, fixed at environment creation.
    pub page_size: u32,
    /// Root page of the root tree (tree name -> tree state).
    pub root_tree_page: PageId,
    /// Next page number to hand out when extending the file.
    pub next_page: u64,
    /// Last assigned document etag.
    pub global_etag: u64,
    /// Commit generation; the header slot is `generation % 2`.
    pub generation: u64,
    /// Caller schema version for migrations.
    pub schema_version: u64,
}

impl FileHeader {
    /// Header for a freshly created store.
    #[must_use]
    pub const fn new(page_size: u32, schema_version: u64) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            page_size,
            root_tree_page: 0,
            next_page: 3, // two header pages + the first section bitmap
            global_etag: 0,
            generation: 0,
            schema_version,
        }
    }

    /// The header page this generation is written to.
    #[must_use]
    pub const fn slot(&self) -> PageId {
        self.generation % 2
    }

    /// Serialize the header to a page for its slot.
    ///
    /// Header pages do not carry the common page header; the magic takes
    /// the place of the page number.
    #[must_use]
    pub fn to_page(&self) -> Page {
        let mut page = Page::new(self.page_size as usize);
        page.write_bytes(offsets::MAGIC, &MAGIC);
        page.write_u32(offsets::FORMAT_VERSION, self.format_version);
        page.write_u32(offsets::PAGE_SIZE, self.page_size);
        page.write_u64(offsets::ROOT_TREE_PAGE, self.root_tree_page);
        page.write_u64(offsets::NEXT_PAGE, self.next_page);
        page.write_u64(offsets::GLOBAL_ETAG, self.global_etag);
        page.write_u64(offsets::GENERATION, self.generation);
        page.write_u64(offsets::SCHEMA_VERSION, self.schema_version);
        page.write_u64(offsets::CHECKSUM, compute_checksum(&page));
        page
    }

    /// Parse and verify a header from a page.
    pub fn from_page(page: &Page) -> Result<Self, HeaderError> {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(page.read_bytes(offsets::MAGIC, 8));
        if magic != MAGIC {
            return Err(HeaderError::InvalidMagic(magic));
        }

        let format_version = page.read_u32(offsets::FORMAT_VERSION);
        if format_version != FORMAT_VERSION {
            return Err(HeaderError::UnsupportedVersion(format_version));
        }

        let page_size = page.read_u32(offsets::PAGE_SIZE);
        if page_size as usize != page.size() {
            return Err(HeaderError::PageSizeMismatch {
                stored: page_size,
                actual: page.size() as u32,
            });
        }

        let stored = page.read_u64(offsets::CHECKSUM);
        let actual = compute_checksum(page);
        if stored != actual {
            return Err(HeaderError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }

        Ok(Self {
            format_version,
            page_size,
            root_tree_page: page.read_u64(offsets::ROOT_TREE_PAGE),
            next_page: page.read_u64(offsets::NEXT_PAGE),
            global_etag: page.read_u64(offsets::GLOBAL_ETAG),
            generation: page.read_u64(offsets::GENERATION),
            schema_version: page.read_u64(offsets::SCHEMA_VERSION),
        })
    }

    /// Load the most recent verified header from the two slots.
    ///
    /// Returns `Corrupt` when neither slot verifies.
    pub fn read_current(pager: &dyn Pager) -> Result<Self, HeaderError> {
        let mut best: Option<Self> = None;
        for slot in 0..2u64 {
            let page = match pager.read_page(slot) {
                Ok(page) => page,
                Err(e) => {
                    if slot == 0 {
                        return Err(HeaderError::Pager(e));
                    }
                    continue;
                }
            };
            if let Ok(header) = Self::from_page(&page) {
                let replace = best.is_none_or(|b| header.generation > b.generation);
                if replace {
                    best = Some(header);
                }
            }
        }
        best.ok_or(HeaderError::Corrupt)
    }
}

/// Checksum of a header page with the checksum field itself zeroed, widened
/// into the 64-bit on-disk field.
fn compute_checksum(page: &Page) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page.as_bytes()[..offsets::CHECKSUM]);
    hasher.update(&[0u8; 8]);
    hasher.update(&page.as_bytes()[offsets::CHECKSUM + 8..]);
    u64::from(hasher.finalize())
}

/// Errors raised while reading a file header.
#[derive(Debug)]
pub enum HeaderError {
    /// Invalid magic number.
    InvalidMagic([u8; 8]),
    /// Unsupported format version.
    UnsupportedVersion(u32),
    /// Stored page size does not match the environment's.
    PageSizeMismatch { stored: u32, actual: u32 },
    /// Checksum verification failed.
    ChecksumMismatch { expected: u64, actual: u64 },
    /// Neither header slot verifies.
    Corrupt,
    /// Pager failure while reading the slots.
    Pager(PagerError),
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic(magic) => {
                write!(f, "invalid magic: {:?}", String::from_utf8_lossy(magic))
            }
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::PageSizeMismatch { stored, actual } => {
                write!(f, "page size mismatch: stored {stored}, environment {actual}")
            }
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "header checksum mismatch: expected {expected}, got {actual}")
            }
            Self::Corrupt => write!(f, "no header slot verifies; store is corrupt"),
            Self::Pager(e) => write!(f, "pager error: {e}"),
        }
    }
}

impl std::error::Error for HeaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Pager(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PagerError> for HeaderError {
    fn from(e: PagerError) -> Self {
        Self::Pager(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::DEFAULT_PAGE_SIZE;
    use crate::storage::pager::{MemoryPager, Pager};

    #[test]
    fn test_header_roundtrip() {
        let mut header = FileHeader::new(DEFAULT_PAGE_SIZE as u32, 1);
        header.root_tree_page = 7;
        header.next_page = 99;
        header.global_etag = 1234;
        header.generation = 5;

        let page = header.to_page();
        let restored = FileHeader::from_page(&page).expect("should parse");
        assert_eq!(restored, header);
    }

    #[test]
    fn test_header_slot_alternates() {
        let mut header = FileHeader::new(DEFAULT_PAGE_SIZE as u32, 1);
        header.generation = 4;
        assert_eq!(header.slot(), 0);
        header.generation = 5;
        assert_eq!(header.slot(), 1);
    }

    #[test]
    fn test_checksum_rejects_corruption() {
        let header = FileHeader::new(DEFAULT_PAGE_SIZE as u32, 1);
        let mut page = header.to_page();
        // Flip a byte in the payload.
        let flipped = page.read_u64(24) ^ 1;
        page.write_u64(24, flipped);
        assert!(matches!(
            FileHeader::from_page(&page),
            Err(HeaderError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_read_current_prefers_higher_generation() {
        let pager = MemoryPager::new(DEFAULT_PAGE_SIZE, 0, u64::MAX);
        pager.ensure_continuous(0, 4).expect("grow");

        let mut old = FileHeader::new(DEFAULT_PAGE_SIZE as u32, 1);
        old.generation = 2;
        old.next_page = 10;
        pager.write_page(old.slot(), &old.to_page()).expect("write old");

        let mut newer = old;
        newer.generation = 3;
        newer.next_page = 20;
        pager
            .write_page(newer.slot(), &newer.to_page())
            .expect("write newer");

        let current = FileHeader::read_current(&pager).expect("read");
        assert_eq!(current.generation, 3);
        assert_eq!(current.next_page, 20);
    }

    #[test]
    fn test_read_current_falls_back_when_one_slot_corrupt() {
        let pager = MemoryPager::new(DEFAULT_PAGE_SIZE, 0, u64::MAX);
        pager.ensure_continuous(0, 4).expect("grow");

        let mut valid = FileHeader::new(DEFAULT_PAGE_SIZE as u32, 1);
        valid.generation = 2;
        pager
            .write_page(valid.slot(), &valid.to_page())
            .expect("write valid");

        // Slot 1 holds garbage.
        let mut junk = Page::new(DEFAULT_PAGE_SIZE);
        junk.write_bytes(0, b"garbage!");
        pager.write_page(1, &junk).expect("write junk");

        let current = FileHeader::read_current(&pager).expect("read");
        assert_eq!(current.generation, 2);
    }

    #[test]
    fn test_read_current_corrupt_when_no_slot_verifies() {
        let pager = MemoryPager::new(DEFAULT_PAGE_SIZE, 0, u64::MAX);
        pager.ensure_continuous(0, 4).expect("grow");
        assert!(matches!(
            FileHeader::read_current(&pager),
            Err(HeaderError::Corrupt)
        ));
    }
}
