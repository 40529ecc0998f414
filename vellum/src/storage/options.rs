//! Environment creation options.

use std::path::PathBuf;

use crate::storage::page::DEFAULT_PAGE_SIZE;
use crate::storage::pager::DEFAULT_MAX_INCREMENT_PAGES;

/// Options fixed at environment creation.
///
/// The page size is immutable for the lifetime of a store file; reopening
/// with a different size fails.
#[derive(Debug, Clone)]
pub struct Options {
    /// Backing file path, or `None` for a memory-only environment.
    pub path: Option<PathBuf>,
    /// Page size in bytes; 4096 or 8192.
    pub page_size: usize,
    /// Caller schema version stamped into the header.
    pub schema_version: u64,
    /// Floor for the adaptive growth increment, in bytes.
    /// Defaults to `16 * page_size`.
    pub min_increase_size: Option<u64>,
    /// Cap for the adaptive growth increment, in bytes.
    /// Defaults to `262144 * page_size`.
    pub max_increase_size: Option<u64>,
}

impl Options {
    /// Options for a memory-only environment.
    #[must_use]
    pub const fn memory() -> Self {
        Self {
            path: None,
            page_size: DEFAULT_PAGE_SIZE,
            schema_version: 1,
            min_increase_size: None,
            max_increase_size: None,
        }
    }

    /// Options for a file-backed environment at `path`.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::memory()
        }
    }

    /// Effective growth floor in bytes.
    #[must_use]
    pub fn min_increase(&self) -> u64 {
        self.min_increase_size
            .unwrap_or(16 * self.page_size as u64)
    }

    /// Effective growth cap in bytes.
    #[must_use]
    pub fn max_increase(&self) -> u64 {
        self.max_increase_size
            .unwrap_or(DEFAULT_MAX_INCREMENT_PAGES * self.page_size as u64)
    }

    /// Validate option consistency.
    pub const fn validate(&self) -> Result<(), &'static str> {
        if self.page_size != 4096 && self.page_size != 8192 {
            return Err("page_size must be 4096 or 8192");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::memory();
        assert!(options.validate().is_ok());
        assert_eq!(options.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(options.min_increase(), 16 * 4096);
        assert_eq!(options.max_increase(), 262_144 * 4096);
    }

    #[test]
    fn test_rejects_odd_page_size() {
        let mut options = Options::memory();
        options.page_size = 1000;
        assert!(options.validate().is_err());
    }
}
