#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
//! vellum: an embedded, single-file, transactional document store.
//!
//! The crate is layered bottom-up:
//!
//! - [`storage`]: the pager over a growable page region, the free-space
//!   section bitmaps, single-writer/many-reader transactions with
//!   copy-on-write pages, and the B+-tree with overflow runs.
//! - [`docs`]: documents over trees, with case-insensitive keys, etag
//!   feeds, tombstones and change notifications.
//! - [`index`]: per-index environments and the background map/cleanup
//!   loop consuming the document feeds.
//!
//! A caller opens a [`docs::DocumentStore`] (file-backed or memory-only),
//! writes documents carrying their collection in `@metadata`, and reads
//! them back directly or through the etag-ordered feeds that also drive
//! indexes.

pub mod docs;
pub mod index;
pub mod storage;

pub use docs::{Document, DocumentStore, ObjectBuilder, ObjectData, StoreError, Tombstone};
pub use index::{Index, IndexDefinition, IndexPersistence, IndexingOptions};
pub use storage::{Environment, Options};
