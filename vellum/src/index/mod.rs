//! Incremental, map-only indexing driven by document etags.
//!
//! Indexes consume the store's etag feeds: the map step walks documents
//! past the last mapped etag, the cleanup step walks tombstones, and both
//! commit their cursor into the index's own environment so progress is
//! monotonic with no gaps.

pub mod engine;

pub use engine::{
    Index, IndexDefinition, IndexError, IndexPersistence, IndexingOptions, PersistenceError,
};
