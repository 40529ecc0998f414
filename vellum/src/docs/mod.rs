//! Documents over the page store.
//!
//! Keys are case-insensitive for identity and case-preserving on read;
//! every write or delete advances the store-wide etag, which doubles as
//! the cursor for change feeds. Deletes leave tombstones behind so
//! incremental consumers can observe them.

pub mod changes;
pub mod data;
pub mod document;
pub mod store;

pub use changes::{ChangeBus, ChangeKind, ChangeSignal, DocumentChange};
pub use data::{DataError, ObjectBuilder, ObjectData, ObjectView, Value};
pub use document::{COLLECTION_FIELD, Document, METADATA_FIELD, Tombstone};
pub use store::{DocumentStore, PutResult, StoreError};
