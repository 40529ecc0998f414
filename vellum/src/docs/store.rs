//! The document store.
//!
//! Documents live in a handful of trees inside one environment:
//!
//! - `docs`: normalized key -> document record
//! - `etags`: big-endian etag -> normalized key (the global feed)
//! - `collections/<name>/etags`: per-collection feed
//! - `collections/<name>/tombstones`: big-endian etag -> tombstone record
//! - `tombstones-by-key`: normalized key -> (collection, etag) of a delete
//!   tombstone, so writing the key again retires it
//! - `collections`: normalized collection name -> original casing
//!
//! Every write runs in its own write transaction; etags are assigned from
//! the header counter, so they are strictly increasing and contiguous
//! across commits. Keys compare case-insensitively while reads return the
//! casing that was stored.

use std::sync::{Arc, Mutex};

use crate::docs::changes::{ChangeBus, ChangeKind, ChangeSignal, DocumentChange};
use crate::docs::data::{DataError, ObjectData};
use crate::docs::document::{Document, Tombstone, now_millis};
use crate::storage::btree::{Tree, TreeError};
use crate::storage::env::{EnvError, EnvInfo, Environment};
use crate::storage::options::Options;
use crate::storage::transaction::TransactionError;

const DOCS_TREE: &str = "docs";
const ETAGS_TREE: &str = "etags";
const COLLECTIONS_TREE: &str = "collections";
const TOMBSTONES_BY_KEY_TREE: &str = "tombstones-by-key";

fn collection_etags_tree(collection: &str) -> String {
    format!("collections/{collection}/etags")
}

fn collection_tombstones_tree(collection: &str) -> String {
    format!("collections/{collection}/tombstones")
}

fn etag_key(etag: u64) -> [u8; 8] {
    etag.to_be_bytes()
}

/// The outcome of a successful put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    /// The key as stored.
    pub key: String,
    /// The assigned etag.
    pub etag: u64,
}

/// A collection-scoped, etag-ordered document store over one environment.
pub struct DocumentStore {
    env: Arc<Environment>,
    changes: ChangeBus,
    /// Keeps commit order and notification order identical.
    write_order: Mutex<()>,
}

impl DocumentStore {
    /// Open a store, creating it when the backing region is empty.
    pub fn open(options: Options) -> Result<Arc<Self>, StoreError> {
        let env = Environment::open(options)?;
        Ok(Arc::new(Self {
            env,
            changes: ChangeBus::new(),
            write_order: Mutex::new(()),
        }))
    }

    /// The underlying environment.
    #[must_use]
    pub const fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Register a change listener scoped to `collections` (or all changes).
    pub fn subscribe(&self, collections: Option<&[String]>, signal: &Arc<ChangeSignal>) {
        self.changes.subscribe(collections, signal);
    }

    /// The last assigned etag.
    #[must_use]
    pub fn last_etag(&self) -> u64 {
        self.env.global_etag()
    }

    /// Bookkeeping counters of the environment.
    #[must_use]
    pub fn info(&self) -> EnvInfo {
        self.env.info()
    }

    /// Insert or update a document.
    ///
    /// `expected_etag` of `Some(0)` asserts the key must not exist; any
    /// other `Some` must match the stored etag. The collection is read from
    /// the body's metadata, and a collection change writes a tombstone
    /// against the old collection so its indexes observe a delete.
    #[allow(clippy::expect_used)] // lock poisoning indicates unrecoverable state
    #[allow(clippy::too_many_lines)]
    pub fn put(
        &self,
        key: &str,
        expected_etag: Option<u64>,
        data: ObjectData,
    ) -> Result<PutResult, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey);
        }
        let normalized = key.to_lowercase();
        let _order = self.write_order.lock().expect("lock poisoned");
        let mut tx = self.env.begin_write()?;

        let mut docs = Tree::open_or_create(&mut tx, DOCS_TREE)?;
        let mut etags = Tree::open_or_create(&mut tx, ETAGS_TREE)?;
        let mut by_key = Tree::open_or_create(&mut tx, TOMBSTONES_BY_KEY_TREE)?;

        let prior = docs
            .read(&tx, normalized.as_bytes())?
            .map(|bytes| Document::from_bytes(&bytes))
            .transpose()?;
        check_expected_etag(key, expected_etag, prior.as_ref().map(|d| d.etag))?;

        let etag = tx.next_etag();
        let collection = Document::collection_of(&data);
        let collection_lower = collection.as_ref().map(|name| name.to_lowercase());
        let mut batch = Vec::new();

        if let Some(prior) = &prior {
            etags.delete(&mut tx, &etag_key(prior.etag))?;
            if let Some(prior_collection) = &prior.collection {
                let prior_lower = prior_collection.to_lowercase();
                let mut prior_feed =
                    Tree::open_or_create(&mut tx, &collection_etags_tree(&prior_lower))?;
                prior_feed.delete(&mut tx, &etag_key(prior.etag))?;
                prior_feed.save(&mut tx)?;

                if collection_lower.as_deref() != Some(prior_lower.as_str()) {
                    // The document moved out of its collection; indexes
                    // bound to the old one must see a delete.
                    let tombstone = Tombstone {
                        key: prior.key.clone(),
                        etag,
                        deleted_etag: prior.etag,
                        collection: prior_collection.clone(),
                    };
                    let mut graveyard =
                        Tree::open_or_create(&mut tx, &collection_tombstones_tree(&prior_lower))?;
                    graveyard.add(&mut tx, &etag_key(etag), &tombstone.to_bytes())?;
                    graveyard.save(&mut tx)?;
                    batch.push(DocumentChange {
                        key: prior.key.clone(),
                        collection: Some(prior_collection.clone()),
                        etag,
                        kind: ChangeKind::Delete,
                    });
                }
            }
        } else if let Some(reference) = by_key.read(&tx, normalized.as_bytes())? {
            // The key was previously deleted; retire its tombstone.
            let (tombstone_collection, tombstone_etag) = decode_tombstone_ref(&reference)?;
            let mut graveyard = Tree::open_or_create(
                &mut tx,
                &collection_tombstones_tree(&tombstone_collection),
            )?;
            graveyard.delete(&mut tx, &etag_key(tombstone_etag))?;
            graveyard.save(&mut tx)?;
            by_key.delete(&mut tx, normalized.as_bytes())?;
        }

        let document = Document {
            key: key.to_string(),
            etag,
            last_modified: now_millis(),
            collection: collection.clone(),
            data,
        };
        docs.add(&mut tx, normalized.as_bytes(), &document.to_bytes())?;
        etags.add(&mut tx, &etag_key(etag), normalized.as_bytes())?;
        if let (Some(collection), Some(lower)) = (&collection, &collection_lower) {
            let mut feed = Tree::open_or_create(&mut tx, &collection_etags_tree(lower))?;
            feed.add(&mut tx, &etag_key(etag), normalized.as_bytes())?;
            feed.save(&mut tx)?;
            let mut names = Tree::open_or_create(&mut tx, COLLECTIONS_TREE)?;
            names.add(&mut tx, lower.as_bytes(), collection.as_bytes())?;
            names.save(&mut tx)?;
        }

        docs.save(&mut tx)?;
        etags.save(&mut tx)?;
        by_key.save(&mut tx)?;
        tx.commit()?;

        batch.push(DocumentChange {
            key: key.to_string(),
            collection,
            etag,
            kind: ChangeKind::Put,
        });
        self.changes.publish(&batch);

        Ok(PutResult {
            key: key.to_string(),
            etag,
        })
    }

    /// Delete a document, writing a tombstone against its collection.
    ///
    /// Returns the deletion etag, or `None` when the key does not exist.
    #[allow(clippy::expect_used)] // lock poisoning indicates unrecoverable state
    pub fn delete(&self, key: &str, expected_etag: Option<u64>) -> Result<Option<u64>, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey);
        }
        let normalized = key.to_lowercase();
        let _order = self.write_order.lock().expect("lock poisoned");
        let mut tx = self.env.begin_write()?;

        let mut docs = Tree::open_or_create(&mut tx, DOCS_TREE)?;
        let mut etags = Tree::open_or_create(&mut tx, ETAGS_TREE)?;
        let mut by_key = Tree::open_or_create(&mut tx, TOMBSTONES_BY_KEY_TREE)?;

        let prior = docs
            .read(&tx, normalized.as_bytes())?
            .map(|bytes| Document::from_bytes(&bytes))
            .transpose()?;
        let Some(prior) = prior else {
            check_expected_etag(key, expected_etag, None)?;
            return Ok(None);
        };
        check_expected_etag(key, expected_etag, Some(prior.etag))?;

        let etag = tx.next_etag();
        docs.delete(&mut tx, normalized.as_bytes())?;
        etags.delete(&mut tx, &etag_key(prior.etag))?;

        if let Some(collection) = &prior.collection {
            let lower = collection.to_lowercase();
            let mut feed = Tree::open_or_create(&mut tx, &collection_etags_tree(&lower))?;
            feed.delete(&mut tx, &etag_key(prior.etag))?;
            feed.save(&mut tx)?;

            let tombstone = Tombstone {
                key: prior.key.clone(),
                etag,
                deleted_etag: prior.etag,
                collection: collection.clone(),
            };
            let mut graveyard =
                Tree::open_or_create(&mut tx, &collection_tombstones_tree(&lower))?;
            graveyard.add(&mut tx, &etag_key(etag), &tombstone.to_bytes())?;
            graveyard.save(&mut tx)?;
            by_key.add(
                &mut tx,
                normalized.as_bytes(),
                &encode_tombstone_ref(&lower, etag),
            )?;
        }

        docs.save(&mut tx)?;
        etags.save(&mut tx)?;
        by_key.save(&mut tx)?;
        tx.commit()?;

        self.changes.publish(&[DocumentChange {
            key: prior.key,
            collection: prior.collection,
            etag,
            kind: ChangeKind::Delete,
        }]);
        Ok(Some(etag))
    }

    /// Fetch a document by key, case-insensitively.
    pub fn get(&self, key: &str) -> Result<Option<Document>, StoreError> {
        let normalized = key.to_lowercase();
        let read = self.env.begin_read()?;
        let Some(docs) = Tree::open(&read, DOCS_TREE)? else {
            return Ok(None);
        };
        docs.read(&read, normalized.as_bytes())?
            .map(|bytes| Document::from_bytes(&bytes).map_err(StoreError::from))
            .transpose()
    }

    /// Documents with etag greater than `etag`, in etag order.
    ///
    /// With a collection the scan runs over that collection's feed;
    /// without one it runs over the global feed.
    pub fn documents_after(
        &self,
        collection: Option<&str>,
        etag: u64,
        take: usize,
    ) -> Result<Vec<Document>, StoreError> {
        let read = self.env.begin_read()?;
        let feed_name = collection.map_or_else(
            || ETAGS_TREE.to_string(),
            |name| collection_etags_tree(&name.to_lowercase()),
        );
        let Some(feed) = Tree::open(&read, &feed_name)? else {
            return Ok(Vec::new());
        };
        let Some(docs) = Tree::open(&read, DOCS_TREE)? else {
            return Ok(Vec::new());
        };

        let mut iter = feed.seek(&read, &etag_key(etag.saturating_add(1)))?;
        let mut documents = Vec::new();
        while documents.len() < take {
            let Some((_, normalized)) = iter.next_entry()? else {
                break;
            };
            if let Some(bytes) = docs.read(&read, &normalized)? {
                documents.push(Document::from_bytes(&bytes)?);
            }
        }
        Ok(documents)
    }

    /// Tombstones of a collection with etag greater than `etag`.
    pub fn tombstones_after(
        &self,
        collection: &str,
        etag: u64,
        take: usize,
    ) -> Result<Vec<Tombstone>, StoreError> {
        let read = self.env.begin_read()?;
        let tree_name = collection_tombstones_tree(&collection.to_lowercase());
        let Some(graveyard) = Tree::open(&read, &tree_name)? else {
            return Ok(Vec::new());
        };
        let mut iter = graveyard.seek(&read, &etag_key(etag.saturating_add(1)))?;
        let mut tombstones = Vec::new();
        while tombstones.len() < take {
            let Some((_, bytes)) = iter.next_entry()? else {
                break;
            };
            tombstones.push(Tombstone::from_bytes(&bytes)?);
        }
        Ok(tombstones)
    }

    /// Number of live documents.
    pub fn document_count(&self) -> Result<u64, StoreError> {
        let read = self.env.begin_read()?;
        Ok(Tree::open(&read, DOCS_TREE)?.map_or(0, |docs| docs.state().entries))
    }

    /// Collection names seen by this store, with their original casing.
    pub fn collections(&self) -> Result<Vec<String>, StoreError> {
        let read = self.env.begin_read()?;
        let Some(names) = Tree::open(&read, COLLECTIONS_TREE)? else {
            return Ok(Vec::new());
        };
        let mut iter = names.iter(&read)?;
        let mut collections = Vec::new();
        while let Some((_, original)) = iter.next_entry()? {
            collections
                .push(String::from_utf8(original).map_err(|_| DataError::InvalidUtf8)?);
        }
        Ok(collections)
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore").finish_non_exhaustive()
    }
}

fn check_expected_etag(
    key: &str,
    expected: Option<u64>,
    actual: Option<u64>,
) -> Result<(), StoreError> {
    match expected {
        None => Ok(()),
        Some(0) => {
            if let Some(actual) = actual {
                return Err(StoreError::ConcurrencyConflict {
                    key: key.to_string(),
                    expected: 0,
                    actual: Some(actual),
                });
            }
            Ok(())
        }
        Some(expected) => {
            if actual == Some(expected) {
                Ok(())
            } else {
                Err(StoreError::ConcurrencyConflict {
                    key: key.to_string(),
                    expected,
                    actual,
                })
            }
        }
    }
}

fn encode_tombstone_ref(collection_lower: &str, etag: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + collection_lower.len());
    bytes.extend_from_slice(&etag.to_le_bytes());
    bytes.extend_from_slice(collection_lower.as_bytes());
    bytes
}

fn decode_tombstone_ref(bytes: &[u8]) -> Result<(String, u64), StoreError> {
    if bytes.len() < 8 {
        return Err(StoreError::InvalidData(DataError::Truncated));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    let collection = String::from_utf8(bytes[8..].to_vec())
        .map_err(|_| StoreError::InvalidData(DataError::InvalidUtf8))?;
    Ok((collection, u64::from_le_bytes(buf)))
}

/// Errors raised by document operations.
#[derive(Debug)]
pub enum StoreError {
    /// Environment failure.
    Env(EnvError),
    /// Transaction failure.
    Transaction(TransactionError),
    /// Tree failure.
    Tree(TreeError),
    /// Optimistic concurrency check failed; the stored document is
    /// unchanged.
    ConcurrencyConflict {
        key: String,
        expected: u64,
        actual: Option<u64>,
    },
    /// A stored record or document body does not parse.
    InvalidData(DataError),
    /// Empty document key.
    InvalidKey,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env(e) => write!(f, "environment error: {e}"),
            Self::Transaction(e) => write!(f, "transaction error: {e}"),
            Self::Tree(e) => write!(f, "tree error: {e}"),
            Self::ConcurrencyConflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "concurrency conflict on '{key}': expected etag {expected}, actual {actual:?}"
            ),
            Self::InvalidData(e) => write!(f, "invalid document data: {e}"),
            Self::InvalidKey => write!(f, "document key must not be empty"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Env(e) => Some(e),
            Self::Transaction(e) => Some(e),
            Self::Tree(e) => Some(e),
            Self::InvalidData(e) => Some(e),
            Self::ConcurrencyConflict { .. } | Self::InvalidKey => None,
        }
    }
}

impl From<EnvError> for StoreError {
    fn from(e: EnvError) -> Self {
        Self::Env(e)
    }
}

impl From<TransactionError> for StoreError {
    fn from(e: TransactionError) -> Self {
        Self::Transaction(e)
    }
}

impl From<TreeError> for StoreError {
    fn from(e: TreeError) -> Self {
        Self::Tree(e)
    }
}

impl From<DataError> for StoreError {
    fn from(e: DataError) -> Self {
        Self::InvalidData(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs::data::ObjectBuilder;
    use crate::docs::document::{COLLECTION_FIELD, METADATA_FIELD};

    fn store() -> Arc<DocumentStore> {
        DocumentStore::open(Options::memory()).expect("open")
    }

    fn body(name: &str, collection: &str) -> ObjectData {
        ObjectBuilder::new()
            .with_string("Name", name)
            .with_object(
                METADATA_FIELD,
                ObjectBuilder::new().with_string(COLLECTION_FIELD, collection),
            )
            .build()
    }

    #[test]
    fn test_put_get_roundtrip() {
        let store = store();
        let result = store
            .put("users/1", None, body("Oren", "Users"))
            .expect("put");
        assert_eq!(result.etag, 1);

        let document = store.get("users/1").expect("get").expect("exists");
        assert_eq!(document.key, "users/1");
        assert_eq!(document.etag, 1);
        assert_eq!(document.collection, Some("Users".to_string()));
        assert_eq!(
            document.data.try_get("Name").and_then(|v| v.as_str()),
            Some("Oren")
        );
        assert!(document.last_modified > 0);

        let feed = store.documents_after(Some("Users"), 0, 10).expect("feed");
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].key, "users/1");
    }

    #[test]
    fn test_feeds_follow_global_and_collection_order() {
        let store = store();
        store.put("users/1", None, body("Oren", "Users")).expect("put");
        store.put("users/2", None, body("Ayende", "Users")).expect("put");
        store.put("pets/1", None, body("Arava", "Dogs")).expect("put");

        let global = store.documents_after(None, 0, 10).expect("global");
        let names: Vec<_> = global
            .iter()
            .map(|d| d.data.try_get("Name").and_then(|v| v.as_str()).map(ToString::to_string))
            .collect();
        assert_eq!(
            names,
            vec![
                Some("Oren".to_string()),
                Some("Ayende".to_string()),
                Some("Arava".to_string())
            ]
        );

        let users = store.documents_after(Some("Users"), 0, 10).expect("users");
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].key, "users/1");
        assert_eq!(users[1].key, "users/2");

        // Resuming after an etag skips what was already seen.
        let rest = store
            .documents_after(None, global[1].etag, 10)
            .expect("rest");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].key, "pets/1");
    }

    #[test]
    fn test_key_identity_is_case_insensitive_and_case_preserving() {
        let store = store();
        store.put("USERs/1", None, body("X", "Users")).expect("put");

        let document = store.get("users/1").expect("get").expect("exists");
        assert_eq!(document.key, "USERs/1");

        // Same identity: a second put replaces rather than inserts.
        store.put("users/1", None, body("Y", "Users")).expect("put");
        assert_eq!(store.document_count().expect("count"), 1);
        let document = store.get("USERS/1").expect("get").expect("exists");
        assert_eq!(document.key, "users/1");
        assert_eq!(
            document.data.try_get("Name").and_then(|v| v.as_str()),
            Some("Y")
        );
    }

    #[test]
    fn test_concurrency_conflict_leaves_document_unchanged() {
        let store = store();
        let result = store.put("k", None, body("A", "Users")).expect("put");

        let error = store
            .put("k", Some(result.etag - 1), body("B", "Users"))
            .expect_err("conflict");
        assert!(matches!(error, StoreError::ConcurrencyConflict { .. }));

        let document = store.get("k").expect("get").expect("exists");
        assert_eq!(
            document.data.try_get("Name").and_then(|v| v.as_str()),
            Some("A")
        );
        assert_eq!(document.etag, result.etag);

        // Matching expectation succeeds.
        store
            .put("k", Some(result.etag), body("B", "Users"))
            .expect("put");

        // Must-not-exist fails for a live key.
        let error = store.put("k", Some(0), body("C", "Users")).expect_err("conflict");
        assert!(matches!(error, StoreError::ConcurrencyConflict { .. }));
    }

    #[test]
    fn test_delete_writes_tombstone_and_removes_document() {
        let store = store();
        let put = store.put("users/1", None, body("Oren", "Users")).expect("put");
        let deleted = store.delete("users/1", None).expect("delete").expect("existed");
        assert_eq!(deleted, put.etag + 1);

        assert!(store.get("users/1").expect("get").is_none());
        assert!(store.documents_after(Some("Users"), 0, 10).expect("feed").is_empty());

        let tombstones = store.tombstones_after("Users", 0, 10).expect("tombstones");
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].key, "users/1");
        assert_eq!(tombstones[0].deleted_etag, put.etag);
        assert_eq!(tombstones[0].etag, deleted);

        // Deleting again is a no-op.
        assert!(store.delete("users/1", None).expect("delete").is_none());
    }

    #[test]
    fn test_reput_retires_delete_tombstone() {
        let store = store();
        store.put("users/1", None, body("Oren", "Users")).expect("put");
        store.delete("users/1", None).expect("delete");
        assert_eq!(store.tombstones_after("Users", 0, 10).expect("t").len(), 1);

        store.put("users/1", None, body("Oren", "Users")).expect("put");
        assert!(store.tombstones_after("Users", 0, 10).expect("t").is_empty());
    }

    #[test]
    fn test_collection_change_tombstones_old_collection() {
        let store = store();
        store.put("users/1", None, body("Oren", "Users")).expect("put");
        let moved = store.put("users/1", None, body("Oren", "People")).expect("put");

        let users_tombstones = store.tombstones_after("Users", 0, 10).expect("t");
        assert_eq!(users_tombstones.len(), 1);
        assert_eq!(users_tombstones[0].key, "users/1");
        assert_eq!(users_tombstones[0].etag, moved.etag);

        let users_feed = store.documents_after(Some("Users"), 0, 10).expect("feed");
        assert!(users_feed.is_empty());
        let people_feed = store.documents_after(Some("People"), 0, 10).expect("feed");
        assert_eq!(people_feed.len(), 1);
    }

    #[test]
    fn test_etags_strictly_increase_across_writes_and_deletes() {
        let store = store();
        let mut last = 0;
        for index in 0..5 {
            let result = store
                .put(&format!("doc/{index}"), None, body("N", "Docs"))
                .expect("put");
            assert_eq!(result.etag, last + 1);
            last = result.etag;
        }
        let deleted = store.delete("doc/0", None).expect("delete").expect("existed");
        assert_eq!(deleted, last + 1);
        assert_eq!(store.last_etag(), deleted);
    }

    #[test]
    fn test_update_moves_document_to_new_etag_position() {
        let store = store();
        store.put("a", None, body("A", "Users")).expect("put");
        store.put("b", None, body("B", "Users")).expect("put");
        store.put("a", None, body("A2", "Users")).expect("put");

        let feed = store.documents_after(Some("Users"), 0, 10).expect("feed");
        assert_eq!(feed.len(), 2);
        assert_eq!(feed[0].key, "b");
        assert_eq!(feed[1].key, "a");
        assert_eq!(
            feed[1].data.try_get("Name").and_then(|v| v.as_str()),
            Some("A2")
        );
    }

    #[test]
    fn test_collections_listing() {
        let store = store();
        store.put("u/1", None, body("A", "Users")).expect("put");
        store.put("d/1", None, body("B", "Dogs")).expect("put");
        store.put("u/2", None, body("C", "Users")).expect("put");

        let mut collections = store.collections().expect("collections");
        collections.sort();
        assert_eq!(collections, vec!["Dogs".to_string(), "Users".to_string()]);
    }

    #[test]
    fn test_change_notifications_follow_commits() {
        let store = store();
        let signal = ChangeSignal::new();
        let filter = vec!["Users".to_string()];
        store.subscribe(Some(filter.as_slice()), &signal);

        store.put("d/1", None, body("A", "Dogs")).expect("put");
        assert!(!signal.is_set());

        store.put("u/1", None, body("B", "Users")).expect("put");
        assert!(signal.is_set());

        signal.reset();
        store.delete("u/1", None).expect("delete");
        assert!(signal.is_set());
    }

    #[test]
    fn test_documents_without_collection_only_in_global_feed() {
        let store = store();
        let data = ObjectBuilder::new().with_string("Name", "loose").build();
        store.put("loose/1", None, data).expect("put");

        let global = store.documents_after(None, 0, 10).expect("global");
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].collection, None);
        assert!(store.collections().expect("collections").is_empty());
    }

    #[test]
    fn test_store_reopens_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("docs.vellum");

        {
            let store = DocumentStore::open(Options::file(&path)).expect("open");
            store.put("users/1", None, body("Oren", "Users")).expect("put");
            store.put("users/2", None, body("Ayende", "Users")).expect("put");
            store.delete("users/2", None).expect("delete");
        }

        {
            let store = DocumentStore::open(Options::file(&path)).expect("reopen");
            assert_eq!(store.last_etag(), 3);
            let document = store.get("users/1").expect("get").expect("exists");
            assert_eq!(document.etag, 1);
            let tombstones = store.tombstones_after("Users", 0, 10).expect("t");
            assert_eq!(tombstones.len(), 1);
            // Etags continue from the persisted counter.
            let result = store.put("users/3", None, body("New", "Users")).expect("put");
            assert_eq!(result.etag, 4);
        }
    }
}
