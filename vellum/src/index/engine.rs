//! The per-index execution engine.
//!
//! Every index owns a storage environment of its own, holding a `stats`
//! tree (index type and definition), an `etags-map` tree (collection ->
//! last mapped document etag) and an `etags-tombstone` tree (collection ->
//! last processed tombstone etag). The search backend behind the index is
//! abstracted as [`IndexPersistence`]; the engine only drives it with
//! `write` and `delete` calls.
//!
//! A dedicated worker thread advances the index: it resets its change
//! signal, runs tombstone cleanup and then the map step for every bound
//! collection, and blocks on the signal until the store commits another
//! intersecting batch. Progress is persisted per batch, so a restart
//! resumes from the last committed cursor with no gaps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::docs::changes::ChangeSignal;
use crate::docs::document::Document;
use crate::docs::store::{DocumentStore, StoreError};
use crate::storage::btree::{Tree, TreeError};
use crate::storage::env::{EnvError, Environment};
use crate::storage::options::Options;
use crate::storage::transaction::TransactionError;

const STATS_TREE: &str = "stats";
const ETAGS_MAP_TREE: &str = "etags-map";
const ETAGS_TOMBSTONE_TREE: &str = "etags-tombstone";

/// Worker-local error type: boxed so backends can surface their own.
pub type PersistenceError = Box<dyn std::error::Error + Send + Sync>;

/// The search backend contract. The engine feeds it documents and deleted
/// keys; everything else about the backend's format is opaque.
pub trait IndexPersistence: Send + 'static {
    /// Index one document version.
    fn write(&mut self, document: &Document) -> Result<(), PersistenceError>;

    /// Remove every row previously produced for `key`.
    fn delete(&mut self, key: &str) -> Result<(), PersistenceError>;
}

/// What an index is and which collections feed it.
#[derive(Debug, Clone)]
pub struct IndexDefinition {
    pub name: String,
    pub collections: Vec<String>,
}

/// Batch and time budgets for the indexing loop.
#[derive(Debug, Clone, Copy)]
pub struct IndexingOptions {
    /// Documents or tombstones consumed per batch.
    pub batch_size: usize,
    /// Soft budget for one map batch; progress is committed on expiry.
    pub document_processing_timeout: Duration,
    /// Soft budget for one cleanup batch.
    pub tombstone_processing_timeout: Duration,
}

impl Default for IndexingOptions {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            document_processing_timeout: Duration::from_secs(5),
            tombstone_processing_timeout: Duration::from_secs(5),
        }
    }
}

/// A running index: its environment plus the worker advancing it.
///
/// Dropping the index cancels the worker, wakes it and joins it before the
/// environment is released.
pub struct Index {
    definition: IndexDefinition,
    env: Arc<Environment>,
    signal: Arc<ChangeSignal>,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Index {
    /// Open an index environment at `options`, persist its definition and
    /// start the worker against `store`.
    pub fn open(
        store: &Arc<DocumentStore>,
        options: Options,
        definition: IndexDefinition,
        persistence: Box<dyn IndexPersistence>,
        indexing: IndexingOptions,
    ) -> Result<Self, IndexError> {
        let env = Environment::open(options)?;

        let mut tx = env.begin_write()?;
        let mut stats = Tree::open_or_create(&mut tx, STATS_TREE)?;
        stats.add(&mut tx, b"type", b"map")?;
        stats.add(&mut tx, b"name", definition.name.as_bytes())?;
        stats.add(
            &mut tx,
            b"collections",
            definition.collections.join("\n").as_bytes(),
        )?;
        stats.save(&mut tx)?;
        Tree::open_or_create(&mut tx, ETAGS_MAP_TREE)?;
        Tree::open_or_create(&mut tx, ETAGS_TOMBSTONE_TREE)?;
        tx.commit()?;

        let signal = ChangeSignal::new();
        store.subscribe(Some(definition.collections.as_slice()), &signal);

        let cancel = Arc::new(AtomicBool::new(false));
        let context = WorkerContext {
            store: Arc::clone(store),
            env: Arc::clone(&env),
            definition: definition.clone(),
            persistence,
            options: indexing,
            signal: Arc::clone(&signal),
            cancel: Arc::clone(&cancel),
        };
        let worker = std::thread::Builder::new()
            .name(format!("index-{}", definition.name))
            .spawn(move || worker_loop(context))
            .map_err(IndexError::Spawn)?;

        Ok(Self {
            definition,
            env,
            signal,
            cancel,
            worker: Some(worker),
        })
    }

    /// The index definition.
    #[must_use]
    pub const fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    /// The last document etag mapped for a collection.
    pub fn last_mapped_etag(&self, collection: &str) -> Result<u64, IndexError> {
        read_cursor(&self.env, ETAGS_MAP_TREE, collection)
    }

    /// The last tombstone etag processed for a collection.
    pub fn last_tombstone_etag(&self, collection: &str) -> Result<u64, IndexError> {
        read_cursor(&self.env, ETAGS_TOMBSTONE_TREE, collection)
    }

    /// Whether the store holds documents or tombstones this index has not
    /// consumed yet. Reported as a flag, never as an error.
    pub fn is_stale(&self, store: &DocumentStore) -> Result<bool, IndexError> {
        for collection in &self.definition.collections {
            let mapped = read_cursor(&self.env, ETAGS_MAP_TREE, collection)?;
            if !store
                .documents_after(Some(collection.as_str()), mapped, 1)?
                .is_empty()
            {
                return Ok(true);
            }
            let tombstone = read_cursor(&self.env, ETAGS_TOMBSTONE_TREE, collection)?;
            if !store.tombstones_after(collection, tombstone, 1)?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        self.signal.set();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.definition.name)
            .finish_non_exhaustive()
    }
}

struct WorkerContext {
    store: Arc<DocumentStore>,
    env: Arc<Environment>,
    definition: IndexDefinition,
    persistence: Box<dyn IndexPersistence>,
    options: IndexingOptions,
    signal: Arc<ChangeSignal>,
    cancel: Arc<AtomicBool>,
}

fn worker_loop(mut context: WorkerContext) {
    tracing::debug!(index = %context.definition.name, "index worker started");
    let collections = context.definition.collections.clone();

    while !context.cancel.load(Ordering::Acquire) {
        context.signal.reset();
        let mut more_pending = false;

        for collection in &collections {
            if context.cancel.load(Ordering::Acquire) {
                break;
            }
            match cleanup_step(&mut context, collection) {
                Ok(progressed) => more_pending |= progressed,
                Err(IndexError::Cancelled) => break,
                Err(error) => {
                    // TODO: pick a retry/back-off policy for resource
                    // failures in the cleanup step.
                    tracing::warn!(
                        index = %context.definition.name,
                        collection,
                        %error,
                        "tombstone cleanup failed"
                    );
                }
            }
            match map_step(&mut context, collection) {
                Ok(progressed) => more_pending |= progressed,
                Err(IndexError::Cancelled) => break,
                Err(error) => {
                    // TODO: pick a retry/back-off policy for resource
                    // failures in the map step.
                    tracing::warn!(
                        index = %context.definition.name,
                        collection,
                        %error,
                        "map step failed"
                    );
                }
            }
        }

        if more_pending {
            context.signal.set();
        }
        loop {
            if context.cancel.load(Ordering::Acquire) {
                tracing::debug!(index = %context.definition.name, "index worker stopped");
                return;
            }
            if context.signal.wait_timeout(Duration::from_millis(100)) {
                break;
            }
        }
    }
    tracing::debug!(index = %context.definition.name, "index worker stopped");
}

/// Map documents of one collection past the last mapped etag.
///
/// Per-document backend failures are logged and skipped; the cursor still
/// advances so one poison document cannot stall the index.
fn map_step(context: &mut WorkerContext, collection: &str) -> Result<bool, IndexError> {
    if context.cancel.load(Ordering::Acquire) {
        return Err(IndexError::Cancelled);
    }
    let last_mapped = read_cursor(&context.env, ETAGS_MAP_TREE, collection)?;
    let documents = context.store.documents_after(
        Some(collection),
        last_mapped,
        context.options.batch_size,
    )?;
    if documents.is_empty() {
        return Ok(false);
    }

    let started = Instant::now();
    let mut cursor = last_mapped;
    let mut count = 0usize;
    for document in &documents {
        if context.cancel.load(Ordering::Acquire) {
            break;
        }
        if let Err(error) = context.persistence.write(document) {
            tracing::warn!(
                index = %context.definition.name,
                key = %document.key,
                %error,
                "indexing a document failed; skipping it"
            );
        }
        cursor = document.etag;
        count += 1;
        if started.elapsed() > context.options.document_processing_timeout {
            break;
        }
    }

    if cursor > last_mapped {
        write_cursor(&context.env, ETAGS_MAP_TREE, collection, cursor)?;
    }
    Ok(count > 0)
}

/// Process tombstones of one collection past the last processed etag.
///
/// Tombstones whose `deleted_etag` was never mapped are skipped: the index
/// holds no rows for them.
fn cleanup_step(context: &mut WorkerContext, collection: &str) -> Result<bool, IndexError> {
    if context.cancel.load(Ordering::Acquire) {
        return Err(IndexError::Cancelled);
    }
    let last_tombstone = read_cursor(&context.env, ETAGS_TOMBSTONE_TREE, collection)?;
    let last_mapped = read_cursor(&context.env, ETAGS_MAP_TREE, collection)?;
    let tombstones = context.store.tombstones_after(
        collection,
        last_tombstone,
        context.options.batch_size,
    )?;
    if tombstones.is_empty() {
        return Ok(false);
    }

    let started = Instant::now();
    let mut cursor = last_tombstone;
    let mut count = 0usize;
    for tombstone in &tombstones {
        if context.cancel.load(Ordering::Acquire) {
            break;
        }
        if tombstone.deleted_etag <= last_mapped {
            if let Err(error) = context.persistence.delete(&tombstone.key) {
                tracing::warn!(
                    index = %context.definition.name,
                    key = %tombstone.key,
                    %error,
                    "removing an indexed document failed; skipping it"
                );
            }
        }
        cursor = tombstone.etag;
        count += 1;
        if started.elapsed() > context.options.tombstone_processing_timeout {
            break;
        }
    }

    if cursor > last_tombstone {
        write_cursor(&context.env, ETAGS_TOMBSTONE_TREE, collection, cursor)?;
    }
    Ok(count > 0)
}

fn read_cursor(env: &Environment, tree_name: &str, collection: &str) -> Result<u64, IndexError> {
    let read = env.begin_read()?;
    let Some(tree) = Tree::open(&read, tree_name)? else {
        return Ok(0);
    };
    let Some(bytes) = tree.read(&read, collection.to_lowercase().as_bytes())? else {
        return Ok(0);
    };
    if bytes.len() != 8 {
        return Ok(0);
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes);
    Ok(u64::from_le_bytes(buf))
}

fn write_cursor(
    env: &Environment,
    tree_name: &str,
    collection: &str,
    etag: u64,
) -> Result<(), IndexError> {
    let mut tx = env.begin_write()?;
    let mut tree = Tree::open_or_create(&mut tx, tree_name)?;
    tree.add(
        &mut tx,
        collection.to_lowercase().as_bytes(),
        &etag.to_le_bytes(),
    )?;
    tree.save(&mut tx)?;
    tx.commit()?;
    Ok(())
}

/// Errors raised by the indexing engine.
#[derive(Debug)]
pub enum IndexError {
    /// Index environment failure.
    Env(EnvError),
    /// Transaction failure in the index environment.
    Transaction(TransactionError),
    /// Tree failure in the index environment.
    Tree(TreeError),
    /// Document store failure while feeding the index.
    Store(StoreError),
    /// Worker thread could not be spawned.
    Spawn(std::io::Error),
    /// The operation was cancelled.
    Cancelled,
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env(e) => write!(f, "environment error: {e}"),
            Self::Transaction(e) => write!(f, "transaction error: {e}"),
            Self::Tree(e) => write!(f, "tree error: {e}"),
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Spawn(e) => write!(f, "failed to spawn index worker: {e}"),
            Self::Cancelled => write!(f, "index operation cancelled"),
        }
    }
}

impl std::error::Error for IndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Env(e) => Some(e),
            Self::Transaction(e) => Some(e),
            Self::Tree(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Spawn(e) => Some(e),
            Self::Cancelled => None,
        }
    }
}

impl From<EnvError> for IndexError {
    fn from(e: EnvError) -> Self {
        Self::Env(e)
    }
}

impl From<TransactionError> for IndexError {
    fn from(e: TransactionError) -> Self {
        Self::Transaction(e)
    }
}

impl From<TreeError> for IndexError {
    fn from(e: TreeError) -> Self {
        Self::Tree(e)
    }
}

impl From<StoreError> for IndexError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}
