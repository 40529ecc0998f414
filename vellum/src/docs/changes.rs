//! Document change notifications.
//!
//! Commits publish a batch of [`DocumentChange`] records after the header
//! swap. Listeners register a [`ChangeSignal`] scoped to the collections
//! they care about; the bus sets the signal when a batch intersects them.
//! Workers block on the signal between batches and reset it before
//! scanning, so a change arriving mid-scan re-wakes them.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

/// What happened to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Put,
    Delete,
}

/// One document change within a committed batch.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    /// The document key, original casing.
    pub key: String,
    /// The collection the change applies to, if any.
    pub collection: Option<String>,
    /// The etag assigned by the committing transaction.
    pub etag: u64,
    /// Put or delete.
    pub kind: ChangeKind,
}

/// A resettable, condvar-backed event.
pub struct ChangeSignal {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl ChangeSignal {
    /// A new, unset signal.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }

    /// Set the signal and wake all waiters.
    #[allow(clippy::expect_used)] // lock poisoning indicates unrecoverable state
    pub fn set(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        *state = true;
        drop(state);
        self.condvar.notify_all();
    }

    /// Clear the signal.
    #[allow(clippy::expect_used)] // lock poisoning indicates unrecoverable state
    pub fn reset(&self) {
        *self.state.lock().expect("lock poisoned") = false;
    }

    /// Whether the signal is currently set.
    #[allow(clippy::expect_used)] // lock poisoning indicates unrecoverable state
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.state.lock().expect("lock poisoned")
    }

    /// Block until the signal is set or the timeout elapses. Returns
    /// whether the signal was set.
    #[allow(clippy::expect_used)] // lock poisoning indicates unrecoverable state
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        let (state, _) = self
            .condvar
            .wait_timeout_while(state, timeout, |set| !*set)
            .expect("lock poisoned");
        *state
    }
}

struct Subscription {
    /// Lowercased collection filter; `None` subscribes to everything.
    collections: Option<Vec<String>>,
    signal: Weak<ChangeSignal>,
}

/// Fan-out of committed change batches to registered signals.
#[derive(Default)]
pub struct ChangeBus {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ChangeBus {
    /// A bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a signal for changes in the given collections, or all
    /// changes when `collections` is `None`. The bus holds a weak
    /// reference; dropping the signal unsubscribes.
    #[allow(clippy::expect_used)] // lock poisoning indicates unrecoverable state
    pub fn subscribe(&self, collections: Option<&[String]>, signal: &Arc<ChangeSignal>) {
        let collections = collections
            .map(|names| names.iter().map(|name| name.to_lowercase()).collect());
        self.subscriptions
            .lock()
            .expect("lock poisoned")
            .push(Subscription {
                collections,
                signal: Arc::downgrade(signal),
            });
    }

    /// Deliver a committed batch, waking every intersecting subscriber and
    /// pruning dropped ones.
    #[allow(clippy::expect_used)] // lock poisoning indicates unrecoverable state
    pub fn publish(&self, changes: &[DocumentChange]) {
        if changes.is_empty() {
            return;
        }
        let mut subscriptions = self.subscriptions.lock().expect("lock poisoned");
        subscriptions.retain(|subscription| {
            let Some(signal) = subscription.signal.upgrade() else {
                return false;
            };
            let matches = match &subscription.collections {
                None => true,
                Some(filter) => changes.iter().any(|change| {
                    change
                        .collection
                        .as_ref()
                        .is_some_and(|collection| filter.contains(&collection.to_lowercase()))
                }),
            };
            if matches {
                signal.set();
            }
            true
        });
    }
}
