//! Per-key coalescing of in-flight operations.
//!
//! Every registered operation runs on its own Tokio task, so it settles even
//! when every caller stops waiting. The task removes its registry entry before
//! its result is published, which means a caller arriving after settlement
//! never joins a finished operation.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::{CacheError, Result};

/// Handle to an in-flight operation. Cloning is cheap; every clone yields the same outcome.
pub type Flight<T> = Shared<BoxFuture<'static, Result<T>>>;

struct Pending<T> {
    id: u64,
    flight: Flight<T>,
}

/// Registry of pending operations of one kind, keyed by cache key.
pub struct SingleFlight<T> {
    kind: &'static str,
    pending: Arc<DashMap<String, Pending<T>>>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            pending: Arc::clone(&self.pending),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty registry. `kind` only labels log lines.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            pending: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The operation currently registered for `key`, if any.
    pub fn pending(&self, key: &str) -> Option<Flight<T>> {
        self.pending.get(key).map(|p| p.flight.clone())
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Number of operations still in flight.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Join the pending operation for `key`, or start one with `producer`.
    ///
    /// `producer` is only called when nothing is pending; it runs while the
    /// key's slot is locked, so it should just build the future.
    pub fn coalesce<F, Fut>(&self, key: &str, producer: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        match self.pending.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                tracing::trace!(kind = self.kind, key = %key, "joined in-flight operation");
                entry.get().flight.clone()
            }
            Entry::Vacant(entry) => {
                let (id, flight) = self.launch(key, producer());
                entry.insert(Pending {
                    id,
                    flight: flight.clone(),
                });
                flight
            }
        }
    }

    /// Start `operation` and make it the pending one for `key`, superseding
    /// whatever was registered before. Used for writes, where the latest write
    /// is the one readers should wait on.
    pub fn track<Fut>(&self, key: &str, operation: Fut) -> Flight<T>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let entry = self.pending.entry(key.to_string());
        let (id, flight) = self.launch(key, operation);
        entry.insert(Pending {
            id,
            flight: flight.clone(),
        });
        flight
    }

    /// Drop every registration. Running operations still settle, but new
    /// callers no longer join them.
    pub fn forget_all(&self) {
        self.pending.clear();
    }

    fn launch<Fut>(&self, key: &str, operation: Fut) -> (u64, Flight<T>)
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registry: Weak<DashMap<String, Pending<T>>> = Arc::downgrade(&self.pending);
        let owned_key = key.to_string();
        let kind = self.kind;

        let task = tokio::spawn(async move {
            let outcome = operation.await;
            if let Some(registry) = registry.upgrade() {
                // Only remove our own registration; a newer one may have replaced it.
                registry.remove_if(&owned_key, |_, pending| pending.id == id);
            }
            if let Err(e) = &outcome {
                tracing::debug!(kind, key = %owned_key, error = %e, "in-flight operation failed");
            }
            outcome
        });

        let flight = async move {
            task.await.unwrap_or_else(|e| {
                Err(CacheError::internal(format!(
                    "in-flight operation did not complete: {e}"
                )))
            })
        }
        .boxed()
        .shared();

        (id, flight)
    }
}
