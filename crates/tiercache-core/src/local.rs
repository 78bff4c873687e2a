//! Single-process cache with stampede prevention.
//!
//! ## Dogpile handling
//!
//! While a deferred value for a key is being computed, readers of that key
//! wait for it instead of reporting a miss, and `get_or_set` callers join it
//! instead of computing their own. With a producer passed to `get_or_set`, N
//! concurrent callers for the same missing key run the producer once.

use std::future::Future;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::memoize::{Memoizable, MemoizeOptions, Memoized};
use crate::metrics;
use crate::single_flight::{Flight, SingleFlight};
use crate::source::ValueSource;
use crate::store::TtlStore;
use crate::ttl::Ttl;

/// In-process cache. Clones share the same entries.
pub struct LocalCache<V> {
    store: TtlStore<V>,
    fetching: SingleFlight<Option<V>>,
}

impl<V> Clone for LocalCache<V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            fetching: self.fetching.clone(),
        }
    }
}

impl<V> Default for LocalCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> LocalCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            store: TtlStore::new(),
            fetching: SingleFlight::new("fetch"),
        }
    }

    /// Get a value, waiting for an in-flight computation of the key if there is one.
    pub async fn get(&self, key: &str) -> Option<V> {
        if let Some(flight) = self.fetching.pending(key) {
            tracing::debug!(key = %key, "waiting on in-flight value");
            return settled(flight).await;
        }
        self.lookup(key)
    }

    pub async fn get_or(&self, key: &str, default: V) -> V {
        self.get(key).await.unwrap_or(default)
    }

    /// Get the committed value without waiting on in-flight computations.
    pub async fn get_stale(&self, key: &str) -> Option<V> {
        self.lookup(key)
    }

    pub async fn get_stale_or(&self, key: &str, default: V) -> V {
        self.lookup(key).unwrap_or(default)
    }

    pub async fn has(&self, key: &str) -> bool {
        self.store.contains(key)
    }

    /// Number of keys in the cache.
    pub async fn size(&self) -> usize {
        self.store.len()
    }

    pub async fn del(&self, key: &str) {
        self.store.remove(key);
    }

    /// Delete every key and forget in-flight computations.
    pub async fn clear(&self) {
        self.store.clear();
        self.fetching.forget_all();
    }

    /// Store a value.
    ///
    /// Deferred values are registered as in flight until they resolve. If
    /// resolution fails the key is deleted and `false` is returned.
    pub async fn set(&self, key: &str, source: ValueSource<V>, ttl: impl Into<Ttl>) -> bool {
        let ttl = ttl.into();
        let mut source = source;
        loop {
            source = match source {
                ValueSource::Literal(value) => {
                    self.store.set(key, value, ttl);
                    return true;
                }
                ValueSource::Producer(produce) => produce(),
                deferred @ ValueSource::Deferred(_) => {
                    let fill = resolve_into(self.store.clone(), key.to_string(), deferred, ttl);
                    let flight = self.fetching.track(key, fill);
                    return matches!(flight.await, Ok(Some(_)));
                }
            };
        }
    }

    /// Return the cached value, or fill the key from `source`.
    ///
    /// With `source` absent a miss returns `None` and stores nothing.
    pub async fn get_or_set(
        &self,
        key: &str,
        source: Option<ValueSource<V>>,
        ttl: impl Into<Ttl>,
    ) -> Option<V> {
        if let Some(value) = self.store.get(key) {
            metrics::record_cache_hit("local");
            return Some(value);
        }
        if let Some(flight) = self.fetching.pending(key) {
            return settled(flight).await;
        }
        let source = source?;

        metrics::record_cache_miss();
        let store = self.store.clone();
        let owned_key = key.to_string();
        let ttl = ttl.into();
        let flight = self.fetching.coalesce(key, move || async move {
            // A fill that finished between our lookup and this point wins.
            if let Some(value) = store.get(&owned_key) {
                return Ok(Some(value));
            }
            resolve_into(store, owned_key, source, ttl).await
        });
        settled(flight).await
    }

    /// Memoize `func` under `key`. Arguments are turned into the cache key
    /// with the options' key function or, by default, their JSON encoding.
    pub fn memoize<A, F, Fut>(
        &self,
        key: impl Into<String>,
        func: F,
        options: MemoizeOptions<A>,
    ) -> Memoized<Self, A, V>
    where
        A: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        Memoized::new(self.clone(), key, func, options)
    }

    fn lookup(&self, key: &str) -> Option<V> {
        let value = self.store.get(key);
        if value.is_some() {
            metrics::record_cache_hit("local");
        } else {
            metrics::record_cache_miss();
        }
        value
    }
}

#[async_trait]
impl<V> Memoizable<V> for LocalCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn memo_get_or_set(
        &self,
        key: String,
        source: ValueSource<V>,
        ttl: Ttl,
    ) -> Result<Option<V>> {
        Ok(self.get_or_set(&key, Some(source), ttl).await)
    }
}

/// Resolve `source` and store the outcome. A failed resolution deletes the key.
async fn resolve_into<V>(
    store: TtlStore<V>,
    key: String,
    source: ValueSource<V>,
    ttl: Ttl,
) -> Result<Option<V>>
where
    V: Clone + Send + Sync + 'static,
{
    match source.resolve().await {
        Ok(value) => {
            store.set(key, value.clone(), ttl);
            Ok(Some(value))
        }
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "failed to resolve value for cache");
            store.remove(&key);
            Ok(None)
        }
    }
}

async fn settled<V: Clone>(flight: Flight<Option<V>>) -> Option<V> {
    flight.await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "in-flight value failed");
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_set_and_get_literal() {
        let cache = LocalCache::new();
        assert!(cache.set("a", ValueSource::literal(1), Ttl::NONE).await);
        assert_eq!(cache.get("a").await, Some(1));
        assert!(cache.has("a").await);
        assert_eq!(cache.size().await, 1);
    }

    #[tokio::test]
    async fn test_value_expires_after_ttl() {
        let cache = LocalCache::new();
        cache.set("a", ValueSource::literal("1"), 50u64).await;
        assert_eq!(cache.get("a").await, Some("1"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get_or("a", "default").await, "default");
    }

    #[tokio::test]
    async fn test_get_waits_for_deferred_but_get_stale_does_not() {
        let cache = LocalCache::new();
        let writer = cache.clone();
        let write = tokio::spawn(async move {
            writer
                .set(
                    "slow",
                    ValueSource::deferred(async {
                        tokio::time::sleep(Duration::from_millis(40)).await;
                        Ok(5)
                    }),
                    Ttl::NONE,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.get_stale("slow").await, None);
        assert_eq!(cache.get("slow").await, Some(5));
        assert!(write.await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_set_deletes_key() {
        let cache = LocalCache::new();
        cache.set("a", ValueSource::literal(1), Ttl::NONE).await;

        let ok = cache
            .set(
                "a",
                ValueSource::deferred(async { anyhow::bail!("upstream failed") }),
                Ttl::NONE,
            )
            .await;

        assert!(!ok);
        assert!(!cache.has("a").await);
        assert_eq!(cache.get("a").await, None);
    }

    #[tokio::test]
    async fn test_producer_is_invoked_then_resolved() {
        let cache = LocalCache::new();
        let ok = cache
            .set("p", ValueSource::from_fn(|| async { Ok(9) }), Ttl::NONE)
            .await;
        assert!(ok);
        assert_eq!(cache.get("p").await, Some(9));
    }

    #[tokio::test]
    async fn test_get_or_set_runs_producer_once() {
        let cache = LocalCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_set(
                        "x",
                        Some(ValueSource::from_fn(move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            Ok(99)
                        })),
                        Ttl::NONE,
                    )
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Some(99));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_set_without_value_does_not_store() {
        let cache: LocalCache<u32> = LocalCache::new();
        assert_eq!(cache.get_or_set("missing", None, Ttl::NONE).await, None);
        assert!(!cache.has("missing").await);
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test]
    async fn test_get_or_set_returns_existing() {
        let cache = LocalCache::new();
        cache.set("k", ValueSource::literal(1), Ttl::NONE).await;
        let value = cache
            .get_or_set("k", Some(ValueSource::literal(2)), Ttl::NONE)
            .await;
        assert_eq!(value, Some(1));
    }

    #[tokio::test]
    async fn test_clear_then_get_returns_default() {
        let cache = LocalCache::new();
        cache.set("a", ValueSource::literal(1), 10_000u64).await;
        cache.set("b", ValueSource::literal(2), Ttl::NONE).await;
        cache.clear().await;

        assert_eq!(cache.get_or("a", 0).await, 0);
        assert_eq!(cache.get_or("b", 0).await, 0);
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test]
    async fn test_del_removes_key() {
        let cache = LocalCache::new();
        cache.set("a", ValueSource::literal(1), Ttl::NONE).await;
        cache.del("a").await;
        assert!(!cache.has("a").await);
    }

    #[tokio::test]
    async fn test_memoize_calls_function_once_per_arguments() {
        let cache: LocalCache<u64> = LocalCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let square = cache.memoize(
            "square",
            move |n: u64| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(n * n)
                }
            },
            MemoizeOptions::new(),
        );

        assert_eq!(square.call(4).await.unwrap(), Some(16));
        assert_eq!(square.call(4).await.unwrap(), Some(16));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(square.call(5).await.unwrap(), Some(25));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.has("square:4").await);
    }
}
