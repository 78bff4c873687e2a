//! Value inputs for `set` / `get_or_set`.
//!
//! A value handed to the cache is either already known, still being computed,
//! or produced on demand by a function that runs only when the cache actually
//! needs to fill the key.

use std::fmt;
use std::future::Future;

use futures::future::{BoxFuture, FutureExt};

/// Boxed future yielding a value to cache.
pub type ValueFuture<V> = BoxFuture<'static, anyhow::Result<V>>;

/// Zero-argument producer, invoked at most once.
pub type Producer<V> = Box<dyn FnOnce() -> ValueSource<V> + Send>;

pub enum ValueSource<V> {
    /// A ready value, stored as-is.
    Literal(V),
    /// A value still being computed. Concurrent readers of the key wait on it.
    Deferred(ValueFuture<V>),
    /// A function whose result is itself resolved as a `ValueSource`.
    Producer(Producer<V>),
}

impl<V: Send + 'static> ValueSource<V> {
    pub fn literal(value: V) -> Self {
        Self::Literal(value)
    }

    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        Self::Deferred(future.boxed())
    }

    pub fn producer<F>(f: F) -> Self
    where
        F: FnOnce() -> ValueSource<V> + Send + 'static,
    {
        Self::Producer(Box::new(f))
    }

    /// Wrap an async function; it is not called until the cache needs the value.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        Self::producer(move || Self::deferred(f()))
    }

    /// Run producers until a literal or a future is reached, then await it.
    pub async fn resolve(self) -> anyhow::Result<V> {
        let mut source = self;
        loop {
            source = match source {
                Self::Literal(value) => return Ok(value),
                Self::Deferred(future) => return future.await,
                Self::Producer(produce) => produce(),
            };
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for ValueSource<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
            Self::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_resolve_literal_and_deferred() {
        assert_eq!(ValueSource::literal(7).resolve().await.unwrap(), 7);
        let deferred = ValueSource::deferred(async { Ok(8) });
        assert_eq!(deferred.resolve().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_nested_producers_are_unwrapped() {
        let source = ValueSource::producer(|| ValueSource::producer(|| ValueSource::literal("deep")));
        assert_eq!(source.resolve().await.unwrap(), "deep");
    }

    #[tokio::test]
    async fn test_from_fn_is_lazy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let source = ValueSource::from_fn(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(1u32)
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        drop(source);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_propagates() {
        let source: ValueSource<u8> = ValueSource::deferred(async { anyhow::bail!("boom") });
        assert_eq!(source.resolve().await.unwrap_err().to_string(), "boom");
    }
}
