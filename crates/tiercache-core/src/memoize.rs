//! Function memoization on top of a cache's `get_or_set`.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;

use crate::error::Result;
use crate::source::ValueSource;
use crate::ttl::Ttl;

/// Derives the key suffix from call arguments.
pub type KeyFn<A> = Arc<dyn Fn(&A) -> String + Send + Sync>;

type MemoFn<A, V> = Arc<dyn Fn(A) -> BoxFuture<'static, anyhow::Result<V>> + Send + Sync>;

/// A cache that can back a [`Memoized`] function.
#[async_trait]
pub trait Memoizable<V: Send + 'static>: Clone + Send + Sync + 'static {
    async fn memo_get_or_set(
        &self,
        key: String,
        source: ValueSource<V>,
        ttl: Ttl,
    ) -> Result<Option<V>>;
}

pub struct MemoizeOptions<A> {
    pub ttl: Ttl,
    pub key_fn: Option<KeyFn<A>>,
}

impl<A> Default for MemoizeOptions<A> {
    fn default() -> Self {
        Self {
            ttl: Ttl::NONE,
            key_fn: None,
        }
    }
}

impl<A> Clone for MemoizeOptions<A> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<A> MemoizeOptions<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: impl Into<Ttl>) -> Self {
        self.ttl = ttl.into();
        self
    }

    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }
}

/// Cache key for one call: `<base>:<suffix>`, where the suffix comes from the
/// key function or, without one, from the JSON encoding of the arguments.
pub fn memo_key<A: Serialize>(base: &str, args: &A, key_fn: Option<&KeyFn<A>>) -> Result<String> {
    let suffix = match key_fn {
        Some(derive) => derive(args),
        None => serde_json::to_string(args)?,
    };
    Ok(format!("{base}:{suffix}"))
}

/// A memoized async function. Calls with the same derived key share one
/// cached result; concurrent calls share one execution.
pub struct Memoized<C, A, V> {
    cache: C,
    key: String,
    func: MemoFn<A, V>,
    options: MemoizeOptions<A>,
}

impl<C: Clone, A, V> Clone for Memoized<C, A, V> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            key: self.key.clone(),
            func: Arc::clone(&self.func),
            options: self.options.clone(),
        }
    }
}

impl<C, A, V> Memoized<C, A, V>
where
    C: Memoizable<V>,
    A: Serialize + Send + 'static,
    V: Send + 'static,
{
    pub fn new<F, Fut>(cache: C, key: impl Into<String>, func: F, options: MemoizeOptions<A>) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        Self {
            cache,
            key: key.into(),
            func: Arc::new(move |args| func(args).boxed()),
            options,
        }
    }

    pub async fn call(&self, args: A) -> Result<Option<V>> {
        let key = memo_key(&self.key, &args, self.options.key_fn.as_ref())?;
        let func = Arc::clone(&self.func);
        let source = ValueSource::producer(move || ValueSource::Deferred(func(args)));
        self.cache
            .memo_get_or_set(key, source, self.options.ttl)
            .await
    }
}
