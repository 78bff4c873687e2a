//! Redis-backed cache with a per-process mirror.
//!
//! ## Read path
//!
//! ```text
//! get_stale(key)
//!   → mirror hit?           → return
//!   → remote read in flight → join it
//!   → GET + PTTL            → populate mirror (no broadcast) → return
//! ```
//!
//! `get` first waits for a `set` of the same key issued by this process, so a
//! process always reads its own writes.
//!
//! ## Write path
//!
//! `set` resolves the value, updates the mirror, writes through to Redis and
//! then publishes an invalidation naming the key. Other processes evict their
//! mirror entry and read the new value from Redis on next access.
//!
//! A remote read reserves its mirror slot before going to Redis. A write,
//! delete or invalidation of the key while the read is out voids the
//! reservation, so the older value it brings back is returned to its callers
//! but never cached.
//!
//! ## Local keys
//!
//! The mirror and the in-flight registries are shared by every cache of a
//! runtime. They are keyed by the remote key, prefixed with `<db>\x0B` for
//! databases other than 0.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use tiercache_core::{
    CacheError, Flight, Memoizable, MemoizeOptions, Memoized, Result, Ttl, ValueSource, metrics,
};

use crate::bus::{InvalidationMessage, SEPARATOR, channel_name};
use crate::runtime::CacheRuntime;
use crate::store::RemoteStore;

/// Transforms a raw value read from Redis before it is cached and returned.
pub type ParseFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Per-call options. Converts from a bare TTL (`Ttl`, `Duration` or integer
/// milliseconds).
#[derive(Clone, Default)]
pub struct CacheOptions {
    pub ttl: Ttl,
    pub parse: Option<ParseFn>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: impl Into<Ttl>) -> Self {
        self.ttl = ttl.into();
        self
    }

    pub fn with_parse<F>(mut self, parse: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.parse = Some(Arc::new(parse));
        self
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("ttl", &self.ttl)
            .field("parse", &self.parse.is_some())
            .finish()
    }
}

impl From<Ttl> for CacheOptions {
    fn from(ttl: Ttl) -> Self {
        Self::new().with_ttl(ttl)
    }
}

impl From<Duration> for CacheOptions {
    fn from(ttl: Duration) -> Self {
        Self::new().with_ttl(ttl)
    }
}

impl From<u64> for CacheOptions {
    fn from(millis: u64) -> Self {
        Self::new().with_ttl(millis)
    }
}

/// Handle to one namespace on one endpoint. Clones share everything.
#[derive(Clone)]
pub struct RedisCache {
    runtime: Arc<CacheRuntime>,
    store: Arc<dyn RemoteStore>,
    namespace: Arc<str>,
    global_prefix: Arc<str>,
    scope: Arc<str>,
    channel: Arc<str>,
    use_local_cache: bool,
}

impl fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache")
            .field("namespace", &self.namespace)
            .field("global_prefix", &self.global_prefix)
            .field("scope", &self.scope)
            .field("use_local_cache", &self.use_local_cache)
            .finish()
    }
}

impl RedisCache {
    pub(crate) fn new(
        runtime: Arc<CacheRuntime>,
        store: Arc<dyn RemoteStore>,
        namespace: &str,
        global_prefix: &str,
        scope: &str,
        use_local_cache: bool,
    ) -> Self {
        let channel = channel_name(runtime.bus_prefix(), global_prefix);
        Self {
            runtime,
            store,
            namespace: namespace.into(),
            global_prefix: global_prefix.into(),
            scope: scope.into(),
            channel: channel.into(),
            use_local_cache,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn runtime(&self) -> &Arc<CacheRuntime> {
        &self.runtime
    }

    /// Remote key for `key`: `<global_prefix>:<namespace>:<key>`.
    pub fn remote_key(&self, key: &str) -> String {
        format!("{}:{}:{key}", self.global_prefix, self.namespace)
    }

    fn namespace_prefix(&self) -> String {
        format!("{}:{}:", self.global_prefix, self.namespace)
    }

    /// Key of `remote_key` in the mirror and the in-flight registries.
    fn local_key(&self, remote_key: &str) -> String {
        format!("{}{remote_key}", self.scope)
    }

    // ---- reads ----

    /// Get a value, waiting for this process's in-flight `set` of the key.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_with(key, CacheOptions::default()).await
    }

    pub async fn get_with<T: DeserializeOwned>(
        &self,
        key: &str,
        options: impl Into<CacheOptions>,
    ) -> Result<Option<T>> {
        let value = self.get_value(key, options.into().parse).await?;
        decode(value)
    }

    pub async fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    /// Get a value without waiting on writes in flight.
    pub async fn get_stale<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_stale_with(key, CacheOptions::default()).await
    }

    pub async fn get_stale_with<T: DeserializeOwned>(
        &self,
        key: &str,
        options: impl Into<CacheOptions>,
    ) -> Result<Option<T>> {
        let value = self.get_stale_value(key, options.into().parse).await?;
        decode(value)
    }

    pub async fn get_stale_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get_stale(key).await?.unwrap_or(default))
    }

    /// `EXISTS` on the remote key. The mirror is not consulted.
    pub async fn has(&self, key: &str) -> Result<bool> {
        self.store.exists(&self.remote_key(key)).await
    }

    // ---- writes ----

    /// Resolve `source` and store it.
    ///
    /// Returns `Ok(false)` when the value could not be produced or Redis
    /// rejected the write; the key is then removed from the mirror and, as far
    /// as Redis is reachable, from Redis. Keys containing `\x0B` are rejected.
    pub async fn set<T>(
        &self,
        key: &str,
        source: ValueSource<T>,
        options: impl Into<CacheOptions>,
    ) -> Result<bool>
    where
        T: Serialize + Send + 'static,
    {
        check_key(key)?;
        let stored = self.set_value(key, source, options.into().ttl).await?;
        Ok(stored.is_some())
    }

    /// Return the cached value or fill the key from `source`.
    ///
    /// Concurrent callers in this process share one fill. With `source`
    /// absent a miss returns `None` and nothing is written.
    pub async fn get_or_set<T>(
        &self,
        key: &str,
        source: Option<ValueSource<T>>,
        options: impl Into<CacheOptions>,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        check_key(key)?;
        let local_key = self.local_key(&self.remote_key(key));
        let pending = self
            .runtime
            .get_or_setting
            .pending(&local_key)
            .or_else(|| self.runtime.setting.pending(&local_key));
        if let Some(flight) = pending {
            tracing::debug!(key = %local_key, "joining in-flight fill");
            return decode(flight.await?);
        }

        let options = options.into();
        let this = self.clone();
        let owned_key = key.to_string();
        let flight = self.runtime.get_or_setting.coalesce(&local_key, move || async move {
            if let Some(existing) = this.get_stale_value(&owned_key, options.parse).await? {
                return Ok(Some(existing));
            }
            match source {
                Some(source) => this.set_value(&owned_key, source, options.ttl).await,
                None => Ok(None),
            }
        });
        decode(flight.await?)
    }

    /// Remove `key` from the mirror and from Redis, and tell other processes.
    pub async fn del(&self, key: &str) -> Result<bool> {
        check_key(key)?;
        let remote_key = self.remote_key(key);
        self.runtime.mirror.remove(&self.local_key(&remote_key));
        let removed = self.store.del(&remote_key).await?;
        self.publish(InvalidationMessage::delete(
            self.runtime.process_id(),
            &self.namespace,
            key,
        ))
        .await;
        Ok(removed)
    }

    /// Delete every key of the namespace. Runs `KEYS` on the server, so it
    /// is slow on large databases.
    pub async fn clear(&self) -> Result<u64> {
        let prefix = self.namespace_prefix();
        let evicted = self.runtime.mirror.remove_prefix(&self.local_key(&prefix));
        let removed = self.store.delete_matching(&format!("{prefix}*")).await?;
        tracing::debug!(prefix = %prefix, evicted, removed, "cleared namespace");
        self.publish(InvalidationMessage::clear(
            self.runtime.process_id(),
            &self.namespace,
        ))
        .await;
        Ok(removed)
    }

    /// Number of keys in the namespace. Runs `KEYS` on the server.
    pub async fn size(&self) -> Result<u64> {
        self.store
            .count_matching(&format!("{}*", self.namespace_prefix()))
            .await
    }

    /// Memoize `func` under `key`; results are shared across processes.
    pub fn memoize<A, V, F, Fut>(
        &self,
        key: impl Into<String>,
        func: F,
        options: MemoizeOptions<A>,
    ) -> Memoized<Self, A, V>
    where
        A: Serialize + Send + 'static,
        V: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        Memoized::new(self.clone(), key, func, options)
    }

    // ---- internals ----

    async fn get_value(&self, key: &str, parse: Option<ParseFn>) -> Result<Option<Value>> {
        let local_key = self.local_key(&self.remote_key(key));
        if let Some(flight) = self.runtime.setting.pending(&local_key) {
            tracing::debug!(key = %local_key, "waiting on in-flight set");
            return flight.await;
        }
        self.get_stale_value(key, parse).await
    }

    async fn get_stale_value(&self, key: &str, parse: Option<ParseFn>) -> Result<Option<Value>> {
        let remote_key = self.remote_key(key);
        let local_key = self.local_key(&remote_key);
        if self.use_local_cache {
            if let Some(value) = self.runtime.mirror.get(&local_key) {
                metrics::record_cache_hit("mirror");
                return Ok(Some(value));
            }
        }

        let this = self.clone();
        let owned_key = local_key.clone();
        let flight = self.runtime.getting.coalesce(&local_key, move || async move {
            this.fetch(remote_key, owned_key, parse).await
        });
        flight.await
    }

    async fn fetch(
        &self,
        remote_key: String,
        local_key: String,
        parse: Option<ParseFn>,
    ) -> Result<Option<Value>> {
        self.runtime.stats.record_remote_read();

        if !self.use_local_cache {
            let raw = self.store.get(&remote_key).await?;
            return parse_remote(raw, parse.as_ref());
        }

        let reservation = self.runtime.mirror.reserve(local_key.as_str());
        let (raw, ttl) = self.store.get_with_ttl(&remote_key).await?;
        let Some(value) = parse_remote(raw, parse.as_ref())? else {
            metrics::record_cache_miss();
            return Ok(None);
        };

        // A local write in progress owns the mirror entry.
        if self.runtime.setting.is_pending(&local_key) {
            return Ok(Some(value));
        }
        if reservation.fill(value.clone(), ttl) {
            tracing::debug!(key = %local_key, ttl = %ttl, "filled mirror from remote");
        } else {
            tracing::debug!(key = %local_key, "key changed during remote read, not caching");
        }
        Ok(Some(value))
    }

    /// Register the write as in flight and wait for it.
    async fn set_value<T>(&self, key: &str, source: ValueSource<T>, ttl: Ttl) -> Result<Option<Value>>
    where
        T: Serialize + Send + 'static,
    {
        let local_key = self.local_key(&self.remote_key(key));
        let this = self.clone();
        let owned_key = key.to_string();
        let flight: Flight<Option<Value>> = self
            .runtime
            .setting
            .track(&local_key, async move { this.write_through(owned_key, source, ttl).await });
        flight.await
    }

    async fn write_through<T>(&self, key: String, source: ValueSource<T>, ttl: Ttl) -> Result<Option<Value>>
    where
        T: Serialize + Send + 'static,
    {
        let remote_key = self.remote_key(&key);
        let local_key = self.local_key(&remote_key);

        let value = match source.resolve().await {
            Ok(resolved) => serde_json::to_value(resolved)?,
            Err(e) => {
                let error = CacheError::resolution(&e);
                tracing::warn!(key = %remote_key, error = %error, "failed to resolve value, removing key");
                self.discard(&key, &remote_key, &local_key).await;
                return Ok(None);
            }
        };
        let text = serde_json::to_string(&value)?;

        if self.use_local_cache {
            self.runtime.mirror.set(local_key.clone(), value.clone(), ttl);
        } else {
            self.runtime.mirror.remove(&local_key);
        }

        if let Err(e) = self.store.set(&remote_key, &text, ttl).await {
            tracing::warn!(key = %remote_key, error = %e, category = %e.category(), "remote write failed, removing key");
            self.discard(&key, &remote_key, &local_key).await;
            return Ok(None);
        }

        self.publish(InvalidationMessage::set(
            self.runtime.process_id(),
            &self.namespace,
            &key,
            ttl,
        ))
        .await;
        Ok(Some(value))
    }

    /// Drop every trace of `key` after a failed write. Remote cleanup is
    /// best effort; the mirror entry always goes.
    async fn discard(&self, key: &str, remote_key: &str, local_key: &str) {
        self.runtime.mirror.remove(local_key);
        if let Err(e) = self.store.del(remote_key).await {
            tracing::warn!(key = %remote_key, error = %e, "failed to remove key after failed write");
        }
        self.publish(InvalidationMessage::delete(
            self.runtime.process_id(),
            &self.namespace,
            key,
        ))
        .await;
    }

    /// Publish failures are logged, not returned; the write itself succeeded.
    async fn publish(&self, message: InvalidationMessage) {
        let command = message.command.as_str();
        match self.store.publish(&self.channel, &message.encode()).await {
            Ok(()) => {
                tracing::debug!(channel = %self.channel, command, key = ?message.key, "published invalidation");
            }
            Err(e) => {
                tracing::warn!(channel = %self.channel, command, error = %e, "failed to publish invalidation");
            }
        }
    }
}

#[async_trait]
impl<V> Memoizable<V> for RedisCache
where
    V: Serialize + DeserializeOwned + Send + 'static,
{
    async fn memo_get_or_set(
        &self,
        key: String,
        source: ValueSource<V>,
        ttl: Ttl,
    ) -> Result<Option<V>> {
        self.get_or_set(&key, Some(source), ttl).await
    }
}

/// Remote values are JSON text; anything else is returned as a JSON string.
fn parse_remote(raw: Option<String>, parse: Option<&ParseFn>) -> Result<Option<Value>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
    match parse {
        Some(parse) => parse(value).map(Some),
        None => Ok(Some(value)),
    }
}

/// Keys travel unescaped in invalidation messages.
fn check_key(key: &str) -> Result<()> {
    if key.contains(SEPARATOR) {
        return Err(CacheError::configuration(
            "cache key must not contain the \\x0B separator",
        ));
    }
    Ok(())
}

fn decode<T: DeserializeOwned>(value: Option<Value>) -> Result<Option<T>> {
    value
        .map(serde_json::from_value)
        .transpose()
        .map_err(CacheError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_remote_json_and_fallback() {
        assert_eq!(
            parse_remote(Some(r#"{"a":1}"#.into()), None).unwrap(),
            Some(json!({"a": 1}))
        );
        assert_eq!(
            parse_remote(Some("not json".into()), None).unwrap(),
            Some(json!("not json"))
        );
        assert_eq!(parse_remote(None, None).unwrap(), None);
    }

    #[test]
    fn test_parse_remote_applies_parse_fn() {
        let parse: ParseFn = Arc::new(|v| Ok(json!({ "wrapped": v })));
        assert_eq!(
            parse_remote(Some("1".into()), Some(&parse)).unwrap(),
            Some(json!({"wrapped": 1}))
        );
    }

    #[test]
    fn test_decode_reports_type_mismatch() {
        let decoded: Result<Option<u32>> = decode(Some(json!("text")));
        assert!(matches!(decoded, Err(CacheError::Serialization(_))));
    }

    #[test]
    fn test_check_key_rejects_separator() {
        assert!(check_key("user:42").is_ok());
        assert!(matches!(
            check_key("x\u{0B}y"),
            Err(CacheError::Configuration(_))
        ));
    }

    #[test]
    fn test_options_from_bare_ttl() {
        let options = CacheOptions::from(1500u64);
        assert_eq!(options.ttl.as_millis(), 1500);
        assert!(options.parse.is_none());

        let options = CacheOptions::from(Duration::from_secs(2));
        assert_eq!(options.ttl.as_millis(), 2000);
    }
}
