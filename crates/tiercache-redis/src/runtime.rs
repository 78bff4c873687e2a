//! Process-scoped state shared by every [`RedisCache`] of one process.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use tiercache_core::{CacheError, LocalCache, Result, SingleFlight, TtlStore};

use crate::bus::{InvalidationListener, MirrorInvalidator, SEPARATOR};
use crate::cache::RedisCache;
use crate::config::{RedisCacheConfig, RuntimeConfig};
use crate::registry::ConnectionRegistry;
use crate::store::{Connector, RedisConnector, RemoteStore};

/// Namespace of [`CacheRuntime::global_cache`].
pub const GLOBAL_NAMESPACE: &str = "global";

/// Point-in-time copy of the runtime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    /// Reads issued against the remote store.
    pub remote_reads: u64,
    /// Invalidations from other processes applied to the mirror.
    pub invalidations_applied: u64,
    /// Invalidations skipped because this process sent them.
    pub invalidations_ignored: u64,
    /// Messages that could not be parsed.
    pub invalidations_dropped: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    remote_reads: AtomicU64,
    applied: AtomicU64,
    ignored: AtomicU64,
    dropped: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_remote_read(&self) {
        self.remote_reads.fetch_add(1, Ordering::Relaxed);
        tiercache_core::metrics::record_remote_read();
    }

    pub(crate) fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RuntimeStats {
        RuntimeStats {
            remote_reads: self.remote_reads.load(Ordering::Relaxed),
            invalidations_applied: self.applied.load(Ordering::Relaxed),
            invalidations_ignored: self.ignored.load(Ordering::Relaxed),
            invalidations_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Owns what the caches of one process share: the endpoint connections,
/// the mirror, the in-flight registries and the invalidation listeners.
///
/// Build one per process (or one per simulated process in tests) and hand
/// out caches with [`CacheRuntime::cache`]. Dropping the last reference stops
/// the listeners.
pub struct CacheRuntime {
    process_id: Arc<str>,
    bus_prefix: Arc<str>,
    registry: ConnectionRegistry,
    pub(crate) mirror: TtlStore<Value>,
    pub(crate) getting: SingleFlight<Option<Value>>,
    pub(crate) setting: SingleFlight<Option<Value>>,
    pub(crate) get_or_setting: SingleFlight<Option<Value>>,
    pub(crate) stats: Arc<StatsCounters>,
    local: LocalCache<Value>,
    listeners: DashMap<String, JoinHandle<()>>,
}

impl CacheRuntime {
    pub fn new(config: &RuntimeConfig, connector: Arc<dyn Connector>) -> Result<Arc<Self>> {
        config.validate()?;
        let process_id = config.process_id.clone().unwrap_or_else(generate_process_id);

        tracing::info!(process_id = %process_id, bus_prefix = %config.bus_prefix, "Cache runtime created");

        Ok(Arc::new(Self {
            process_id: process_id.into(),
            bus_prefix: config.bus_prefix.as_str().into(),
            registry: ConnectionRegistry::new(connector),
            mirror: TtlStore::new(),
            getting: SingleFlight::new("get"),
            setting: SingleFlight::new("set"),
            get_or_setting: SingleFlight::new("get_or_set"),
            stats: Arc::new(StatsCounters::default()),
            local: LocalCache::new(),
            listeners: DashMap::new(),
        }))
    }

    /// Runtime backed by real Redis endpoints.
    pub fn with_redis(config: &RuntimeConfig) -> Result<Arc<Self>> {
        Self::new(config, Arc::new(RedisConnector))
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn bus_prefix(&self) -> &str {
        &self.bus_prefix
    }

    pub fn stats(&self) -> RuntimeStats {
        self.stats.snapshot()
    }

    /// Number of entries in the mirror, across every cache of this runtime.
    pub fn mirror_len(&self) -> usize {
        self.mirror.len()
    }

    /// A cache over `namespace` on `config`'s endpoint.
    ///
    /// The first cache for an endpoint and database connects to it and
    /// starts its invalidation listener; later ones reuse both.
    pub fn cache(self: &Arc<Self>, namespace: &str, config: &RedisCacheConfig) -> Result<RedisCache> {
        config.validate()?;
        if namespace.contains(SEPARATOR) {
            return Err(CacheError::configuration(
                "namespace must not contain the \\x0B separator",
            ));
        }
        let store = self.store_for(config)?;
        Ok(RedisCache::new(
            Arc::clone(self),
            store,
            namespace,
            &config.global_prefix,
            &config.mirror_scope(),
            config.use_local_cache,
        ))
    }

    /// The default cache, namespace `global`.
    pub fn global_cache(self: &Arc<Self>, config: &RedisCacheConfig) -> Result<RedisCache> {
        self.cache(GLOBAL_NAMESPACE, config)
    }

    /// The default process-local cache. Every call returns a handle to the
    /// same entries; it is independent of the mirror and never touches Redis.
    pub fn local_cache(&self) -> LocalCache<Value> {
        self.local.clone()
    }

    fn store_for(&self, config: &RedisCacheConfig) -> Result<Arc<dyn RemoteStore>> {
        let (store, created) = self.registry.get_or_connect(config)?;
        if created {
            let invalidator = MirrorInvalidator::new(
                Arc::clone(&self.process_id),
                Arc::clone(&self.bus_prefix),
                config.mirror_scope().into(),
                self.mirror.clone(),
                Arc::clone(&self.stats),
            );
            let connection = config.connection_key();
            let listener = InvalidationListener::new(connection.clone(), Arc::clone(&store), invalidator);
            self.listeners.insert(connection, listener.start());
        }
        Ok(store)
    }
}

impl Drop for CacheRuntime {
    fn drop(&mut self) {
        for listener in self.listeners.iter() {
            listener.value().abort();
        }
    }
}

/// `<os pid>-<8 hex chars>`, unique per runtime even within one OS process.
fn generate_process_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", std::process::id(), &suffix[..8])
}
