//! Distributed cache over Redis.
//!
//! Each process keeps a mirror of the values it has read or written. Writes
//! go through to Redis and publish an invalidation so other processes drop
//! their copy. Build a [`CacheRuntime`] once per process and get caches from it:
//!
//! ```no_run
//! # async fn example() -> tiercache_core::Result<()> {
//! use tiercache_core::ValueSource;
//! use tiercache_redis::{CacheRuntime, RedisCacheConfig, RuntimeConfig};
//!
//! let runtime = CacheRuntime::with_redis(&RuntimeConfig::default())?;
//! let users = runtime.cache("users", &RedisCacheConfig::default())?;
//!
//! users.set("42", ValueSource::literal("Ann"), 60_000u64).await?;
//! let name: Option<String> = users.get("42").await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod cache;
pub mod config;
pub mod registry;
pub mod runtime;
pub mod store;

pub use bus::{BusError, Command, InvalidationMessage};
pub use cache::{CacheOptions, ParseFn, RedisCache};
pub use config::{LoggingConfig, RedisCacheConfig, RuntimeConfig, TierCacheSettings};
pub use registry::ConnectionRegistry;
pub use runtime::{CacheRuntime, GLOBAL_NAMESPACE, RuntimeStats};
pub use store::{
    BusMessage, Connector, MemoryConnector, MemoryStore, RedisConnector, RedisStore, RemoteStore,
};
