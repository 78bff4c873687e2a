//! Remote key/value store abstraction.
//!
//! [`RemoteStore`] is the narrow set of operations the distributed cache
//! needs. [`RedisStore`] talks to a real Redis; [`MemoryStore`] keeps
//! everything in-process and lets several runtimes share one "endpoint".

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use tiercache_core::{Result, Ttl};

use crate::config::RedisCacheConfig;

pub mod memory;
pub mod redis;

pub use self::memory::{MemoryConnector, MemoryStore};
pub use self::redis::{RedisConnector, RedisStore};

/// A message received on a pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Stream of messages from a dedicated subscription connection.
pub type MessageStream = BoxStream<'static, BusMessage>;

/// Operations against the shared remote key/value service.
///
/// Patterns are Redis glob patterns; callers only ever use a literal prefix
/// followed by `*`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// `GET key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// `GET key` and `PTTL key` in one round trip. Keys without an expiry
    /// report `Ttl::NONE`.
    async fn get_with_ttl(&self, key: &str) -> Result<(Option<String>, Ttl)>;

    /// `SET key value [PX ttl]`.
    async fn set(&self, key: &str, value: &str, ttl: Ttl) -> Result<()>;

    /// `EXISTS key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// `DEL key`. Returns whether a key was removed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Delete every key matching `pattern`. Returns how many were removed.
    async fn delete_matching(&self, pattern: &str) -> Result<u64>;

    /// Count keys matching `pattern`. Scans the whole keyspace.
    async fn count_matching(&self, pattern: &str) -> Result<u64>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Open a dedicated subscription to channels matching `pattern`.
    ///
    /// A subscribed connection cannot issue other commands, so this never
    /// reuses the command connections.
    async fn subscribe(&self, pattern: &str) -> Result<MessageStream>;
}

/// Opens a store for an endpoint. Called once per endpoint by the
/// connection registry.
pub trait Connector: Send + Sync {
    fn connect(&self, config: &RedisCacheConfig) -> Result<Arc<dyn RemoteStore>>;
}
