//! Redis-backed [`RemoteStore`].
//!
//! Commands go through a `deadpool-redis` pool. Subscriptions open their own
//! client connection because a connection in subscribe mode cannot run other
//! commands.

use std::sync::Arc;

use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands, RedisError};
use deadpool_redis::{Connection, Pool, PoolConfig, Runtime};
use futures::StreamExt;

use tiercache_core::{CacheError, Result, Ttl};

use super::{BusMessage, Connector, MessageStream, RemoteStore};
use crate::config::RedisCacheConfig;

/// Deletes every key matching ARGV[1], returns the number removed.
const DELETE_MATCHING_SCRIPT: &str = r"
local removed = 0
for _, name in ipairs(redis.call('KEYS', ARGV[1])) do
    removed = removed + redis.call('DEL', name)
end
return removed
";

const COUNT_MATCHING_SCRIPT: &str = "return #redis.call('KEYS', ARGV[1])";

pub struct RedisStore {
    pool: Pool,
    client: redis::Client,
    address: String,
    delete_matching: redis::Script,
    count_matching: redis::Script,
}

impl RedisStore {
    /// Build the pool and pub/sub client. No connection is made until the
    /// first command.
    pub fn connect(config: &RedisCacheConfig) -> Result<Self> {
        let url = config.url();

        let mut redis_config = deadpool_redis::Config::from_url(&url);
        let mut pool_config = PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(config.timeout());
        pool_config.timeouts.create = Some(config.timeout());
        pool_config.timeouts.recycle = Some(config.timeout());
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::configuration(format!("failed to create Redis pool: {e}")))?;

        let client = redis::Client::open(url.as_str())
            .map_err(|e| CacheError::configuration(format!("failed to create Redis client: {e}")))?;

        Ok(Self {
            pool,
            client,
            address: config.address(),
            delete_matching: redis::Script::new(DELETE_MATCHING_SCRIPT),
            count_matching: redis::Script::new(COUNT_MATCHING_SCRIPT),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool.get().await.map_err(|e| {
            tracing::warn!(address = %self.address, error = %e, "Failed to get Redis connection");
            CacheError::unavailable(e)
        })
    }
}

/// Connection-level failures are "unavailable"; everything else is a command error.
fn remote_error(e: RedisError) -> CacheError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_timeout() || e.is_connection_dropped() {
        CacheError::unavailable(e)
    } else {
        CacheError::remote(e)
    }
}

fn ttl_from_pttl(pttl: i64) -> Ttl {
    // -1: no expiry, -2: missing key
    Ttl::from_millis(pttl)
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        conn.get::<_, Option<String>>(key)
            .await
            .map_err(remote_error)
    }

    async fn get_with_ttl(&self, key: &str) -> Result<(Option<String>, Ttl)> {
        let mut conn = self.conn().await?;
        let (value, pttl): (Option<String>, i64) = redis::pipe()
            .get(key)
            .pttl(key)
            .query_async(&mut conn)
            .await
            .map_err(remote_error)?;
        Ok((value, ttl_from_pttl(pttl)))
    }

    async fn set(&self, key: &str, value: &str, ttl: Ttl) -> Result<()> {
        let mut conn = self.conn().await?;
        if ttl.is_none() {
            conn.set::<_, _, ()>(key, value).await.map_err(remote_error)
        } else {
            conn.pset_ex::<_, _, ()>(key, value, ttl.as_millis())
                .await
                .map_err(remote_error)
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        conn.exists::<_, bool>(key).await.map_err(remote_error)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(key).await.map_err(remote_error)?;
        Ok(removed > 0)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let removed: u64 = self
            .delete_matching
            .arg(pattern)
            .invoke_async(&mut conn)
            .await
            .map_err(remote_error)?;
        tracing::debug!(pattern = %pattern, removed, "deleted matching keys");
        Ok(removed)
    }

    async fn count_matching(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        self.count_matching
            .arg(pattern)
            .invoke_async(&mut conn)
            .await
            .map_err(remote_error)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(remote_error)
    }

    async fn subscribe(&self, pattern: &str) -> Result<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(remote_error)?;
        pubsub.psubscribe(pattern).await.map_err(remote_error)?;

        tracing::info!(address = %self.address, pattern = %pattern, "Subscribed to invalidation channels");

        let stream = pubsub.into_on_message().map(|msg| BusMessage {
            channel: msg.get_channel_name().to_string(),
            payload: String::from_utf8_lossy(msg.get_payload_bytes()).into_owned(),
        });
        Ok(stream.boxed())
    }
}

/// Opens a [`RedisStore`] per endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct RedisConnector;

impl Connector for RedisConnector {
    fn connect(&self, config: &RedisCacheConfig) -> Result<Arc<dyn RemoteStore>> {
        tracing::info!(address = %config.address(), "Connecting to Redis");
        Ok(Arc::new(RedisStore::connect(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pttl_mapping() {
        assert_eq!(ttl_from_pttl(-1), Ttl::NONE);
        assert_eq!(ttl_from_pttl(-2), Ttl::NONE);
        assert_eq!(ttl_from_pttl(1500).as_millis(), 1500);
    }

    #[tokio::test]
    async fn test_connect_is_lazy() {
        let config = RedisCacheConfig {
            host: "nonexistent.invalid".into(),
            port: 9999,
            timeout_ms: 200,
            ..Default::default()
        };
        let store = RedisStore::connect(&config).unwrap();
        assert_eq!(store.address(), "nonexistent.invalid:9999");

        let err = store.get("k").await.unwrap_err();
        assert!(err.is_remote());
    }
}
