//! Integration tests against a real Redis.
//!
//! Tests use testcontainers to spin up Redis, so they need Docker:
//!
//! ```text
//! cargo test -p tiercache-redis --test redis_cache -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tiercache_core::{Ttl, ValueSource};
use tiercache_redis::{CacheRuntime, RedisCacheConfig, RedisStore, RemoteStore, RuntimeConfig};
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, u16)> = OnceCell::const_new();

async fn redis_config(global_prefix: &str) -> RedisCacheConfig {
    let (_, port) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");
            let port = container.get_host_port_ipv4(6379).await.expect("get port");
            (container, port)
        })
        .await;

    RedisCacheConfig {
        host: "127.0.0.1".into(),
        port: *port,
        global_prefix: global_prefix.into(),
        pool_size: 5,
        ..Default::default()
    }
}

fn runtime(process_id: &str) -> Arc<CacheRuntime> {
    runtime_on_bus(process_id, "RC")
}

/// Tests share one server, so coherence tests listen on their own bus.
fn runtime_on_bus(process_id: &str, bus_prefix: &str) -> Arc<CacheRuntime> {
    CacheRuntime::with_redis(&RuntimeConfig {
        bus_prefix: bus_prefix.into(),
        process_id: Some(process_id.into()),
    })
    .expect("runtime")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_store_commands() {
    let config = redis_config("store").await;
    let store = RedisStore::connect(&config).unwrap();

    store.set("store:ns:a", "1", Ttl::from(5_000u64)).await.unwrap();
    store.set("store:ns:b", "2", Ttl::NONE).await.unwrap();

    let (value, ttl) = store.get_with_ttl("store:ns:a").await.unwrap();
    assert_eq!(value.as_deref(), Some("1"));
    assert!(ttl.as_millis() > 0 && ttl.as_millis() <= 5_000);
    assert_eq!(store.get_with_ttl("store:ns:b").await.unwrap().1, Ttl::NONE);

    assert!(store.exists("store:ns:a").await.unwrap());
    assert_eq!(store.count_matching("store:ns:*").await.unwrap(), 2);
    assert_eq!(store.delete_matching("store:ns:*").await.unwrap(), 2);
    assert!(!store.del("store:ns:a").await.unwrap());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_set_get_and_expiry() {
    let config = redis_config("expiry").await;
    let rt = runtime("expiry-1");
    let cache = rt.cache("users", &config).unwrap();

    assert!(cache.set("a", ValueSource::literal(1), 100u64).await.unwrap());
    assert_eq!(cache.get::<i32>("a").await.unwrap(), Some(1));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(cache.get_or("a", -1).await.unwrap(), -1);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_cross_instance_invalidation() {
    let config = redis_config("coherence").await;
    let rt_a = runtime_on_bus("coherence-a", "COHERENCE");
    let rt_b = runtime_on_bus("coherence-b", "COHERENCE");
    let a = rt_a.cache("users", &config).unwrap();
    let b = rt_b.cache("users", &config).unwrap();

    // Give both listeners time to subscribe.
    tokio::time::sleep(Duration::from_millis(300)).await;

    a.set("k", ValueSource::literal("v1"), Ttl::NONE).await.unwrap();
    eventually(|| rt_b.stats().invalidations_applied >= 1).await;
    assert_eq!(b.get::<String>("k").await.unwrap().as_deref(), Some("v1"));

    a.set("k", ValueSource::literal("v2"), Ttl::NONE).await.unwrap();
    eventually(|| rt_b.stats().invalidations_applied >= 2).await;
    assert_eq!(b.get::<String>("k").await.unwrap().as_deref(), Some("v2"));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_clear_and_size() {
    let config = redis_config("clear").await;
    let rt = runtime("clear-1");
    let cache = rt.cache("items", &config).unwrap();

    for i in 0..5 {
        cache
            .set(&i.to_string(), ValueSource::literal(i), Ttl::NONE)
            .await
            .unwrap();
    }
    assert_eq!(cache.size().await.unwrap(), 5);
    assert_eq!(cache.clear().await.unwrap(), 5);
    assert_eq!(cache.size().await.unwrap(), 0);
    assert_eq!(cache.get::<i32>("0").await.unwrap(), None);
}

#[tokio::test]
async fn test_unreachable_redis_is_reported() {
    let config = RedisCacheConfig {
        host: "127.0.0.1".into(),
        port: 1,
        timeout_ms: 500,
        ..Default::default()
    };
    let rt = runtime("unreachable");
    let cache = rt.cache("users", &config).unwrap();

    let err = cache.get::<i32>("k").await.unwrap_err();
    assert!(err.is_remote());
}
