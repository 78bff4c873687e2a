//! In-process [`RemoteStore`].
//!
//! Stands in for a Redis endpoint in tests and single-binary setups. Runtimes
//! sharing one `MemoryStore` behave like processes sharing one server: they
//! see the same keys and each other's published messages.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use tiercache_core::{CacheError, Result, Ttl};

use super::{BusMessage, Connector, MessageStream, RemoteStore};
use crate::config::RedisCacheConfig;

const CHANNEL_CAPACITY: usize = 1024;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    bus: broadcast::Sender<BusMessage>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            bus,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the endpoint going down (`false`) or coming back (`true`).
    /// While down every operation fails with [`CacheError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys, across all prefixes.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::unavailable("memory store is offline"))
        }
    }

    fn live(&self, key: &str) -> Option<(String, Option<Instant>)> {
        let now = Instant::now();
        let found = self
            .entries
            .get(key)
            .map(|e| (e.is_live(now), e.value.clone(), e.expires_at));
        match found {
            Some((true, value, expires_at)) => Some((value, expires_at)),
            Some((false, ..)) => {
                self.entries.remove_if(key, |_, e| !e.is_live(now));
                None
            }
            None => None,
        }
    }
}

/// Glob match supporting `*` and `?`, enough for the prefix patterns the
/// cache issues.
fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, n));
                p += 1;
            }
            Some('?') => {
                p += 1;
                n += 1;
            }
            Some(c) if *c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    n = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.live(key).map(|(value, _)| value))
    }

    async fn get_with_ttl(&self, key: &str) -> Result<(Option<String>, Ttl)> {
        self.check()?;
        Ok(match self.live(key) {
            Some((value, Some(at))) => {
                let remaining = at.saturating_duration_since(Instant::now());
                (Some(value), Ttl::from(remaining.max(Duration::from_millis(1))))
            }
            Some((value, None)) => (Some(value), Ttl::NONE),
            None => (None, Ttl::NONE),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Ttl) -> Result<()> {
        self.check()?;
        let expires_at = ttl.as_duration().map(|d| Instant::now() + d);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.live(key).is_some())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live(now)))
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        self.check()?;
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|name, entry| {
            if glob_match(pattern, name) {
                if entry.is_live(now) {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn count_matching(&self, pattern: &str) -> Result<u64> {
        self.check()?;
        let now = Instant::now();
        let count = self
            .entries
            .iter()
            .filter(|e| e.is_live(now) && glob_match(pattern, e.key()))
            .count();
        Ok(count as u64)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.check()?;
        // No subscribers is not an error, same as Redis PUBLISH returning 0.
        let _ = self.bus.send(BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<MessageStream> {
        self.check()?;
        let pattern = pattern.to_string();
        let stream = BroadcastStream::new(self.bus.subscribe()).filter_map(move |received| {
            let message = match received {
                Ok(message) if glob_match(&pattern, &message.channel) => Some(message),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "memory bus subscriber lagged");
                    None
                }
            };
            futures::future::ready(message)
        });
        Ok(stream.boxed())
    }
}

/// Hands out one shared [`MemoryStore`] per connection key (`host:port/db`).
#[derive(Default)]
pub struct MemoryConnector {
    stores: DashMap<String, Arc<MemoryStore>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store backing `config`'s endpoint, created on first use.
    pub fn store_for(&self, config: &RedisCacheConfig) -> Arc<MemoryStore> {
        self.stores
            .entry(config.connection_key())
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .clone()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, config: &RedisCacheConfig) -> Result<Arc<dyn RemoteStore>> {
        Ok(self.store_for(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("a:ns:*", "a:ns:key"));
        assert!(glob_match("a:ns:*", "a:ns:"));
        assert!(!glob_match("a:ns:*", "a:other:key"));
        assert!(glob_match("RC:*", "RC:shop"));
        assert!(glob_match("a?c", "abc"));
        assert!(glob_match("*:x:*", "a:x:b"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[tokio::test]
    async fn test_set_get_with_ttl() {
        let store = MemoryStore::new();
        store.set("k", "\"v\"", Ttl::from(1000u64)).await.unwrap();

        let (value, ttl) = store.get_with_ttl("k").await.unwrap();
        assert_eq!(value.as_deref(), Some("\"v\""));
        assert!(ttl.as_millis() > 0 && ttl.as_millis() <= 1000);

        store.set("forever", "1", Ttl::NONE).await.unwrap();
        assert_eq!(store.get_with_ttl("forever").await.unwrap().1, Ttl::NONE);
    }

    #[tokio::test]
    async fn test_remote_expiry() {
        let store = MemoryStore::new();
        store.set("k", "1", Ttl::from(30u64)).await.unwrap();
        assert!(store.exists("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_and_count_matching() {
        let store = MemoryStore::new();
        store.set("a:ns:1", "1", Ttl::NONE).await.unwrap();
        store.set("a:ns:2", "2", Ttl::NONE).await.unwrap();
        store.set("a:other:1", "3", Ttl::NONE).await.unwrap();

        assert_eq!(store.count_matching("a:ns:*").await.unwrap(), 2);
        assert_eq!(store.delete_matching("a:ns:*").await.unwrap(), 2);
        assert_eq!(store.count_matching("a:ns:*").await.unwrap(), 0);
        assert_eq!(store.key_count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = store.get("k").await.unwrap_err();
        assert!(err.is_remote());

        store.set_available(true);
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pattern_subscription() {
        let store = MemoryStore::new();
        let mut messages = store.subscribe("RC:*").await.unwrap();

        store.publish("OTHER:a", "ignored").await.unwrap();
        store.publish("RC:a", "hello").await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), messages.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.channel, "RC:a");
        assert_eq!(message.payload, "hello");
    }

    #[test]
    fn test_connector_shares_store_per_address() {
        let connector = MemoryConnector::new();
        let config = RedisCacheConfig::default();
        let a = connector.store_for(&config);
        let b = connector.store_for(&config);
        assert!(Arc::ptr_eq(&a, &b));

        let other = RedisCacheConfig {
            port: 6380,
            ..Default::default()
        };
        assert!(!Arc::ptr_eq(&a, &connector.store_for(&other)));
    }
}
