//! Process-wide map of connection key (`host:port/db`) to shared remote store.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use tiercache_core::Result;

use crate::config::RedisCacheConfig;
use crate::store::{Connector, RemoteStore};

/// Opens one store per endpoint and hands out clones of it. Stores live
/// as long as the registry.
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    connections: DashMap<String, Arc<dyn RemoteStore>>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: DashMap::new(),
        }
    }

    /// The store for `config`'s endpoint and database. The flag is `true` when
    /// this call created it, so the caller can start its subscriber exactly once.
    pub fn get_or_connect(&self, config: &RedisCacheConfig) -> Result<(Arc<dyn RemoteStore>, bool)> {
        match self.connections.entry(config.connection_key()) {
            Entry::Occupied(entry) => Ok((Arc::clone(entry.get()), false)),
            Entry::Vacant(entry) => {
                let store = self.connector.connect(config)?;
                tracing::info!(connection = %entry.key(), "Registered remote endpoint");
                entry.insert(Arc::clone(&store));
                Ok((store, true))
            }
        }
    }

    pub fn get(&self, connection_key: &str) -> Option<Arc<dyn RemoteStore>> {
        self.connections.get(connection_key).map(|s| Arc::clone(s.value()))
    }

    /// Number of connections opened so far.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryConnector;

    #[test]
    fn test_connects_once_per_address() {
        let registry = ConnectionRegistry::new(Arc::new(MemoryConnector::new()));
        let config = RedisCacheConfig::default();

        let (first, created) = registry.get_or_connect(&config).unwrap();
        assert!(created);
        let (second, created) = registry.get_or_connect(&config).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));

        let other = RedisCacheConfig {
            host: "10.0.0.2".into(),
            ..Default::default()
        };
        let (_, created) = registry.get_or_connect(&other).unwrap();
        assert!(created);
        assert_eq!(registry.len(), 2);
        assert!(registry.get("10.0.0.2:6379/0").is_some());
    }

    #[test]
    fn test_each_database_gets_its_own_connection() {
        let registry = ConnectionRegistry::new(Arc::new(MemoryConnector::new()));
        let db0 = RedisCacheConfig::default();
        let db1 = RedisCacheConfig {
            db: 1,
            ..Default::default()
        };

        let (zero, _) = registry.get_or_connect(&db0).unwrap();
        let (one, created) = registry.get_or_connect(&db1).unwrap();
        assert!(created);
        assert!(!Arc::ptr_eq(&zero, &one));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_prefix_and_namespace_do_not_split_connections() {
        let registry = ConnectionRegistry::new(Arc::new(MemoryConnector::new()));
        let a = RedisCacheConfig::default();
        let b = RedisCacheConfig {
            global_prefix: "other".into(),
            use_local_cache: false,
            ..Default::default()
        };
        registry.get_or_connect(&a).unwrap();
        let (_, created) = registry.get_or_connect(&b).unwrap();
        assert!(!created);
        assert_eq!(registry.len(), 1);
    }
}
