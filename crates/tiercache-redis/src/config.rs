use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use tiercache_core::{CacheError, Result};

use crate::bus::SEPARATOR;

/// Top-level settings, loadable from `tiercache.toml` and `TIERCACHE__*` env vars.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TierCacheSettings {
    #[serde(default)]
    pub redis: RedisCacheConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TierCacheSettings {
    pub fn validate(&self) -> Result<()> {
        self.redis.validate()?;
        self.runtime.validate()?;
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(CacheError::configuration(format!(
                "logging.level must be one of {valid_levels:?}"
            )));
        }
        Ok(())
    }
}

/// Connection and behaviour settings for one remote-backed cache instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisCacheConfig {
    /// Redis host
    #[serde(default = "default_host")]
    pub host: String,

    /// Redis port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional password (`auth` accepted as an alias)
    #[serde(default, alias = "auth")]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default)]
    pub db: i64,

    /// Keep a per-process mirror of remote values
    /// Default: true
    #[serde(default = "default_use_local_cache")]
    pub use_local_cache: bool,

    /// Partitions unrelated applications sharing one Redis
    #[serde(default = "default_global_prefix")]
    pub global_prefix: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_use_local_cache() -> bool {
    true
}

fn default_global_prefix() -> String {
    "a".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_timeout_ms() -> u64 {
    5000
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: None,
            db: 0,
            use_local_cache: default_use_local_cache(),
            global_prefix: default_global_prefix(),
            pool_size: default_pool_size(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl RedisCacheConfig {
    /// Endpoint address, e.g. `127.0.0.1:6379`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Address plus database, e.g. `127.0.0.1:6379/0`. Caches with the same
    /// connection key share one pool and one invalidation listener.
    pub fn connection_key(&self) -> String {
        format!("{}/{}", self.address(), self.db)
    }

    /// Prefix of this database's keys in a runtime's mirror. Empty for db 0.
    pub(crate) fn mirror_scope(&self) -> String {
        if self.db == 0 {
            String::new()
        } else {
            format!("{}{SEPARATOR}", self.db)
        }
    }

    /// Connection URL, with the password percent-encoded.
    pub fn url(&self) -> String {
        let auth = self
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| format!(":{}@", urlencoding::encode(p)))
            .unwrap_or_default();
        format!("redis://{auth}{}:{}/{}", self.host, self.port, self.db)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(CacheError::configuration("redis.host must not be empty"));
        }
        if self.port == 0 {
            return Err(CacheError::configuration("redis.port must be > 0"));
        }
        if self.pool_size == 0 {
            return Err(CacheError::configuration("redis.pool_size must be > 0"));
        }
        validate_prefix("redis.global_prefix", &self.global_prefix)
    }
}

/// Process-wide settings shared by every cache on a runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Prefix of the invalidation channels (`<bus_prefix>:<global_prefix>`)
    #[serde(default = "default_bus_prefix")]
    pub bus_prefix: String,

    /// Identity stamped on published invalidations. Generated when absent.
    #[serde(default)]
    pub process_id: Option<String>,
}

fn default_bus_prefix() -> String {
    "RC".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bus_prefix: default_bus_prefix(),
            process_id: None,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        validate_prefix("runtime.bus_prefix", &self.bus_prefix)?;
        if let Some(id) = &self.process_id {
            validate_prefix("runtime.process_id", id)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn validate_prefix(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(CacheError::configuration(format!("{name} must not be empty")));
    }
    if value.contains(SEPARATOR) {
        return Err(CacheError::configuration(format!(
            "{name} must not contain the \\x0B separator"
        )));
    }
    Ok(())
}

pub mod loader {
    use super::*;
    use config::{Config, Environment, File};

    /// Load settings from `path` (or `tiercache.toml` when present) and
    /// `TIERCACHE__SECTION__FIELD` environment overrides.
    pub fn load_settings(path: Option<&Path>) -> Result<TierCacheSettings> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                if !p.exists() {
                    return Err(CacheError::configuration(format!(
                        "config file not found: {}",
                        p.display()
                    )));
                }
                builder = builder.add_source(File::from(p.to_path_buf()));
            }
            None => {
                let default_path = Path::new("tiercache.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path.to_path_buf()));
                }
            }
        }
        // Environment variable overrides, e.g., TIERCACHE__REDIS__PORT=6380
        builder = builder.add_source(
            Environment::with_prefix("TIERCACHE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| CacheError::configuration(format!("config build error: {e}")))?;
        let settings: TierCacheSettings = cfg
            .try_deserialize()
            .map_err(|e| CacheError::configuration(format!("config deserialize error: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }
}
