//! Cross-process invalidation over Redis Pub/Sub.
//!
//! Every write publishes a message on `<bus_prefix>:<global_prefix>`. Other
//! processes evict the named mirror entries; they never take values from the
//! bus, so the next read goes back to Redis.
//!
//! ## Wire format
//!
//! ```text
//! origin \x0B namespace \x0B command \x0B key [\x0B arg ...]
//! ```
//!
//! `command` is `set`, `delete` or `clear`. For `set` the first argument is
//! the TTL in milliseconds. `clear` carries `null` as its key.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;

use tiercache_core::{CacheError, Ttl, TtlStore};

use crate::runtime::StatsCounters;
use crate::store::{BusMessage, RemoteStore};

pub const SEPARATOR: char = '\u{0B}';

const CLEAR_KEY: &str = "null";
const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("empty invalidation message")]
    Empty,

    #[error("invalidation message is missing the {0} field")]
    MissingField(&'static str),

    #[error("unknown invalidation command: {0}")]
    UnknownCommand(String),

    #[error("channel {0} is not an invalidation channel")]
    ForeignChannel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Set,
    Delete,
    Clear,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Set => "set",
            Command::Delete => "delete",
            Command::Clear => "clear",
        }
    }

    /// Parse a wire command. Older writers send `setdel` for sets.
    pub fn parse(s: &str) -> Result<Self, BusError> {
        match s {
            "set" | "setdel" => Ok(Command::Set),
            "delete" => Ok(Command::Delete),
            "clear" => Ok(Command::Clear),
            other => Err(BusError::UnknownCommand(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationMessage {
    pub origin: String,
    pub namespace: String,
    pub command: Command,
    pub key: Option<String>,
    pub args: Vec<String>,
}

impl InvalidationMessage {
    pub fn set(origin: &str, namespace: &str, key: &str, ttl: Ttl) -> Self {
        Self {
            origin: origin.to_string(),
            namespace: namespace.to_string(),
            command: Command::Set,
            key: Some(key.to_string()),
            args: vec![ttl.as_millis().to_string()],
        }
    }

    pub fn delete(origin: &str, namespace: &str, key: &str) -> Self {
        Self {
            origin: origin.to_string(),
            namespace: namespace.to_string(),
            command: Command::Delete,
            key: Some(key.to_string()),
            args: Vec::new(),
        }
    }

    pub fn clear(origin: &str, namespace: &str) -> Self {
        Self {
            origin: origin.to_string(),
            namespace: namespace.to_string(),
            command: Command::Clear,
            key: None,
            args: Vec::new(),
        }
    }

    pub fn encode(&self) -> String {
        let key = self.key.as_deref().unwrap_or(CLEAR_KEY);
        let mut fields = vec![
            self.origin.as_str(),
            self.namespace.as_str(),
            self.command.as_str(),
            key,
        ];
        fields.extend(self.args.iter().map(String::as_str));
        fields.join(&SEPARATOR.to_string())
    }

    pub fn parse(payload: &str) -> Result<Self, BusError> {
        if payload.is_empty() {
            return Err(BusError::Empty);
        }
        let mut fields = payload.split(SEPARATOR);
        let origin = fields.next().ok_or(BusError::MissingField("origin"))?;
        let namespace = fields.next().ok_or(BusError::MissingField("namespace"))?;
        let command = Command::parse(fields.next().ok_or(BusError::MissingField("command"))?)?;
        let key = fields.next();

        let key = match command {
            Command::Clear => None,
            Command::Set | Command::Delete => {
                Some(key.ok_or(BusError::MissingField("key"))?.to_string())
            }
        };

        Ok(Self {
            origin: origin.to_string(),
            namespace: namespace.to_string(),
            command,
            key,
            args: fields.map(str::to_string).collect(),
        })
    }
}

/// `<bus_prefix>:<global_prefix>`
pub fn channel_name(bus_prefix: &str, global_prefix: &str) -> String {
    format!("{bus_prefix}:{global_prefix}")
}

/// Recover the global prefix from a channel name produced by [`channel_name`].
pub fn global_prefix_of<'a>(bus_prefix: &str, channel: &'a str) -> Result<&'a str, BusError> {
    channel
        .strip_prefix(bus_prefix)
        .and_then(|rest| rest.strip_prefix(':'))
        .filter(|global| !global.is_empty())
        .ok_or_else(|| BusError::ForeignChannel(channel.to_string()))
}

/// Applies received invalidations to the process mirror.
#[derive(Clone)]
pub struct MirrorInvalidator {
    process_id: Arc<str>,
    bus_prefix: Arc<str>,
    scope: Arc<str>,
    mirror: TtlStore<Value>,
    stats: Arc<StatsCounters>,
}

impl MirrorInvalidator {
    pub(crate) fn new(
        process_id: Arc<str>,
        bus_prefix: Arc<str>,
        scope: Arc<str>,
        mirror: TtlStore<Value>,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self {
            process_id,
            bus_prefix,
            scope,
            mirror,
            stats,
        }
    }

    /// Evict what `message` names. Returns `false` for our own messages,
    /// which were already applied locally.
    pub fn apply(&self, message: &BusMessage) -> Result<bool, BusError> {
        let global = global_prefix_of(&self.bus_prefix, &message.channel)?;
        let parsed = InvalidationMessage::parse(&message.payload)?;

        if parsed.origin == *self.process_id {
            self.stats.record_ignored();
            return Ok(false);
        }

        match (&parsed.command, &parsed.key) {
            (Command::Set | Command::Delete, Some(key)) => {
                let mirror_key = format!("{}{global}:{}:{key}", self.scope, parsed.namespace);
                self.mirror.remove(&mirror_key);
                tracing::debug!(
                    key = %mirror_key,
                    command = parsed.command.as_str(),
                    origin = %parsed.origin,
                    "evicted mirror entry"
                );
            }
            (Command::Clear, _) => {
                let prefix = format!("{}{global}:{}:", self.scope, parsed.namespace);
                let evicted = self.mirror.remove_prefix(&prefix);
                tracing::debug!(prefix = %prefix, evicted, origin = %parsed.origin, "cleared mirror namespace");
            }
            (_, None) => return Err(BusError::MissingField("key")),
        }

        self.stats.record_applied();
        tiercache_core::metrics::record_invalidation(parsed.command.as_str());
        Ok(true)
    }
}

/// Subscriber for one endpoint and database. Runs until its task is aborted, reconnecting
/// with exponential backoff.
pub struct InvalidationListener {
    connection: String,
    pattern: String,
    store: Arc<dyn RemoteStore>,
    invalidator: MirrorInvalidator,
}

impl InvalidationListener {
    pub fn new(
        connection: String,
        store: Arc<dyn RemoteStore>,
        invalidator: MirrorInvalidator,
    ) -> Self {
        let pattern = format!("{}:*", invalidator.bus_prefix);
        Self {
            connection,
            pattern,
            store,
            invalidator,
        }
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);

            loop {
                match self.run().await {
                    Ok(()) => {
                        backoff = Duration::from_secs(1);
                    }
                    Err(e) => {
                        tracing::error!(
                            connection = %self.connection,
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "Invalidation listener error, reconnecting..."
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        })
    }

    async fn run(&self) -> Result<(), CacheError> {
        let mut messages = self.store.subscribe(&self.pattern).await?;
        tracing::info!(connection = %self.connection, pattern = %self.pattern, "Invalidation listener subscribed");

        while let Some(message) = messages.next().await {
            if let Err(e) = self.invalidator.apply(&message) {
                self.invalidator.stats.record_dropped();
                tracing::warn!(
                    channel = %message.channel,
                    error = %e,
                    "dropping malformed invalidation message"
                );
            }
        }

        Err(CacheError::unavailable("pub/sub connection closed"))
    }
}
