//! Time-to-live values.
//!
//! A TTL is either absent (the entry never expires) or a positive duration.
//! It can be built from raw milliseconds, a [`Duration`], or a human-readable
//! string such as `"1d 3h"` or `"500ms"`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CacheError, Result};

/// Time-to-live for a cache entry. `Ttl::NONE` never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ttl(Option<Duration>);

impl Ttl {
    pub const NONE: Ttl = Ttl(None);

    /// Build a TTL from milliseconds; zero or negative means no expiry.
    pub fn from_millis(millis: i64) -> Self {
        if millis <= 0 {
            Self::NONE
        } else {
            Self(Some(Duration::from_millis(millis as u64)))
        }
    }

    /// Parse a human-readable duration (`"1d 3h"`, `"250ms"`) or a bare
    /// millisecond count (`"1500"`).
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Self::NONE);
        }
        if let Ok(millis) = trimmed.parse::<i64>() {
            return Ok(Self::from_millis(millis));
        }
        humantime::parse_duration(trimmed)
            .map(Self::from)
            .map_err(|e| CacheError::invalid_ttl(format!("{trimmed:?}: {e}")))
    }

    pub fn as_duration(&self) -> Option<Duration> {
        self.0
    }

    /// Milliseconds as sent to the remote store; `0` when there is no expiry.
    pub fn as_millis(&self) -> u64 {
        self.0.map(|d| d.as_millis() as u64).unwrap_or(0)
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }
}

impl From<Duration> for Ttl {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            Self::NONE
        } else {
            Self(Some(duration))
        }
    }
}

impl From<Option<Duration>> for Ttl {
    fn from(duration: Option<Duration>) -> Self {
        duration.map(Self::from).unwrap_or(Self::NONE)
    }
}

impl From<u64> for Ttl {
    fn from(millis: u64) -> Self {
        Self::from(Duration::from_millis(millis))
    }
}

impl FromStr for Ttl {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for Ttl {
    type Error = CacheError;

    fn try_from(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(d) => write!(f, "{}", humantime::format_duration(d)),
            None => write!(f, "none"),
        }
    }
}

impl Serialize for Ttl {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.as_millis())
    }
}

impl<'de> Deserialize<'de> for Ttl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Ttl::from_millis(ms)),
            Raw::Text(s) => Ttl::parse(&s).map_err(serde::de::Error::custom),
        }
    }
}
