use thiserror::Error;

/// Errors surfaced by cache operations.
///
/// Payloads are plain strings so the error is `Clone`: a coalesced operation
/// delivers the same failure to every caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Remote store error: {0}")]
    Remote(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid TTL: {0}")]
    InvalidTtl(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Value resolution failed: {0}")]
    Resolution(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Create a new Unavailable error
    pub fn unavailable(message: impl std::fmt::Display) -> Self {
        Self::Unavailable(message.to_string())
    }

    /// Create a new Remote error
    pub fn remote(message: impl std::fmt::Display) -> Self {
        Self::Remote(message.to_string())
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl std::fmt::Display) -> Self {
        Self::Serialization(message.to_string())
    }

    /// Create a new InvalidTtl error
    pub fn invalid_ttl(message: impl std::fmt::Display) -> Self {
        Self::InvalidTtl(message.to_string())
    }

    /// Create a new Configuration error
    pub fn configuration(message: impl std::fmt::Display) -> Self {
        Self::Configuration(message.to_string())
    }

    /// Create a new Resolution error
    pub fn resolution(message: impl std::fmt::Display) -> Self {
        Self::Resolution(message.to_string())
    }

    /// Create a new Internal error
    pub fn internal(message: impl std::fmt::Display) -> Self {
        Self::Internal(message.to_string())
    }

    /// Check if this error came from talking to the remote store
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Remote(_))
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unavailable(_) | Self::Remote(_) => ErrorCategory::Remote,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::InvalidTtl(_) | Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Resolution(_) => ErrorCategory::Resolution,
            Self::Internal(_) => ErrorCategory::System,
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Error categories for monitoring and classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Remote,
    Serialization,
    Configuration,
    Resolution,
    System,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote => write!(f, "remote"),
            Self::Serialization => write!(f, "serialization"),
            Self::Configuration => write!(f, "configuration"),
            Self::Resolution => write!(f, "resolution"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Convenience result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
