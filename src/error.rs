//! Unified error handling for the wienfeed crate
//!
//! Domain-specific errors (`FetchError`, `ParseError`, `StorageError`) are
//! wrapped into a single [`Error`] enum that can cross module boundaries
//! without losing detail. [`ErrorCategory`] classifies errors for handling
//! strategies (retry, skip item, abort run).

use std::io;
use thiserror::Error;

/// Errors raised by the hardened HTTP client.
#[derive(Error, Debug)]
pub enum FetchError {
    /// URL failed the pre-flight safety checks (scheme, port, TLD, address range)
    #[error("URL rejected: {0}")]
    UrlRejected(String),

    /// The connected peer address fell into a blocked range after the
    /// connection was established
    #[error("Connection rejected: peer address {0} is not globally reachable")]
    RebindingRejected(String),

    /// Redirect chain violated the redirect policy
    #[error("Redirect rejected: {0}")]
    RedirectRejected(String),

    /// Response body exceeded the configured size cap
    #[error("Response exceeded {limit} bytes")]
    ResponseTooLarge { limit: u64 },

    /// Wall-clock budget for the request was exhausted
    #[error("Request timed out")]
    Timeout,

    /// Server answered with a non-success status that is not retryable
    #[error("Server error: HTTP {0}")]
    Status(u16),

    /// All retry attempts exhausted
    #[error("Maximum retry attempts exceeded")]
    MaxRetriesExceeded,

    /// Network, DNS or TLS failure (message already redacted)
    #[error("Transport error: {0}")]
    Transport(String),
}

impl FetchError {
    /// Whether another attempt could succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout | FetchError::Transport(_) | FetchError::Status(_)
        )
    }
}

/// Errors raised while decoding upstream payloads.
///
/// Parse errors are scoped to a single element: the offending item is
/// skipped and the rest of the batch proceeds.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid XML payload: {0}")]
    Xml(String),

    #[error("Invalid timestamp: {0:?}")]
    Timestamp(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Errors raised by the cache, state and quota stores.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Path {0:?} escapes the allowed directories")]
    PathOutsideAllowlist(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Could not acquire lock on {0} within the timeout")]
    LockTimeout(String),

    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network-related errors (HTTP, timeout, SSRF rejection)
    Network,
    /// Upstream payload decoding errors
    Parsing,
    /// Cache, state and quota file errors
    Storage,
    /// Configuration and validation errors
    Config,
    /// Daily request budget exhausted
    RateLimit,
    /// Other/unknown errors
    Other,
}

/// Unified error type for the wienfeed crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Daily request budget for a provider would be or has been exceeded
    #[error("Rate limit exceeded for {provider}: {detail}")]
    RateLimitExceeded { provider: String, detail: String },

    /// Fatal configuration problem, detected before any I/O
    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is recoverable (a later run can succeed without
    /// operator intervention)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_recoverable(),
            Self::Parse(_) => false,
            Self::Storage(StorageError::LockTimeout(_)) => true,
            Self::Storage(_) => false,
            Self::RateLimitExceeded { .. } => true,
            Self::Config(_) => false,
            Self::Io(_) => true,
            Self::Other(_) => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Fetch(_) => ErrorCategory::Network,
            Self::Parse(_) => ErrorCategory::Parsing,
            Self::Storage(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::RateLimitExceeded { .. } => ErrorCategory::RateLimit,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other(_) => ErrorCategory::Other,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_recoverable() {
        assert!(FetchError::Timeout.is_recoverable());
        assert!(FetchError::Status(503).is_recoverable());
        assert!(!FetchError::UrlRejected("bad scheme".into()).is_recoverable());
        assert!(!FetchError::RebindingRejected("127.0.0.1".into()).is_recoverable());
    }

    #[test]
    fn test_error_category() {
        let fetch: Error = FetchError::Timeout.into();
        assert_eq!(fetch.category(), ErrorCategory::Network);

        let cfg = Error::config("OUT_PATH outside allowed directories");
        assert_eq!(cfg.category(), ErrorCategory::Config);
        assert!(!cfg.is_recoverable());

        let quota = Error::RateLimitExceeded {
            provider: "vor".into(),
            detail: "budget".into(),
        };
        assert_eq!(quota.category(), ErrorCategory::RateLimit);
        assert!(quota.is_recoverable());
    }

    #[test]
    fn test_storage_lock_timeout_recoverable() {
        let err: Error = StorageError::LockTimeout("data/vor/requests.lock".into()).into();
        assert!(err.is_recoverable());
    }
}
