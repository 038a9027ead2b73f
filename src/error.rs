//! Error types for the cache layer.
//!
//! Every operational error surfaces synchronously to its caller. The one
//! exception is a failing removal listener, which is logged at the dispatch
//! boundary and never becomes a `CacheError`.

use std::sync::Arc;
use thiserror::Error;

use crate::config::ConfigurationError;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Unknown provider, invalid backend or unsupported builder combination.
    /// Fatal at startup or build time and never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A loader or mapping function failed. Never cached.
    #[error("Loader failed for cache '{cache}': {error}")]
    Loader {
        cache: String,
        error: Arc<anyhow::Error>,
    },

    /// Network or backend failure on a distributed operation.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Cache '{0}' is closed")]
    Closed(String),

    /// A remote lock lease ran out, or was taken over, while a guard still
    /// held it.
    #[error("Lock '{0}' was lost before it was released")]
    LockLost(String),

    /// Adding to a counter would leave the signed 64-bit range. The counter
    /// keeps its previous value.
    #[error("Counter '{counter}' overflows adding {delta}")]
    CounterOverflow { counter: String, delta: i64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn backend_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    pub fn loader<S: Into<String>>(cache: S, source: anyhow::Error) -> Self {
        Self::Loader {
            cache: cache.into(),
            error: Arc::new(source),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    pub fn is_loader(&self) -> bool {
        matches!(self, Self::Loader { .. })
    }

    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }

    pub fn counter_overflow<S: Into<String>>(counter: S, delta: i64) -> Self {
        Self::CounterOverflow {
            counter: counter.into(),
            delta,
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(error: serde_json::Error) -> Self {
        CacheError::Serialization(error.to_string())
    }
}

impl From<ConfigurationError> for CacheError {
    fn from(error: ConfigurationError) -> Self {
        CacheError::Configuration(error.to_string())
    }
}

/// Result type for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;
