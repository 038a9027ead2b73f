//! Configuration Error Types
//!
//! Specific, actionable error messages for settings loading, provider
//! resolution and builder validation.

use thiserror::Error;

/// Configuration-related errors with detailed context
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// Provider name does not match any backend kind
    #[error("Unsupported cache provider '{provider}' for {group}")]
    UnknownProvider { group: String, provider: String },

    /// Missing required configuration field
    #[error("Missing required configuration field '{field}' in {context}")]
    MissingRequiredField { field: String, context: String },

    /// Invalid configuration value
    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },

    /// Builder requested something the selected backend cannot do
    #[error("Cache '{cache}' cannot be built on {backend}: {reason}")]
    UnsupportedCombination {
        cache: String,
        backend: String,
        reason: String,
    },

    /// File I/O or syntax errors during settings loading
    #[error("Failed to load settings from '{source_name}': {error}")]
    LoadError { source_name: String, error: String },
}

impl ConfigurationError {
    /// Create an unknown provider error
    pub fn unknown_provider<G: Into<String>, P: Into<String>>(group: G, provider: P) -> Self {
        Self::UnknownProvider {
            group: group.into(),
            provider: provider.into(),
        }
    }

    /// Create a missing required field error
    pub fn missing_required_field<F: Into<String>, C: Into<String>>(field: F, context: C) -> Self {
        Self::MissingRequiredField {
            field: field.into(),
            context: context.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value<F: Into<String>, V: Into<String>, C: Into<String>>(
        field: F,
        value: V,
        context: C,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            context: context.into(),
        }
    }

    /// Create an unsupported builder combination error
    pub fn unsupported<C: Into<String>, B: Into<String>, R: Into<String>>(
        cache: C,
        backend: B,
        reason: R,
    ) -> Self {
        Self::UnsupportedCombination {
            cache: cache.into(),
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Create a settings load error
    pub fn load_error<S: Into<String>, E: std::fmt::Display>(source_name: S, error: E) -> Self {
        Self::LoadError {
            source_name: source_name.into(),
            error: error.to_string(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigurationError>;
