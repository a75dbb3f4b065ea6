//! Error types for sremeta-core.

use thiserror::Error;

/// Result type alias using sremeta-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during meta-learning operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed insight, illegal category, or violated invariant on input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Trace id is not live in the store
    #[error("Unknown trace: {0}")]
    UnknownTrace(String),

    /// Trace id is already live in the store
    #[error("Duplicate trace: {0}")]
    DuplicateTrace(String),

    /// LLM rate limit or other transient backend failure, retriable
    #[error("Rate limited: {provider} - {message}")]
    RateLimited { provider: String, message: String },

    /// LLM API error (non-retriable)
    #[error("LLM error: {0}")]
    Llm(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error on a persisted artifact
    #[error("Storage error: {0}")]
    Storage(String),

    /// Cooperative cancellation
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a rate-limit error.
    pub fn rate_limited(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RateLimited {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Whether the error is transient and worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}
