//! Embedding client error types.

use quill_core::QuillError;
use thiserror::Error;

/// Errors that can occur while talking to an embedding API.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// HTTP request failed.
    #[error("embedding request failed: {0}")]
    RequestFailed(String),

    /// The API answered with a non-success status.
    #[error("embedding API returned HTTP {status}: {body}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// Response body did not have the expected shape.
    #[error("failed to parse embedding response: {0}")]
    ParseError(String),

    /// Request timed out.
    #[error("embedding request timed out after {0}ms")]
    Timeout(u64),

    /// Provider is unreachable or not configured.
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),

    /// All retry attempts exhausted.
    #[error("all embedding retry attempts exhausted after {attempts} tries: {last_error}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// The last failure.
        last_error: String,
    },

    /// Returned vectors do not have the configured dimensionality.
    #[error("embedding dimension mismatch: configured {expected}, service returned {actual}")]
    DimensionMismatch {
        /// Configured dimensionality.
        expected: usize,
        /// Dimensionality the service produced.
        actual: usize,
    },

    /// Configuration error.
    #[error("embedding configuration error: {0}")]
    ConfigError(String),
}

impl From<reqwest::Error> for EmbedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EmbedError::Timeout(0)
        } else if err.is_connect() {
            EmbedError::Unavailable(err.to_string())
        } else {
            EmbedError::RequestFailed(err.to_string())
        }
    }
}

impl From<EmbedError> for QuillError {
    fn from(err: EmbedError) -> Self {
        QuillError::EmbeddingUnavailable(err.to_string())
    }
}
