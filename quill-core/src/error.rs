//! Error types for the quill retrieval core.

use thiserror::Error;

use crate::types::{Category, ChunkId};

/// Top-level error type for all quill operations.
#[derive(Error, Debug)]
pub enum QuillError {
    /// No chunk with the given id exists in the category.
    #[error("Chunk not found: {category}/{id}")]
    NotFound {
        /// Category that was searched.
        category: Category,
        /// The missing chunk id.
        id: ChunkId,
    },

    /// A vector's dimensionality differs from the one fixed by the index.
    #[error("Embedding dimension mismatch: index holds {expected}-d vectors, got {actual}-d")]
    DimensionMismatch {
        /// Dimensionality fixed by the first insertion.
        expected: usize,
        /// Dimensionality of the rejected vector.
        actual: usize,
    },

    /// Strict insert collided with an existing chunk.
    #[error("Chunk already exists: {0}")]
    DuplicateChunk(ChunkId),

    /// The embedding service could not produce a vector.
    #[error("Embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Stored index data failed validation on load.
    #[error("Index for category {category} is corrupt: {reason}")]
    IndexCorruption {
        /// The affected category; reset it to recover.
        category: Category,
        /// What failed validation.
        reason: String,
    },

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// SQLite persistence error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuillError {
    /// Whether this error leaves the chunk usable in degraded (keyword-only) mode.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::EmbeddingUnavailable(_))
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, QuillError>;
