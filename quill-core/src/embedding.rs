//! Embedding service abstraction.
//!
//! Text → vector computation is delegated to an external service. The
//! network client lives in `quill-embed`; this module defines the trait the
//! manager consumes plus two local providers:
//!
//! - [`NoEmbeddingService`] for keyword-only deployments, and
//! - [`HashEmbeddingService`], a deterministic feature-hashing embedder for
//!   tests, benchmarks and offline use.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{QuillError, Result};
use crate::keyword::tokenize;
use crate::types::Embedding;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Compute vector embeddings from text.
///
/// Implementations must be `Send + Sync`; the manager awaits them without
/// holding any lock.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Embed a single text.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::EmbeddingUnavailable`] if the service cannot
    /// produce an embedding.
    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Embed a batch of texts, preserving order.
    ///
    /// Default implementation calls `embed` in a loop. Remote providers
    /// should override this with a native batch request.
    ///
    /// # Errors
    ///
    /// Returns an error if any embedding in the batch fails.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Dimensionality of the vectors this service produces.
    fn dimensions(&self) -> usize;

    /// Human-readable model name.
    fn model_name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// No-op provider
// ---------------------------------------------------------------------------

/// A service that never produces embeddings.
///
/// Every ingested chunk takes the degraded path and participates in keyword
/// search only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEmbeddingService;

#[async_trait]
impl EmbeddingService for NoEmbeddingService {
    async fn embed(&self, _text: &str) -> Result<Embedding> {
        Err(QuillError::EmbeddingUnavailable(
            "no embedding service configured".into(),
        ))
    }

    fn dimensions(&self) -> usize {
        0
    }

    fn model_name(&self) -> &str {
        "none"
    }
}

// ---------------------------------------------------------------------------
// Feature-hashing provider
// ---------------------------------------------------------------------------

/// Deterministic bag-of-terms embedder.
///
/// Each keyword token is hashed into one of `dims` buckets with a ±1 sign;
/// the vector is L2-normalized. Texts that share terms get positive cosine
/// similarity, so rankings are meaningful without a model.
#[derive(Debug, Clone, Copy)]
pub struct HashEmbeddingService {
    dims: usize,
}

impl HashEmbeddingService {
    /// Create a provider with the given dimensionality (at least 1).
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dims: dimensions.max(1),
        }
    }

    /// Synchronous embedding, for callers outside an async context.
    #[must_use]
    pub fn embed_now(&self, text: &str) -> Embedding {
        let mut v = vec![0.0_f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]);
            #[allow(clippy::cast_possible_truncation)]
            let slot = (bucket % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[slot] += sign;
        }
        Embedding(Embedding(v).normalized())
    }
}

impl Default for HashEmbeddingService {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingService for HashEmbeddingService {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        Ok(self.embed_now(text))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        "feature-hash"
    }
}
