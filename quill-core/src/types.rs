//! Core type definitions for the quill retrieval core.
//!
//! Chunks, categories, queries and scored results. Everything that is
//! persisted is serializable.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::QuillError;

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// One of the three independent knowledge domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Past narrative passages.
    History,
    /// Planned structure and plot beats.
    Outline,
    /// Persona facts about characters.
    Character,
}

impl Category {
    /// All categories, in a stable order.
    pub const ALL: [Category; 3] = [Category::History, Category::Outline, Category::Character];

    /// Lowercase name, also used for file names.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::History => "history",
            Self::Outline => "outline",
            Self::Character => "character",
        }
    }

    /// Dense index into per-category arrays.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::History => 0,
            Self::Outline => 1,
            Self::Character => 2,
        }
    }

    /// Heading used when rendering prompt context.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::History => "History",
            Self::Outline => "Outline",
            Self::Character => "Character",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = QuillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "history" => Ok(Self::History),
            "outline" => Ok(Self::Outline),
            "character" => Ok(Self::Character),
            other => Err(QuillError::Config(format!("unknown category: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Identifier of a chunk, derived from its content.
///
/// The hash covers the category, the source position and the text, so
/// identical text re-ingested at the same position maps to the same id and
/// ids never alias across categories.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub String);

impl ChunkId {
    /// Derive the id for `text` at `source_position` in `category`.
    #[must_use]
    pub fn derive(category: Category, source_position: u64, text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(category.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(source_position.to_le_bytes());
        hasher.update([0x1f]);
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Embedding
// ---------------------------------------------------------------------------

/// A dense vector embedding for semantic similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding(pub Vec<f32>);

impl Embedding {
    /// Dimensionality of the embedding.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    /// Unit-length copy of the vector. A zero vector stays zero.
    #[must_use]
    pub fn normalized(&self) -> Vec<f32> {
        let norm = self.0.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm < f32::EPSILON {
            return vec![0.0; self.0.len()];
        }
        self.0.iter().map(|x| x / norm).collect()
    }
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// An addressable unit of narrative text.
///
/// Immutable once created, except that the embedding may be attached
/// exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub(crate) id: ChunkId,
    pub(crate) category: Category,
    pub(crate) text: String,
    pub(crate) source_position: u64,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) embedding: Option<Embedding>,
}

impl Chunk {
    /// Create a new chunk without an embedding, stamped with the current time.
    #[must_use]
    pub fn new(category: Category, text: impl Into<String>, source_position: u64) -> Self {
        let text = text.into();
        Self {
            id: ChunkId::derive(category, source_position, &text),
            category,
            text,
            source_position,
            created_at: Utc::now(),
            embedding: None,
        }
    }

    /// Rebuild a chunk from persisted fields.
    #[must_use]
    pub fn restore(
        id: ChunkId,
        category: Category,
        text: String,
        source_position: u64,
        created_at: DateTime<Utc>,
        embedding: Option<Embedding>,
    ) -> Self {
        Self {
            id,
            category,
            text,
            source_position,
            created_at,
            embedding,
        }
    }

    /// Attach the embedding. Returns `false` (and keeps the old vector) if
    /// one is already present.
    pub fn set_embedding(&mut self, embedding: Embedding) -> bool {
        if self.embedding.is_some() {
            return false;
        }
        self.embedding = Some(embedding);
        true
    }

    /// The chunk id.
    #[must_use]
    pub fn id(&self) -> &ChunkId {
        &self.id
    }

    /// The owning category.
    #[must_use]
    pub fn category(&self) -> Category {
        self.category
    }

    /// The chunk text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Ordinal position within the source document.
    #[must_use]
    pub fn source_position(&self) -> u64 {
        self.source_position
    }

    /// Creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The embedding, if one has been computed.
    #[must_use]
    pub fn embedding(&self) -> Option<&Embedding> {
        self.embedding.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Knowledge-base state
// ---------------------------------------------------------------------------

/// Lifecycle state of one category's knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryState {
    /// Never activated (or reset). May hold staged content.
    #[default]
    Uninitialized,
    /// Participates in search.
    Active,
    /// Data retained but excluded from search.
    Inactive,
}

impl CategoryState {
    /// Whether the category participates in search.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for CategoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

/// Snapshot of one category, as returned by `stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeBaseStats {
    /// The category described.
    pub category: Category,
    /// Lifecycle state.
    pub state: CategoryState,
    /// Shorthand for `state == Active`.
    pub active: bool,
    /// Number of stored chunks.
    pub chunk_count: usize,
    /// Number of chunks that carry an embedding.
    pub embedded_count: usize,
    /// Vector dimensionality, once fixed.
    pub dimensions: Option<usize>,
}

// ---------------------------------------------------------------------------
// Query & results
// ---------------------------------------------------------------------------

/// A retrieval request issued by the prompt builder.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Query text for keyword matching (and embedding, via `search_text`).
    pub text: String,
    /// Categories to consult. Empty means every category.
    pub category_filter: Vec<Category>,
    /// Maximum number of results.
    pub top_k: usize,
    /// The writer's current cursor, for recency scoring.
    pub anchor_position: Option<u64>,
    /// Precomputed query embedding. Without it, ranking is keyword-only.
    pub query_vector: Option<Embedding>,
}

impl Query {
    /// A query over every category with `top_k = 5` and no anchor.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            category_filter: Vec::new(),
            top_k: 5,
            anchor_position: None,
            query_vector: None,
        }
    }

    /// Restrict the query to the given categories.
    #[must_use]
    pub fn categories(mut self, categories: impl IntoIterator<Item = Category>) -> Self {
        self.category_filter = categories.into_iter().collect();
        self
    }

    /// Set the result limit.
    #[must_use]
    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set the recency anchor.
    #[must_use]
    pub fn anchor(mut self, position: u64) -> Self {
        self.anchor_position = Some(position);
        self
    }

    /// Attach a precomputed query embedding.
    #[must_use]
    pub fn with_vector(mut self, vector: Embedding) -> Self {
        self.query_vector = Some(vector);
        self
    }

    /// Whether `category` passes the filter.
    #[must_use]
    pub fn includes(&self, category: Category) -> bool {
        self.category_filter.is_empty() || self.category_filter.contains(&category)
    }
}

/// A ranked retrieval result. Transient; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    /// The retrieved chunk.
    pub chunk: Chunk,
    /// Raw BM25 score (0 when the chunk shares no query term).
    pub keyword_score: f64,
    /// Raw cosine similarity, `None` when the chunk or the query has no vector.
    pub embedding_score: Option<f64>,
    /// Keyword score after min-max normalization over the candidate set.
    pub keyword_norm: f64,
    /// Embedding score after min-max normalization over the candidate set.
    pub embedding_norm: f64,
    /// `exp(-decay · distance)` for chunks at or before the anchor, else 0.
    pub recency_score: f64,
    /// `combined · (1 + recency_weight · recency_score)`.
    pub final_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_is_content_derived() {
        let a = ChunkId::derive(Category::History, 3, "The storm broke.");
        let b = ChunkId::derive(Category::History, 3, "The storm broke.");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn chunk_ids_do_not_alias_across_categories() {
        let h = ChunkId::derive(Category::History, 1, "Mara");
        let c = ChunkId::derive(Category::Character, 1, "Mara");
        assert_ne!(h, c);
    }

    #[test]
    fn chunk_ids_differ_by_position() {
        let a = ChunkId::derive(Category::Outline, 1, "beat");
        let b = ChunkId::derive(Category::Outline, 2, "beat");
        assert_ne!(a, b);
    }

    #[test]
    fn embedding_is_set_once() {
        let mut chunk = Chunk::new(Category::History, "text", 0);
        assert!(chunk.set_embedding(Embedding(vec![1.0, 0.0])));
        assert!(!chunk.set_embedding(Embedding(vec![0.0, 1.0])));
        assert_eq!(chunk.embedding(), Some(&Embedding(vec![1.0, 0.0])));
    }

    #[test]
    fn category_round_trips_through_str() {
        for category in Category::ALL {
            let parsed: Category = category.as_str().parse().expect("parse");
            assert_eq!(parsed, category);
        }
        assert!("setting".parse::<Category>().is_err());
    }

    #[test]
    fn normalized_zero_vector_stays_zero() {
        let zero = Embedding(vec![0.0, 0.0, 0.0]);
        assert_eq!(zero.normalized(), vec![0.0, 0.0, 0.0]);
        let unit = Embedding(vec![3.0, 4.0]).normalized();
        assert!((unit[0] - 0.6).abs() < 1e-6);
        assert!((unit[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn empty_filter_includes_everything() {
        let query = Query::new("storm");
        assert!(Category::ALL.iter().all(|c| query.includes(*c)));
        let query = query.categories([Category::Outline]);
        assert!(query.includes(Category::Outline));
        assert!(!query.includes(Category::History));
    }
}
