//! Configuration for the quill retrieval core.
//!
//! Maps directly to `quill.toml`. Every knob is passed explicitly into the
//! component that uses it; nothing reads ambient global state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{QuillError, Result};
use crate::types::Category;

/// Top-level configuration, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuillConfig {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,
    /// Hybrid ranking settings.
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// BM25 parameters.
    #[serde(default)]
    pub keyword: KeywordConfig,
    /// Vector index parameters.
    #[serde(default)]
    pub vector: VectorConfig,
    /// Default chunking policy.
    #[serde(default)]
    pub chunking: ChunkingConfig,
    /// Embedding service settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Persistence settings.
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl QuillConfig {
    /// Load configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `QuillError::Config` if the TOML is invalid or fails validation.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| QuillError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Reject out-of-range values.
    ///
    /// # Errors
    /// Returns `QuillError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.retrieval.top_k == 0 {
            return Err(QuillError::Config("retrieval.top_k must be at least 1".into()));
        }
        if self.retrieval.max_recency_weight < 0.0 {
            return Err(QuillError::Config(
                "retrieval.max_recency_weight must be non-negative".into(),
            ));
        }
        for category in Category::ALL {
            self.retrieval.ranking(category).validate(category)?;
        }
        if self.chunking.chunk_size == 0 {
            return Err(QuillError::Config("chunking.chunk_size must be at least 1".into()));
        }
        if self.keyword.k1 < 0.0 || !(0.0..=1.0).contains(&self.keyword.b) {
            return Err(QuillError::Config(
                "keyword.k1 must be non-negative and keyword.b within [0, 1]".into(),
            ));
        }
        if self.embedding.batch_size == 0 {
            return Err(QuillError::Config("embedding.batch_size must be at least 1".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// General system settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log filter for the host's subscriber: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Hybrid ranking settings, shared and per category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Default number of results per query.
    #[serde(default = "default_5_usize")]
    pub top_k: usize,
    /// Candidates pulled from each index before blending.
    #[serde(default = "default_50_usize")]
    pub candidate_pool: usize,
    /// Upper bound on `recency_weight`: recency can multiply a score by at
    /// most `1 + max_recency_weight`.
    #[serde(default = "default_1_0")]
    pub max_recency_weight: f64,
    /// Ranking for past narrative.
    #[serde(default)]
    pub history: RankingConfig,
    /// Ranking for outline beats.
    #[serde(default)]
    pub outline: RankingConfig,
    /// Ranking for character facts.
    #[serde(default)]
    pub character: RankingConfig,
}

impl RetrievalConfig {
    /// Ranking parameters for `category`.
    #[must_use]
    pub fn ranking(&self, category: Category) -> &RankingConfig {
        match category {
            Category::History => &self.history,
            Category::Outline => &self.outline,
            Category::Character => &self.character,
        }
    }

    /// Mutable ranking parameters for `category`.
    pub fn ranking_mut(&mut self, category: Category) -> &mut RankingConfig {
        match category {
            Category::History => &mut self.history,
            Category::Outline => &mut self.outline,
            Category::Character => &mut self.character,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            candidate_pool: 50,
            max_recency_weight: 1.0,
            history: RankingConfig::default(),
            outline: RankingConfig::default(),
            character: RankingConfig::default(),
        }
    }
}

/// Blend and recency parameters for one category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankingConfig {
    /// Embedding weight in `[0, 1]`; keyword gets `1 - alpha`.
    #[serde(default = "default_alpha", alias = "hybrid_search_alpha")]
    pub alpha: f64,
    /// Recency decay rate per position of distance from the anchor.
    #[serde(default = "default_recency_strength")]
    pub recency_boost_strength: f64,
    /// Multiplicative weight of the recency score.
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
}

impl RankingConfig {
    fn validate(&self, category: Category) -> Result<()> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(QuillError::Config(format!(
                "retrieval.{category}.alpha must be within [0, 1], got {}",
                self.alpha
            )));
        }
        if self.recency_boost_strength < 0.0 {
            return Err(QuillError::Config(format!(
                "retrieval.{category}.recency_boost_strength must be non-negative"
            )));
        }
        if self.recency_weight < 0.0 {
            return Err(QuillError::Config(format!(
                "retrieval.{category}.recency_weight must be non-negative"
            )));
        }
        Ok(())
    }
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            alpha: 0.7,
            recency_boost_strength: 0.05,
            recency_weight: 0.3,
        }
    }
}

/// BM25 parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeywordConfig {
    /// Term-frequency saturation.
    #[serde(default = "default_k1")]
    pub k1: f64,
    /// Length normalization.
    #[serde(default = "default_b")]
    pub b: f64,
}

impl Default for KeywordConfig {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// Vector index parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VectorConfig {
    /// HNSW build accuracy.
    #[serde(default = "default_100_usize")]
    pub ef_construction: usize,
    /// HNSW search accuracy.
    #[serde(default = "default_50_usize")]
    pub ef_search: usize,
    /// Below this many vectors, search is an exact scan.
    #[serde(default = "default_2048")]
    pub exact_search_threshold: usize,
    /// Rebuild the HNSW graph once this fraction of vectors is unbuilt.
    #[serde(default = "default_0_2")]
    pub rebuild_threshold: f32,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            ef_construction: 100,
            ef_search: 50,
            exact_search_threshold: 2048,
            rebuild_threshold: 0.2,
        }
    }
}

/// Default chunking policy settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Target chunk size in characters.
    #[serde(default = "default_800")]
    pub chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { chunk_size: 800 }
    }
}

/// Embedding service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider: "openai" (any compatible API), "ollama", "none".
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Base URL of the embedding API.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model name.
    #[serde(default = "default_model")]
    pub model: String,
    /// Expected vector dimensionality.
    #[serde(default = "default_1024")]
    pub dimensions: usize,
    /// Texts per embedding request.
    #[serde(default = "default_10_usize")]
    pub batch_size: usize,
    /// Retries per request before giving up.
    #[serde(default = "default_2")]
    pub max_retries: u32,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_30000")]
    pub request_timeout_ms: u64,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Query embeddings kept in the LRU cache.
    #[serde(default = "default_256")]
    pub query_cache_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            base_url: "https://dashscope.aliyuncs.com/compatible-mode".to_string(),
            model: "text-embedding-v4".to_string(),
            dimensions: 1024,
            batch_size: 10,
            max_retries: 2,
            request_timeout_ms: 30_000,
            api_key_env: "QUILL_EMBEDDING_API_KEY".to_string(),
            query_cache_size: 256,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Directory holding one database file per category.
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// Use WAL journaling.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
    /// Store and verify a checksum over the chunk rows.
    #[serde(default = "default_true")]
    pub checksum_enabled: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            wal_mode: true,
            checksum_enabled: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Serde default helpers
// ---------------------------------------------------------------------------

fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_provider() -> String { "openai".to_string() }
fn default_base_url() -> String { "https://dashscope.aliyuncs.com/compatible-mode".to_string() }
fn default_model() -> String { "text-embedding-v4".to_string() }
fn default_api_key_env() -> String { "QUILL_EMBEDDING_API_KEY".to_string() }
fn default_directory() -> PathBuf { PathBuf::from("app_data/knowledge_bases") }
fn default_alpha() -> f64 { 0.7 }
fn default_recency_strength() -> f64 { 0.05 }
fn default_recency_weight() -> f64 { 0.3 }
fn default_1_0() -> f64 { 1.0 }
fn default_k1() -> f64 { 1.2 }
fn default_b() -> f64 { 0.75 }
fn default_0_2() -> f32 { 0.2 }
fn default_2() -> u32 { 2 }
fn default_5_usize() -> usize { 5 }
fn default_10_usize() -> usize { 10 }
fn default_50_usize() -> usize { 50 }
fn default_100_usize() -> usize { 100 }
fn default_256() -> usize { 256 }
fn default_800() -> usize { 800 }
fn default_1024() -> usize { 1024 }
fn default_2048() -> usize { 2048 }
fn default_30000() -> u64 { 30_000 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = QuillConfig::from_toml("").expect("parse");
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.chunking.chunk_size, 800);
        assert_eq!(config.embedding.batch_size, 10);
        assert!((config.retrieval.history.alpha - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn per_category_ranking_overrides() {
        let config = QuillConfig::from_toml(
            r#"
            [retrieval.outline]
            hybrid_search_alpha = 0.2
            recency_boost_strength = 0.5

            [retrieval.character]
            alpha = 1.0
            recency_weight = 0.0
            "#,
        )
        .expect("parse");
        assert!((config.retrieval.ranking(Category::Outline).alpha - 0.2).abs() < f64::EPSILON);
        assert!(
            (config.retrieval.ranking(Category::Outline).recency_boost_strength - 0.5).abs()
                < f64::EPSILON
        );
        assert!((config.retrieval.ranking(Category::Character).alpha - 1.0).abs() < f64::EPSILON);
        assert!((config.retrieval.ranking(Category::History).alpha - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn alpha_out_of_range_is_rejected() {
        let err = QuillConfig::from_toml("[retrieval.history]\nalpha = 1.5\n").unwrap_err();
        assert!(matches!(err, QuillError::Config(_)));
    }

    #[test]
    fn negative_decay_is_rejected() {
        let err = QuillConfig::from_toml("[retrieval.outline]\nrecency_boost_strength = -0.1\n")
            .unwrap_err();
        assert!(err.to_string().contains("recency_boost_strength"));
    }

    #[test]
    fn zero_top_k_is_rejected() {
        assert!(QuillConfig::from_toml("[retrieval]\ntop_k = 0\n").is_err());
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let err = QuillConfig::from_toml("[retrieval\n").unwrap_err();
        assert!(matches!(err, QuillError::Config(_)));
    }
}
