//! Hybrid Ranker: blends keyword and embedding relevance with a recency boost.
//!
//! Ranking one category for a query:
//! 1. Gather candidates: the keyword index's top `candidate_pool` hits, plus
//!    the embedding index's top `candidate_pool` hits when a query vector is
//!    available. A component with zero blend weight contributes none.
//! 2. Score every candidate on both components (BM25 and exact cosine).
//! 3. Min-max normalize each component over the candidate set.
//! 4. Blend, apply the recency boost, sort, truncate.
//!
//! Sort order is `final_score` descending, then `source_position`
//! descending, then chunk id ascending, so results are totally ordered.

pub mod scoring;

use std::cmp::Ordering;
use std::collections::BTreeSet;

use ordered_float::OrderedFloat;

use crate::config::RankingConfig;
use crate::keyword::KeywordIndex;
use crate::store::ChunkStore;
use crate::types::{ChunkId, Embedding, Query, ScoredChunk};
use crate::vector::EmbeddingIndex;

/// Ranks one category's chunks for a query.
#[derive(Debug, Clone, Copy)]
pub struct HybridRanker {
    config: RankingConfig,
    max_recency_weight: f64,
    candidate_pool: usize,
}

impl HybridRanker {
    /// Create a ranker. `recency_weight` is clamped to
    /// `[0, max_recency_weight]`.
    #[must_use]
    pub fn new(config: RankingConfig, max_recency_weight: f64, candidate_pool: usize) -> Self {
        Self {
            config,
            max_recency_weight: max_recency_weight.max(0.0),
            candidate_pool,
        }
    }

    /// The ranking parameters in use.
    #[must_use]
    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    /// Recency weight after clamping.
    #[must_use]
    pub fn effective_recency_weight(&self) -> f64 {
        self.config
            .recency_weight
            .clamp(0.0, self.max_recency_weight)
    }

    /// Rank `store`'s chunks for `query`, at most `query.top_k` results.
    ///
    /// Without a usable query vector (absent, or of a different
    /// dimensionality than the category's vectors), ranking is keyword-only.
    #[must_use]
    pub fn rank(
        &self,
        store: &ChunkStore,
        keywords: &KeywordIndex,
        vectors: &EmbeddingIndex,
        query: &Query,
    ) -> Vec<ScoredChunk> {
        if query.top_k == 0 {
            return Vec::new();
        }

        let query_vector: Option<&Embedding> = query
            .query_vector
            .as_ref()
            .filter(|v| vectors.dimensions() == Some(v.dimensions()));
        let alpha = if query_vector.is_some() {
            self.config.alpha.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let pool = self.candidate_pool.max(query.top_k);
        let mut candidates: BTreeSet<ChunkId> = BTreeSet::new();
        if alpha < 1.0 {
            candidates.extend(keywords.search(&query.text, pool).into_iter().map(|(id, _)| id));
        }
        if alpha > 0.0 {
            if let Some(v) = query_vector {
                candidates.extend(vectors.search(v, pool).into_iter().map(|(id, _)| id));
            }
        }
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut rows = Vec::with_capacity(candidates.len());
        for id in candidates {
            let Ok(chunk) = store.get(&id) else {
                tracing::debug!(chunk = %id, "candidate missing from store");
                continue;
            };
            let keyword_score = keywords.score(&id, &query.text);
            let embedding_score = query_vector.and_then(|v| vectors.similarity(&id, v));
            rows.push((chunk, keyword_score, embedding_score));
        }

        let keyword_norms =
            scoring::min_max_normalize(&rows.iter().map(|r| Some(r.1)).collect::<Vec<_>>());
        let embedding_norms =
            scoring::min_max_normalize(&rows.iter().map(|r| r.2).collect::<Vec<_>>());
        let recency_weight = self.effective_recency_weight();

        let mut results: Vec<ScoredChunk> = rows
            .into_iter()
            .zip(keyword_norms.into_iter().zip(embedding_norms))
            .map(|((chunk, keyword_score, embedding_score), (keyword_norm, embedding_norm))| {
                let combined = scoring::blend(alpha, embedding_norm, keyword_norm);
                let recency_score = scoring::recency_score(
                    query.anchor_position,
                    chunk.source_position(),
                    self.config.recency_boost_strength,
                );
                ScoredChunk {
                    chunk: chunk.clone(),
                    keyword_score,
                    embedding_score,
                    keyword_norm,
                    embedding_norm,
                    recency_score,
                    final_score: scoring::final_score(combined, recency_weight, recency_score),
                }
            })
            .collect();

        results.sort_by(compare_scored);
        results.truncate(query.top_k);
        results
    }
}

/// Result order: `final_score` desc, `source_position` desc, id asc.
#[must_use]
pub fn compare_scored(a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    OrderedFloat(b.final_score)
        .cmp(&OrderedFloat(a.final_score))
        .then_with(|| b.chunk.source_position().cmp(&a.chunk.source_position()))
        .then_with(|| a.chunk.id().cmp(b.chunk.id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, Chunk};

    struct Fixture {
        store: ChunkStore,
        keywords: KeywordIndex,
        vectors: EmbeddingIndex,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: ChunkStore::new(Category::History),
                keywords: KeywordIndex::default(),
                vectors: EmbeddingIndex::default(),
            }
        }

        fn add(&mut self, text: &str, pos: u64, vector: Option<&[f32]>) -> ChunkId {
            let chunk = Chunk::new(Category::History, text, pos);
            let id = chunk.id().clone();
            self.keywords.index(&chunk);
            if let Some(v) = vector {
                self.vectors.index(&id, pos, &Embedding(v.to_vec())).expect("index vector");
            }
            self.store.put(chunk);
            id
        }

        fn rank(&self, config: RankingConfig, query: &Query) -> Vec<ScoredChunk> {
            HybridRanker::new(config, 1.0, 50).rank(&self.store, &self.keywords, &self.vectors, query)
        }
    }

    fn ranking(alpha: f64, recency_boost_strength: f64, recency_weight: f64) -> RankingConfig {
        RankingConfig {
            alpha,
            recency_boost_strength,
            recency_weight,
        }
    }

    fn ids(results: &[ScoredChunk]) -> Vec<ChunkId> {
        results.iter().map(|r| r.chunk.id().clone()).collect()
    }

    #[test]
    fn alpha_zero_matches_keyword_order() {
        let mut f = Fixture::new();
        f.add("dragon dragon dragon", 1, Some(&[0.0, 1.0]));
        f.add("dragon castle", 2, Some(&[1.0, 0.0]));
        f.add("dragon castle moat gate", 3, Some(&[0.7, 0.7]));

        let query = Query::new("dragon").top_k(10).with_vector(Embedding(vec![1.0, 0.0]));
        let results = f.rank(ranking(0.0, 0.0, 0.0), &query);
        let expected: Vec<ChunkId> =
            f.keywords.search("dragon", 10).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids(&results), expected);
    }

    #[test]
    fn alpha_one_matches_embedding_order() {
        let mut f = Fixture::new();
        f.add("dragon dragon dragon", 1, Some(&[0.0, 1.0]));
        f.add("castle", 2, Some(&[1.0, 0.0]));
        f.add("moat", 3, Some(&[0.8, 0.6]));

        let qv = Embedding(vec![1.0, 0.0]);
        let query = Query::new("dragon").top_k(10).with_vector(qv.clone());
        let results = f.rank(ranking(1.0, 0.0, 0.0), &query);
        let expected: Vec<ChunkId> = f.vectors.search(&qv, 10).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids(&results), expected);
    }

    fn six_ravens() -> Fixture {
        let mut f = Fixture::new();
        for pos in 0..6 {
            f.add("raven", pos, Some(&[1.0, 0.0]));
        }
        f
    }

    #[test]
    fn alpha_zero_matches_keyword_order_on_ties() {
        let f = six_ravens();
        let query = Query::new("raven").top_k(6).with_vector(Embedding(vec![1.0, 0.0]));
        let results = f.rank(ranking(0.0, 0.0, 0.0), &query);
        let expected: Vec<ChunkId> =
            f.keywords.search("raven", 6).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids(&results), expected);
        let positions: Vec<u64> = results.iter().map(|r| r.chunk.source_position()).collect();
        assert_eq!(positions, vec![5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn alpha_one_matches_embedding_order_on_ties() {
        let f = six_ravens();
        let qv = Embedding(vec![1.0, 0.0]);
        let query = Query::new("raven").top_k(6).with_vector(qv.clone());
        let results = f.rank(ranking(1.0, 0.0, 0.0), &query);
        let expected: Vec<ChunkId> = f.vectors.search(&qv, 6).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids(&results), expected);
    }

    #[test]
    fn missing_query_vector_falls_back_to_keywords() {
        let mut f = Fixture::new();
        let hit = f.add("lantern in the dark", 1, Some(&[1.0, 0.0]));
        f.add("sunlit meadow", 2, Some(&[0.0, 1.0]));

        let results = f.rank(ranking(1.0, 0.0, 0.0), &Query::new("lantern"));
        assert_eq!(ids(&results), vec![hit]);
        assert!(results[0].embedding_score.is_none());
        assert!((results[0].final_score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unembedded_chunks_still_rank_on_keywords() {
        let mut f = Fixture::new();
        let degraded = f.add("storm harbor", 1, None);
        let embedded = f.add("calm sea", 2, Some(&[1.0, 0.0]));

        let query = Query::new("storm").top_k(5).with_vector(Embedding(vec![1.0, 0.0]));
        let results = f.rank(ranking(0.5, 0.0, 0.0), &query);
        assert_eq!(results.len(), 2);
        let d = results.iter().find(|r| r.chunk.id() == &degraded).expect("degraded present");
        assert!(d.embedding_score.is_none());
        assert!(d.keyword_norm > 0.0);
        assert!(results.iter().any(|r| r.chunk.id() == &embedded));
    }

    #[test]
    fn recency_prefers_nearer_chunks_on_equal_relevance() {
        let mut f = Fixture::new();
        let near = f.add("raven", 80, None);
        let far = f.add("raven", 20, None);

        let query = Query::new("raven").anchor(100);
        let results = f.rank(ranking(0.0, 0.05, 0.5), &query);
        assert_eq!(ids(&results), vec![near, far]);
        assert!(results[0].final_score >= results[1].final_score);
    }

    #[test]
    fn equal_scores_break_ties_by_position_then_id() {
        let mut f = Fixture::new();
        let early = f.add("ember", 5, None);
        let late = f.add("ember", 9, None);

        let results = f.rank(ranking(0.0, 0.0, 0.0), &Query::new("ember"));
        assert!((results[0].final_score - results[1].final_score).abs() < f64::EPSILON);
        assert_eq!(ids(&results), vec![late, early]);
    }

    #[test]
    fn recency_can_overtake_a_marginal_keyword_lead() {
        let mut f = Fixture::new();
        let p10 = f.add("dragon dragon castle", 10, None);
        let p50 = f.add("castle gate moat", 50, None);
        let p90 = f.add("dragon castle moat", 90, None);

        let query = Query::new("dragon castle").anchor(95);
        assert!(f.keywords.score(&p10, "dragon castle") > f.keywords.score(&p90, "dragon castle"));

        let results = f.rank(ranking(0.0, 0.1, 1.0), &query);
        assert_eq!(ids(&results), vec![p90, p10, p50]);
    }

    #[test]
    fn recency_weight_is_capped() {
        let ranker = HybridRanker::new(ranking(0.5, 0.1, 5.0), 1.0, 10);
        assert!((ranker.effective_recency_weight() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unmatched_query_is_empty() {
        let mut f = Fixture::new();
        f.add("dragon", 1, None);
        assert!(f.rank(ranking(0.5, 0.0, 0.0), &Query::new("unicorn")).is_empty());
        assert!(f.rank(ranking(0.5, 0.0, 0.0), &Query::new("the")).is_empty());
        assert!(f.rank(ranking(0.5, 0.0, 0.0), &Query::new("dragon").top_k(0)).is_empty());
    }

    #[test]
    fn results_are_truncated_and_sorted() {
        let mut f = Fixture::new();
        for i in 0..10u64 {
            f.add(&format!("wolf {}", "howl ".repeat(i as usize)), i, None);
        }
        let results = f.rank(ranking(0.0, 0.0, 0.0), &Query::new("wolf howl").top_k(3));
        assert_eq!(results.len(), 3);
        for pair in results.windows(2) {
            assert_ne!(compare_scored(&pair[0], &pair[1]), Ordering::Greater);
        }
    }
}
