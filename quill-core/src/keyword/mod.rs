//! Keyword Index: BM25 over an incrementally maintained inverted index.
//!
//!   score(d, q) = Σ_t∈q idf(t) · tf(t,d)·(k1+1) / (tf(t,d) + k1·(1 − b + b·|d|/avgdl))
//!   idf(t)      = ln(1 + (N − df(t) + 0.5) / (df(t) + 0.5))
//!
//! This idf variant is strictly positive, so every matching document scores
//! above zero. Postings and length statistics are updated in place on
//! `index` / `remove`; removing a document leaves no trace of it.

pub mod tokenize;

use std::collections::{BTreeSet, HashMap};

use ordered_float::OrderedFloat;

use crate::config::KeywordConfig;
use crate::types::{Chunk, ChunkId};

pub use tokenize::tokenize;

/// Per-document bookkeeping needed to retract it later.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DocEntry {
    /// Token count.
    len: u32,
    /// Source position, for tie-breaks.
    source_position: u64,
    /// Distinct terms, sorted.
    terms: Vec<String>,
}

/// Inverted index with BM25 scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordIndex {
    params: KeywordConfig,
    /// term → (chunk → term frequency)
    postings: HashMap<String, HashMap<ChunkId, u32>>,
    docs: HashMap<ChunkId, DocEntry>,
    total_len: u64,
}

impl KeywordIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new(params: KeywordConfig) -> Self {
        Self {
            params,
            postings: HashMap::new(),
            docs: HashMap::new(),
            total_len: 0,
        }
    }

    /// Tokenize and index a chunk. Re-indexing the same id replaces it.
    pub fn index(&mut self, chunk: &Chunk) {
        self.index_text(chunk.id(), chunk.source_position(), chunk.text());
    }

    /// Index raw text under `id`.
    pub fn index_text(&mut self, id: &ChunkId, source_position: u64, text: &str) {
        if self.docs.contains_key(id) {
            self.remove(id);
        }

        let tokens = tokenize(text);
        let mut tf: HashMap<String, u32> = HashMap::new();
        for token in &tokens {
            *tf.entry(token.clone()).or_insert(0) += 1;
        }

        let len = u32::try_from(tokens.len()).unwrap_or(u32::MAX);
        let mut terms: Vec<String> = tf.keys().cloned().collect();
        terms.sort_unstable();

        for (term, count) in tf {
            self.postings.entry(term).or_default().insert(id.clone(), count);
        }
        self.total_len += u64::from(len);
        self.docs.insert(
            id.clone(),
            DocEntry {
                len,
                source_position,
                terms,
            },
        );
    }

    /// Retract a chunk. Returns `false` if it was not indexed.
    pub fn remove(&mut self, id: &ChunkId) -> bool {
        let Some(entry) = self.docs.remove(id) else {
            return false;
        };
        for term in &entry.terms {
            if let Some(list) = self.postings.get_mut(term) {
                list.remove(id);
                if list.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        self.total_len -= u64::from(entry.len);
        true
    }

    /// Top `top_k` chunks for `query_text`, best first.
    ///
    /// Ties break by source position, later first, then by chunk id. An empty or stop-word-only query yields no
    /// results.
    #[must_use]
    pub fn search(&self, query_text: &str, top_k: usize) -> Vec<(ChunkId, f64)> {
        let terms = query_terms(query_text);
        if terms.is_empty() || self.docs.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let mut scores: HashMap<&ChunkId, (f64, u64)> = HashMap::new();
        for term in &terms {
            let Some(list) = self.postings.get(term.as_str()) else {
                continue;
            };
            let idf = self.idf(list.len());
            for (id, &tf) in list {
                let (len, pos) = self.docs.get(id).map_or((0, 0), |d| (d.len, d.source_position));
                scores.entry(id).or_insert((0.0, pos)).0 += idf * self.tf_weight(tf, len);
            }
        }

        let mut ranked: Vec<(&ChunkId, f64, u64)> =
            scores.into_iter().map(|(id, (s, pos))| (id, s, pos)).collect();
        ranked.sort_by(|a, b| {
            OrderedFloat(b.1)
                .cmp(&OrderedFloat(a.1))
                .then_with(|| b.2.cmp(&a.2))
                .then_with(|| a.0.cmp(b.0))
        });
        ranked.truncate(top_k);
        ranked.into_iter().map(|(id, s, _)| (id.clone(), s)).collect()
    }

    /// BM25 score of a single chunk; 0 when it shares no term with the query
    /// or is not indexed.
    #[must_use]
    pub fn score(&self, id: &ChunkId, query_text: &str) -> f64 {
        let Some(doc) = self.docs.get(id) else {
            return 0.0;
        };
        query_terms(query_text)
            .iter()
            .filter_map(|term| {
                let list = self.postings.get(term.as_str())?;
                let tf = *list.get(id)?;
                Some(self.idf(list.len()) * self.tf_weight(tf, doc.len))
            })
            .sum()
    }

    /// Number of indexed chunks containing `term`.
    #[must_use]
    pub fn document_frequency(&self, term: &str) -> usize {
        self.postings.get(term).map_or(0, HashMap::len)
    }

    /// Mean document length in tokens.
    #[must_use]
    pub fn avg_doc_len(&self) -> f64 {
        if self.docs.is_empty() {
            0.0
        } else {
            self.total_len as f64 / self.docs.len() as f64
        }
    }

    /// Whether `id` is indexed.
    #[must_use]
    pub fn contains(&self, id: &ChunkId) -> bool {
        self.docs.contains_key(id)
    }

    /// Number of indexed chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Number of distinct terms.
    #[must_use]
    pub fn vocabulary_size(&self) -> usize {
        self.postings.len()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.postings.clear();
        self.docs.clear();
        self.total_len = 0;
    }

    fn idf(&self, df: usize) -> f64 {
        let n = self.docs.len() as f64;
        let df = df as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    fn tf_weight(&self, tf: u32, doc_len: u32) -> f64 {
        let KeywordConfig { k1, b } = self.params;
        let tf = f64::from(tf);
        let avg = self.avg_doc_len().max(1.0);
        let norm = k1 * (1.0 - b + b * f64::from(doc_len) / avg);
        tf * (k1 + 1.0) / (tf + norm)
    }
}

impl Default for KeywordIndex {
    fn default() -> Self {
        Self::new(KeywordConfig::default())
    }
}

/// Distinct query terms in sorted order, so score summation is deterministic.
fn query_terms(query_text: &str) -> BTreeSet<String> {
    tokenize(query_text).into_iter().collect()
}
