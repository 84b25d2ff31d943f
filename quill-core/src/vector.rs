//! Embedding Index: cosine-similarity search over chunk embeddings.
//!
//! Vectors are stored L2-normalized, so cosine similarity is a dot product.
//! Small indices are scanned exactly. Once the index holds
//! `exact_search_threshold` vectors, an HNSW graph (`instant-distance`) is
//! built over them and rebuilt whenever the fraction of vectors inserted or
//! removed since the last build exceeds `rebuild_threshold`.
//!
//! The graph itself is immutable, so between rebuilds:
//! - hits for removed or replaced ids are filtered against the live set, and
//! - vectors inserted since the build are scanned exactly and merged in.
//!
//! The graph is always built from ids in sorted order with a fixed seed on a
//! single thread, so the same set of vectors produces the same graph.

use std::collections::{HashMap, HashSet};

use instant_distance::{Builder, HnswMap, Point, Search};
use ordered_float::OrderedFloat;

use crate::config::VectorConfig;
use crate::error::{QuillError, Result};
use crate::types::{ChunkId, Embedding};

// ---------------------------------------------------------------------------
// HnswPoint: adapter from a normalized vector to instant-distance's Point
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct HnswPoint {
    normalized: Vec<f32>,
}

impl Point for HnswPoint {
    /// Cosine distance `1 - dot`, vectors being pre-normalized.
    fn distance(&self, other: &Self) -> f32 {
        if self.normalized.len() != other.normalized.len() {
            return 1.0;
        }
        (1.0 - dot(&self.normalized, &other.normalized)).max(0.0)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

// ---------------------------------------------------------------------------
// EmbeddingIndex
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredVector {
    source_position: u64,
    normalized: Vec<f32>,
}

/// The graph partition of an [`EmbeddingIndex`], enough to rebuild an
/// identical graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphState {
    /// Whether a graph is in use.
    pub built: bool,
    /// Live ids whose current vector is in the graph, sorted.
    pub members: Vec<ChunkId>,
    /// Graph points whose id was removed or re-indexed since the build,
    /// sorted by id. Vectors are normalized.
    pub stale: Vec<(ChunkId, Vec<f32>)>,
    /// Inserts and removals since the build.
    pub dirty_count: usize,
}

/// Vector index for one category.
pub struct EmbeddingIndex {
    params: VectorConfig,
    /// Live vectors, normalized.
    vectors: HashMap<ChunkId, StoredVector>,
    /// Fixed by the first insertion.
    dimensions: Option<usize>,
    /// Graph over the vectors present at the last build.
    map: Option<HnswMap<HnswPoint, ChunkId>>,
    /// Ids whose current vector is in `map`.
    built: HashSet<ChunkId>,
    /// Points in `map` that are no longer live, kept so the graph can be
    /// reproduced.
    stale: HashMap<ChunkId, Vec<f32>>,
    /// Inserts and removals since the last build.
    dirty_count: usize,
}

impl EmbeddingIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new(params: VectorConfig) -> Self {
        Self {
            params,
            vectors: HashMap::new(),
            dimensions: None,
            map: None,
            built: HashSet::new(),
            stale: HashMap::new(),
            dirty_count: 0,
        }
    }

    /// Rebuild an index from saved vectors and its saved graph partition.
    ///
    /// The graph is rebuilt from exactly the saved members and stale points,
    /// so searches return what they returned before the save.
    ///
    /// # Errors
    /// Returns [`QuillError::DimensionMismatch`] if a vector disagrees with
    /// `dimensions`, or [`QuillError::Serialization`] if the graph partition
    /// names ids that are not live or overlaps itself.
    pub fn restore(
        params: VectorConfig,
        dimensions: Option<usize>,
        entries: Vec<(ChunkId, u64, Embedding)>,
        mut graph: GraphState,
    ) -> Result<Self> {
        graph.members.sort_unstable();
        let mut index = Self::new(params);
        index.dimensions = dimensions;
        for (id, source_position, embedding) in entries {
            index.check_dimensions(embedding.dimensions())?;
            index.dimensions = Some(embedding.dimensions());
            index.vectors.insert(
                id,
                StoredVector {
                    source_position,
                    normalized: embedding.normalized(),
                },
            );
        }

        if !graph.built {
            return Ok(index);
        }
        for id in &graph.members {
            if !index.vectors.contains_key(id) {
                return Err(QuillError::Serialization(format!(
                    "graph member {id} has no stored vector"
                )));
            }
        }
        for (id, vector) in &graph.stale {
            if graph.members.binary_search(id).is_ok() {
                return Err(QuillError::Serialization(format!(
                    "graph point {id} is both live and stale"
                )));
            }
            index.check_dimensions(vector.len())?;
        }

        let mut points: Vec<(&ChunkId, &Vec<f32>)> = graph
            .members
            .iter()
            .filter_map(|id| index.vectors.get(id).map(|v| (id, &v.normalized)))
            .chain(graph.stale.iter().map(|(id, v)| (id, v)))
            .collect();
        points.sort_unstable_by(|a, b| a.0.cmp(b.0));
        let map = index.build_graph(points);

        index.map = map;
        index.built = graph.members.into_iter().collect();
        index.stale = graph.stale.into_iter().collect();
        index.dirty_count = graph.dirty_count;
        Ok(index)
    }

    /// Store the vector for `id`, replacing any previous one.
    ///
    /// # Errors
    /// Returns [`QuillError::DimensionMismatch`] if the vector is empty or its
    /// length differs from the dimensionality fixed by the first insertion.
    pub fn index(
        &mut self,
        id: &ChunkId,
        source_position: u64,
        embedding: &Embedding,
    ) -> Result<()> {
        let actual = embedding.dimensions();
        self.check_dimensions(actual)?;

        self.dimensions = Some(actual);
        let previous = self.vectors.insert(
            id.clone(),
            StoredVector {
                source_position,
                normalized: embedding.normalized(),
            },
        );
        if let Some(previous) = previous {
            self.retire(id, previous);
        }
        self.dirty_count += 1;
        self.maybe_rebuild();
        Ok(())
    }

    /// Delete the vector for `id`. Returns `false` if none was stored.
    pub fn remove(&mut self, id: &ChunkId) -> bool {
        let Some(previous) = self.vectors.remove(id) else {
            return false;
        };
        self.retire(id, previous);
        self.dirty_count += 1;
        self.maybe_rebuild();
        true
    }

    /// The `k` most similar vectors to `query`, best first, as
    /// `(id, cosine similarity)`.
    ///
    /// Ties break by source position, later first, then by chunk id. A
    /// query of the wrong dimensionality matches nothing.
    #[must_use]
    pub fn search(&self, query: &Embedding, k: usize) -> Vec<(ChunkId, f64)> {
        if k == 0 || self.vectors.is_empty() || Some(query.dimensions()) != self.dimensions {
            return Vec::new();
        }
        let query = query.normalized();

        let Some(map) = &self.map else {
            return self.exact_search(&query, k, |_| true);
        };

        let point = HnswPoint {
            normalized: query.clone(),
        };
        let mut search = Search::default();
        let mut hits: Vec<Hit> = map
            .search(&point, &mut search)
            .filter(|item| self.built.contains(item.value))
            .filter_map(|item| {
                let v = self.vectors.get(item.value)?;
                Some(Hit::new(item.value, v, &query))
            })
            .collect();

        // The graph yields at most `ef_search` candidates; fall back to a full
        // scan if filtering left too few.
        if hits.len() < k.min(self.built.len()) {
            return self.exact_search(&query, k, |_| true);
        }

        hits.extend(self.exact_hits(&query, |id| !self.built.contains(id)));
        finish(hits, k)
    }

    /// Exact cosine similarity between the stored vector for `id` and
    /// `query`, or `None` if no vector is stored or the sizes differ.
    #[must_use]
    pub fn similarity(&self, id: &ChunkId, query: &Embedding) -> Option<f64> {
        let stored = self.vectors.get(id)?;
        if stored.normalized.len() != query.dimensions() {
            return None;
        }
        Some(clamp_similarity(dot(&stored.normalized, &query.normalized())))
    }

    /// Whether a vector is stored for `id`.
    #[must_use]
    pub fn contains(&self, id: &ChunkId) -> bool {
        self.vectors.contains_key(id)
    }

    /// The fixed dimensionality, once set.
    #[must_use]
    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    /// Number of stored vectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Drop every vector and forget the dimensionality.
    pub fn clear(&mut self) {
        self.vectors.clear();
        self.dimensions = None;
        self.map = None;
        self.built.clear();
        self.stale.clear();
        self.dirty_count = 0;
    }

    /// Index statistics for debugging.
    #[must_use]
    pub fn stats(&self) -> EmbeddingIndexStats {
        EmbeddingIndexStats {
            total_points: self.vectors.len(),
            dirty_count: self.dirty_count,
            stale_points: self.stale.len(),
            is_built: self.map.is_some(),
            dimensions: self.dimensions,
            ef_construction: self.params.ef_construction,
            ef_search: self.params.ef_search,
        }
    }

    /// The current graph partition, for persistence.
    #[must_use]
    pub fn graph_state(&self) -> GraphState {
        let mut members: Vec<ChunkId> = self.built.iter().cloned().collect();
        members.sort_unstable();
        let mut stale: Vec<(ChunkId, Vec<f32>)> =
            self.stale.iter().map(|(id, v)| (id.clone(), v.clone())).collect();
        stale.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        GraphState {
            built: self.map.is_some(),
            members,
            stale,
            dirty_count: self.dirty_count,
        }
    }

    /// Whether the graph is due for a rebuild.
    #[must_use]
    pub fn needs_rebuild(&self) -> bool {
        let total = self.vectors.len();
        if total < self.params.exact_search_threshold.max(1) {
            return false;
        }
        if self.map.is_none() {
            return true;
        }
        (self.dirty_count as f32 / total as f32) > self.params.rebuild_threshold
    }

    /// Build the HNSW graph from every live vector, in id order.
    pub fn build(&mut self) {
        let mut points: Vec<(&ChunkId, &Vec<f32>)> =
            self.vectors.iter().map(|(id, v)| (id, &v.normalized)).collect();
        points.sort_unstable_by(|a, b| a.0.cmp(b.0));
        let map = self.build_graph(points);

        self.built = match map {
            Some(_) => self.vectors.keys().cloned().collect(),
            None => HashSet::new(),
        };
        self.map = map;
        self.stale.clear();
        self.dirty_count = 0;
    }

    fn build_graph(
        &self,
        points: Vec<(&ChunkId, &Vec<f32>)>,
    ) -> Option<HnswMap<HnswPoint, ChunkId>> {
        if points.is_empty() {
            return None;
        }
        let (values, points): (Vec<ChunkId>, Vec<HnswPoint>) = points
            .into_iter()
            .map(|(id, v)| {
                (
                    id.clone(),
                    HnswPoint {
                        normalized: v.clone(),
                    },
                )
            })
            .unzip();
        tracing::debug!(points = values.len(), "rebuilt embedding graph");
        let builder = Builder::default()
            .ef_construction(self.params.ef_construction)
            .ef_search(self.params.ef_search)
            .seed(42);
        // Lower layers are inserted in parallel; one thread keeps the graph a
        // pure function of its points.
        let map = match rayon::ThreadPoolBuilder::new().num_threads(1).build() {
            Ok(pool) => pool.install(|| builder.build(points, values)),
            Err(err) => {
                tracing::warn!(error = %err, "single-threaded graph build unavailable");
                builder.build(points, values)
            }
        };
        Some(map)
    }

    fn check_dimensions(&self, actual: usize) -> Result<()> {
        match self.dimensions {
            Some(expected) if expected != actual => {
                Err(QuillError::DimensionMismatch { expected, actual })
            }
            None if actual == 0 => Err(QuillError::DimensionMismatch {
                expected: 1,
                actual: 0,
            }),
            _ => Ok(()),
        }
    }

    /// A graph member's vector stops being live.
    fn retire(&mut self, id: &ChunkId, previous: StoredVector) {
        if self.built.remove(id) {
            self.stale.insert(id.clone(), previous.normalized);
        }
    }

    fn maybe_rebuild(&mut self) {
        if self.vectors.len() < self.params.exact_search_threshold.max(1) {
            if self.map.is_some() {
                self.map = None;
                self.built.clear();
                self.stale.clear();
            }
            return;
        }
        if self.needs_rebuild() {
            self.build();
        }
    }

    fn exact_hits(&self, query: &[f32], include: impl Fn(&ChunkId) -> bool) -> Vec<Hit> {
        self.vectors
            .iter()
            .filter(|(id, _)| include(id))
            .map(|(id, v)| Hit::new(id, v, query))
            .collect()
    }

    fn exact_search(
        &self,
        query: &[f32],
        k: usize,
        include: impl Fn(&ChunkId) -> bool,
    ) -> Vec<(ChunkId, f64)> {
        finish(self.exact_hits(query, include), k)
    }
}

impl Default for EmbeddingIndex {
    fn default() -> Self {
        Self::new(VectorConfig::default())
    }
}

impl std::fmt::Debug for EmbeddingIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingIndex")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn clamp_similarity(s: f32) -> f64 {
    f64::from(s.clamp(-1.0, 1.0))
}

struct Hit {
    id: ChunkId,
    similarity: f64,
    source_position: u64,
}

impl Hit {
    fn new(id: &ChunkId, stored: &StoredVector, query: &[f32]) -> Self {
        Self {
            id: id.clone(),
            similarity: clamp_similarity(dot(query, &stored.normalized)),
            source_position: stored.source_position,
        }
    }
}

/// Sort by similarity desc, position desc, id asc and keep the top `k`.
fn finish(mut hits: Vec<Hit>, k: usize) -> Vec<(ChunkId, f64)> {
    hits.sort_by(|a, b| {
        OrderedFloat(b.similarity)
            .cmp(&OrderedFloat(a.similarity))
            .then_with(|| b.source_position.cmp(&a.source_position))
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(k);
    hits.into_iter().map(|h| (h.id, h.similarity)).collect()
}

/// Statistics about the embedding index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingIndexStats {
    /// Number of stored vectors.
    pub total_points: usize,
    /// Inserts and removals since the last graph build.
    pub dirty_count: usize,
    /// Graph points that are no longer live.
    pub stale_points: usize,
    /// Whether an HNSW graph is in use.
    pub is_built: bool,
    /// Fixed dimensionality.
    pub dimensions: Option<usize>,
    /// `ef_construction` parameter.
    pub ef_construction: usize,
    /// `ef_search` parameter.
    pub ef_search: usize,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
