//! Knowledge Base Manager: category lifecycle, ingestion and query fan-out.
//!
//! Owns one [`ChunkStore`], [`KeywordIndex`] and [`EmbeddingIndex`] per
//! category, each behind its own `RwLock`. Searches take read locks; index
//! mutation takes the write lock for the duration of one chunk.
//!
//! Ingestion runs in three steps:
//! 1. chunk the text and register a cancellation token per new chunk,
//! 2. compute embeddings with no lock held,
//! 3. under the write lock, drop cancelled chunks and commit the rest to all
//!    three structures at once.
//!
//! Deleting or resetting while an embedding is in flight cancels the token,
//! so a vector is never indexed for text that no longer exists.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunking::{ChunkingPolicy, LineChunker};
use crate::config::QuillConfig;
use crate::embedding::{EmbeddingService, NoEmbeddingService};
use crate::error::{QuillError, Result};
use crate::keyword::KeywordIndex;
use crate::persistence::{CategorySnapshot, PersistenceEngine};
use crate::retrieval::{compare_scored, HybridRanker};
use crate::store::ChunkStore;
use crate::types::{
    Category, CategoryState, Chunk, ChunkId, Embedding, KnowledgeBaseStats, Query, ScoredChunk,
};
use crate::vector::{EmbeddingIndex, EmbeddingIndexStats};

// ---------------------------------------------------------------------------
// Ingest report
// ---------------------------------------------------------------------------

/// Outcome of one `ingest` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Chunks newly committed.
    pub inserted: usize,
    /// Chunks already stored or already being ingested.
    pub skipped: usize,
    /// Committed chunks that have no embedding (keyword-only).
    pub degraded: usize,
    /// Chunks deleted while their embedding was in flight.
    pub discarded: usize,
    /// Ids of the committed chunks, in chunk order.
    pub chunk_ids: Vec<ChunkId>,
}

// ---------------------------------------------------------------------------
// Per-category state
// ---------------------------------------------------------------------------

struct PendingIngest {
    ticket: u64,
    token: CancellationToken,
    source_position: u64,
}

/// Store and indices for one category.
struct CategoryIndex {
    category: Category,
    state: CategoryState,
    store: ChunkStore,
    keywords: KeywordIndex,
    vectors: EmbeddingIndex,
}

impl CategoryIndex {
    fn new(category: Category, config: &QuillConfig) -> Self {
        Self {
            category,
            state: CategoryState::Uninitialized,
            store: ChunkStore::new(category),
            keywords: KeywordIndex::new(config.keyword),
            vectors: EmbeddingIndex::new(config.vector),
        }
    }

    /// Commit a chunk to the store and both indices, or to none of them.
    fn insert(&mut self, chunk: Chunk) -> Result<()> {
        let id = chunk.id().clone();
        let position = chunk.source_position();
        let embedding = chunk.embedding().cloned();

        self.store.insert(chunk)?;
        let stored = self.store.get(&id)?;
        self.keywords.index(stored);

        if let Some(embedding) = embedding {
            if let Err(err) = self.vectors.index(&id, position, &embedding) {
                self.keywords.remove(&id);
                let _rolled_back = self.store.delete(&id);
                return Err(err);
            }
        }
        Ok(())
    }

    fn remove(&mut self, id: &ChunkId) -> Result<Chunk> {
        let chunk = self.store.delete(id)?;
        self.keywords.remove(id);
        self.vectors.remove(id);
        Ok(chunk)
    }

    fn clear(&mut self) {
        self.state = CategoryState::Uninitialized;
        self.store.clear();
        self.keywords.clear();
        self.vectors.clear();
    }

    fn stats(&self) -> KnowledgeBaseStats {
        KnowledgeBaseStats {
            category: self.category,
            state: self.state,
            active: self.state.is_active(),
            chunk_count: self.store.len(),
            embedded_count: self.vectors.len(),
            dimensions: self.vectors.dimensions(),
        }
    }

    fn snapshot(&self) -> CategorySnapshot {
        let mut chunks: Vec<Chunk> = self.store.list_by_category().cloned().collect();
        chunks.sort_by(|a, b| a.id().cmp(b.id()));
        CategorySnapshot {
            category: self.category,
            state: self.state,
            dimensions: self.vectors.dimensions(),
            chunks,
            graph: self.vectors.graph_state(),
        }
    }

    /// Rebuild from stored rows. The embedding graph is rebuilt from the
    /// saved partition, so searches rank exactly as they did before saving.
    fn from_snapshot(snapshot: CategorySnapshot, config: &QuillConfig) -> Result<Self> {
        let mut index = Self::new(snapshot.category, config);
        index.state = snapshot.state;

        let mut entries = Vec::new();
        for chunk in snapshot.chunks {
            if let Some(embedding) = chunk.embedding() {
                entries.push((chunk.id().clone(), chunk.source_position(), embedding.clone()));
            }
            let id = chunk.id().clone();
            index.store.insert(chunk)?;
            index.keywords.index(index.store.get(&id)?);
        }
        index.vectors =
            EmbeddingIndex::restore(config.vector, snapshot.dimensions, entries, snapshot.graph)?;
        Ok(index)
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Entry point for the retrieval core.
pub struct KnowledgeBaseManager {
    config: QuillConfig,
    embedder: Arc<dyn EmbeddingService>,
    chunker: Box<dyn ChunkingPolicy>,
    categories: [RwLock<CategoryIndex>; 3],
    pending: DashMap<(Category, ChunkId), PendingIngest>,
    next_ticket: AtomicU64,
    query_cache: Mutex<LruCache<String, Embedding>>,
}

impl std::fmt::Debug for KnowledgeBaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeBaseManager")
            .field("model", &self.embedder.model_name())
            .field("in_flight", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl KnowledgeBaseManager {
    /// Create a manager with every category `Uninitialized`.
    #[must_use]
    pub fn new(
        config: QuillConfig,
        embedder: Arc<dyn EmbeddingService>,
        chunker: Box<dyn ChunkingPolicy>,
    ) -> Self {
        let cache_size =
            NonZeroUsize::new(config.embedding.query_cache_size).unwrap_or(NonZeroUsize::MIN);
        let categories = Category::ALL.map(|c| RwLock::new(CategoryIndex::new(c, &config)));
        Self {
            config,
            embedder,
            chunker,
            categories,
            pending: DashMap::new(),
            next_ticket: AtomicU64::new(0),
            query_cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    /// Keyword-only manager with the default line chunker.
    #[must_use]
    pub fn keyword_only(config: QuillConfig) -> Self {
        let chunker = LineChunker::from_config(&config.chunking);
        Self::new(config, Arc::new(NoEmbeddingService), Box::new(chunker))
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &QuillConfig {
        &self.config
    }

    /// Default directory for `save_all` / `load_all`.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.config.persistence.directory
    }

    fn slot(&self, category: Category) -> &RwLock<CategoryIndex> {
        &self.categories[category.index()]
    }

    fn ranker(&self, category: Category) -> HybridRanker {
        let retrieval = &self.config.retrieval;
        HybridRanker::new(
            *retrieval.ranking(category),
            retrieval.max_recency_weight,
            retrieval.candidate_pool,
        )
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Include `category` in search. Idempotent.
    pub fn activate(&self, category: Category) {
        let mut guard = self.slot(category).write();
        if guard.state != CategoryState::Active {
            info!(category = %category, from = %guard.state, "activating knowledge base");
            guard.state = CategoryState::Active;
        }
    }

    /// Exclude `category` from search, keeping its data. Idempotent; an
    /// uninitialized category stays uninitialized.
    pub fn deactivate(&self, category: Category) {
        let mut guard = self.slot(category).write();
        if guard.state == CategoryState::Active {
            info!(category = %category, "deactivating knowledge base");
            guard.state = CategoryState::Inactive;
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self, category: Category) -> CategoryState {
        self.slot(category).read().state
    }

    /// Clear the category's store and indices and return it to
    /// `Uninitialized`. In-flight ingestions are cancelled. Irreversible.
    pub fn reset(&self, category: Category) {
        let mut guard = self.slot(category).write();
        let cancelled = self.cancel_pending(|c, _| c == category);
        let dropped = guard.store.len();
        guard.clear();
        info!(category = %category, chunks = dropped, cancelled, "knowledge base reset");
    }

    /// Snapshot of the category.
    #[must_use]
    pub fn stats(&self, category: Category) -> KnowledgeBaseStats {
        self.slot(category).read().stats()
    }

    /// Statistics of the category's embedding index.
    #[must_use]
    pub fn index_stats(&self, category: Category) -> EmbeddingIndexStats {
        self.slot(category).read().vectors.stats()
    }

    /// All chunks of the category, ordered by source position.
    #[must_use]
    pub fn chunks(&self, category: Category) -> Vec<Chunk> {
        self.slot(category)
            .read()
            .store
            .list_by_category()
            .cloned()
            .collect()
    }

    /// Fetch one chunk.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::NotFound`] if the chunk is not stored.
    pub fn get(&self, category: Category, id: &ChunkId) -> Result<Chunk> {
        self.slot(category).read().store.get(id).cloned()
    }

    /// Number of chunks of the category whose embedding is in flight.
    #[must_use]
    pub fn in_flight(&self, category: Category) -> usize {
        self.pending.iter().filter(|e| e.key().0 == category).count()
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Chunk `text`, embed the new chunks and commit them.
    ///
    /// Chunks get `source_position = source_position + offset`. Chunks that
    /// are already stored are skipped. If the embedding service fails the
    /// chunk is committed without a vector (degraded). The activation state
    /// is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::DimensionMismatch`] if an embedding does not
    /// match the category's vectors. Chunks committed before the failing
    /// one stay committed; the failing chunk leaves no trace.
    pub async fn ingest(
        &self,
        category: Category,
        text: &str,
        source_position: u64,
    ) -> Result<IngestReport> {
        let start = Instant::now();
        let mut report = IngestReport::default();

        let mut work: Vec<(Chunk, u64, CancellationToken)> = Vec::new();
        {
            let guard = self.slot(category).read();
            for (piece, offset) in self.chunker.chunk(text) {
                let chunk = Chunk::new(category, piece, source_position.saturating_add(offset));
                if guard.store.contains(chunk.id()) {
                    report.skipped += 1;
                    continue;
                }
                match self.pending.entry((category, chunk.id().clone())) {
                    Entry::Occupied(_) => report.skipped += 1,
                    Entry::Vacant(slot) => {
                        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                        let token = CancellationToken::new();
                        slot.insert(PendingIngest {
                            ticket,
                            token: token.clone(),
                            source_position: chunk.source_position(),
                        });
                        work.push((chunk, ticket, token));
                    }
                }
            }
        }

        let texts: Vec<String> = work.iter().map(|(c, _, _)| c.text().to_string()).collect();
        let tokens: Vec<CancellationToken> = work.iter().map(|(_, _, t)| t.clone()).collect();
        let embeddings = self.embed_all(category, &texts, &tokens).await;

        let mut failure: Option<QuillError> = None;
        for ((mut chunk, ticket, token), embedding) in work.into_iter().zip(embeddings) {
            let key = (category, chunk.id().clone());
            let mut guard = self.slot(category).write();
            self.pending.remove_if(&key, |_, p| p.ticket == ticket);

            if failure.is_some() {
                continue;
            }
            if token.is_cancelled() {
                debug!(category = %category, chunk = %chunk.id(), "ingestion cancelled");
                report.discarded += 1;
                continue;
            }
            if guard.store.contains(chunk.id()) {
                report.skipped += 1;
                continue;
            }

            let degraded = match embedding {
                Some(e) => !chunk.set_embedding(e),
                None => true,
            };
            let id = chunk.id().clone();
            match guard.insert(chunk) {
                Ok(()) => {
                    report.inserted += 1;
                    if degraded {
                        report.degraded += 1;
                    }
                    report.chunk_ids.push(id);
                }
                Err(err) => {
                    warn!(category = %category, chunk = %id, error = %err, "ingestion rolled back");
                    failure = Some(err);
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }

        info!(
            category = %category,
            inserted = report.inserted,
            skipped = report.skipped,
            degraded = report.degraded,
            discarded = report.discarded,
            elapsed_us = start.elapsed().as_micros(),
            "ingested"
        );
        Ok(report)
    }

    /// Embed `texts` in batches. A failed batch is retried one text at a
    /// time; a text whose token is cancelled, or whose embedding fails,
    /// yields `None`.
    async fn embed_all(
        &self,
        category: Category,
        texts: &[String],
        tokens: &[CancellationToken],
    ) -> Vec<Option<Embedding>> {
        let batch_size = self.config.embedding.batch_size.max(1);
        let mut out: Vec<Option<Embedding>> = Vec::with_capacity(texts.len());

        for (batch_no, batch) in texts.chunks(batch_size).enumerate() {
            let base = batch_no * batch_size;
            let batch_tokens = tokens.get(base..base + batch.len()).unwrap_or(&[]);
            if !batch_tokens.is_empty() && batch_tokens.iter().all(CancellationToken::is_cancelled) {
                out.extend(std::iter::repeat_n(None, batch.len()));
            } else {
                self.embed_batch_into(category, batch, batch_tokens, &mut out).await;
            }
            debug!(
                category = %category,
                done = out.len(),
                total = texts.len(),
                "embedding progress"
            );
        }
        out
    }

    /// Embed one batch, falling back to per-text calls if the batch call
    /// fails. Appends exactly `batch.len()` entries to `out`.
    async fn embed_batch_into(
        &self,
        category: Category,
        batch: &[String],
        tokens: &[CancellationToken],
        out: &mut Vec<Option<Embedding>>,
    ) {
        match self.embedder.embed_batch(batch).await {
            Ok(vectors) if vectors.len() == batch.len() => {
                out.extend(vectors.into_iter().map(Some));
                return;
            }
            Ok(vectors) => warn!(
                category = %category,
                expected = batch.len(),
                got = vectors.len(),
                "embedding batch returned wrong count, retrying singly"
            ),
            Err(err) => warn!(
                category = %category,
                size = batch.len(),
                error = %err,
                "embedding batch failed, retrying singly"
            ),
        }

        for (i, text) in batch.iter().enumerate() {
            let token = tokens.get(i).cloned().unwrap_or_default();
            let result = tokio::select! {
                () = token.cancelled() => None,
                r = self.embedder.embed(text) => Some(r),
            };
            out.push(match result {
                Some(Ok(v)) => Some(v),
                Some(Err(err)) if err.is_degraded() => {
                    warn!(
                        category = %category,
                        error = %err,
                        "embedding unavailable, keeping chunk keyword-only"
                    );
                    None
                }
                Some(Err(err)) => {
                    warn!(category = %category, error = %err, "embedding service error");
                    None
                }
                None => None,
            });
        }
    }

    /// Retry embedding for chunks stored without a vector.
    ///
    /// Returns how many chunks gained an embedding.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::DimensionMismatch`] if a new embedding does not
    /// match the category's vectors.
    pub async fn reembed(&self, category: Category) -> Result<usize> {
        let targets: Vec<(ChunkId, String)> = {
            let guard = self.slot(category).read();
            guard
                .store
                .unembedded()
                .into_iter()
                .filter_map(|id| {
                    let text = guard.store.get(&id).ok()?.text().to_string();
                    Some((id, text))
                })
                .collect()
        };
        if targets.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = targets.iter().map(|(_, t)| t.clone()).collect();
        let embeddings = self.embed_all(category, &texts, &[]).await;

        let mut guard = self.slot(category).write();
        let mut embedded = 0;
        for ((id, _), embedding) in targets.into_iter().zip(embeddings) {
            let Some(embedding) = embedding else { continue };
            let Ok(chunk) = guard.store.get(&id) else { continue };
            if chunk.embedding().is_some() {
                continue;
            }
            let position = chunk.source_position();
            guard.vectors.index(&id, position, &embedding)?;
            guard.store.attach_embedding(&id, embedding)?;
            embedded += 1;
        }
        info!(category = %category, embedded, "re-embed pass complete");
        Ok(embedded)
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Delete one chunk from the store and both indices, or cancel its
    /// in-flight ingestion.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::NotFound`] if the chunk is neither stored nor
    /// in flight.
    pub fn delete(&self, category: Category, id: &ChunkId) -> Result<()> {
        let mut guard = self.slot(category).write();
        let cancelled = self.cancel_pending(|c, i| c == category && i == id);
        match guard.remove(id) {
            Ok(_) => {
                debug!(category = %category, chunk = %id, "chunk deleted");
                Ok(())
            }
            Err(_) if cancelled > 0 => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Delete every chunk at `source_position` and cancel in-flight
    /// ingestions there. Returns how many chunks were removed or cancelled.
    pub fn delete_at_position(&self, category: Category, source_position: u64) -> usize {
        let mut guard = self.slot(category).write();
        let cancelled = self.cancel_pending_where(|c, p| {
            c == category && p.source_position == source_position
        });
        let mut removed = 0;
        for id in guard.store.ids_at_position(source_position) {
            if guard.remove(&id).is_ok() {
                removed += 1;
            }
        }
        debug!(category = %category, source_position, removed, cancelled, "deleted at position");
        removed + cancelled
    }

    fn cancel_pending(&self, matches: impl Fn(Category, &ChunkId) -> bool) -> usize {
        let mut cancelled = 0;
        self.pending.retain(|(c, id), p| {
            if matches(*c, id) {
                p.token.cancel();
                cancelled += 1;
                false
            } else {
                true
            }
        });
        cancelled
    }

    fn cancel_pending_where(&self, matches: impl Fn(Category, &PendingIngest) -> bool) -> usize {
        let mut cancelled = 0;
        self.pending.retain(|(c, _), p| {
            if matches(*c, p) {
                p.token.cancel();
                cancelled += 1;
                false
            } else {
                true
            }
        });
        cancelled
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// A query over every category limited to the configured
    /// `retrieval.top_k` results.
    #[must_use]
    pub fn query(&self, text: impl Into<String>) -> Query {
        Query::new(text).top_k(self.config.retrieval.top_k)
    }

    /// Rank chunks from every active category the query selects.
    ///
    /// Never fails: unmatched queries and inactive categories yield an
    /// empty result.
    #[must_use]
    pub fn search(&self, query: &Query) -> Vec<ScoredChunk> {
        let start = Instant::now();
        let mut results = Vec::new();
        for category in Category::ALL {
            if !query.includes(category) {
                continue;
            }
            let guard = self.slot(category).read();
            if !guard.state.is_active() {
                continue;
            }
            results.extend(self.ranker(category).rank(
                &guard.store,
                &guard.keywords,
                &guard.vectors,
                query,
            ));
        }
        results.sort_by(compare_scored);
        results.truncate(query.top_k);
        debug!(
            results = results.len(),
            elapsed_us = start.elapsed().as_micros(),
            "search complete"
        );
        results
    }

    /// Embed the query text (cached), then [`search`](Self::search).
    ///
    /// Falls back to keyword-only ranking if the query cannot be embedded.
    pub async fn search_text(&self, mut query: Query) -> Vec<ScoredChunk> {
        if query.query_vector.is_none() && self.has_vectors_for(&query) {
            query.query_vector = self.query_embedding(&query.text).await;
        }
        self.search(&query)
    }

    fn has_vectors_for(&self, query: &Query) -> bool {
        Category::ALL.into_iter().any(|c| {
            if !query.includes(c) {
                return false;
            }
            let guard = self.slot(c).read();
            guard.state.is_active() && !guard.vectors.is_empty()
        })
    }

    async fn query_embedding(&self, text: &str) -> Option<Embedding> {
        if let Some(hit) = self.query_cache.lock().get(text).cloned() {
            return Some(hit);
        }
        match self.embedder.embed(text).await {
            Ok(v) => {
                self.query_cache.lock().put(text.to_string(), v.clone());
                Some(v)
            }
            Err(err) => {
                warn!(error = %err, "query embedding failed, searching by keyword only");
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Write the category to `<dir>/<category>.db`.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::Io`] if the directory cannot be created, or a
    /// database / serialization error from the write.
    pub fn save(&self, category: Category, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let snapshot = self.slot(category).read().snapshot();
        let path = CategorySnapshot::path_in(dir, category);
        let mut engine = PersistenceEngine::open(&path, &self.config.persistence)?;
        engine.save_snapshot(&snapshot)?;
        info!(
            category = %category,
            chunks = snapshot.chunks.len(),
            path = %path.display(),
            "knowledge base saved"
        );
        Ok(())
    }

    /// Replace the category with the contents of `<dir>/<category>.db`.
    ///
    /// Returns the number of chunks loaded. On error the in-memory category
    /// is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::Io`] if the file does not exist, and
    /// [`QuillError::IndexCorruption`] if it fails validation; `reset` the
    /// category to recover.
    pub fn load(&self, category: Category, dir: &Path) -> Result<usize> {
        let path: PathBuf = CategorySnapshot::path_in(dir, category);
        if !path.exists() {
            return Err(QuillError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no saved knowledge base at {}", path.display()),
            )));
        }

        let corrupt = |err: QuillError| match err {
            QuillError::IndexCorruption { .. } => err,
            other => QuillError::IndexCorruption {
                category,
                reason: other.to_string(),
            },
        };
        let engine =
            PersistenceEngine::open_existing(&path, &self.config.persistence).map_err(corrupt)?;
        let snapshot = engine.load_snapshot(category).map_err(corrupt)?;
        let index = CategoryIndex::from_snapshot(snapshot, &self.config).map_err(corrupt)?;
        let count = index.store.len();

        let mut guard = self.slot(category).write();
        self.cancel_pending(|c, _| c == category);
        *guard = index;
        info!(category = %category, chunks = count, state = %guard.state, "knowledge base loaded");
        Ok(count)
    }

    /// Save every category to `dir`.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered.
    pub fn save_all(&self, dir: &Path) -> Result<()> {
        for category in Category::ALL {
            self.save(category, dir)?;
        }
        Ok(())
    }

    /// Load every category from `dir`. One category failing does not
    /// affect the others.
    pub fn load_all(&self, dir: &Path) -> Vec<(Category, Result<usize>)> {
        Category::ALL
            .into_iter()
            .map(|c| {
                let result = self.load(c, dir);
                if let Err(err) = &result {
                    warn!(category = %c, error = %err, "knowledge base not loaded");
                }
                (c, result)
            })
            .collect()
    }
}
