//! Chunk Store: id → chunk mapping with a position-ordered view.
//!
//! One store per category. The store owns its chunks; the keyword and
//! embedding indices only ever hold chunk ids.

use std::collections::{BTreeSet, HashMap};

use crate::error::{QuillError, Result};
use crate::types::{Category, Chunk, ChunkId, Embedding};

/// Per-category chunk storage.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    category: Category,
    chunks: HashMap<ChunkId, Chunk>,
    /// `(source_position, id)` for ordered traversal.
    by_position: BTreeSet<(u64, ChunkId)>,
}

impl ChunkStore {
    /// Create an empty store for `category`.
    #[must_use]
    pub fn new(category: Category) -> Self {
        Self {
            category,
            chunks: HashMap::new(),
            by_position: BTreeSet::new(),
        }
    }

    /// The category this store belongs to.
    #[must_use]
    pub fn category(&self) -> Category {
        self.category
    }

    /// Insert or overwrite by id. Returns the chunk that was replaced.
    pub fn put(&mut self, chunk: Chunk) -> Option<Chunk> {
        debug_assert_eq!(chunk.category(), self.category);
        if let Some(prev) = self.chunks.get(chunk.id()) {
            self.by_position
                .remove(&(prev.source_position(), prev.id().clone()));
        }
        self.by_position
            .insert((chunk.source_position(), chunk.id().clone()));
        self.chunks.insert(chunk.id().clone(), chunk)
    }

    /// Strict insert.
    ///
    /// # Errors
    /// Returns [`QuillError::DuplicateChunk`] if the id is already stored.
    pub fn insert(&mut self, chunk: Chunk) -> Result<()> {
        if self.chunks.contains_key(chunk.id()) {
            return Err(QuillError::DuplicateChunk(chunk.id().clone()));
        }
        self.put(chunk);
        Ok(())
    }

    /// Look up a chunk.
    ///
    /// # Errors
    /// Returns [`QuillError::NotFound`] if the id is absent.
    pub fn get(&self, id: &ChunkId) -> Result<&Chunk> {
        self.chunks.get(id).ok_or_else(|| QuillError::NotFound {
            category: self.category,
            id: id.clone(),
        })
    }

    /// Whether the id is stored.
    #[must_use]
    pub fn contains(&self, id: &ChunkId) -> bool {
        self.chunks.contains_key(id)
    }

    /// Attach an embedding to a stored chunk.
    ///
    /// Returns `false` when the chunk already had one; the stored vector is
    /// never replaced.
    ///
    /// # Errors
    /// Returns [`QuillError::NotFound`] if the id is absent.
    pub fn attach_embedding(&mut self, id: &ChunkId, embedding: Embedding) -> Result<bool> {
        let category = self.category;
        let chunk = self.chunks.get_mut(id).ok_or_else(|| QuillError::NotFound {
            category,
            id: id.clone(),
        })?;
        Ok(chunk.set_embedding(embedding))
    }

    /// Remove a chunk. The caller retracts it from the indices.
    ///
    /// # Errors
    /// Returns [`QuillError::NotFound`] if the id is absent.
    pub fn delete(&mut self, id: &ChunkId) -> Result<Chunk> {
        let chunk = self.chunks.remove(id).ok_or_else(|| QuillError::NotFound {
            category: self.category,
            id: id.clone(),
        })?;
        self.by_position
            .remove(&(chunk.source_position(), chunk.id().clone()));
        Ok(chunk)
    }

    /// Chunks ordered by `source_position` (then id). Call again to restart.
    pub fn list_by_category(&self) -> impl Iterator<Item = &Chunk> + '_ {
        self.by_position
            .iter()
            .filter_map(|(_, id)| self.chunks.get(id))
    }

    /// Ids of every chunk at `source_position`.
    #[must_use]
    pub fn ids_at_position(&self, source_position: u64) -> Vec<ChunkId> {
        self.by_position
            .range((source_position, ChunkId(String::new()))..)
            .take_while(|(pos, _)| *pos == source_position)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Chunks that still lack an embedding, in position order.
    #[must_use]
    pub fn unembedded(&self) -> Vec<ChunkId> {
        self.list_by_category()
            .filter(|c| c.embedding().is_none())
            .map(|c| c.id().clone())
            .collect()
    }

    /// Number of stored chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Drop every chunk.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.by_position.clear();
    }
}
