//! Chunking policy: splits a document into addressable pieces.

use crate::config::ChunkingConfig;

/// Splits document text into `(chunk_text, offset)` pairs.
///
/// Offsets are ordinals within the document; ingestion adds them to the
/// caller's base position to get each chunk's `source_position`.
pub trait ChunkingPolicy: Send + Sync {
    /// Chunk `text`. Must be deterministic.
    fn chunk(&self, text: &str) -> Vec<(String, u64)>;
}

/// Packs whole lines into chunks of at most `chunk_size` characters.
///
/// A line is never split: one longer than `chunk_size` becomes a chunk of
/// its own. Chunks that are blank after trimming are dropped, and offsets
/// stay dense over the chunks that remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineChunker {
    chunk_size: usize,
}

impl LineChunker {
    /// Create a chunker. A `chunk_size` of zero is treated as one.
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Build from configuration.
    #[must_use]
    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.chunk_size)
    }
}

impl Default for LineChunker {
    fn default() -> Self {
        Self::from_config(&ChunkingConfig::default())
    }
}

impl ChunkingPolicy for LineChunker {
    fn chunk(&self, text: &str) -> Vec<(String, u64)> {
        let mut pieces: Vec<String> = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_size = 0usize;

        for line in text.split('\n') {
            let line_size = line.chars().count();
            if current_size + line_size > self.chunk_size && !current.is_empty() {
                pieces.push(current.join("\n"));
                current.clear();
                current_size = 0;
            }
            current.push(line);
            current_size += line_size;
        }
        if !current.is_empty() {
            pieces.push(current.join("\n"));
        }

        pieces
            .into_iter()
            .filter(|p| !p.trim().is_empty())
            .zip(0u64..)
            .collect()
    }
}

/// Treats the whole text as one chunk at offset 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WholeText;

impl ChunkingPolicy for WholeText {
    fn chunk(&self, text: &str) -> Vec<(String, u64)> {
        if text.trim().is_empty() {
            Vec::new()
        } else {
            vec![(text.to_string(), 0)]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = LineChunker::new(100).chunk("one\ntwo\nthree");
        assert_eq!(chunks, vec![("one\ntwo\nthree".to_string(), 0)]);
    }

    #[test]
    fn lines_pack_up_to_the_limit() {
        let chunks = LineChunker::new(6).chunk("abc\ndef\nghi");
        assert_eq!(
            chunks,
            vec![("abc\ndef".to_string(), 0), ("ghi".to_string(), 1)]
        );
    }

    #[test]
    fn long_line_stands_alone() {
        let chunks = LineChunker::new(4).chunk("ab\nabcdefgh\ncd");
        let texts: Vec<&str> = chunks.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(texts, vec!["ab", "abcdefgh", "cd"]);
    }

    #[test]
    fn size_counts_characters_not_bytes() {
        // Six CJK characters are eighteen bytes.
        let chunks = LineChunker::new(6).chunk("林风拔剑\n山门");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn blank_chunks_are_dropped_and_offsets_stay_dense() {
        let chunks = LineChunker::new(3).chunk("abc\n   \nxyz");
        assert_eq!(
            chunks,
            vec![("abc".to_string(), 0), ("xyz".to_string(), 1)]
        );
        assert!(LineChunker::new(10).chunk("").is_empty());
    }

    #[test]
    fn whole_text_keeps_everything() {
        assert_eq!(WholeText.chunk("a\nb"), vec![("a\nb".to_string(), 0)]);
        assert!(WholeText.chunk(" \n ").is_empty());
    }
}
