//! Quill Benchmark Suite
//!
//! Performance targets:
//!   keyword_index_single_chunk ......... < 100μs
//!   hybrid_rank_top5_from_1k ........... < 2ms
//!   manager_search_top5_3x1k ........... < 2ms per category
//!   embedding_search_top50 exact / hnsw  (comparison only)

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use quill_core::chunking::LineChunker;
use quill_core::config::{KeywordConfig, QuillConfig, RankingConfig, VectorConfig};
use quill_core::embedding::HashEmbeddingService;
use quill_core::keyword::KeywordIndex;
use quill_core::retrieval::HybridRanker;
use quill_core::store::ChunkStore;
use quill_core::vector::EmbeddingIndex;
use quill_core::{Category, Chunk, KnowledgeBaseManager, Query};

const DIMS: usize = 64;

const WORDS: &[&str] = &[
    "dragon", "castle", "river", "sword", "winter", "letter", "mara", "tower", "storm", "bridge",
    "harbor", "lantern", "oath", "ember", "forest", "king", "traitor", "wolf", "ash", "crown",
    "ship", "mountain", "temple", "mask", "silver", "poison", "garden", "bell", "map", "ghost",
];

fn make_passage(rng: &mut StdRng) -> String {
    let len = rng.gen_range(12..40);
    (0..len)
        .filter_map(|_| WORDS.choose(rng).copied())
        .collect::<Vec<_>>()
        .join(" ")
}

fn make_corpus(n: usize, seed: u64) -> Vec<(String, u64)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|i| (make_passage(&mut rng), i as u64)).collect()
}

struct Indexed {
    store: ChunkStore,
    keywords: KeywordIndex,
    vectors: EmbeddingIndex,
}

fn build_indices(corpus: &[(String, u64)], vector_config: VectorConfig) -> Indexed {
    let embedder = HashEmbeddingService::new(DIMS);
    let mut indexed = Indexed {
        store: ChunkStore::new(Category::History),
        keywords: KeywordIndex::new(KeywordConfig::default()),
        vectors: EmbeddingIndex::new(vector_config),
    };
    for (text, pos) in corpus {
        let mut chunk = Chunk::new(Category::History, text.as_str(), *pos);
        let embedding = embedder.embed_now(text);
        indexed
            .vectors
            .index(chunk.id(), chunk.source_position(), &embedding)
            .expect("uniform dimensions");
        chunk.set_embedding(embedding);
        indexed.keywords.index(&chunk);
        indexed.store.put(chunk);
    }
    indexed
}

/// Benchmark: Keyword indexing of one chunk (target: < 100μs).
fn bench_keyword_index(c: &mut Criterion) {
    let corpus = make_corpus(1_000, 7);
    let mut index = KeywordIndex::new(KeywordConfig::default());
    for (text, pos) in &corpus {
        index.index(&Chunk::new(Category::History, text.as_str(), *pos));
    }
    let chunk = Chunk::new(Category::History, corpus[0].0.as_str(), 5_000);

    c.bench_function("keyword_index_single_chunk", |b| {
        b.iter(|| {
            index.index(black_box(&chunk));
            index.remove(chunk.id());
        });
    });
}

/// Benchmark: Hybrid ranking top-5 over 1k chunks (target: < 2ms).
fn bench_hybrid_rank(c: &mut Criterion) {
    let corpus = make_corpus(1_000, 11);
    let indexed = build_indices(&corpus, VectorConfig::default());
    let ranker = HybridRanker::new(RankingConfig::default(), 1.0, 50);
    let embedder = HashEmbeddingService::new(DIMS);

    let text = "the dragon burned the silver tower";
    let query = Query::new(text)
        .anchor(900)
        .with_vector(embedder.embed_now(text));
    let keyword_query = Query::new(text).anchor(900);

    let mut group = c.benchmark_group("hybrid_rank_top5_from_1k");
    group.bench_function("hybrid", |b| {
        b.iter(|| {
            black_box(ranker.rank(
                &indexed.store,
                &indexed.keywords,
                &indexed.vectors,
                black_box(&query),
            ))
        });
    });
    group.bench_function("keyword_only", |b| {
        b.iter(|| {
            black_box(ranker.rank(
                &indexed.store,
                &indexed.keywords,
                &indexed.vectors,
                black_box(&keyword_query),
            ))
        });
    });
    group.finish();
}

/// Benchmark: Exact scan vs HNSW for the embedding side.
fn bench_embedding_search(c: &mut Criterion) {
    let embedder = HashEmbeddingService::new(DIMS);
    let query = embedder.embed_now("a ghost walks the temple garden");
    let mut group = c.benchmark_group("embedding_search_top50");

    for &n in &[1_000usize, 5_000] {
        let corpus = make_corpus(n, 23);
        let exact = build_indices(
            &corpus,
            VectorConfig {
                exact_search_threshold: usize::MAX,
                ..VectorConfig::default()
            },
        );
        let mut hnsw = build_indices(
            &corpus,
            VectorConfig {
                exact_search_threshold: 1,
                ..VectorConfig::default()
            },
        );
        hnsw.vectors.build();

        group.bench_with_input(BenchmarkId::new("exact", n), &n, |b, _| {
            b.iter(|| black_box(exact.vectors.search(black_box(&query), 50)));
        });
        group.bench_with_input(BenchmarkId::new("hnsw", n), &n, |b, _| {
            b.iter(|| black_box(hnsw.vectors.search(black_box(&query), 50)));
        });
    }
    group.finish();
}

/// Benchmark: Manager search across three categories of 1k chunks each.
fn bench_manager_search(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let kb = KnowledgeBaseManager::new(
        QuillConfig::default(),
        Arc::new(HashEmbeddingService::new(DIMS)),
        Box::new(LineChunker::new(400)),
    );

    runtime.block_on(async {
        for (i, category) in Category::ALL.into_iter().enumerate() {
            for (text, pos) in make_corpus(1_000, 100 + i as u64) {
                kb.ingest(category, &text, pos).await.expect("ingest");
            }
            kb.activate(category);
        }
    });

    let text = "the traitor hid the crown beneath the bridge";
    let query = Query::new(text)
        .anchor(990)
        .with_vector(HashEmbeddingService::new(DIMS).embed_now(text));

    c.bench_function("manager_search_top5_3x1k", |b| {
        b.iter(|| black_box(kb.search(black_box(&query))));
    });
}

criterion_group!(
    benches,
    bench_keyword_index,
    bench_hybrid_rank,
    bench_embedding_search,
    bench_manager_search,
);
criterion_main!(benches);
