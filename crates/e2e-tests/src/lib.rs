//! End-to-end test infrastructure for the retrieval engine.
//!
//! Provides a shared `TestHarness` wiring the real router, cache, index and
//! pipeline around a `MockProvider`, plus helpers for building chunks and
//! synthetic vectors.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rag_embeddings::{CachedEmbedder, EmbeddingCache, MockProvider};
use rag_retrieval::{PipelineConfig, RetrievalPipeline};
use rag_router::{EmbeddingRouter, RouterConfig, RouterHandle, RoutedEmbedder};
use rag_types::{Chunk, Query, SearchMode};
use rag_vector::{IndexConfig, VectorIndex};

pub type HarnessPipeline = RetrievalPipeline<CachedEmbedder<RoutedEmbedder>>;

/// Knobs for building a harness.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub dimension: usize,
    pub router: RouterConfig,
    pub index: IndexConfig,
    pub pipeline: PipelineConfig,
    pub max_retries: u32,
}

impl HarnessConfig {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            router: RouterConfig::default(),
            index: IndexConfig::new(dimension),
            pipeline: PipelineConfig::default(),
            max_retries: 3,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::new(8)
    }
}

/// Shared test harness for E2E tests.
///
/// The cache and index are persistent and live in a temp directory.
/// Must be created inside a tokio runtime (the router is spawned).
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    pub provider: Arc<MockProvider>,
    pub router: RouterHandle,
    pub cache: Arc<EmbeddingCache>,
    pub index: Arc<VectorIndex>,
    pub pipeline: HarnessPipeline,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(HarnessConfig::default())
    }

    pub fn with_config(config: HarnessConfig) -> Self {
        let provider = Arc::new(MockProvider::new(config.dimension));
        Self::with_provider(provider, config)
    }

    pub fn with_provider(provider: Arc<MockProvider>, config: HarnessConfig) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let cache = Arc::new(
            EmbeddingCache::open(temp_dir.path().join("embedding-cache"), 1000, None)
                .expect("Failed to open embedding cache"),
        );
        let index = Arc::new(
            VectorIndex::open(temp_dir.path().join("vector-index"), config.index)
                .expect("Failed to open vector index"),
        );

        let router = EmbeddingRouter::spawn(provider.clone(), config.router);
        let embedder = CachedEmbedder::new(
            RoutedEmbedder::new(router.clone(), config.max_retries)
                .with_backoff(Duration::from_millis(10), Duration::from_millis(100)),
            cache.clone(),
        );
        let pipeline = RetrievalPipeline::new(embedder, index.clone(), config.pipeline);

        Self {
            _temp_dir: temp_dir,
            provider,
            router,
            cache,
            index,
            pipeline,
        }
    }

    /// Pin the provider's vector for `text`.
    pub fn pin(&self, text: &str, vector: Vec<f32>) {
        self.provider.set_vector(text, vector);
    }
}

/// Midnight UTC on the given day of March 2024.
pub fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap()
}

/// A "post" chunk.
pub fn post(source_ref: &str, text: &str, created_at: DateTime<Utc>) -> Chunk {
    Chunk::new(source_ref, text, "post", created_at)
}

/// Unit vector along `axis`.
pub fn axis(dimension: usize, axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; dimension];
    v[axis] = 1.0;
    v
}

/// `per_cluster` noisy vectors around each of the first `clusters` axes.
///
/// Returns `(cluster, vector)` pairs in a fixed order.
pub fn clustered_vectors(
    dimension: usize,
    clusters: usize,
    per_cluster: usize,
    seed: u64,
) -> Vec<(usize, Vec<f32>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Vec::with_capacity(clusters * per_cluster);
    for cluster in 0..clusters {
        for _ in 0..per_cluster {
            let mut v: Vec<f32> = (0..dimension).map(|_| rng.random_range(-0.1..0.1)).collect();
            v[cluster] += 1.0;
            out.push((cluster, v));
        }
    }
    out
}

/// Query with exact search and no dedup, for deterministic assertions.
pub fn exact_query(text: &str, top_k: usize, min_similarity: f32) -> Query {
    Query::new(text)
        .with_top_k(top_k)
        .with_min_similarity(min_similarity)
        .with_mode(SearchMode::Exact)
        .with_deduplicate(false)
}
