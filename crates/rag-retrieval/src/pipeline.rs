//! Query and indexing paths.
//!
//! The query path never fails: provider or quota trouble degrades to an
//! empty result carrying a `DegradeReason`. The indexing path never blocks
//! on quota either; chunks it cannot embed right now are deferred.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rag_embeddings::{EmbedRequest, Embedder, EmbeddingError};
use rag_types::{Chunk, ChunkId, ChunkType, Query, RetrievalHit, Settings};
use rag_vector::{SearchFilter, VectorError, VectorIndex};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::deferred::{DeferredEntry, DeferredQueue};
use crate::error::RetrievalError;
use crate::ranking;
use crate::stats::{PipelineStats, PipelineStatsSnapshot};

/// Candidates fetched per result slot when deduplicating by source. Each
/// refetch grows the pool by the same factor.
const DEDUP_FETCH_FACTOR: usize = 4;

/// Why a query returned no results without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    ProviderUnavailable,
    Overloaded,
    BudgetExhausted,
    Timeout,
    InvalidQuery,
    Internal,
}

impl DegradeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradeReason::ProviderUnavailable => "provider_unavailable",
            DegradeReason::Overloaded => "overloaded",
            DegradeReason::BudgetExhausted => "budget_exhausted",
            DegradeReason::Timeout => "timeout",
            DegradeReason::InvalidQuery => "invalid_query",
            DegradeReason::Internal => "internal",
        }
    }

    fn from_embedding(err: &EmbeddingError) -> Self {
        match err {
            EmbeddingError::ProviderUnavailable(_) | EmbeddingError::Transient { .. } => {
                DegradeReason::ProviderUnavailable
            }
            EmbeddingError::Overloaded => DegradeReason::Overloaded,
            EmbeddingError::BudgetExhausted => DegradeReason::BudgetExhausted,
            EmbeddingError::Timeout => DegradeReason::Timeout,
            EmbeddingError::InvalidInput(_) => DegradeReason::InvalidQuery,
            _ => DegradeReason::Internal,
        }
    }
}

/// Result of the query path.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalOutcome {
    pub hits: Vec<RetrievalHit>,
    /// Set when the hits are empty because retrieval could not run
    pub degraded: Option<DegradeReason>,
}

impl RetrievalOutcome {
    fn degraded(reason: DegradeReason) -> Self {
        Self {
            hits: Vec::new(),
            degraded: Some(reason),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

/// Per-call indexing summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub indexed: usize,
    pub skipped_type: usize,
    pub skipped_empty: usize,
    pub already_indexed: usize,
    pub deferred: usize,
    pub dropped: usize,
    /// Deferred chunks from earlier calls that were indexed this time
    pub recovered: usize,
    /// Deferred chunks dropped for exceeding their maximum age
    pub expired: usize,
    /// Chunks embedded but not written to the index; also counted in
    /// `deferred`
    pub store_failures: usize,
}

/// Result of one retrieve / generate / index cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub retrieval: RetrievalOutcome,
    pub indexing: IndexReport,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Chunk types admitted to the index
    pub indexable_types: Vec<ChunkType>,
    /// Indexing batches embedded in parallel
    pub concurrency: usize,
    pub query_deadline: Duration,
    /// Hide chunks created within this many days of the query
    pub exclude_recent_days: u32,
    pub max_deferred_age: chrono::Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl PipelineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            indexable_types: settings.indexing.allowed_types(),
            concurrency: settings.quota.concurrency,
            query_deadline: settings.retrieval.query_deadline(),
            exclude_recent_days: settings.retrieval.exclude_recent_days,
            max_deferred_age: settings.indexing.max_deferred_age(),
        }
    }

    pub fn with_indexable_types(mut self, types: &[&str]) -> Self {
        self.indexable_types = types.iter().map(ChunkType::new).collect();
        self
    }

    pub fn with_exclude_recent_days(mut self, days: u32) -> Self {
        self.exclude_recent_days = days;
        self
    }
}

/// A chunk waiting to be embedded, with its deferral history if any.
struct Pending {
    chunk: Chunk,
    previous: Option<DeferredEntry>,
}

/// The retrieval pipeline over an embedder and a vector index.
pub struct RetrievalPipeline<E> {
    embedder: E,
    index: Arc<VectorIndex>,
    config: PipelineConfig,
    deferred: Mutex<DeferredQueue>,
    stats: PipelineStats,
}

impl<E: Embedder> RetrievalPipeline<E> {
    pub fn new(embedder: E, index: Arc<VectorIndex>, config: PipelineConfig) -> Self {
        Self {
            embedder,
            index,
            config,
            deferred: Mutex::new(DeferredQueue::new()),
            stats: PipelineStats::default(),
        }
    }

    /// Resume with a deferred queue saved by an earlier run.
    pub fn with_deferred(self, queue: DeferredQueue) -> Self {
        Self {
            deferred: Mutex::new(queue),
            ..self
        }
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    pub fn vector_index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// The queue holds plain data, so a panic elsewhere cannot leave it
    /// half-updated; a poisoned lock is taken over rather than losing work.
    fn deferred_queue(&self) -> MutexGuard<'_, DeferredQueue> {
        self.deferred.lock().unwrap_or_else(|poisoned| {
            warn!("Deferred queue lock was poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred_queue().len()
    }

    /// Copy of the deferred queue for persistence.
    pub fn deferred_snapshot(&self) -> DeferredQueue {
        self.deferred_queue().clone()
    }

    /// Replace the deferred queue.
    pub fn restore_deferred(&self, queue: DeferredQueue) {
        *self.deferred_queue() = queue;
    }

    /// Run the query path.
    pub async fn retrieve(&self, query: &Query) -> RetrievalOutcome {
        self.stats.record_query();

        let text = query.text.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.is_empty() {
            warn!("Rejected empty query text");
            self.stats.record_degraded(DegradeReason::InvalidQuery);
            return RetrievalOutcome::degraded(DegradeReason::InvalidQuery);
        }
        if query.top_k == 0 {
            self.stats.record_empty();
            return RetrievalOutcome::default();
        }

        let deadline = Instant::now() + self.config.query_deadline;
        let request = EmbedRequest::interactive(vec![text]).with_deadline(deadline);
        let vector = match self.embedder.embed_batch(request).await {
            Ok(mut vectors) if vectors.len() == 1 => vectors.remove(0),
            Ok(vectors) => {
                warn!(count = vectors.len(), "Embedder returned the wrong number of vectors");
                return self.degrade(DegradeReason::Internal);
            }
            Err(e) => {
                let reason = DegradeReason::from_embedding(&e);
                if reason == DegradeReason::InvalidQuery {
                    warn!(error = %e, "Query text rejected by embedder");
                } else {
                    warn!(error = %e, reason = reason.as_str(), "Retrieval degraded");
                }
                return self.degrade(reason);
            }
        };

        let filter = self.filter_for(query);
        let mut fetch = if query.deduplicate {
            query.top_k.saturating_mul(DEDUP_FETCH_FACTOR)
        } else {
            query.top_k
        };
        // Dedup can collapse a whole pool into a few sources; widen the
        // pool until top_k sources are found or nothing more can qualify.
        let hits = loop {
            let hits = match self.index.search(&vector, fetch, query.mode, &filter) {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(error = %e, "Vector search failed");
                    return self.degrade(DegradeReason::Internal);
                }
            };
            let candidates = hits.len();
            let exhausted = candidates < fetch || fetch >= self.index.len();
            let below_threshold = hits.last().is_some_and(|h| h.score < query.min_similarity);

            let ranked =
                ranking::finalize(hits, query.min_similarity, query.deduplicate, query.top_k);
            if !query.deduplicate || ranked.len() >= query.top_k || exhausted || below_threshold {
                debug!(
                    mode = query.mode.name(),
                    candidates,
                    results = ranked.len(),
                    "Retrieved chunks"
                );
                break ranked;
            }
            debug!(fetch, sources = ranked.len(), "Too few distinct sources, widening search");
            fetch = fetch.saturating_mul(DEDUP_FETCH_FACTOR);
        };
        if hits.is_empty() {
            self.stats.record_empty();
        }
        RetrievalOutcome {
            hits,
            degraded: None,
        }
    }

    fn degrade(&self, reason: DegradeReason) -> RetrievalOutcome {
        self.stats.record_degraded(reason);
        RetrievalOutcome::degraded(reason)
    }

    /// Query filter with the recency exclusion applied.
    fn filter_for(&self, query: &Query) -> SearchFilter {
        let mut filter = SearchFilter::from_query(query);
        if self.config.exclude_recent_days > 0 {
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.config.exclude_recent_days));
            filter.created_before = Some(match filter.created_before {
                Some(existing) => existing.min(cutoff),
                None => cutoff,
            });
        }
        filter
    }

    /// Run the indexing path over `chunks`, retrying deferred chunks first.
    ///
    /// Chunks that cannot be embedded or stored right now go back to the
    /// deferred queue; this never loses a taken deferred entry.
    pub async fn index(&self, chunks: Vec<Chunk>) -> Result<IndexReport, RetrievalError> {
        let mut report = IndexReport::default();
        let now = Utc::now();

        let (retry, expired) = self
            .deferred_queue()
            .take(now, self.config.max_deferred_age);
        report.expired = expired.len();
        let mut to_defer: Vec<(Pending, String)> = Vec::new();

        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        let retry = retry.into_iter().map(|entry| Pending {
            chunk: entry.chunk.clone(),
            previous: Some(entry),
        });
        let fresh = chunks.into_iter().map(|chunk| Pending {
            chunk,
            previous: None,
        });
        for item in retry.chain(fresh) {
            let chunk = &item.chunk;
            if !self.config.indexable_types.contains(&chunk.chunk_type) {
                debug!(chunk_id = %chunk.id.short(), chunk_type = %chunk.chunk_type, "Skipping non-indexable chunk");
                report.skipped_type += 1;
                continue;
            }
            if chunk.text.trim().is_empty() {
                report.skipped_empty += 1;
                continue;
            }
            if !seen.insert(chunk.id.clone()) {
                report.already_indexed += 1;
                continue;
            }
            match self.index.contains(&chunk.id) {
                Ok(true) => report.already_indexed += 1,
                Ok(false) => pending.push(item),
                Err(e) => {
                    warn!(chunk_id = %chunk.id.short(), error = %e, "Index lookup failed, deferring chunk");
                    to_defer.push((item, e.to_string()));
                }
            }
        }

        let batch_count = self.embed_and_store(pending, &mut report, &mut to_defer).await;
        self.requeue(to_defer, now, &mut report);

        if report.indexed > 0 {
            self.train_partitions().await;
        }
        if batch_count > 0 || report.deferred > 0 {
            info!(
                batches = batch_count,
                indexed = report.indexed,
                deferred = report.deferred,
                dropped = report.dropped,
                store_failures = report.store_failures,
                "Indexing pass complete"
            );
        }
        self.finish_report(&report);
        Ok(report)
    }

    /// Embed `pending` in batches and store the vectors. Returns the number
    /// of batches sent.
    async fn embed_and_store(
        &self,
        pending: Vec<Pending>,
        report: &mut IndexReport,
        to_defer: &mut Vec<(Pending, String)>,
    ) -> usize {
        if pending.is_empty() {
            return 0;
        }

        let batch_size = self.embedder.max_batch_size().max(1);
        let mut batches: Vec<Vec<Pending>> = Vec::new();
        for item in pending {
            match batches.last_mut() {
                Some(batch) if batch.len() < batch_size => batch.push(item),
                _ => batches.push(vec![item]),
            }
        }
        let batch_count = batches.len();

        let results: Vec<(Vec<Pending>, Result<Vec<Vec<f32>>, EmbeddingError>)> =
            stream::iter(batches)
                .map(|batch| async move {
                    let texts = batch.iter().map(|p| p.chunk.text.clone()).collect();
                    let result = self.embedder.embed_batch(EmbedRequest::background(texts)).await;
                    (batch, result)
                })
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;

        for (batch, result) in results {
            match result {
                Ok(vectors) => {
                    for (item, vector) in batch.into_iter().zip(vectors) {
                        match self.index.store(item.chunk.id.clone(), vector, item.chunk.metadata()) {
                            Ok(()) => {
                                report.indexed += 1;
                                if item.previous.is_some() {
                                    report.recovered += 1;
                                }
                            }
                            Err(VectorError::DimensionMismatch { expected, actual }) => {
                                warn!(chunk_id = %item.chunk.id.short(), expected, actual, "Dropping chunk with wrong vector size");
                                report.dropped += 1;
                            }
                            Err(e) => {
                                warn!(chunk_id = %item.chunk.id.short(), error = %e, "Failed to store chunk, deferring");
                                report.store_failures += 1;
                                to_defer.push((item, e.to_string()));
                            }
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    let message = e.to_string();
                    for item in batch {
                        to_defer.push((item, message.clone()));
                    }
                }
                Err(e) => {
                    warn!(error = %e, chunks = batch.len(), "Dropping chunks after permanent embedding failure");
                    report.dropped += batch.len();
                }
            }
        }

        batch_count
    }

    fn requeue(&self, to_defer: Vec<(Pending, String)>, now: DateTime<Utc>, report: &mut IndexReport) {
        if to_defer.is_empty() {
            return;
        }
        let mut queue = self.deferred_queue();
        for (item, message) in to_defer {
            report.deferred += 1;
            match item.previous {
                Some(entry) => queue.requeue(entry, &message),
                None => queue.defer(item.chunk, &message, now),
            }
        }
        warn!(deferred = report.deferred, queued = queue.len(), "Deferred chunks for the next pass");
    }

    /// Retrain index partitions off the async runtime when due.
    async fn train_partitions(&self) {
        if !matches!(self.index.training_due(), Ok(true)) {
            return;
        }
        let index = self.index.clone();
        match tokio::task::spawn_blocking(move || index.train_if_due()).await {
            Ok(Ok(trained)) => debug!(trained, "Partition training finished"),
            Ok(Err(e)) => warn!(error = %e, "Partition training failed"),
            Err(e) => warn!(error = %e, "Partition training task failed"),
        }
    }

    fn finish_report(&self, report: &IndexReport) {
        self.stats.record_store_failures(report.store_failures);
        self.stats.record_indexing(
            report.indexed,
            report.skipped_type + report.skipped_empty + report.already_indexed,
            report.deferred,
            report.dropped + report.expired,
        );
    }

    /// Retrieve for `query`, pass the outcome to `generate`, then index
    /// whatever it produced.
    ///
    /// Chunks produced in a cycle are indexed only after that cycle's
    /// retrieval, so they can first appear in the next cycle's results.
    pub async fn run_cycle<F, Fut>(
        &self,
        query: &Query,
        generate: F,
    ) -> Result<CycleReport, RetrievalError>
    where
        F: FnOnce(RetrievalOutcome) -> Fut,
        Fut: Future<Output = Vec<Chunk>>,
    {
        let retrieval = self.retrieve(query).await;
        let produced = generate(retrieval.clone()).await;
        let indexing = self.index(produced).await?;
        Ok(CycleReport {
            retrieval,
            indexing,
        })
    }

    /// IDs of chunks currently waiting in the deferred queue.
    pub fn deferred_ids(&self) -> Vec<ChunkId> {
        self.deferred_queue()
            .entries()
            .map(|e| e.chunk.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rag_embeddings::{CachedEmbedder, EmbeddingCache, MockProvider};
    use rag_router::{EmbeddingRouter, RouterConfig, RoutedEmbedder};
    use rag_types::{SearchMode, TaskType};
    use rag_vector::IndexConfig;
    use tempfile::TempDir;

    type TestPipeline = RetrievalPipeline<CachedEmbedder<RoutedEmbedder>>;

    fn setup_with(config: PipelineConfig) -> (Arc<MockProvider>, TestPipeline) {
        let index = Arc::new(VectorIndex::in_memory(IndexConfig::new(4)).unwrap());
        setup_over(config, index)
    }

    fn setup_over(
        config: PipelineConfig,
        index: Arc<VectorIndex>,
    ) -> (Arc<MockProvider>, TestPipeline) {
        let provider = Arc::new(
            MockProvider::new(4)
                .with_vector("alpha notes", vec![1.0, 0.0, 0.0, 0.0])
                .with_vector("beta notes", vec![0.0, 1.0, 0.0, 0.0])
                .with_vector("gamma notes", vec![0.0, 0.0, 1.0, 0.0])
                .with_vector("tell me about beta", vec![0.1, 0.9, 0.0, 0.0]),
        );
        let router = EmbeddingRouter::spawn(provider.clone(), RouterConfig::default());
        let embedder = CachedEmbedder::new(
            RoutedEmbedder::new(router, 3),
            Arc::new(EmbeddingCache::in_memory(100, None)),
        );
        (provider, RetrievalPipeline::new(embedder, index, config))
    }

    fn setup() -> (Arc<MockProvider>, TestPipeline) {
        setup_with(PipelineConfig::default())
    }

    fn post(source: &str, text: &str, day: u32) -> Chunk {
        let created = Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap();
        Chunk::new(source, text, "post", created)
    }

    fn abc() -> Vec<Chunk> {
        vec![
            post("posts/a.md", "alpha notes", 1),
            post("posts/b.md", "beta notes", 2),
            post("posts/c.md", "gamma notes", 3),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrieve_nearest_and_threshold() {
        let (_provider, pipeline) = setup();
        let report = pipeline.index(abc()).await.unwrap();
        assert_eq!(report.indexed, 3);

        let query = Query::new("tell me about beta")
            .with_top_k(1)
            .with_min_similarity(0.5)
            .with_mode(SearchMode::Exact);
        let outcome = pipeline.retrieve(&query).await;
        assert!(!outcome.is_degraded());
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.hits[0].metadata.source_ref, "posts/b.md");

        let strict = query.with_min_similarity(0.999);
        let outcome = pipeline.retrieve(&strict).await;
        assert!(outcome.hits.is_empty());
        assert!(!outcome.is_degraded());
        assert_eq!(pipeline.stats().empty_results, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_index_is_idempotent() {
        let (provider, pipeline) = setup();
        pipeline.index(abc()).await.unwrap();
        let calls = provider.call_count();

        let report = pipeline.index(abc()).await.unwrap();
        assert_eq!(report.indexed, 0);
        assert_eq!(report.already_indexed, 3);
        assert_eq!(provider.call_count(), calls);
        assert_eq!(pipeline.vector_index().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_index_skips_types_and_empty_text() {
        let (provider, pipeline) = setup();
        let profile = Chunk::new("profiles/p.md", "alpha notes", "profile", Utc::now());
        let blank = post("posts/blank.md", "   ", 1);

        let report = pipeline.index(vec![profile, blank]).await.unwrap();
        assert_eq!(report.skipped_type, 1);
        assert_eq!(report.skipped_empty, 1);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_defers_then_recovers() {
        let (provider, pipeline) = setup();
        provider.set_failure(Some(EmbeddingError::BudgetExhausted));

        let report = pipeline.index(abc()).await.unwrap();
        assert_eq!(report.deferred, 3);
        assert_eq!(report.indexed, 0);
        assert_eq!(pipeline.deferred_len(), 3);

        provider.set_failure(None);
        let report = pipeline.index(Vec::new()).await.unwrap();
        assert_eq!(report.indexed, 3);
        assert_eq!(report.recovered, 3);
        assert_eq!(pipeline.deferred_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_deferral_counts_attempts() {
        let (provider, pipeline) = setup();
        provider.set_failure(Some(EmbeddingError::BudgetExhausted));
        pipeline.index(abc()).await.unwrap();
        pipeline.index(Vec::new()).await.unwrap();

        let snapshot = pipeline.deferred_snapshot();
        assert!(snapshot.entries().all(|e| e.attempts == 2));
        assert_eq!(pipeline.deferred_ids().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_drops() {
        let (provider, pipeline) = setup();
        provider.fail_next(EmbeddingError::InvalidInput("rejected".into()));

        let report = pipeline.index(abc()).await.unwrap();
        assert_eq!(report.dropped, 3);
        assert_eq!(pipeline.deferred_len(), 0);
        assert!(pipeline.vector_index().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deferred_entries_dropped() {
        let (_provider, pipeline) = setup();
        let mut queue = DeferredQueue::new();
        queue.defer(
            post("posts/a.md", "alpha notes", 1),
            "timeout",
            Utc::now() - chrono::Duration::days(30),
        );
        pipeline.restore_deferred(queue);

        let report = pipeline.index(Vec::new()).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.indexed, 0);
        assert!(pipeline.vector_index().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_degrades_when_provider_unavailable() {
        let (provider, pipeline) = setup();
        pipeline.index(abc()).await.unwrap();
        provider.set_failure(Some(EmbeddingError::ProviderUnavailable("down".into())));

        let outcome = pipeline.retrieve(&Query::new("tell me about beta")).await;
        assert!(outcome.hits.is_empty());
        assert_eq!(outcome.degraded, Some(DegradeReason::ProviderUnavailable));
        assert_eq!(pipeline.stats().degraded_provider_unavailable, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_degrades_on_timeout() {
        let (provider, pipeline) = setup();
        provider.set_latency(Some(Duration::from_secs(30)));

        let outcome = pipeline.retrieve(&Query::new("tell me about beta")).await;
        assert_eq!(outcome.degraded, Some(DegradeReason::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_query_degrades_without_provider_call() {
        let (provider, pipeline) = setup();
        let outcome = pipeline.retrieve(&Query::new(" \n\t ")).await;
        assert_eq!(outcome.degraded, Some(DegradeReason::InvalidQuery));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exclude_recent_days() {
        let config = PipelineConfig::default().with_exclude_recent_days(2);
        let (_provider, pipeline) = setup_with(config);
        let fresh = Chunk::new("posts/new.md", "beta notes", "post", Utc::now());
        pipeline.index(vec![fresh]).await.unwrap();

        let query = Query::new("tell me about beta").with_min_similarity(0.0);
        let outcome = pipeline.retrieve(&query).await;
        assert!(outcome.hits.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_cycle_indexes_after_retrieval() {
        let (_provider, pipeline) = setup();
        let query = Query::new("tell me about beta").with_min_similarity(0.5);

        let first = pipeline
            .run_cycle(&query, |outcome| async move {
                assert!(outcome.hits.is_empty());
                vec![post("posts/b.md", "beta notes", 2)]
            })
            .await
            .unwrap();
        assert!(first.retrieval.hits.is_empty());
        assert_eq!(first.indexing.indexed, 1);

        let second = pipeline
            .run_cycle(&query, |_| async { Vec::new() })
            .await
            .unwrap();
        assert_eq!(second.retrieval.hits.len(), 1);
        assert_eq!(second.retrieval.hits[0].metadata.source_ref, "posts/b.md");
    }

    #[tokio::test(start_paused = true)]
    async fn test_allowed_types_are_configurable() {
        let config = PipelineConfig::default().with_indexable_types(&["post", "profile"]);
        let (_provider, pipeline) = setup_with(config);
        let profile = Chunk::new("profiles/p.md", "alpha notes", "Profile", Utc::now());
        let report = pipeline.index(vec![profile]).await.unwrap();
        assert_eq!(report.indexed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_keeps_deferred_work() {
        let temp_dir = TempDir::new().unwrap();
        drop(VectorIndex::open(temp_dir.path(), IndexConfig::new(4)).unwrap());
        let index =
            Arc::new(VectorIndex::open_read_only(temp_dir.path(), IndexConfig::new(4)).unwrap());
        let (_provider, pipeline) = setup_over(PipelineConfig::default(), index);

        let earlier = post("posts/a.md", "alpha notes", 1);
        let mut queue = DeferredQueue::new();
        queue.defer(earlier.clone(), "timeout", Utc::now());
        pipeline.restore_deferred(queue);

        let fresh = post("posts/b.md", "beta notes", 2);
        let report = pipeline.index(vec![fresh.clone()]).await.unwrap();
        assert_eq!(report.indexed, 0);
        assert_eq!(report.store_failures, 2);
        assert_eq!(report.deferred, 2);
        assert_eq!(pipeline.deferred_len(), 2);
        assert_eq!(pipeline.stats().store_failures, 2);

        let snapshot = pipeline.deferred_snapshot();
        let attempts = |chunk: &Chunk| {
            snapshot
                .entries()
                .find(|e| e.chunk.id == chunk.id)
                .map(|e| e.attempts)
        };
        assert_eq!(attempts(&earlier), Some(2));
        assert_eq!(attempts(&fresh), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_widens_until_enough_sources() {
        let (_provider, pipeline) = setup();
        let index = pipeline.vector_index();
        for i in 0..10 {
            let chunk = post("posts/big.md", &format!("big part {i}"), 1);
            index
                .insert(chunk.id.clone(), vec![0.1, 0.9, 0.0, 0.0], chunk.metadata())
                .unwrap();
        }
        let other = post("posts/other.md", "other", 1);
        index
            .insert(other.id.clone(), vec![0.0, 1.0, 0.0, 0.0], other.metadata())
            .unwrap();

        let query = Query::new("tell me about beta")
            .with_top_k(2)
            .with_min_similarity(0.0)
            .with_mode(SearchMode::Exact)
            .with_deduplicate(true);
        let outcome = pipeline.retrieve(&query).await;
        let sources: Vec<&str> = outcome
            .hits
            .iter()
            .map(|h| h.metadata.source_ref.as_str())
            .collect();
        assert_eq!(sources, vec!["posts/big.md", "posts/other.md"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_indexing_and_queries_use_their_task_types() {
        let (provider, pipeline) = setup();
        pipeline.index(abc()).await.unwrap();
        pipeline.retrieve(&Query::new("tell me about beta")).await;

        let tasks = provider.call_tasks();
        let (last, indexing) = tasks.split_last().unwrap();
        assert_eq!(*last, TaskType::RetrievalQuery);
        assert!(!indexing.is_empty());
        assert!(indexing.iter().all(|t| *t == TaskType::RetrievalDocument));
    }

    #[tokio::test]
    async fn test_indexing_trains_partitions_when_due() {
        let index = Arc::new(
            VectorIndex::in_memory(IndexConfig::new(4).with_partitions(2, 3)).unwrap(),
        );
        let (_provider, pipeline) = setup_over(PipelineConfig::default(), index.clone());

        pipeline.index(abc()).await.unwrap();
        let stats = index.stats().unwrap();
        assert!(stats.trained);
        assert_eq!(stats.trained_size, 3);
    }
}
