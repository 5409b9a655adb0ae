//! The vector index.
//!
//! Records are kept in memory behind a `RwLock` and written through to
//! RocksDB. Exact search scans every record; ANN search probes the nearest
//! IVF partitions, overfetches candidates and re-ranks them. Both modes run
//! the same filter and ranking code.
//!
//! k-means never runs under the lock. Training works on a copy of the
//! vectors and the result is reconciled with whatever changed meanwhile.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use rag_types::{ChunkId, ChunkMetadata, SearchMode, Settings, SimilarityMetric};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::VectorError;
use crate::filter::SearchFilter;
use crate::ivf::IvfPartitions;
use crate::similarity::score;
use crate::store::{IndexRecord, RecordStore};

/// Minimum extra candidates scored in ANN mode.
pub const MIN_EXTRA_CANDIDATES: usize = 10;

/// Vector index configuration.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub dimension: usize,
    pub metric: SimilarityMetric,
    /// IVF partition count
    pub nlist: usize,
    /// Records required before partitions are trained
    pub min_train_size: usize,
    /// Retrain when the index grows by this factor since the last training
    pub retrain_growth: f32,
}

impl IndexConfig {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            metric: SimilarityMetric::Cosine,
            nlist: 64,
            min_train_size: 256,
            retrain_growth: 2.0,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            dimension: settings.embedding.dimension,
            metric: settings.vector.metric,
            nlist: settings.vector.nlist,
            min_train_size: settings.vector.min_train_size,
            retrain_growth: settings.vector.retrain_growth,
        }
    }

    pub fn with_metric(mut self, metric: SimilarityMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_partitions(mut self, nlist: usize, min_train_size: usize) -> Self {
        self.nlist = nlist;
        self.min_train_size = min_train_size;
        self
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: ChunkId,
    pub score: f32,
    pub metadata: ChunkMetadata,
}

/// Index statistics
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub records: usize,
    pub dimension: usize,
    pub metric: SimilarityMetric,
    /// Whether ANN search uses partitions (else it falls back to exact)
    pub trained: bool,
    pub partitions: usize,
    pub trained_size: usize,
    pub persistent: bool,
}

#[derive(Default)]
struct IndexState {
    records: HashMap<ChunkId, IndexRecord>,
    partitions: Option<IvfPartitions>,
}

/// Vectors copied out for training.
struct TrainingSnapshot {
    started: DateTime<Utc>,
    vectors: Vec<(ChunkId, Vec<f32>)>,
}

/// Holds the training flag; clears it on drop.
struct TrainingGuard<'a>(&'a AtomicBool);

impl<'a> TrainingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TrainingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, AtomicOrdering::Release);
    }
}

/// Exact and IVF-flat vector index over chunk records.
pub struct VectorIndex {
    config: IndexConfig,
    store: Option<RecordStore>,
    state: RwLock<IndexState>,
    training: AtomicBool,
}

impl VectorIndex {
    /// Create an index that lives only in memory.
    pub fn in_memory(config: IndexConfig) -> Result<Self, VectorError> {
        validate_config(&config)?;
        Ok(Self {
            config,
            store: None,
            state: RwLock::new(IndexState::default()),
            training: AtomicBool::new(false),
        })
    }

    /// Open or create a persistent index at `path`.
    pub fn open(path: impl AsRef<Path>, config: IndexConfig) -> Result<Self, VectorError> {
        validate_config(&config)?;
        Self::load(RecordStore::open(path)?, config)
    }

    /// Open an existing index without write access. Inserts and deletes
    /// fail with `ReadOnly`; search works as usual.
    pub fn open_read_only(path: impl AsRef<Path>, config: IndexConfig) -> Result<Self, VectorError> {
        validate_config(&config)?;
        Self::load(RecordStore::open_read_only(path)?, config)
    }

    fn load(store: RecordStore, config: IndexConfig) -> Result<Self, VectorError> {
        match store.dimension()? {
            Some(stored) if stored != config.dimension => {
                return Err(VectorError::DimensionMismatch {
                    expected: stored,
                    actual: config.dimension,
                });
            }
            Some(_) => {}
            None if store.is_read_only() => {}
            None => store.set_dimension(config.dimension)?,
        }

        let mut state = IndexState::default();
        for record in store.load_all()? {
            if record.vector.len() != config.dimension {
                warn!(chunk_id = %record.chunk_id.short(), "Skipping record with wrong dimension");
                continue;
            }
            state.records.insert(record.chunk_id.clone(), record);
        }

        let index = Self {
            config,
            store: Some(store),
            state: RwLock::new(state),
            training: AtomicBool::new(false),
        };
        index.train_if_due()?;
        {
            let state = index.read()?;
            info!(
                records = state.records.len(),
                trained = state.partitions.is_some(),
                "Opened vector index"
            );
        }
        Ok(index)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, IndexState>, VectorError> {
        self.state
            .read()
            .map_err(|e| VectorError::Index(format!("Index lock error: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, IndexState>, VectorError> {
        self.state
            .write()
            .map_err(|e| VectorError::Index(format!("Index lock error: {e}")))
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), VectorError> {
        if vector.len() != self.config.dimension {
            return Err(VectorError::DimensionMismatch {
                expected: self.config.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Whether partitions are missing with enough records to train, or the
    /// index has grown enough since the last training.
    pub fn training_due(&self) -> Result<bool, VectorError> {
        let state = self.read()?;
        let len = state.records.len();
        Ok(match &state.partitions {
            None => len > 0 && len >= self.config.min_train_size,
            Some(p) => len as f64 >= p.trained_size() as f64 * f64::from(self.config.retrain_growth),
        })
    }

    /// Train or retrain partitions if due. Returns whether it trained.
    ///
    /// CPU-bound; async callers should run it on a blocking thread.
    pub fn train_if_due(&self) -> Result<bool, VectorError> {
        if !self.training_due()? {
            return Ok(false);
        }
        self.retrain()
    }

    /// Train over the current records. Returns false if another training
    /// is already running.
    fn retrain(&self) -> Result<bool, VectorError> {
        let Some(_guard) = TrainingGuard::acquire(&self.training) else {
            debug!("Partition training already running");
            return Ok(false);
        };
        let snapshot = self.snapshot()?;
        let trained = self.train(&snapshot);
        self.install(trained, &snapshot)?;
        Ok(true)
    }

    fn snapshot(&self) -> Result<TrainingSnapshot, VectorError> {
        let started = Utc::now();
        let state = self.read()?;
        let vectors = state
            .records
            .iter()
            .map(|(id, r)| (id.clone(), r.vector.clone()))
            .collect();
        Ok(TrainingSnapshot { started, vectors })
    }

    fn train(&self, snapshot: &TrainingSnapshot) -> Option<IvfPartitions> {
        let records = snapshot
            .vectors
            .iter()
            .map(|(id, vector)| (id, vector.as_slice()));
        IvfPartitions::train(records, self.config.nlist, self.config.metric)
    }

    /// Swap in freshly trained partitions, catching up with writes made
    /// after the snapshot.
    fn install(
        &self,
        trained: Option<IvfPartitions>,
        snapshot: &TrainingSnapshot,
    ) -> Result<(), VectorError> {
        let mut state = self.write()?;
        let Some(mut partitions) = trained else {
            state.partitions = None;
            return Ok(());
        };

        for (id, _) in &snapshot.vectors {
            if !state.records.contains_key(id) {
                partitions.remove(id);
            }
        }
        let mut caught_up = 0;
        for (id, record) in &state.records {
            if record.indexed_at >= snapshot.started || !partitions.contains(id) {
                partitions.insert(id, &record.vector);
                caught_up += 1;
            }
        }

        debug!(
            partitions = partitions.partition_count(),
            trained_on = snapshot.vectors.len(),
            caught_up,
            "Installed IVF partitions"
        );
        state.partitions = Some(partitions);
        Ok(())
    }

    /// Insert or replace the record for `chunk_id`, retraining partitions
    /// in place when due.
    pub fn insert(
        &self,
        chunk_id: ChunkId,
        vector: Vec<f32>,
        metadata: ChunkMetadata,
    ) -> Result<(), VectorError> {
        self.store(chunk_id, vector, metadata)?;
        self.train_if_due()?;
        Ok(())
    }

    /// Insert or replace the record for `chunk_id` without training.
    ///
    /// The record joins its nearest existing partition. Call
    /// `train_if_due` afterwards to keep partitions current.
    pub fn store(
        &self,
        chunk_id: ChunkId,
        vector: Vec<f32>,
        metadata: ChunkMetadata,
    ) -> Result<(), VectorError> {
        self.check_dimension(&vector)?;
        let record = IndexRecord {
            chunk_id: chunk_id.clone(),
            vector,
            metadata,
            indexed_at: Utc::now(),
        };

        let mut state = self.write()?;
        if let Some(store) = &self.store {
            store.put(&record)?;
        }
        if let Some(partitions) = state.partitions.as_mut() {
            partitions.insert(&chunk_id, &record.vector);
        }
        state.records.insert(chunk_id.clone(), record);

        debug!(chunk_id = %chunk_id.short(), records = state.records.len(), "Indexed chunk");
        Ok(())
    }

    /// Remove a record. Returns whether it existed.
    pub fn delete(&self, chunk_id: &ChunkId) -> Result<bool, VectorError> {
        let mut state = self.write()?;
        if !state.records.contains_key(chunk_id) {
            return Ok(false);
        }
        if let Some(store) = &self.store {
            store.delete(chunk_id)?;
        }
        state.records.remove(chunk_id);
        if let Some(partitions) = state.partitions.as_mut() {
            partitions.remove(chunk_id);
        }
        Ok(true)
    }

    pub fn get(&self, chunk_id: &ChunkId) -> Result<Option<IndexRecord>, VectorError> {
        Ok(self.read()?.records.get(chunk_id).cloned())
    }

    pub fn contains(&self, chunk_id: &ChunkId) -> Result<bool, VectorError> {
        Ok(self.read()?.records.contains_key(chunk_id))
    }

    pub fn len(&self) -> usize {
        self.read().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Result<IndexStats, VectorError> {
        let state = self.read()?;
        Ok(IndexStats {
            records: state.records.len(),
            dimension: self.config.dimension,
            metric: self.config.metric,
            trained: state.partitions.is_some(),
            partitions: state
                .partitions
                .as_ref()
                .map_or(0, |p| p.partition_count()),
            trained_size: state.partitions.as_ref().map_or(0, |p| p.trained_size()),
            persistent: self.store.is_some(),
        })
    }

    /// Retrain partitions over the current records.
    pub fn rebuild(&self) -> Result<IndexStats, VectorError> {
        if !self.retrain()? {
            warn!("Rebuild skipped, partition training already running");
        }
        let stats = self.stats()?;
        info!(
            records = stats.records,
            partitions = stats.partitions,
            "Rebuilt IVF partitions"
        );
        Ok(stats)
    }

    /// Top `top_k` records by similarity to `query` that pass `filter`.
    ///
    /// Results are ordered by score (descending), then `created_at`
    /// (newest first), then chunk ID.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        mode: SearchMode,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>, VectorError> {
        self.check_dimension(query)?;
        if let SearchMode::Ann { nprobe, overfetch } = mode {
            if nprobe == 0 || overfetch == 0 {
                return Err(VectorError::InvalidParameter(
                    "nprobe and overfetch must be positive".to_string(),
                ));
            }
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let state = self.read()?;
        let hits = match (mode, state.partitions.as_ref()) {
            (SearchMode::Exact, _) => self.rank(state.records.values(), query, filter, top_k),
            (SearchMode::Ann { .. }, None) => {
                debug!("Partitions not trained, falling back to exact search");
                self.rank(state.records.values(), query, filter, top_k)
            }
            (SearchMode::Ann { nprobe, overfetch }, Some(partitions)) => {
                // Probe at least `nprobe` partitions, then keep going until
                // enough filtered candidates have been gathered.
                let candidate_limit = top_k
                    .saturating_mul(overfetch)
                    .max(top_k + MIN_EXTRA_CANDIDATES);
                let mut candidates: Vec<&IndexRecord> = Vec::new();
                let mut probed = 0;
                for cluster in partitions.nearest(query) {
                    if probed >= nprobe && candidates.len() >= candidate_limit {
                        break;
                    }
                    probed += 1;
                    candidates.extend(
                        partitions
                            .members(&[cluster])
                            .filter_map(|id| state.records.get(id))
                            .filter(|r| filter.matches(&r.metadata)),
                    );
                }
                debug!(probed, candidates = candidates.len(), "ANN candidates gathered");
                self.top_hits(candidates.into_iter(), query, top_k)
            }
        };
        Ok(hits)
    }

    /// Filter, then score, sort and truncate.
    fn rank<'a>(
        &self,
        records: impl Iterator<Item = &'a IndexRecord>,
        query: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Vec<SearchHit> {
        self.top_hits(records.filter(|r| filter.matches(&r.metadata)), query, limit)
    }

    fn top_hits<'a>(
        &self,
        records: impl Iterator<Item = &'a IndexRecord>,
        query: &[f32],
        limit: usize,
    ) -> Vec<SearchHit> {
        let mut hits: Vec<SearchHit> = records
            .map(|r| SearchHit {
                chunk_id: r.chunk_id.clone(),
                score: score(self.config.metric, query, &r.vector),
                metadata: r.metadata.clone(),
            })
            .collect();
        hits.sort_by(compare_hits);
        hits.truncate(limit);
        hits
    }
}

/// Score descending, newest first, then chunk ID.
pub fn compare_hits(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.metadata.created_at.cmp(&a.metadata.created_at))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

fn validate_config(config: &IndexConfig) -> Result<(), VectorError> {
    if config.dimension == 0 {
        return Err(VectorError::InvalidParameter(
            "dimension must be positive".to_string(),
        ));
    }
    if config.nlist == 0 {
        return Err(VectorError::InvalidParameter(
            "nlist must be positive".to_string(),
        ));
    }
    if config.retrain_growth <= 1.0 {
        return Err(VectorError::InvalidParameter(
            "retrain_growth must be greater than 1".to_string(),
        ));
    }
    Ok(())
}
