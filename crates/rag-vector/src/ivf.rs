//! IVF-flat partitions.
//!
//! k-means splits the vectors into `nlist` partitions. A search probes only
//! the partitions whose centroids are closest to the query. Partitions keep
//! chunk IDs; the vectors stay in the index's record map.

use std::collections::HashMap;

use rag_types::{ChunkId, SimilarityMetric};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::similarity::{score, squared_euclidean};

pub type ClusterId = usize;

/// Fixed so training the same vectors always yields the same partitions.
const KMEANS_SEED: u64 = 0x5EED_1DF0;
const MAX_ITERATIONS: usize = 25;
/// Independent k-means++ seedings; the lowest-inertia run wins.
const RESTARTS: usize = 4;

#[derive(Debug, Clone)]
pub struct KMeansResult {
    pub centroids: Vec<Vec<f32>>,
    pub assignments: Vec<ClusterId>,
    pub iterations: usize,
    /// Sum of seeding distances from each vector to its centroid
    pub inertia: f64,
}

/// Index of the centroid most similar to `vector`.
pub fn assign_to_nearest_centroid(
    vector: &[f32],
    centroids: &[Vec<f32>],
    metric: SimilarityMetric,
) -> ClusterId {
    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, score(metric, vector, c)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Seeding distance: 1 - cosine for cosine, squared L2 otherwise.
fn seed_distance(metric: SimilarityMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        SimilarityMetric::Cosine => (1.0 - score(metric, a, b)).max(0.0),
        _ => squared_euclidean(a, b),
    }
}

/// k-means++ seeding.
fn seed_centroids(
    vectors: &[&[f32]],
    k: usize,
    metric: SimilarityMetric,
    rng: &mut StdRng,
) -> Vec<Vec<f32>> {
    let mut centroids = vec![vectors[rng.random_range(0..vectors.len())].to_vec()];
    let mut nearest: Vec<f32> = vectors
        .iter()
        .map(|v| seed_distance(metric, v, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f64 = nearest.iter().map(|d| f64::from(*d)).sum();
        let next = if total <= 0.0 {
            // Every point coincides with a centroid
            rng.random_range(0..vectors.len())
        } else {
            let mut target = rng.random::<f64>() * total;
            let mut chosen = vectors.len() - 1;
            for (i, d) in nearest.iter().enumerate() {
                target -= f64::from(*d);
                if target <= 0.0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        };

        let centroid = vectors[next].to_vec();
        for (d, v) in nearest.iter_mut().zip(vectors) {
            *d = d.min(seed_distance(metric, v, &centroid));
        }
        centroids.push(centroid);
    }
    centroids
}

/// Lloyd's k-means with k-means++ seeding and a fixed RNG seed.
///
/// Runs several seedings and keeps the one with the lowest inertia.
pub fn kmeans_clustering(vectors: &[&[f32]], k: usize, metric: SimilarityMetric) -> KMeansResult {
    if vectors.is_empty() || k == 0 {
        return KMeansResult {
            centroids: Vec::new(),
            assignments: Vec::new(),
            iterations: 0,
            inertia: 0.0,
        };
    }
    let k = k.min(vectors.len());
    let mut rng = StdRng::seed_from_u64(KMEANS_SEED);

    let mut best = lloyd(vectors, k, metric, &mut rng);
    for _ in 1..RESTARTS {
        let run = lloyd(vectors, k, metric, &mut rng);
        if run.inertia < best.inertia {
            best = run;
        }
    }
    best
}

fn lloyd(vectors: &[&[f32]], k: usize, metric: SimilarityMetric, rng: &mut StdRng) -> KMeansResult {
    let dimension = vectors[0].len();
    let mut centroids = seed_centroids(vectors, k, metric, rng);
    let mut assignments = vec![usize::MAX; vectors.len()];
    let mut iterations = 0;

    while iterations < MAX_ITERATIONS {
        iterations += 1;
        let mut changed = false;
        for (slot, v) in assignments.iter_mut().zip(vectors) {
            let nearest = assign_to_nearest_centroid(v, &centroids, metric);
            if *slot != nearest {
                *slot = nearest;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut sums = vec![vec![0.0f32; dimension]; k];
        let mut counts = vec![0usize; k];
        for (&cluster, v) in assignments.iter().zip(vectors) {
            counts[cluster] += 1;
            for (s, x) in sums[cluster].iter_mut().zip(v.iter()) {
                *s += x;
            }
        }
        for ((centroid, sum), count) in centroids.iter_mut().zip(sums).zip(counts) {
            // Empty clusters keep their previous centroid
            if count > 0 {
                *centroid = sum.into_iter().map(|s| s / count as f32).collect();
            }
        }
    }

    let inertia = assignments
        .iter()
        .zip(vectors)
        .map(|(&c, v)| f64::from(seed_distance(metric, v, &centroids[c])))
        .sum();
    KMeansResult {
        centroids,
        assignments,
        iterations,
        inertia,
    }
}

/// Trained partitions and their member lists.
#[derive(Debug, Clone)]
pub struct IvfPartitions {
    metric: SimilarityMetric,
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<ChunkId>>,
    assignment: HashMap<ChunkId, ClusterId>,
    trained_size: usize,
}

impl IvfPartitions {
    /// Train `nlist` partitions over `records`.
    pub fn train<'a>(
        records: impl IntoIterator<Item = (&'a ChunkId, &'a [f32])>,
        nlist: usize,
        metric: SimilarityMetric,
    ) -> Option<Self> {
        let (ids, vectors): (Vec<&ChunkId>, Vec<&[f32]>) = records.into_iter().unzip();
        if ids.is_empty() {
            return None;
        }

        let result = kmeans_clustering(&vectors, nlist, metric);
        let mut lists = vec![Vec::new(); result.centroids.len()];
        let mut assignment = HashMap::with_capacity(ids.len());
        for (id, cluster) in ids.into_iter().zip(result.assignments) {
            lists[cluster].push(id.clone());
            assignment.insert(id.clone(), cluster);
        }

        debug!(
            partitions = result.centroids.len(),
            records = assignment.len(),
            iterations = result.iterations,
            "Trained IVF partitions"
        );
        Some(Self {
            metric,
            centroids: result.centroids,
            lists,
            trained_size: assignment.len(),
            assignment,
        })
    }

    /// Add or move a record to its nearest partition.
    pub fn insert(&mut self, chunk_id: &ChunkId, vector: &[f32]) {
        self.remove(chunk_id);
        let cluster = assign_to_nearest_centroid(vector, &self.centroids, self.metric);
        self.lists[cluster].push(chunk_id.clone());
        self.assignment.insert(chunk_id.clone(), cluster);
    }

    pub fn remove(&mut self, chunk_id: &ChunkId) {
        if let Some(cluster) = self.assignment.remove(chunk_id) {
            self.lists[cluster].retain(|id| id != chunk_id);
        }
    }

    /// The `nprobe` partitions nearest to `query`, nearest first.
    pub fn probe(&self, query: &[f32], nprobe: usize) -> Vec<ClusterId> {
        let mut order = self.nearest(query);
        order.truncate(nprobe);
        order
    }

    /// Every partition, nearest to `query` first.
    pub fn nearest(&self, query: &[f32]) -> Vec<ClusterId> {
        let mut scored: Vec<(ClusterId, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, score(self.metric, query, c)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.into_iter().map(|(i, _)| i).collect()
    }

    /// Member IDs of the given partitions.
    pub fn members<'a>(&'a self, clusters: &'a [ClusterId]) -> impl Iterator<Item = &'a ChunkId> {
        clusters
            .iter()
            .filter_map(|&c| self.lists.get(c))
            .flat_map(|list| list.iter())
    }

    pub fn contains(&self, chunk_id: &ChunkId) -> bool {
        self.assignment.contains_key(chunk_id)
    }

    pub fn partition_count(&self) -> usize {
        self.centroids.len()
    }

    /// Record count when the partitions were last trained.
    pub fn trained_size(&self) -> usize {
        self.trained_size
    }

    pub fn len(&self) -> usize {
        self.assignment.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignment.is_empty()
    }
}
