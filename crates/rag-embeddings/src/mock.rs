//! Mock embedding provider for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rag_types::TaskType;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::error::EmbeddingError;
use crate::fingerprint::normalize;
use crate::provider::EmbeddingProvider;

/// Mock provider that returns deterministic vectors.
///
/// Vectors come from an explicit text -> vector table when one is set, else
/// from a hash of the normalized text; the task type does not change them.
/// Every call is counted, timestamped and has its task recorded so tests can
/// assert on provider traffic.
pub struct MockProvider {
    dimension: usize,
    model_version: String,
    vectors: Mutex<HashMap<String, Vec<f32>>>,
    scripted_failures: Mutex<VecDeque<EmbeddingError>>,
    persistent_failure: Mutex<Option<EmbeddingError>>,
    latency: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    texts_embedded: AtomicUsize,
    call_log: Mutex<Vec<Instant>>,
    task_log: Mutex<Vec<TaskType>>,
}

impl MockProvider {
    /// Create a new mock provider.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model_version: format!("mock@{dimension}"),
            vectors: Mutex::new(HashMap::new()),
            scripted_failures: Mutex::new(VecDeque::new()),
            persistent_failure: Mutex::new(None),
            latency: Mutex::new(None),
            calls: AtomicUsize::new(0),
            texts_embedded: AtomicUsize::new(0),
            call_log: Mutex::new(Vec::new()),
            task_log: Mutex::new(Vec::new()),
        }
    }

    /// Pin the vector returned for `text` (matched after normalization).
    pub fn with_vector(self, text: &str, vector: Vec<f32>) -> Self {
        self.set_vector(text, vector);
        self
    }

    pub fn set_vector(&self, text: &str, vector: Vec<f32>) {
        if let Ok(mut vectors) = self.vectors.lock() {
            vectors.insert(normalize(text), vector);
        }
    }

    /// Simulated provider latency per call.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(Some(latency));
        self
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut slot) = self.latency.lock() {
            *slot = latency;
        }
    }

    /// Fail the next call with `err` (queued, one per call).
    pub fn fail_next(&self, err: EmbeddingError) {
        if let Ok(mut failures) = self.scripted_failures.lock() {
            failures.push_back(err);
        }
    }

    /// Fail every call with `err` until cleared with `None`.
    pub fn set_failure(&self, err: Option<EmbeddingError>) {
        if let Ok(mut slot) = self.persistent_failure.lock() {
            *slot = err;
        }
    }

    /// Number of `embed` calls made (including failed ones).
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of texts embedded successfully.
    pub fn texts_embedded(&self) -> usize {
        self.texts_embedded.load(Ordering::SeqCst)
    }

    /// Instants at which calls started.
    pub fn call_instants(&self) -> Vec<Instant> {
        self.call_log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Task type of each call, in call order.
    pub fn call_tasks(&self) -> Vec<TaskType> {
        self.task_log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    fn next_failure(&self) -> Option<EmbeddingError> {
        if let Some(err) = self
            .scripted_failures
            .lock()
            .ok()
            .and_then(|mut failures| failures.pop_front())
        {
            return Some(err);
        }
        self.persistent_failure.lock().ok().and_then(|f| f.clone())
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let key = normalize(text);
        if let Some(vector) = self.vectors.lock().ok().and_then(|v| v.get(&key).cloned()) {
            return vector;
        }
        hashed_vector(&key, self.dimension)
    }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(
        &self,
        texts: &[String],
        task: TaskType,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut log) = self.call_log.lock() {
            log.push(Instant::now());
        }
        if let Ok(mut log) = self.task_log.lock() {
            log.push(task);
        }

        let latency = self.latency.lock().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(err) = self.next_failure() {
            return Err(err);
        }

        let vectors: Vec<Vec<f32>> = texts.iter().map(|t| self.vector_for(t)).collect();
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(vectors)
    }
}

/// Unit vector seeded from the text's hash.
fn hashed_vector(text: &str, dimension: usize) -> Vec<f32> {
    let seed = Sha256::digest(text.as_bytes());
    let mut state = u64::from_le_bytes([
        seed[0], seed[1], seed[2], seed[3], seed[4], seed[5], seed[6], seed[7],
    ]) | 1;

    // xorshift64*
    let mut vector: Vec<f32> = (0..dimension)
        .map(|_| {
            state ^= state >> 12;
            state ^= state << 25;
            state ^= state >> 27;
            let bits = state.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 40;
            (bits as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
        })
        .collect();

    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    const DOC: TaskType = TaskType::RetrievalDocument;

    #[tokio::test]
    async fn test_deterministic_vectors() {
        let provider = MockProvider::new(8);
        let a = provider.embed(&texts(&["hello world"]), DOC).await.unwrap();
        let b = provider.embed(&texts(&["Hello   World"]), DOC).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 8);

        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_pinned_vector() {
        let provider = MockProvider::new(3).with_vector("alpha", vec![1.0, 0.0, 0.0]);
        let out = provider.embed(&texts(&["ALPHA", "beta"]), DOC).await.unwrap();
        assert_eq!(out[0], vec![1.0, 0.0, 0.0]);
        assert_ne!(out[1], vec![1.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_counts_calls() {
        let provider = MockProvider::new(4);
        provider.embed(&texts(&["a", "b"]), DOC).await.unwrap();
        provider.embed(&texts(&["c"]), DOC).await.unwrap();
        assert_eq!(provider.call_count(), 2);
        assert_eq!(provider.texts_embedded(), 3);
        assert_eq!(provider.call_instants().len(), 2);
    }

    #[tokio::test]
    async fn test_records_task_without_changing_vectors() {
        let provider = MockProvider::new(4);
        let document = provider.embed(&texts(&["same"]), DOC).await.unwrap();
        let query = provider
            .embed(&texts(&["same"]), TaskType::RetrievalQuery)
            .await
            .unwrap();
        assert_eq!(document, query);
        assert_eq!(provider.call_tasks(), vec![DOC, TaskType::RetrievalQuery]);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let provider = MockProvider::new(4);
        provider.fail_next(EmbeddingError::transient("boom"));

        assert!(provider.embed(&texts(&["a"]), DOC).await.is_err());
        assert!(provider.embed(&texts(&["a"]), DOC).await.is_ok());

        provider.set_failure(Some(EmbeddingError::InvalidInput("bad".into())));
        assert!(provider.embed(&texts(&["a"]), DOC).await.is_err());
        assert!(provider.embed(&texts(&["a"]), DOC).await.is_err());
        provider.set_failure(None);
        assert!(provider.embed(&texts(&["a"]), DOC).await.is_ok());
    }
}
