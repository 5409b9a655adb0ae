//! Embedder trait and the cache-backed decorator.
//!
//! An `Embedder` is what the retrieval pipeline talks to. The direct
//! implementation lives with the router; `CachedEmbedder` wraps any embedder
//! and only forwards cache misses, coalescing identical texts so one
//! fingerprint is never embedded twice at the same time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rag_types::{Priority, TaskType};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::EmbeddingCache;
use crate::error::EmbeddingError;
use crate::fingerprint::{normalize, task_fingerprint};

/// A batch of texts to embed.
#[derive(Debug, Clone)]
pub struct EmbedRequest {
    pub texts: Vec<String>,
    pub priority: Priority,
    pub task: TaskType,
    /// The request fails with `Timeout` once this passes.
    pub deadline: Option<Instant>,
}

impl EmbedRequest {
    /// Query-time request, embedded as a retrieval query.
    pub fn interactive(texts: Vec<String>) -> Self {
        Self::new(texts, Priority::Interactive)
    }

    /// Indexing request, embedded as a retrieval document.
    pub fn background(texts: Vec<String>) -> Self {
        Self::new(texts, Priority::Background)
    }

    fn new(texts: Vec<String>, priority: Priority) -> Self {
        Self {
            texts,
            priority,
            task: priority.default_task(),
            deadline: None,
        }
    }

    pub fn with_task(mut self, task: TaskType) -> Self {
        self.task = task;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Turns texts into vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_version(&self) -> &str;

    fn dimension(&self) -> usize;

    /// Largest accepted batch.
    fn max_batch_size(&self) -> usize;

    /// Embed a batch; output is in input order.
    async fn embed_batch(&self, request: EmbedRequest) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

#[async_trait]
impl<E: Embedder + ?Sized> Embedder for Arc<E> {
    fn model_version(&self) -> &str {
        (**self).model_version()
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn max_batch_size(&self) -> usize {
        (**self).max_batch_size()
    }

    async fn embed_batch(&self, request: EmbedRequest) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        (**self).embed_batch(request).await
    }
}

/// Reject batches no provider call could serve.
pub fn validate_batch(texts: &[String], max_batch_size: usize) -> Result<(), EmbeddingError> {
    if texts.len() > max_batch_size {
        return Err(EmbeddingError::InvalidInput(format!(
            "batch of {} exceeds max_batch_size {}",
            texts.len(),
            max_batch_size
        )));
    }
    if let Some(pos) = texts.iter().position(|t| normalize(t).is_empty()) {
        return Err(EmbeddingError::InvalidInput(format!(
            "text at position {pos} is empty"
        )));
    }
    Ok(())
}

type Outcome = Option<Result<Vec<f32>, EmbeddingError>>;

/// In-flight embeds are tracked per fingerprint and priority class.
type FlightKey = (String, Priority);

struct Flight {
    id: u64,
    tx: watch::Sender<Outcome>,
}

/// Removes this call's in-flight entries, including when the call is dropped
/// mid-flight. Followers of a dropped leader see a closed channel and retry.
struct FlightGuard<'a> {
    in_flight: &'a Mutex<HashMap<FlightKey, Flight>>,
    owned: Vec<(FlightKey, u64)>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut map) = self.in_flight.lock() {
            for (key, id) in self.owned.drain(..) {
                if map.get(&key).is_some_and(|f| f.id == id) {
                    map.remove(&key);
                }
            }
        }
    }
}

/// Flights a caller of `priority` may wait on, in preference order.
///
/// Background work may ride on an interactive flight. Interactive work never
/// waits on a background flight, which can sit behind the whole backlog.
fn joinable(priority: Priority) -> &'static [Priority] {
    match priority {
        Priority::Interactive => &[Priority::Interactive],
        Priority::Background => &[Priority::Background, Priority::Interactive],
    }
}

/// Cache-backed embedder with single-flight coalescing.
pub struct CachedEmbedder<E> {
    inner: E,
    cache: Arc<EmbeddingCache>,
    in_flight: Mutex<HashMap<FlightKey, Flight>>,
    next_flight: AtomicU64,
}

impl<E: Embedder> CachedEmbedder<E> {
    pub fn new(inner: E, cache: Arc<EmbeddingCache>) -> Self {
        Self {
            inner,
            cache,
            in_flight: Mutex::new(HashMap::new()),
            next_flight: AtomicU64::new(1),
        }
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Split unresolved fingerprints into ones this call leads and ones it
    /// waits on.
    #[allow(clippy::type_complexity)]
    fn elect(
        &self,
        pending: &[String],
        priority: Priority,
        resolved: &mut HashMap<String, Vec<f32>>,
        guard: &mut FlightGuard<'_>,
    ) -> Result<(Vec<String>, Vec<(String, watch::Receiver<Outcome>)>), EmbeddingError> {
        let model = self.inner.model_version();
        let mut leads = Vec::new();
        let mut follows = Vec::new();

        let mut map = self
            .in_flight
            .lock()
            .map_err(|e| EmbeddingError::Storage(format!("In-flight lock error: {e}")))?;
        for fp in pending {
            if let Some(vector) = self.cache.get(fp, model)? {
                resolved.insert(fp.clone(), vector);
                continue;
            }
            let joined = joinable(priority)
                .iter()
                .find_map(|class| map.get(&(fp.clone(), *class)));
            if let Some(flight) = joined {
                follows.push((fp.clone(), flight.tx.subscribe()));
                continue;
            }
            let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
            let (tx, _rx) = watch::channel(None);
            let key = (fp.clone(), priority);
            map.insert(key.clone(), Flight { id, tx });
            guard.owned.push((key, id));
            leads.push(fp.clone());
        }
        Ok((leads, follows))
    }

    fn publish(&self, key: FlightKey, outcome: Result<Vec<f32>, EmbeddingError>) {
        if let Ok(map) = self.in_flight.lock() {
            if let Some(flight) = map.get(&key) {
                flight.tx.send_replace(Some(outcome));
            }
        }
    }

    async fn lead(
        &self,
        leads: &[String],
        texts_by_fp: &HashMap<String, String>,
        template: &EmbedRequest,
    ) -> Result<Vec<(String, Vec<f32>)>, EmbeddingError> {
        if leads.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<String> = leads
            .iter()
            .filter_map(|fp| texts_by_fp.get(fp).cloned())
            .collect();
        debug!(misses = texts.len(), task = template.task.as_str(), "Embedding cache misses");

        let request = EmbedRequest {
            texts,
            ..template.clone()
        };
        let priority = template.priority;
        match self.inner.embed_batch(request).await {
            Ok(vectors) => {
                let model = self.inner.model_version();
                let mut out = Vec::with_capacity(vectors.len());
                for (fp, vector) in leads.iter().zip(vectors) {
                    if let Err(e) = self.cache.put(fp, model, &vector) {
                        warn!(error = %e, fingerprint = %fp, "Failed to cache embedding");
                    }
                    self.publish((fp.clone(), priority), Ok(vector.clone()));
                    out.push((fp.clone(), vector));
                }
                Ok(out)
            }
            Err(e) => {
                for fp in leads {
                    self.publish((fp.clone(), priority), Err(e.clone()));
                }
                Err(e)
            }
        }
    }

    /// Wait for other callers' results. `None` for a leader that went away.
    async fn follow(
        follows: Vec<(String, watch::Receiver<Outcome>)>,
        deadline: Option<Instant>,
    ) -> Result<Vec<(String, Option<Vec<f32>>)>, EmbeddingError> {
        let mut out = Vec::with_capacity(follows.len());
        for (fp, mut rx) in follows {
            let wait = async {
                match rx.wait_for(|v| v.is_some()).await {
                    Ok(outcome) => outcome.clone(),
                    Err(_) => None,
                }
            };
            let outcome = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, wait)
                    .await
                    .map_err(|_| EmbeddingError::Timeout)?,
                None => wait.await,
            };
            match outcome {
                Some(Ok(vector)) => out.push((fp, Some(vector))),
                Some(Err(e)) => return Err(e),
                None => out.push((fp, None)),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl<E: Embedder> Embedder for CachedEmbedder<E> {
    fn model_version(&self) -> &str {
        self.inner.model_version()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }

    async fn embed_batch(&self, request: EmbedRequest) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        validate_batch(&request.texts, self.max_batch_size())?;
        if request.texts.is_empty() {
            return Ok(Vec::new());
        }

        let fps: Vec<String> = request
            .texts
            .iter()
            .map(|t| task_fingerprint(t, request.task))
            .collect();
        let mut texts_by_fp = HashMap::new();
        let mut pending = Vec::new();
        let mut seen = HashSet::new();
        for (fp, text) in fps.iter().zip(&request.texts) {
            if seen.insert(fp.clone()) {
                texts_by_fp.insert(fp.clone(), text.clone());
                pending.push(fp.clone());
            }
        }

        let mut resolved: HashMap<String, Vec<f32>> = HashMap::new();
        let mut guard = FlightGuard {
            in_flight: &self.in_flight,
            owned: Vec::new(),
        };

        while !pending.is_empty() {
            let (leads, follows) =
                self.elect(&pending, request.priority, &mut resolved, &mut guard)?;

            let (led, followed) = tokio::join!(
                self.lead(&leads, &texts_by_fp, &request),
                Self::follow(follows, request.deadline),
            );

            pending.clear();
            for (fp, vector) in led? {
                resolved.insert(fp, vector);
            }
            for (fp, vector) in followed? {
                match vector {
                    Some(vector) => {
                        resolved.insert(fp, vector);
                    }
                    // Leader dropped before finishing; try again
                    None => pending.push(fp),
                }
            }
        }
        drop(guard);

        fps.iter()
            .map(|fp| {
                resolved.get(fp).cloned().ok_or_else(|| {
                    EmbeddingError::InvalidInput(format!("no vector produced for {fp}"))
                })
            })
            .collect()
    }
}
