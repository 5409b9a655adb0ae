//! Dual-queue embedding router.
//!
//! A single actor task owns both queues and the quota governor. Callers hold
//! a cloneable `RouterHandle` and get their vectors back on a oneshot
//! channel. Each granted slot becomes a spawned provider call; completions
//! come back to the actor so the concurrency slot can be released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rag_embeddings::{check_vectors, EmbedRequest, EmbeddingError, EmbeddingProvider};
use rag_types::{Priority, Settings};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::queue::{Batch, DualQueue, PendingRequest};
use crate::quota::{Admission, QuotaGovernor};

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_batch_size: usize,
    pub interactive_queue_depth: usize,
    pub starvation_ticks: u32,
    pub per_second_limit: u32,
    pub concurrency: usize,
    pub daily_request_budget: u64,
    /// Deadline for one provider call
    pub embedding_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl RouterConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_batch_size: settings.embedding.max_batch_size,
            interactive_queue_depth: settings.router.interactive_queue_depth,
            starvation_ticks: settings.router.starvation_ticks,
            per_second_limit: settings.quota.per_second_limit,
            concurrency: settings.quota.concurrency,
            daily_request_budget: settings.quota.daily_request_budget,
            embedding_timeout: settings.embedding.timeout(),
        }
    }
}

/// Router counters.
#[derive(Debug, Default)]
pub struct RouterStats {
    dispatched_calls: AtomicU64,
    dispatched_texts: AtomicU64,
    interactive_calls: AtomicU64,
    background_calls: AtomicU64,
    shed_requests: AtomicU64,
    budget_rejections: AtomicU64,
    timeouts: AtomicU64,
    starvation_grants: AtomicU64,
    provider_failures: AtomicU64,
}

/// Point-in-time copy of `RouterStats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStatsSnapshot {
    pub dispatched_calls: u64,
    pub dispatched_texts: u64,
    pub interactive_calls: u64,
    pub background_calls: u64,
    pub shed_requests: u64,
    pub budget_rejections: u64,
    pub timeouts: u64,
    pub starvation_grants: u64,
    pub provider_failures: u64,
}

impl RouterStats {
    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            dispatched_calls: self.dispatched_calls.load(Ordering::Relaxed),
            dispatched_texts: self.dispatched_texts.load(Ordering::Relaxed),
            interactive_calls: self.interactive_calls.load(Ordering::Relaxed),
            background_calls: self.background_calls.load(Ordering::Relaxed),
            shed_requests: self.shed_requests.load(Ordering::Relaxed),
            budget_rejections: self.budget_rejections.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            starvation_grants: self.starvation_grants.load(Ordering::Relaxed),
            provider_failures: self.provider_failures.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable handle to a running router.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::UnboundedSender<PendingRequest>,
    stats: Arc<RouterStats>,
    model_version: Arc<str>,
    dimension: usize,
    max_batch_size: usize,
}

impl RouterHandle {
    /// Submit texts with the priority's default task and wait for their
    /// vectors.
    pub async fn submit(
        &self,
        texts: Vec<String>,
        priority: Priority,
        deadline: Option<Instant>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.submit_request(EmbedRequest {
            texts,
            priority,
            task: priority.default_task(),
            deadline,
        })
        .await
    }

    /// Submit a request and wait for its vectors.
    ///
    /// Fails with `Timeout` once the deadline passes, even if the provider
    /// call is still running; its result is then discarded.
    pub async fn submit_request(
        &self,
        request: EmbedRequest,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let EmbedRequest {
            texts,
            priority,
            task,
            deadline,
        } = request;
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.len() > self.max_batch_size {
            return Err(EmbeddingError::InvalidInput(format!(
                "batch of {} exceeds max_batch_size {}",
                texts.len(),
                self.max_batch_size
            )));
        }
        if deadline.is_some_and(|d| d <= Instant::now()) {
            self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
            return Err(EmbeddingError::Timeout);
        }

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                texts,
                priority,
                task,
                deadline,
                reply,
            })
            .map_err(|_| EmbeddingError::ProviderUnavailable("router stopped".to_string()))?;

        let received = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(EmbeddingError::Timeout);
                }
            },
            None => rx.await,
        };
        received.map_err(|_| {
            EmbeddingError::ProviderUnavailable("router dropped the request".to_string())
        })?
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

/// The router actor.
pub struct EmbeddingRouter {
    provider: Arc<dyn EmbeddingProvider>,
    config: RouterConfig,
    queue: DualQueue,
    quota: QuotaGovernor,
    rx: mpsc::UnboundedReceiver<PendingRequest>,
    done_tx: mpsc::UnboundedSender<()>,
    done_rx: mpsc::UnboundedReceiver<()>,
    stats: Arc<RouterStats>,
    wake_at: Option<Instant>,
    closed: bool,
}

impl EmbeddingRouter {
    /// Start the router on the current tokio runtime.
    pub fn spawn(provider: Arc<dyn EmbeddingProvider>, config: RouterConfig) -> RouterHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(RouterStats::default());

        let handle = RouterHandle {
            tx,
            stats: stats.clone(),
            model_version: Arc::from(provider.model_version()),
            dimension: provider.dimension(),
            max_batch_size: config.max_batch_size,
        };

        let router = Self {
            queue: DualQueue::new(
                config.interactive_queue_depth,
                config.starvation_ticks,
                config.max_batch_size,
            ),
            quota: QuotaGovernor::new(
                config.per_second_limit,
                config.concurrency,
                config.daily_request_budget,
            ),
            provider,
            config,
            rx,
            done_tx,
            done_rx,
            stats,
            wake_at: None,
            closed: false,
        };

        info!(
            per_second = router.config.per_second_limit,
            concurrency = router.config.concurrency,
            daily_budget = router.config.daily_request_budget,
            "Starting embedding router"
        );
        tokio::spawn(router.run());
        handle
    }

    async fn run(mut self) {
        loop {
            self.dispatch_ready();

            if self.closed && self.queue.is_empty() && self.quota.in_flight() == 0 {
                break;
            }

            let wake_at = self.wake_at;
            tokio::select! {
                request = self.rx.recv(), if !self.closed => match request {
                    Some(request) => self.enqueue(request),
                    None => self.closed = true,
                },
                Some(()) = self.done_rx.recv() => self.quota.release(),
                _ = sleep_until(wake_at.unwrap_or_else(Instant::now)), if wake_at.is_some() => {
                    self.wake_at = None;
                }
            }
        }
        debug!("Embedding router stopped");
    }

    fn enqueue(&mut self, request: PendingRequest) {
        let mut dead = Vec::new();
        let shed = self.queue.push(request, Instant::now(), &mut dead);
        self.answer_dead(dead);
        if let Some(shed) = shed {
            self.stats.shed_requests.fetch_add(1, Ordering::Relaxed);
            warn!(texts = shed.texts.len(), "Interactive queue full, shedding oldest request");
            shed.fail(EmbeddingError::Overloaded);
        }
    }

    /// Callers of expired requests have already timed out on their side.
    fn answer_dead(&self, dead: Vec<PendingRequest>) {
        if !dead.is_empty() {
            debug!(count = dead.len(), "Dropping expired or abandoned requests");
        }
        for request in dead {
            request.fail(EmbeddingError::Timeout);
        }
    }

    /// Dispatch as many batches as the quota allows right now.
    fn dispatch_ready(&mut self) {
        loop {
            let now = Instant::now();
            let dead = self.queue.purge_heads(now);
            self.answer_dead(dead);
            if self.queue.is_empty() {
                self.wake_at = None;
                return;
            }

            match self.quota.try_acquire(now, Utc::now().date_naive()) {
                Admission::Granted => {
                    let mut dead = Vec::new();
                    let batch = self.queue.next_batch(now, &mut dead);
                    self.answer_dead(dead);
                    match batch {
                        Some(batch) => self.dispatch(batch),
                        None => self.quota.refund(),
                    }
                }
                Admission::WaitUntil(at) => {
                    self.wake_at = Some(at);
                    return;
                }
                Admission::AtCapacity => {
                    // A completion wakes the loop
                    self.wake_at = None;
                    return;
                }
                Admission::BudgetExhausted => {
                    let rejected = self.queue.drain();
                    warn!(rejected = rejected.len(), "Daily embedding budget exhausted");
                    for request in rejected {
                        self.stats.budget_rejections.fetch_add(1, Ordering::Relaxed);
                        request.fail(EmbeddingError::BudgetExhausted);
                    }
                    self.wake_at = None;
                    return;
                }
            }
        }
    }

    fn dispatch(&self, batch: Batch) {
        let texts: Vec<String> = batch
            .requests
            .iter()
            .flat_map(|r| r.texts.iter().cloned())
            .collect();

        self.stats.dispatched_calls.fetch_add(1, Ordering::Relaxed);
        self.stats
            .dispatched_texts
            .fetch_add(texts.len() as u64, Ordering::Relaxed);
        match batch.class {
            Priority::Interactive => self.stats.interactive_calls.fetch_add(1, Ordering::Relaxed),
            Priority::Background => self.stats.background_calls.fetch_add(1, Ordering::Relaxed),
        };
        if batch.starvation_grant {
            self.stats.starvation_grants.fetch_add(1, Ordering::Relaxed);
            debug!("Background batch granted after interactive starvation");
        }
        debug!(
            class = batch.class.as_str(),
            task = batch.task.as_str(),
            requests = batch.requests.len(),
            texts = texts.len(),
            "Dispatching embedding call"
        );

        let provider = self.provider.clone();
        let done_tx = self.done_tx.clone();
        let stats = self.stats.clone();
        let timeout = self.config.embedding_timeout;
        let task = batch.task;

        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, provider.embed(&texts, task)).await {
                Ok(Ok(vectors)) => {
                    check_vectors(&vectors, texts.len(), provider.dimension()).map(|_| vectors)
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(EmbeddingError::transient(format!(
                    "provider call exceeded {}s",
                    timeout.as_secs()
                ))),
            };
            let _ = done_tx.send(());

            match result {
                Ok(vectors) => {
                    let mut vectors = vectors.into_iter();
                    for request in batch.requests {
                        let part: Vec<Vec<f32>> =
                            vectors.by_ref().take(request.texts.len()).collect();
                        // Caller may have given up; the result is discarded then
                        let _ = request.reply.send(Ok(part));
                    }
                }
                Err(e) => {
                    stats.provider_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Embedding call failed");
                    for request in batch.requests {
                        request.fail(e.clone());
                    }
                }
            }
        });
    }
}
