//! Direct embedder: router submission with retries.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use rag_embeddings::{validate_batch, EmbedRequest, Embedder, EmbeddingError};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::router::RouterHandle;

/// Submits batches to the router and retries transient provider failures.
///
/// Failures are counted per client: `max_retries` consecutive failures
/// across all callers make the provider unavailable until a call succeeds.
#[derive(Clone)]
pub struct RoutedEmbedder {
    router: RouterHandle,
    max_retries: u32,
    consecutive_failures: Arc<AtomicU32>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RoutedEmbedder {
    pub fn new(router: RouterHandle, max_retries: u32) -> Self {
        Self {
            router,
            max_retries: max_retries.max(1),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn router(&self) -> &RouterHandle {
        &self.router
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for RoutedEmbedder {
    fn model_version(&self) -> &str {
        self.router.model_version()
    }

    fn dimension(&self) -> usize {
        self.router.dimension()
    }

    fn max_batch_size(&self) -> usize {
        self.router.max_batch_size()
    }

    async fn embed_batch(&self, request: EmbedRequest) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        validate_batch(&request.texts, self.max_batch_size())?;
        if request.texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut attempts = 0;

        loop {
            attempts += 1;
            debug!(
                attempt = attempts,
                priority = request.priority.as_str(),
                texts = request.texts.len(),
                "Submitting embedding request"
            );

            let err = match self
                .router
                .submit_request(request.clone())
                .await
            {
                Ok(vectors) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    return Ok(vectors);
                }
                Err(e @ EmbeddingError::Transient { .. }) => e,
                // Router-level outcomes and permanent failures surface as-is
                Err(e) => return Err(e),
            };

            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= self.max_retries || attempts >= self.max_retries {
                error!(error = %err, failures, "Embedding provider unavailable");
                return Err(EmbeddingError::ProviderUnavailable(format!(
                    "{failures} consecutive failures, last: {err}"
                )));
            }

            let delay = err
                .retry_after()
                .or_else(|| backoff.next_backoff())
                .unwrap_or(self.max_backoff);
            if request
                .deadline
                .is_some_and(|deadline| Instant::now() + delay >= deadline)
            {
                return Err(EmbeddingError::Timeout);
            }

            warn!(
                error = %err,
                retry_in_ms = delay.as_millis() as u64,
                "Embedding call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
