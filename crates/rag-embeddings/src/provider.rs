//! Embedding provider trait.

use std::sync::Arc;

use async_trait::async_trait;
use rag_types::{EmbeddingSettings, ProviderKind, TaskType};

use crate::error::EmbeddingError;
use crate::http::HttpEmbeddingProvider;
use crate::mock::MockProvider;

/// A remote (or fake) embedding model.
///
/// One call embeds one batch. Implementations classify their own failures:
/// retryable conditions come back as `EmbeddingError::Transient`.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Identifier that namespaces cached vectors.
    fn model_version(&self) -> &str;

    /// Dimension of every returned vector.
    fn dimension(&self) -> usize;

    /// Embed a batch for `task`; output is in input order.
    async fn embed(
        &self,
        texts: &[String],
        task: TaskType,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Check a provider response against the request.
pub fn check_vectors(
    vectors: &[Vec<f32>],
    expected_count: usize,
    dimension: usize,
) -> Result<(), EmbeddingError> {
    if vectors.len() != expected_count {
        return Err(EmbeddingError::InvalidInput(format!(
            "provider returned {} vectors for {} texts",
            vectors.len(),
            expected_count
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
        return Err(EmbeddingError::DimensionMismatch {
            expected: dimension,
            actual: bad.len(),
        });
    }
    if let Some(pos) = vectors
        .iter()
        .position(|v| v.iter().any(|x| !x.is_finite()))
    {
        return Err(EmbeddingError::InvalidInput(format!(
            "provider returned non-finite values in vector {pos}"
        )));
    }
    Ok(())
}

/// Build the provider selected by configuration.
pub fn build_provider(
    settings: &EmbeddingSettings,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    match settings.provider {
        ProviderKind::Mock => Ok(Arc::new(MockProvider::new(settings.dimension))),
        ProviderKind::Gemini | ProviderKind::Openai => {
            Ok(Arc::new(HttpEmbeddingProvider::from_settings(settings)?))
        }
    }
}
