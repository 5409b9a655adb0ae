//! Embedding error types.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during embedding operations.
///
/// `Clone` so that concurrent callers waiting on the same in-flight embed
/// all receive the leader's outcome.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EmbeddingError {
    /// Empty text, oversize batch, or a permanent provider rejection
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Provider returned vectors of the wrong size
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A single failed provider call that may succeed on retry
    #[error("Transient provider failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Provider kept failing past the consecutive-failure ceiling
    #[error("Embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Interactive queue overflowed and this request was shed
    #[error("Embedding router overloaded")]
    Overloaded,

    /// Daily request budget is used up
    #[error("Daily embedding budget exhausted")]
    BudgetExhausted,

    /// Deadline passed before the request completed
    #[error("Embedding request timed out")]
    Timeout,

    /// A different vector was already cached under the same key
    #[error("Cache conflict for fingerprint {0}")]
    CacheConflict(String),

    /// Cache storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EmbeddingError {
    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EmbeddingError::Transient { .. }
                | EmbeddingError::ProviderUnavailable(_)
                | EmbeddingError::Overloaded
                | EmbeddingError::BudgetExhausted
                | EmbeddingError::Timeout
        )
    }

    /// Retry hint carried by a rate-limit response.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EmbeddingError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        EmbeddingError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }
}

impl From<rocksdb::Error> for EmbeddingError {
    fn from(err: rocksdb::Error) -> Self {
        EmbeddingError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EmbeddingError {
    fn from(err: serde_json::Error) -> Self {
        EmbeddingError::Serialization(err.to_string())
    }
}
