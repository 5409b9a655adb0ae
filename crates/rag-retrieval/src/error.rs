//! Error types for the retrieval pipeline.

use rag_embeddings::EmbeddingError;
use rag_vector::VectorError;
use thiserror::Error;

/// Errors that can occur in the retrieval pipeline
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// Vector index error
    #[error("Vector error: {0}")]
    Vector(#[from] VectorError),

    /// Embedding error
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// Deferred queue load/save issues
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RetrievalError {
    fn from(err: serde_json::Error) -> Self {
        RetrievalError::Serialization(err.to_string())
    }
}
