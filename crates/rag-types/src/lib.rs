//! # rag-types
//!
//! Shared domain types for the contextual retrieval engine.
//!
//! This crate defines the data structures every other crate agrees on:
//! - Chunks: units of indexable text with content-derived IDs
//! - Queries: ephemeral retrieval requests and their search mode
//! - Hits: ranked retrieval results with their metadata
//! - Settings: layered configuration for the whole engine

pub mod chunk;
pub mod config;
pub mod error;
pub mod query;

pub use chunk::{Chunk, ChunkId, ChunkMetadata, ChunkType};
pub use config::{
    EmbeddingSettings, IndexingSettings, ProviderKind, QuotaSettings, RetrievalModeKind,
    RetrievalSettings, RouterSettings, Settings, SimilarityMetric, VectorSettings,
};
pub use error::RagError;
pub use query::{Priority, Query, RetrievalHit, SearchMode, TaskType};
