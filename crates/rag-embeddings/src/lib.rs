//! # rag-embeddings
//!
//! Embedding generation for the retrieval engine.
//!
//! This crate provides:
//! - `EmbeddingProvider`: the single remote embed RPC (HTTP and mock backends)
//! - `EmbeddingCache`: fingerprint-keyed vector cache (LRU + RocksDB), with
//!   separate keys per embedding task
//! - `Embedder` / `CachedEmbedder`: the batch API the pipeline calls, with
//!   cache lookups and single-flight coalescing of identical texts
//!
//! Quota, prioritisation and retries live in `rag-router`.

pub mod cache;
pub mod client;
pub mod error;
pub mod fingerprint;
pub mod http;
pub mod mock;
pub mod provider;

pub use cache::{CacheEntry, CacheStats, EmbeddingCache};
pub use client::{validate_batch, CachedEmbedder, EmbedRequest, Embedder};
pub use error::EmbeddingError;
pub use fingerprint::{fingerprint, normalize, task_fingerprint};
pub use http::{ApiFlavor, HttpEmbeddingProvider, HttpProviderConfig};
pub use mock::MockProvider;
pub use provider::{build_provider, check_vectors, EmbeddingProvider};
