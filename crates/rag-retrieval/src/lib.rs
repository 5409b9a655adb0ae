//! # rag-retrieval
//!
//! The two paths through the retrieval engine:
//! - Query: normalize, embed at interactive priority, search, threshold,
//!   dedup, rank. Provider trouble degrades to empty results.
//! - Indexing: filter, batch, embed at background priority, insert.
//!   Transient failures defer chunks to the next pass. Markdown documents
//!   are split into overlapping token-bounded chunks first.
//!
//! `run_cycle` runs retrieve, then the caller's generation step, then
//! indexing, so a cycle never retrieves what it produced.

pub mod chunking;
pub mod deferred;
pub mod error;
pub mod pipeline;
pub mod ranking;
pub mod stats;

pub use chunking::{chunk_markdown, MarkdownChunker, TokenCounter};
pub use deferred::{DeferredEntry, DeferredQueue};
pub use error::RetrievalError;
pub use pipeline::{
    CycleReport, DegradeReason, IndexReport, PipelineConfig, RetrievalOutcome, RetrievalPipeline,
};
pub use stats::{PipelineStats, PipelineStatsSnapshot};
