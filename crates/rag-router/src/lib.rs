//! # rag-router
//!
//! Priority routing and quota enforcement for embedding calls.
//!
//! Query-time (interactive) and indexing (background) requests share one
//! provider quota. The router keeps them in separate queues so a bulk
//! indexing backlog never delays a query by more than one call slot:
//! - `quota`: rolling per-second rate, concurrency cap, daily budget
//! - `queue`: bounded interactive FIFO, coalescing background FIFO
//! - `router`: the actor that owns both and dispatches provider calls
//! - `client`: `RoutedEmbedder`, the retrying `Embedder` over a router

pub mod client;
pub mod queue;
pub mod quota;
pub mod router;

pub use client::RoutedEmbedder;
pub use quota::{Admission, QuotaGovernor};
pub use router::{EmbeddingRouter, RouterConfig, RouterHandle, RouterStats, RouterStatsSnapshot};
