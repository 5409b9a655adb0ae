//! # rag-vector
//!
//! Vector index for the retrieval engine.
//!
//! Stores one record per chunk (vector + metadata) and answers top-k
//! similarity queries in two modes:
//! - Exact: full scan, guaranteed true top-k
//! - ANN: IVF-flat partitions trained with k-means, overfetch + re-rank
//!
//! Records persist in RocksDB and are loaded into memory on open.

pub mod error;
pub mod filter;
pub mod index;
pub mod ivf;
pub mod similarity;
pub mod store;

pub use error::VectorError;
pub use filter::SearchFilter;
pub use index::{compare_hits, IndexConfig, IndexStats, SearchHit, VectorIndex};
pub use ivf::{assign_to_nearest_centroid, kmeans_clustering, ClusterId, IvfPartitions, KMeansResult};
pub use similarity::{cosine_similarity, score};
pub use store::{IndexRecord, RecordStore, CF_INDEX_META, CF_INDEX_RECORDS};
