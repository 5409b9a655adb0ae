//! Query and result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkId, ChunkMetadata, ChunkType};
use crate::config::{RetrievalModeKind, RetrievalSettings};

/// Priority class of an embedding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Query-time request; latency sensitive
    Interactive,
    /// Bulk indexing request
    Background,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Interactive => "interactive",
            Priority::Background => "background",
        }
    }

    /// Task used when a request does not name one.
    pub fn default_task(&self) -> TaskType {
        match self {
            Priority::Interactive => TaskType::RetrievalQuery,
            Priority::Background => TaskType::RetrievalDocument,
        }
    }
}

/// What an embedding will be used for.
///
/// Providers that support task hints embed documents and queries into
/// asymmetric spaces, so the two are cached separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// Text stored in the index
    RetrievalDocument,
    /// Text searched with
    RetrievalQuery,
}

impl TaskType {
    /// Wire name, as the Gemini API spells it.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::RetrievalDocument => "RETRIEVAL_DOCUMENT",
            TaskType::RetrievalQuery => "RETRIEVAL_QUERY",
        }
    }
}

/// How the vector index is searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum SearchMode {
    /// Full scan; guarantees the true top-k
    Exact,
    /// Partition-probe search with exact re-scoring of the candidates
    Ann {
        /// Number of partitions probed
        nprobe: usize,
        /// Candidate multiplier applied to `top_k`
        overfetch: usize,
    },
}

impl SearchMode {
    pub fn name(&self) -> &'static str {
        match self {
            SearchMode::Exact => "exact",
            SearchMode::Ann { .. } => "ann",
        }
    }
}

/// An ephemeral retrieval request.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Query text (normalized before embedding)
    pub text: String,
    /// Maximum number of results
    pub top_k: usize,
    /// Result similarity floor
    pub min_similarity: f32,
    /// Chunk types never returned
    pub exclude_types: Vec<ChunkType>,
    /// Only chunks created strictly after this instant
    pub created_after: Option<DateTime<Utc>>,
    /// Only chunks created strictly before this instant
    pub created_before: Option<DateTime<Utc>>,
    /// Search mode
    pub mode: SearchMode,
    /// Keep only the best chunk per source artifact
    pub deduplicate: bool,
}

impl Query {
    /// Create a query with engine defaults.
    pub fn new(text: impl Into<String>) -> Self {
        Self::from_settings(text, &RetrievalSettings::default())
    }

    /// Create a query from the configured retrieval settings.
    pub fn from_settings(text: impl Into<String>, settings: &RetrievalSettings) -> Self {
        let mode = match settings.mode {
            RetrievalModeKind::Exact => SearchMode::Exact,
            RetrievalModeKind::Ann => SearchMode::Ann {
                nprobe: settings.nprobe,
                overfetch: settings.overfetch,
            },
        };
        Self {
            text: text.into(),
            top_k: settings.top_k,
            min_similarity: settings.min_similarity_threshold,
            exclude_types: Vec::new(),
            created_after: None,
            created_before: None,
            mode,
            deduplicate: settings.deduplicate,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_min_similarity(mut self, min_similarity: f32) -> Self {
        self.min_similarity = min_similarity;
        self
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn excluding_type(mut self, chunk_type: impl Into<ChunkType>) -> Self {
        self.exclude_types.push(chunk_type.into());
        self
    }

    pub fn created_after(mut self, after: DateTime<Utc>) -> Self {
        self.created_after = Some(after);
        self
    }

    pub fn created_before(mut self, before: DateTime<Utc>) -> Self {
        self.created_before = Some(before);
        self
    }

    pub fn with_deduplicate(mut self, deduplicate: bool) -> Self {
        self.deduplicate = deduplicate;
        self
    }
}

/// One ranked retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub chunk_id: ChunkId,
    /// Similarity under the configured metric (cosine by default)
    pub similarity: f32,
    pub metadata: ChunkMetadata,
}
