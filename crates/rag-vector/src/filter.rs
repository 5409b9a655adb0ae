//! Metadata filters applied before ranking.

use chrono::{DateTime, Utc};
use rag_types::{ChunkMetadata, ChunkType, Query};

/// Search filter over record metadata. Empty lists mean "no constraint".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    pub exclude_types: Vec<ChunkType>,
    pub include_types: Vec<ChunkType>,
    /// Strict lower bound on `created_at`
    pub created_after: Option<DateTime<Utc>>,
    /// Strict upper bound on `created_at`
    pub created_before: Option<DateTime<Utc>>,
    /// Match records carrying at least one of these tags
    pub tags_any: Vec<String>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter carrying a query's type and time constraints.
    pub fn from_query(query: &Query) -> Self {
        Self {
            exclude_types: query.exclude_types.clone(),
            created_after: query.created_after,
            created_before: query.created_before,
            ..Default::default()
        }
    }

    pub fn exclude_type(mut self, chunk_type: impl Into<ChunkType>) -> Self {
        self.exclude_types.push(chunk_type.into());
        self
    }

    pub fn include_type(mut self, chunk_type: impl Into<ChunkType>) -> Self {
        self.include_types.push(chunk_type.into());
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

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags_any.push(tag.into());
        self
    }

    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        if self.exclude_types.contains(&metadata.chunk_type) {
            return false;
        }
        if !self.include_types.is_empty() && !self.include_types.contains(&metadata.chunk_type) {
            return false;
        }
        if self.created_after.is_some_and(|t| metadata.created_at <= t) {
            return false;
        }
        if self.created_before.is_some_and(|t| metadata.created_at >= t) {
            return false;
        }
        if !self.tags_any.is_empty() && !metadata.tags.iter().any(|t| self.tags_any.contains(t)) {
            return false;
        }
        true
    }
}
