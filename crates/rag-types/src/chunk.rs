//! Chunk types.
//!
//! A chunk is the unit of text that gets embedded, indexed and retrieved.
//! Its ID is derived from `(source_ref, text)` so indexing the same artifact
//! twice always lands on the same record.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maximum characters kept in a metadata text preview.
const MAX_PREVIEW: usize = 200;

/// Stable, content-derived chunk identifier (hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    /// Derive the ID for a chunk from its source reference and text.
    ///
    /// The two parts are separated by a NUL byte so `("ab", "c")` and
    /// `("a", "bc")` never collide.
    pub fn derive(source_ref: &str, text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source_ref.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an existing ID string (e.g. loaded from storage).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Artifact kind of a chunk (e.g. "post", "profile", "journal").
///
/// Stored lowercase so allow-list checks are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ChunkType(String);

impl ChunkType {
    pub fn new(kind: impl AsRef<str>) -> Self {
        Self(kind.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ChunkType {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for ChunkType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<ChunkType> for String {
    fn from(value: ChunkType) -> Self {
        value.0
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of indexable text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Content-derived identifier
    pub id: ChunkId,
    /// Text to embed
    pub text: String,
    /// Artifact kind
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    /// When the originating artifact was created
    pub created_at: DateTime<Utc>,
    /// Opaque pointer back to the originating artifact
    pub source_ref: String,
    /// Optional artifact title
    #[serde(default)]
    pub title: Option<String>,
    /// Optional artifact tags
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Chunk {
    /// Create a chunk, deriving its ID from `source_ref` and `text`.
    pub fn new(
        source_ref: impl Into<String>,
        text: impl Into<String>,
        chunk_type: impl Into<ChunkType>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let source_ref = source_ref.into();
        let text = text.into();
        Self {
            id: ChunkId::derive(&source_ref, &text),
            text,
            chunk_type: chunk_type.into(),
            created_at,
            source_ref,
            title: None,
            tags: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Metadata stored alongside the chunk's vector in the index.
    pub fn metadata(&self) -> ChunkMetadata {
        ChunkMetadata {
            chunk_type: self.chunk_type.clone(),
            created_at: self.created_at,
            source_ref: self.source_ref.clone(),
            title: self.title.clone(),
            tags: self.tags.clone(),
            text_preview: preview(&self.text),
        }
    }
}

/// Metadata persisted with an index record and returned with every hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    pub created_at: DateTime<Utc>,
    pub source_ref: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Text that was embedded (truncated for storage)
    pub text_preview: String,
}

fn preview(text: &str) -> String {
    if text.chars().count() > MAX_PREVIEW {
        let cut: String = text.chars().take(MAX_PREVIEW).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}
