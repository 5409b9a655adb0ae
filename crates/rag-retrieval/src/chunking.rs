//! Markdown chunking for the indexing path.
//!
//! A document is split on blank lines into paragraphs, and paragraphs are
//! packed into chunks of at most `max_tokens`. When a chunk is closed, its
//! trailing paragraphs (up to `overlap_tokens`) open the next one so context
//! carries across the boundary. A single paragraph larger than the budget
//! becomes a chunk of its own.

use chrono::{DateTime, Utc};
use rag_types::{Chunk, ChunkType, Settings};
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

pub const DEFAULT_MAX_TOKENS: usize = 1800;
pub const DEFAULT_OVERLAP_TOKENS: usize = 150;

/// Token counting with the cl100k_base encoding.
///
/// Falls back to roughly four bytes per token if the encoding cannot be
/// loaded.
pub struct TokenCounter {
    bpe: Option<CoreBPE>,
}

impl TokenCounter {
    pub fn new() -> Self {
        let bpe = match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!(error = %e, "Tokenizer unavailable, estimating token counts");
                None
            }
        };
        Self { bpe }
    }

    /// Counter that always uses the length estimate.
    pub fn estimating() -> Self {
        Self { bpe: None }
    }

    pub fn count(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            // ~4 chars per token
            None => (text.len() / 4).max(1),
        }
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits markdown documents into overlapping chunks.
pub struct MarkdownChunker {
    counter: TokenCounter,
    max_tokens: usize,
    overlap_tokens: usize,
}

impl MarkdownChunker {
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Self {
        Self {
            counter: TokenCounter::new(),
            max_tokens: max_tokens.max(1),
            overlap_tokens,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.indexing.max_chunk_tokens,
            settings.indexing.chunk_overlap_tokens,
        )
    }

    pub fn with_counter(mut self, counter: TokenCounter) -> Self {
        self.counter = counter;
        self
    }

    /// Split `content` into chunk texts, in document order.
    pub fn split(&self, content: &str) -> Vec<String> {
        let content = content.replace("\r\n", "\n");
        let mut chunks = Vec::new();
        let mut current: Vec<(&str, usize)> = Vec::new();
        let mut current_tokens = 0;

        for paragraph in content.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            let tokens = self.counter.count(paragraph);
            if current_tokens + tokens > self.max_tokens && !current.is_empty() {
                chunks.push(join(&current));

                let mut kept = 0;
                let mut kept_tokens = 0;
                for (_, t) in current.iter().rev() {
                    if kept_tokens + t > self.overlap_tokens {
                        break;
                    }
                    kept_tokens += t;
                    kept += 1;
                }
                current.drain(..current.len() - kept);
                current_tokens = kept_tokens;
            }
            current.push((paragraph, tokens));
            current_tokens += tokens;
        }
        if !current.is_empty() {
            chunks.push(join(&current));
        }
        chunks
    }

    /// Chunk one document. Every chunk shares the document's source, type,
    /// creation time and title.
    pub fn chunk_document(
        &self,
        source_ref: &str,
        content: &str,
        chunk_type: impl Into<ChunkType>,
        created_at: DateTime<Utc>,
        title: Option<&str>,
    ) -> Vec<Chunk> {
        let chunk_type = chunk_type.into();
        let chunks: Vec<Chunk> = self
            .split(content)
            .into_iter()
            .map(|text| {
                let mut chunk = Chunk::new(source_ref, text, chunk_type.clone(), created_at);
                chunk.title = title.map(str::to_string);
                chunk
            })
            .collect();
        debug!(source_ref, chunks = chunks.len(), "Chunked document");
        chunks
    }
}

impl Default for MarkdownChunker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOKENS, DEFAULT_OVERLAP_TOKENS)
    }
}

fn join(paragraphs: &[(&str, usize)]) -> String {
    paragraphs
        .iter()
        .map(|(p, _)| *p)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Split markdown with the cl100k_base tokenizer.
pub fn chunk_markdown(content: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    MarkdownChunker::new(max_tokens, overlap_tokens).split(content)
}
