//! Deferred indexing queue.
//!
//! Chunks whose embedding failed transiently wait here and are retried at
//! the start of the next indexing pass. Entries older than the configured
//! age are dropped.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use rag_types::{Chunk, ChunkId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RetrievalError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredEntry {
    pub chunk: Chunk,
    pub first_deferred_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeferredQueue {
    entries: Vec<DeferredEntry>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &DeferredEntry> {
        self.entries.iter()
    }

    pub fn contains(&self, chunk_id: &ChunkId) -> bool {
        self.entries.iter().any(|e| &e.chunk.id == chunk_id)
    }

    /// Defer a chunk for the first time.
    pub fn defer(&mut self, chunk: Chunk, error: &str, now: DateTime<Utc>) {
        self.requeue(
            DeferredEntry {
                chunk,
                first_deferred_at: now,
                attempts: 0,
                last_error: String::new(),
            },
            error,
        );
    }

    /// Put an entry back after another failed attempt.
    pub fn requeue(&mut self, mut entry: DeferredEntry, error: &str) {
        entry.attempts += 1;
        entry.last_error = error.to_string();
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.chunk.id == entry.chunk.id)
        {
            existing.attempts = existing.attempts.max(entry.attempts);
            existing.last_error = entry.last_error;
            return;
        }
        debug!(chunk_id = %entry.chunk.id.short(), attempts = entry.attempts, "Deferred chunk");
        self.entries.push(entry);
    }

    /// Remove every entry. Returns `(retryable, expired)`.
    pub fn take(
        &mut self,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> (Vec<DeferredEntry>, Vec<DeferredEntry>) {
        let (expired, live): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| now - e.first_deferred_at > max_age);
        for entry in &expired {
            warn!(
                chunk_id = %entry.chunk.id.short(),
                attempts = entry.attempts,
                last_error = %entry.last_error,
                "Dropping deferred chunk past its maximum age"
            );
        }
        (live, expired)
    }

    /// Serialize the queue.
    pub fn snapshot(&self) -> Result<Vec<u8>, RetrievalError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Rebuild a queue from `snapshot` output.
    pub fn restore(bytes: &[u8]) -> Result<Self, RetrievalError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Load from a file; a missing file is an empty queue.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RetrievalError> {
        match std::fs::read(path.as_ref()) {
            Ok(bytes) => Self::restore(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), RetrievalError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, self.snapshot()?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
