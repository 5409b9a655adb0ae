//! Text fingerprints used as embedding cache keys.

use rag_types::TaskType;
use sha2::{Digest, Sha256};

/// Normalize text before hashing: collapse whitespace runs to one space,
/// trim, lowercase.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Hex SHA-256 of the normalized text.
pub fn fingerprint(text: &str) -> String {
    let normalized = normalize(text);
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Cache key for `text` embedded for `task`.
pub fn task_fingerprint(text: &str, task: TaskType) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(normalize(text).as_bytes());
    hex::encode(hasher.finalize())
}
