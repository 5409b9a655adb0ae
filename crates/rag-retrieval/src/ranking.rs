//! Post-search ranking: threshold, per-source dedup, ordering, truncation.

use std::collections::HashSet;

use rag_types::RetrievalHit;
use rag_vector::{compare_hits, SearchHit};

/// Turn raw index hits into the final result list.
///
/// Drops hits below `min_similarity`, keeps only the best hit per
/// `source_ref` when `deduplicate` is set, orders by similarity (then
/// newest first, then chunk ID) and truncates to `top_k`.
pub fn finalize(
    mut hits: Vec<SearchHit>,
    min_similarity: f32,
    deduplicate: bool,
    top_k: usize,
) -> Vec<RetrievalHit> {
    hits.retain(|h| h.score >= min_similarity);
    hits.sort_by(compare_hits);
    if deduplicate {
        hits = dedupe_by_source(hits);
    }
    hits.truncate(top_k);

    hits.into_iter()
        .map(|h| RetrievalHit {
            chunk_id: h.chunk_id,
            similarity: h.score,
            metadata: h.metadata,
        })
        .collect()
}

/// Keep the first hit for each source. Input must already be ordered.
pub fn dedupe_by_source(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|h| seen.insert(h.metadata.source_ref.clone()))
        .collect()
}
