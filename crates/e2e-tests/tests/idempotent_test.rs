//! Indexing the same artifact twice yields one record and at most one
//! provider call.

use pretty_assertions::assert_eq;

use e2e_tests::{day, post, TestHarness};

#[tokio::test(start_paused = true)]
async fn test_reindexing_same_artifact() {
    let harness = TestHarness::new();
    let chunk = post("posts/rust.md", "ownership and borrowing", day(4));

    let first = harness.pipeline.index(vec![chunk.clone()]).await.unwrap();
    let second = harness.pipeline.index(vec![chunk.clone()]).await.unwrap();

    assert_eq!(first.indexed, 1);
    assert_eq!(second.indexed, 0);
    assert_eq!(second.already_indexed, 1);
    assert_eq!(harness.index.len(), 1);
    assert!(harness.provider.call_count() <= 1);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_within_one_call() {
    let harness = TestHarness::new();
    let chunk = post("posts/rust.md", "ownership and borrowing", day(4));

    let report = harness
        .pipeline
        .index(vec![chunk.clone(), chunk.clone(), chunk])
        .await
        .unwrap();
    assert_eq!(report.indexed, 1);
    assert_eq!(report.already_indexed, 2);
    assert_eq!(harness.provider.call_count(), 1);
}

/// A chunk removed from the index is re-embedded from the cache, not the
/// provider.
#[tokio::test(start_paused = true)]
async fn test_cache_serves_reindex_after_delete() {
    let harness = TestHarness::new();
    let chunk = post("posts/rust.md", "ownership and borrowing", day(4));

    harness.pipeline.index(vec![chunk.clone()]).await.unwrap();
    assert!(harness.index.delete(&chunk.id).unwrap());

    let report = harness.pipeline.index(vec![chunk]).await.unwrap();
    assert_eq!(report.indexed, 1);
    assert_eq!(harness.provider.call_count(), 1);
    assert!(harness.cache.stats().hits >= 1);
}

/// Identity ignores timestamps: same source and text is the same chunk.
#[tokio::test(start_paused = true)]
async fn test_identity_is_content_derived() {
    let harness = TestHarness::new();
    let early = post("posts/rust.md", "ownership and borrowing", day(4));
    let late = post("posts/rust.md", "ownership and borrowing", day(9));
    assert_eq!(early.id, late.id);

    harness.pipeline.index(vec![early]).await.unwrap();
    let report = harness.pipeline.index(vec![late]).await.unwrap();
    assert_eq!(report.already_indexed, 1);
}
