//! Retrieval scenarios over a three-document corpus, and concurrent
//! indexing of identical texts.

use pretty_assertions::assert_eq;

use e2e_tests::{axis, day, exact_query, post, TestHarness};

/// A, B, C along separate axes; a query near B returns exactly B.
#[tokio::test(start_paused = true)]
async fn test_query_near_b_returns_b() {
    let harness = TestHarness::new();
    harness.pin("notes about apples", axis(8, 0));
    harness.pin("notes about bicycles", axis(8, 1));
    harness.pin("notes about clouds", axis(8, 2));
    let mut near_b = axis(8, 1);
    near_b[0] = 0.2;
    harness.pin("bike maintenance", near_b);

    let report = harness
        .pipeline
        .index(vec![
            post("posts/a.md", "notes about apples", day(1)),
            post("posts/b.md", "notes about bicycles", day(2)),
            post("posts/c.md", "notes about clouds", day(3)),
        ])
        .await
        .unwrap();
    assert_eq!(report.indexed, 3);

    let outcome = harness
        .pipeline
        .retrieve(&exact_query("bike maintenance", 1, 0.5))
        .await;
    let sources: Vec<&str> = outcome
        .hits
        .iter()
        .map(|h| h.metadata.source_ref.as_str())
        .collect();
    assert_eq!(sources, vec!["posts/b.md"]);

    // B scores about 0.98; a floor above that leaves nothing
    let outcome = harness
        .pipeline
        .retrieve(&exact_query("bike maintenance", 1, 0.99))
        .await;
    assert!(outcome.hits.is_empty());
    assert_eq!(outcome.degraded, None);
}

/// Five chunks with identical text from different sources, indexed
/// concurrently: one provider call, five records.
#[tokio::test(start_paused = true)]
async fn test_identical_texts_embedded_once() {
    let harness = TestHarness::new();
    let chunks: Vec<_> = (0..5)
        .map(|i| post(&format!("posts/{i}.md"), "the same paragraph", day(1)))
        .collect();

    let reports = futures::future::join_all(
        chunks
            .into_iter()
            .map(|chunk| harness.pipeline.index(vec![chunk])),
    )
    .await;

    let indexed: usize = reports.into_iter().map(|r| r.unwrap().indexed).sum();
    assert_eq!(indexed, 5);
    assert_eq!(harness.index.len(), 5);
    assert_eq!(harness.provider.call_count(), 1);
}

/// Exclusions by type never leak into results.
#[tokio::test(start_paused = true)]
async fn test_excluded_types_not_returned() {
    let mut config = e2e_tests::HarnessConfig::default();
    config.pipeline = config.pipeline.with_indexable_types(&["post", "journal"]);
    let harness = TestHarness::with_config(config);
    harness.pin("morning pages", axis(8, 3));
    harness.pin("published essay", axis(8, 3));
    harness.pin("writing habits", axis(8, 3));

    let journal = rag_types::Chunk::new("journal/1.md", "morning pages", "journal", day(1));
    let essay = post("posts/essay.md", "published essay", day(1));
    harness.pipeline.index(vec![journal, essay]).await.unwrap();

    let query = exact_query("writing habits", 5, 0.5).excluding_type("journal");
    let outcome = harness.pipeline.retrieve(&query).await;
    assert_eq!(outcome.hits.len(), 1);
    assert_eq!(outcome.hits[0].metadata.source_ref, "posts/essay.md");
}
