//! Result ordering: similarity never increases down the list, and equal
//! similarities put the newest chunk first.

use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use e2e_tests::{axis, day, exact_query, post, TestHarness};

#[tokio::test(start_paused = true)]
async fn test_similarity_non_increasing() {
    let harness = TestHarness::new();
    let mut rng = StdRng::seed_from_u64(42);
    let mut chunks = Vec::new();
    for i in 0..40 {
        let text = format!("random chunk {i}");
        let v: Vec<f32> = (0..8).map(|_| rng.random_range(-1.0..1.0)).collect();
        harness.pin(&text, v);
        chunks.push(post(&format!("posts/{i}.md"), &text, day(1 + (i % 28) as u32)));
    }
    harness.pin("anchor", axis(8, 0));
    harness.pipeline.index(chunks).await.unwrap();

    let outcome = harness
        .pipeline
        .retrieve(&exact_query("anchor", 20, -1.0))
        .await;
    assert_eq!(outcome.hits.len(), 20);
    for pair in outcome.hits.windows(2) {
        assert!(pair[0].similarity >= pair[1].similarity);
    }
}

#[tokio::test(start_paused = true)]
async fn test_ties_broken_by_recency() {
    let harness = TestHarness::new();
    for text in ["older note", "newer note", "newest note", "anchor"] {
        harness.pin(text, axis(8, 2));
    }
    harness
        .pipeline
        .index(vec![
            post("posts/older.md", "older note", day(1)),
            post("posts/newest.md", "newest note", day(20)),
            post("posts/newer.md", "newer note", day(10)),
        ])
        .await
        .unwrap();

    let outcome = harness.pipeline.retrieve(&exact_query("anchor", 3, 0.0)).await;
    let sources: Vec<&str> = outcome
        .hits
        .iter()
        .map(|h| h.metadata.source_ref.as_str())
        .collect();
    assert_eq!(sources, vec!["posts/newest.md", "posts/newer.md", "posts/older.md"]);
}

/// With dedup on, a source appears once, with its best chunk.
#[tokio::test(start_paused = true)]
async fn test_dedup_keeps_best_chunk_per_source() {
    let harness = TestHarness::new();
    let mut close = axis(8, 4);
    close[5] = 0.1;
    let mut far = axis(8, 4);
    far[5] = 0.9;
    harness.pin("intro paragraph", far);
    harness.pin("key paragraph", close);
    harness.pin("other post", axis(8, 5));
    harness.pin("anchor", axis(8, 4));

    harness
        .pipeline
        .index(vec![
            post("posts/long.md", "intro paragraph", day(1)),
            post("posts/long.md", "key paragraph", day(1)),
            post("posts/other.md", "other post", day(1)),
        ])
        .await
        .unwrap();

    let query = exact_query("anchor", 5, 0.0).with_deduplicate(true);
    let outcome = harness.pipeline.retrieve(&query).await;
    assert_eq!(outcome.hits.len(), 2);
    assert_eq!(outcome.hits[0].metadata.text_preview, "key paragraph");
    assert_eq!(outcome.hits[1].metadata.source_ref, "posts/other.md");
}
