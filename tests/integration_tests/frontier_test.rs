//! Traversal strategies over a fake site

use crate::common::FakeSite;
use fleetcrawl::frontier::{run_local, FrontierError, Seed, TraversalSettings, TraversalStrategy};
use std::sync::Arc;
use std::time::Duration;

fn tree() -> Arc<FakeSite> {
    Arc::new(FakeSite::new(&[
        ("https://t.example/", &["https://t.example/a", "https://t.example/b"]),
        ("https://t.example/a", &["https://t.example/a/1", "https://t.example/"]),
        ("https://t.example/b", &["https://t.example/b/1"]),
        ("https://t.example/a/1", &[]),
        ("https://t.example/b/1", &[]),
    ]))
}

fn settings(max_depth: u32, max_pages: usize) -> TraversalSettings {
    TraversalSettings {
        max_depth,
        max_pages,
        concurrency: 1,
        delay: Duration::ZERO,
        high_value_patterns: Vec::new(),
    }
}

#[tokio::test]
async fn test_bfs_visits_level_by_level() {
    let site = tree();
    let report = run_local(
        TraversalStrategy::Bfs,
        vec![Seed::new("https://t.example/")],
        site.clone(),
        settings(5, 100),
    )
    .await
    .unwrap();

    assert_eq!(
        site.visited(),
        vec![
            "https://t.example/",
            "https://t.example/a",
            "https://t.example/b",
            "https://t.example/a/1",
            "https://t.example/b/1",
        ]
    );
    assert_eq!(report.pages_crawled(), 5);
}

#[tokio::test]
async fn test_dfs_goes_deep_first() {
    let site = tree();
    run_local(
        TraversalStrategy::Dfs,
        vec![Seed::new("https://t.example/")],
        site.clone(),
        settings(5, 100),
    )
    .await
    .unwrap();

    assert_eq!(
        site.visited(),
        vec![
            "https://t.example/",
            "https://t.example/a",
            "https://t.example/a/1",
            "https://t.example/b",
            "https://t.example/b/1",
        ]
    );
}

#[tokio::test]
async fn test_every_strategy_respects_limits() {
    for strategy in [
        TraversalStrategy::Bfs,
        TraversalStrategy::Dfs,
        TraversalStrategy::Priority,
        TraversalStrategy::Adaptive,
    ] {
        let site = tree();
        let report = run_local(
            strategy,
            vec![Seed::new("https://t.example/")],
            site.clone(),
            settings(1, 3),
        )
        .await
        .unwrap();

        assert!(report.admitted <= 3, "{strategy} admitted {}", report.admitted);
        assert!(report.pages.iter().all(|p| p.depth <= 1), "{strategy} went too deep");

        let mut visited = site.visited();
        let total = visited.len();
        visited.sort();
        visited.dedup();
        assert_eq!(visited.len(), total, "{strategy} fetched a URL twice");
    }
}

#[tokio::test]
async fn test_missing_pages_reported_as_failures() {
    let report = run_local(
        TraversalStrategy::Bfs,
        vec![Seed::new("https://t.example/"), Seed::new("https://t.example/gone")],
        tree(),
        settings(0, 10),
    )
    .await
    .unwrap();

    assert_eq!(report.pages_crawled(), 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].url, "https://t.example/gone");
}

#[tokio::test]
async fn test_no_seeds_is_an_error() {
    let result = run_local(TraversalStrategy::Bfs, Vec::new(), tree(), settings(1, 1)).await;
    assert!(matches!(result, Err(FrontierError::NoSeeds)));
}
