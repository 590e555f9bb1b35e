//! Whole in-process clusters

use crate::common::{fast_config, FakeSite};
use fleetcrawl::cluster::LocalCluster;
use fleetcrawl::frontier::{Seed, TraversalStrategy};
use fleetcrawl::models::NodeRole;
use fleetcrawl::registry::NodeRegistry;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_crawls_site_to_completion() {
    let site = Arc::new(FakeSite::star("https://s.example/", 12).with_latency(Duration::from_millis(5)));

    let mut config = fast_config();
    config.crawler.strategy = TraversalStrategy::Bfs;
    let cluster = LocalCluster::start(&config, 3, site.clone()).await.unwrap();

    let crawlers = cluster.registry().active_nodes(Some(NodeRole::Crawler)).await.unwrap();
    assert_eq!(crawlers.len(), 3);

    cluster.seed(&[Seed::new("https://s.example/")]).await.unwrap();
    let stats = cluster
        .wait_until_drained(Duration::from_millis(20), Duration::from_secs(20))
        .await
        .unwrap();

    assert_eq!(stats.completed, 13);
    assert_eq!(stats.failed, 0);

    let mut visited = site.visited();
    visited.sort();
    visited.dedup();
    assert_eq!(visited.len(), 13);

    let per_worker = cluster.worker_stats().await;
    let completed: u64 = per_worker.iter().map(|(_, s)| s.tasks_completed).sum();
    assert!(completed >= 13);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_respects_page_budget() {
    let site = Arc::new(FakeSite::star("https://b.example/", 20));

    let mut config = fast_config();
    config.crawler.max_pages = 5;
    let cluster = LocalCluster::start(&config, 2, site.clone()).await.unwrap();

    cluster.seed(&[Seed::new("https://b.example/")]).await.unwrap();
    let stats = cluster
        .wait_until_drained(Duration::from_millis(20), Duration::from_secs(20))
        .await
        .unwrap();

    assert_eq!(stats.completed, 5);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_pages_end_in_failed_partition() {
    let site = Arc::new(FakeSite::new(&[(
        "https://f.example/",
        &["https://f.example/gone"],
    )]));

    let mut config = fast_config();
    config.crawler.max_retries = 2;
    let cluster = LocalCluster::start(&config, 2, site.clone()).await.unwrap();

    cluster.seed(&[Seed::new("https://f.example/")]).await.unwrap();
    let stats = cluster
        .wait_until_drained(Duration::from_millis(20), Duration::from_secs(20))
        .await
        .unwrap();

    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    let attempts = site
        .visited()
        .iter()
        .filter(|url| url.as_str() == "https://f.example/gone")
        .count();
    assert_eq!(attempts, 2);

    cluster.shutdown().await;
}
