//! Worker execution driven by a coordinator over the local transport

use crate::common::{fast_config, FakeSite};
use fleetcrawl::coordinator::{AssignOutcome, Coordinator};
use fleetcrawl::models::{TaskStatus, META_LAST_ERROR};
use fleetcrawl::queue::{InMemoryQueue, TaskQueue};
use fleetcrawl::registry::{InMemoryRegistry, NodeRegistry};
use fleetcrawl::transport::LocalTransport;
use fleetcrawl::worker::heartbeat::SystemSampler;
use fleetcrawl::worker::WorkerNode;
use std::sync::Arc;
use std::time::Duration;

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_dispatched_tasks_complete_and_counters_settle() {
    let site = Arc::new(FakeSite::new(&[("https://example.com/", &[])]));

    let mut config = fast_config();
    config.cluster.node_id = "w1".to_string();

    let queue = Arc::new(InMemoryQueue::new());
    let registry = Arc::new(InMemoryRegistry::new(Duration::from_secs(30)));
    let transport = Arc::new(LocalTransport::new());

    let worker = Arc::new(WorkerNode::new(
        &config,
        queue.clone(),
        registry.clone(),
        transport.clone(),
        site.clone(),
    ));
    let handle = worker.run().await.unwrap();

    let mut coordinator_config = fast_config();
    coordinator_config.cluster.node_id = "coordinator".to_string();
    let coordinator =
        Coordinator::new(&coordinator_config, queue.clone(), registry.clone(), transport.clone());

    let ids = coordinator
        .submit_urls(
            &[
                "https://example.com/".to_string(),
                "https://example.com/missing".to_string(),
            ],
            0,
        )
        .await
        .unwrap();
    for _ in 0..2 {
        assert!(matches!(
            coordinator.assign_once().await.unwrap(),
            AssignOutcome::Dispatched { .. }
        ));
    }

    let ok_id = ids[0].clone();
    let missing_id = ids[1].clone();
    wait_for(|| {
        let queue = queue.clone();
        let (ok_id, missing_id) = (ok_id.clone(), missing_id.clone());
        async move {
            let ok = queue.get(&ok_id).await.unwrap().unwrap();
            let missing = queue.get(&missing_id).await.unwrap().unwrap();
            ok.status == TaskStatus::Completed && missing.status == TaskStatus::Retry
        }
    })
    .await;

    let missing = queue.get(&missing_id).await.unwrap().unwrap();
    assert_eq!(
        missing.metadata.get(META_LAST_ERROR).and_then(|v| v.as_str()),
        Some("HTTP status 404")
    );

    let registry_watch = registry.clone();
    wait_for(|| {
        let registry = registry_watch.clone();
        async move { registry.get("w1").await.unwrap().unwrap().current_tasks == 0 }
    })
    .await;

    handle.shutdown().await;
    assert!(registry.get("w1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_evicted_worker_reregisters_on_heartbeat() {
    let mut config = fast_config();
    config.cluster.node_id = "w1".to_string();
    config.cluster.capabilities = vec!["http".to_string(), "javascript".to_string()];

    let registry = Arc::new(InMemoryRegistry::new(Duration::from_secs(30)));
    let worker = WorkerNode::new(
        &config,
        Arc::new(InMemoryQueue::new()),
        registry.clone(),
        Arc::new(LocalTransport::new()),
        Arc::new(FakeSite::new(&[])),
    );

    worker.register().await.unwrap();
    registry.remove("w1").await.unwrap();

    let mut sampler = SystemSampler::new();
    worker.send_heartbeat(&mut sampler).await.unwrap();

    let node = registry.get("w1").await.unwrap().unwrap();
    assert!(node.capabilities.contains("javascript"));
    assert_eq!(node.max_concurrent_tasks, 2);
}
