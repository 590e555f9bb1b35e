//! Coordinator assignment and recovery against the in-memory backends

use fleetcrawl::config::Config;
use fleetcrawl::coordinator::{AssignOutcome, Coordinator};
use fleetcrawl::models::{CrawlTask, CrawlerNode, NodeRole, TaskStatus};
use fleetcrawl::queue::{InMemoryQueue, TaskQueue};
use fleetcrawl::registry::{InMemoryRegistry, NodeRegistry};
use fleetcrawl::transport::{AssignmentTransport, LocalTransport, NodeMessage};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    queue: Arc<InMemoryQueue>,
    registry: Arc<InMemoryRegistry>,
    transport: Arc<LocalTransport>,
    coordinator: Coordinator,
}

fn harness() -> Harness {
    let mut config = Config::default();
    config.cluster.node_id = "coordinator".to_string();

    let queue = Arc::new(InMemoryQueue::new());
    let registry = Arc::new(InMemoryRegistry::new(Duration::from_secs(30)));
    let transport = Arc::new(LocalTransport::new());
    let coordinator = Coordinator::new(&config, queue.clone(), registry.clone(), transport.clone());
    Harness {
        queue,
        registry,
        transport,
        coordinator,
    }
}

#[tokio::test]
async fn test_tasks_spread_by_availability() {
    let h = harness();
    for id in ["w1", "w2"] {
        h.registry
            .register(CrawlerNode::new(id, NodeRole::Crawler, "127.0.0.1", 0, 2))
            .await
            .unwrap();
    }
    let mut w1 = h.transport.open_inbox("w1").await.unwrap();
    let mut w2 = h.transport.open_inbox("w2").await.unwrap();

    let urls: Vec<String> = (0..5).map(|i| format!("https://example.com/{i}")).collect();
    h.coordinator.submit_urls(&urls, 0).await.unwrap();

    let mut dispatched = Vec::new();
    for _ in 0..5 {
        dispatched.push(h.coordinator.assign_once().await.unwrap());
    }

    // four slots in total: the fifth task finds no capacity
    let to = |node: &str| {
        dispatched
            .iter()
            .filter(|o| matches!(o, AssignOutcome::Dispatched { node_id, .. } if node_id == node))
            .count()
    };
    assert_eq!(to("w1"), 2);
    assert_eq!(to("w2"), 2);
    assert!(matches!(dispatched[4], AssignOutcome::NoCapacity { .. }));

    let stats = h.queue.stats().await.unwrap();
    assert_eq!(stats.assigned, 4);
    assert_eq!(stats.pending, 1);

    let mut received = 0;
    while let Some(NodeMessage::TaskAssignment(_)) = w1.recv(Duration::from_millis(20)).await.unwrap() {
        received += 1;
    }
    while let Some(NodeMessage::TaskAssignment(_)) = w2.recv(Duration::from_millis(20)).await.unwrap() {
        received += 1;
    }
    assert_eq!(received, 4);
}

#[tokio::test]
async fn test_required_capability_routes_task() {
    let h = harness();
    h.registry
        .register(CrawlerNode::new("plain", NodeRole::Crawler, "127.0.0.1", 0, 8))
        .await
        .unwrap();
    h.registry
        .register(
            CrawlerNode::new("renderer", NodeRole::Crawler, "127.0.0.1", 0, 1)
                .with_capability("javascript"),
        )
        .await
        .unwrap();
    let _plain = h.transport.open_inbox("plain").await.unwrap();
    let _renderer = h.transport.open_inbox("renderer").await.unwrap();

    h.queue
        .enqueue(
            CrawlTask::new("https://spa.example/", 0, 0)
                .with_id("spa")
                .with_requirements(["javascript"]),
        )
        .await
        .unwrap();

    let outcome = h.coordinator.assign_once().await.unwrap();
    assert_eq!(
        outcome,
        AssignOutcome::Dispatched {
            task_id: "spa".to_string(),
            node_id: "renderer".to_string()
        }
    );
}

#[tokio::test]
async fn test_coordinators_are_never_assigned() {
    let h = harness();
    h.coordinator.register_self().await.unwrap();
    let _inbox = h.transport.open_inbox("coordinator").await.unwrap();

    h.coordinator
        .submit_urls(&["https://example.com/".to_string()], 0)
        .await
        .unwrap();
    let outcome = h.coordinator.assign_once().await.unwrap();
    assert!(matches!(outcome, AssignOutcome::NoCapacity { .. }));
}

#[tokio::test]
async fn test_recovered_task_reassigned_to_live_node() {
    let mut config = Config::default();
    config.cluster.node_id = "coordinator".to_string();
    config.cluster.stuck_task_timeout_secs = 0;

    let queue = Arc::new(InMemoryQueue::new());
    let registry = Arc::new(InMemoryRegistry::new(Duration::from_secs(30)));
    let transport = Arc::new(LocalTransport::new());
    let coordinator = Coordinator::new(&config, queue.clone(), registry.clone(), transport.clone());

    registry
        .register(CrawlerNode::new("w1", NodeRole::Crawler, "127.0.0.1", 0, 4))
        .await
        .unwrap();
    let mut inbox = transport.open_inbox("w1").await.unwrap();

    let ids = coordinator
        .submit_urls(&["https://example.com/".to_string()], 1)
        .await
        .unwrap();
    coordinator.assign_once().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = coordinator.monitor_once().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(queue.get(&ids[0]).await.unwrap().unwrap().status, TaskStatus::Retry);

    // the same task goes out again, one retry consumed
    coordinator.assign_once().await.unwrap();
    let mut deliveries = Vec::new();
    while let Some(NodeMessage::TaskAssignment(a)) = inbox.recv(Duration::from_millis(20)).await.unwrap() {
        deliveries.push(a.task);
    }
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[1].id, ids[0]);
    assert_eq!(deliveries[1].retry_count, 1);
}
