//! In-memory registry backend

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

use super::{
    apply_status, chrono_threshold, validate_node, HeartbeatReport, NodeRegistry, RegistryError,
    RegistryEvent, RegistryResult, EVENT_CHANNEL_CAPACITY,
};
use crate::models::{CrawlerNode, NodeStatus};

/// Registry for tracking all nodes of a single-process cluster
pub struct InMemoryRegistry {
    /// Registered nodes
    nodes: Arc<RwLock<HashMap<String, CrawlerNode>>>,

    heartbeat_interval: Duration,

    events: broadcast::Sender<RegistryEvent>,
}

impl InMemoryRegistry {
    /// Create a new registry
    pub fn new(heartbeat_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
            heartbeat_interval,
            events,
        }
    }

    fn publish(&self, event: RegistryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl NodeRegistry for InMemoryRegistry {
    async fn register(&self, node: CrawlerNode) -> RegistryResult<()> {
        validate_node(&node)?;

        let mut node = node;
        node.last_heartbeat = Utc::now();
        node.status = NodeStatus::Active;
        let (node_id, role) = (node.id.clone(), node.role);

        self.nodes.write().await.insert(node_id.clone(), node);

        tracing::info!(node = %node_id, role = %role, "Node registered");
        self.publish(RegistryEvent::Registered { node_id, role });
        Ok(())
    }

    async fn heartbeat(&self, node_id: &str, report: HeartbeatReport) -> RegistryResult<()> {
        let mut nodes = self.nodes.write().await;

        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))?;

        node.last_heartbeat = Utc::now();
        node.performance_metrics = report.metrics;
        if let Some(current) = report.current_tasks {
            node.current_tasks = current;
        }
        Ok(())
    }

    async fn update_counters(&self, node_id: &str, delta: i64) -> RegistryResult<u32> {
        let mut nodes = self.nodes.write().await;

        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))?;

        let updated = (node.current_tasks as i64 + delta).max(0);
        node.current_tasks = u32::try_from(updated).unwrap_or(u32::MAX);
        Ok(node.current_tasks)
    }

    async fn snapshot(&self) -> RegistryResult<Vec<CrawlerNode>> {
        let now = Utc::now();
        let threshold = chrono_threshold(self.staleness_threshold());
        Ok(self
            .nodes
            .read()
            .await
            .values()
            .cloned()
            .map(|mut node| {
                apply_status(&mut node, now, threshold);
                node
            })
            .collect())
    }

    async fn evict_stale(&self) -> RegistryResult<Vec<CrawlerNode>> {
        let now = Utc::now();
        let threshold = chrono_threshold(self.staleness_threshold());

        let evicted: Vec<CrawlerNode> = {
            let mut nodes = self.nodes.write().await;
            let stale: Vec<String> = nodes
                .values()
                .filter(|n| n.is_stale_at(now, threshold))
                .map(|n| n.id.clone())
                .collect();
            stale
                .iter()
                .filter_map(|id| nodes.remove(id))
                .map(|mut node| {
                    node.status = NodeStatus::Stale;
                    node
                })
                .collect()
        };

        for node in &evicted {
            tracing::warn!(
                node = %node.id,
                last_heartbeat = %node.last_heartbeat,
                current_tasks = node.current_tasks,
                "Evicting stale node"
            );
            self.publish(RegistryEvent::Evicted {
                node_id: node.id.clone(),
                last_heartbeat: node.last_heartbeat,
                current_tasks: node.current_tasks,
            });
        }
        Ok(evicted)
    }

    async fn remove(&self, node_id: &str) -> RegistryResult<Option<CrawlerNode>> {
        let removed = self.nodes.write().await.remove(node_id);
        if removed.is_some() {
            tracing::info!(node = %node_id, "Node deregistered");
            self.publish(RegistryEvent::Removed {
                node_id: node_id.to_string(),
            });
        }
        Ok(removed)
    }

    async fn get(&self, node_id: &str) -> RegistryResult<Option<CrawlerNode>> {
        let now = Utc::now();
        let threshold = chrono_threshold(self.staleness_threshold());
        Ok(self.nodes.read().await.get(node_id).cloned().map(|mut node| {
            apply_status(&mut node, now, threshold);
            node
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeRole, PerformanceMetrics};

    fn create_node(id: &str, max: u32) -> CrawlerNode {
        CrawlerNode::new(id, NodeRole::Crawler, "127.0.0.1", 9000, max)
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = InMemoryRegistry::new(Duration::from_secs(30));
        registry.register(create_node("n1", 4)).await.unwrap();

        let node = registry.get("n1").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Active);
        assert_eq!(node.max_concurrent_tasks, 4);
        assert!(registry.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_register_rejects_empty_id() {
        let registry = InMemoryRegistry::new(Duration::from_secs(30));
        assert!(matches!(
            registry.register(create_node(" ", 1)).await,
            Err(RegistryError::InvalidNode(_))
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_updates_metrics() {
        let registry = InMemoryRegistry::new(Duration::from_secs(30));
        registry.register(create_node("n1", 4)).await.unwrap();

        let metrics = PerformanceMetrics {
            cpu_usage: 42.0,
            tasks_completed: 7,
            ..Default::default()
        };
        registry
            .heartbeat("n1", HeartbeatReport::new(metrics).with_current_tasks(2))
            .await
            .unwrap();

        let node = registry.get("n1").await.unwrap().unwrap();
        assert_eq!(node.performance_metrics.cpu_usage, 42.0);
        assert_eq!(node.performance_metrics.tasks_completed, 7);
        assert_eq!(node.current_tasks, 2);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_node() {
        let registry = InMemoryRegistry::new(Duration::from_secs(30));
        let result = registry.heartbeat("ghost", HeartbeatReport::default()).await;
        assert!(matches!(result, Err(RegistryError::NodeNotFound(_))));
    }

    #[tokio::test]
    async fn test_update_counters_floor_zero() {
        let registry = InMemoryRegistry::new(Duration::from_secs(30));
        registry.register(create_node("n1", 4)).await.unwrap();

        assert_eq!(registry.update_counters("n1", 1).await.unwrap(), 1);
        assert_eq!(registry.update_counters("n1", 1).await.unwrap(), 2);
        assert_eq!(registry.update_counters("n1", -5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_node_evicted_after_twice_interval() {
        let registry = InMemoryRegistry::new(Duration::from_millis(100));
        let mut events = registry.subscribe();
        registry.register(create_node("n1", 4)).await.unwrap();
        registry.register(create_node("n2", 4)).await.unwrap();

        assert_eq!(registry.active_nodes(None).await.unwrap().len(), 2);

        tokio::time::sleep(Duration::from_millis(120)).await;
        registry
            .heartbeat("n2", HeartbeatReport::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // threshold is 200ms: n1 is ~220ms old, n2 ~100ms
        let active = registry.active_nodes(None).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "n2");
        assert!(registry.get("n1").await.unwrap().is_none());

        let mut evicted = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RegistryEvent::Evicted { node_id, .. } = event {
                evicted.push(node_id);
            }
        }
        assert_eq!(evicted, vec!["n1".to_string()]);
    }

    #[tokio::test]
    async fn test_snapshot_does_not_evict() {
        let registry = InMemoryRegistry::new(Duration::from_millis(10));
        registry.register(create_node("n1", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let snapshot = registry.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, NodeStatus::Stale);

        assert_eq!(registry.evict_stale().await.unwrap().len(), 1);
        assert!(registry.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_nodes_role_filter() {
        let registry = InMemoryRegistry::new(Duration::from_secs(30));
        registry.register(create_node("c1", 2)).await.unwrap();
        registry
            .register(CrawlerNode::new("coord", NodeRole::Coordinator, "h", 1, 0))
            .await
            .unwrap();

        let crawlers = registry.active_nodes(Some(NodeRole::Crawler)).await.unwrap();
        assert_eq!(crawlers.len(), 1);
        assert_eq!(crawlers[0].id, "c1");
        assert_eq!(registry.active_nodes(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_publishes_event() {
        let registry = InMemoryRegistry::new(Duration::from_secs(30));
        registry.register(create_node("n1", 1)).await.unwrap();
        let mut events = registry.subscribe();

        assert!(registry.remove("n1").await.unwrap().is_some());
        assert!(registry.remove("n1").await.unwrap().is_none());
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::Removed {
                node_id: "n1".to_string()
            }
        );
    }
}
