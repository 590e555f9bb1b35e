//! Single-process cluster: one coordinator and N workers
//!
//! Runs the real coordinator and worker loops over the in-memory queue and
//! registry and the in-process transport. Used by `fleetcrawl run` and by the
//! integration tests.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorHandle};
use crate::error::{Error, Result};
use crate::fetcher::SharedVisitor;
use crate::frontier::{QueueFrontier, Seed, TraversalSettings};
use crate::models::NodeRole;
use crate::queue::{InMemoryQueue, QueueStats, SharedQueue};
use crate::registry::{InMemoryRegistry, SharedRegistry};
use crate::transport::LocalTransport;
use crate::worker::{WorkerHandle, WorkerNode, WorkerStats};

/// In-process fleet
pub struct LocalCluster {
    coordinator: Arc<Coordinator>,
    coordinator_handle: CoordinatorHandle,
    frontier: Arc<QueueFrontier>,
    workers: Vec<WorkerHandle>,
    queue: SharedQueue,
    registry: SharedRegistry,
}

impl LocalCluster {
    /// Start a coordinator and `workers` workers sharing `visitor`
    pub async fn start(config: &Config, workers: usize, visitor: SharedVisitor) -> Result<Self> {
        let queue: SharedQueue = Arc::new(InMemoryQueue::new());
        let registry: SharedRegistry =
            Arc::new(InMemoryRegistry::new(config.cluster.heartbeat_interval()));
        let transport = Arc::new(LocalTransport::new());

        let frontier = Arc::new(QueueFrontier::new(
            Arc::clone(&queue),
            config.crawler.strategy,
            &TraversalSettings::from_config(&config.crawler),
            config.crawler.max_retries,
        ));

        let mut coordinator_config = config.clone();
        coordinator_config.cluster.node_id = "local-coordinator".to_string();
        coordinator_config.cluster.node_role = NodeRole::Coordinator;
        let coordinator = Arc::new(
            Coordinator::new(
                &coordinator_config,
                Arc::clone(&queue),
                Arc::clone(&registry),
                transport.clone(),
            )
            .with_frontier(Arc::clone(&frontier)),
        );

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let mut worker_config = config.clone();
            worker_config.cluster.node_id = format!("local-worker-{}", i + 1);
            worker_config.cluster.node_role = NodeRole::Crawler;

            let worker = Arc::new(WorkerNode::new(
                &worker_config,
                Arc::clone(&queue),
                Arc::clone(&registry),
                transport.clone(),
                Arc::clone(&visitor),
            ));
            handles.push(worker.run().await?);
        }

        let coordinator_handle = Arc::clone(&coordinator).run().await?;

        tracing::info!(
            workers,
            strategy = %config.crawler.strategy,
            "Local cluster started"
        );

        Ok(Self {
            coordinator,
            coordinator_handle,
            frontier,
            workers: handles,
            queue,
            registry,
        })
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Seed the frontier. Returns the ids of the enqueued tasks.
    pub async fn seed(&self, seeds: &[Seed]) -> Result<Vec<String>> {
        Ok(self.frontier.seed(seeds, None).await?)
    }

    /// Poll until nothing is pending or assigned and the frontier has no
    /// links left to expand
    pub async fn wait_until_drained(&self, poll: Duration, timeout: Duration) -> Result<QueueStats> {
        let wait = async {
            loop {
                if self.queue.stats().await?.is_drained() && self.frontier.pump().await? == 0 {
                    // a concurrent pump may have enqueued links meanwhile
                    let stats = self.queue.stats().await?;
                    if stats.is_drained() {
                        return Ok::<_, Error>(stats);
                    }
                }
                tokio::time::sleep(poll).await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::other(format!("cluster not drained after {timeout:?}")))?
    }

    /// Per-worker statistics
    pub async fn worker_stats(&self) -> Vec<(String, WorkerStats)> {
        let mut stats = Vec::with_capacity(self.workers.len());
        for handle in &self.workers {
            let worker = handle.worker();
            stats.push((worker.node_id().to_string(), worker.stats().await));
        }
        stats
    }

    /// Stop the coordinator, then drain every worker
    pub async fn shutdown(self) {
        self.coordinator_handle.shutdown().await;
        for handle in self.workers {
            handle.shutdown().await;
        }
        tracing::info!("Local cluster stopped");
    }
}
