//! Coordinator: assignment, monitoring and the control surface
//!
//! The coordinator runs two loops for the lifetime of the process:
//!
//! - **assignment**: claim the best pending task, pick a node with
//!   [`select_node`], hand the task over and dispatch it to the node's inbox.
//!   When no node has spare capacity the claim is released and the loop backs
//!   off.
//! - **monitor**: log a cluster snapshot, evict stale nodes, fail back tasks
//!   that are stuck or held by evicted nodes, then heartbeat.
//!
//! A third loop expands discovered links when a [`QueueFrontier`] is attached.
//!
//! Recovery is at-least-once: a task whose node is merely slow is failed back
//! and may run twice.

pub mod api;
pub mod client;

use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::balancer::select_node;
use crate::config::{ClusterConfig, Config};
use crate::error::{ErrorCategory, FleetErrorTrait};
use crate::frontier::{normalize_url, FrontierError, QueueFrontier, Seed};
use crate::metrics;
use crate::models::{CrawlTask, CrawlerNode, NodeRole, NodeSummary};
use crate::queue::{QueueError, QueueStats, SharedQueue};
use crate::registry::{
    chrono_threshold, HeartbeatReport, RegistryError, RegistryEvent, RegistryStats,
    SharedRegistry,
};
use crate::transport::{NodeMessage, SharedTransport, TransportError};
use crate::worker::heartbeat::SystemSampler;

/// Error recorded on tasks assigned for longer than the stuck timeout
pub const STUCK_TASK_ERROR: &str = "timeout - reassigning";

/// Error recorded on tasks held by an evicted node
pub const EVICTED_NODE_ERROR: &str = "node evicted - reassigning";

// ============================================================================
// Errors
// ============================================================================

/// Coordinator errors
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Frontier(#[from] FrontierError),
}

impl FleetErrorTrait for CoordinatorError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::InvalidUrl { .. } => false,
            Self::Queue(e) => e.is_recoverable(),
            Self::Registry(e) => e.is_recoverable(),
            Self::Transport(e) => e.is_recoverable(),
            Self::Frontier(e) => e.is_recoverable(),
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidUrl { .. } => ErrorCategory::Input,
            Self::Queue(e) => e.category(),
            Self::Registry(e) => e.category(),
            Self::Transport(e) => e.category(),
            Self::Frontier(e) => e.category(),
        }
    }
}

pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;

// ============================================================================
// Loop Outcomes
// ============================================================================

/// Result of one pass of the assignment loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignOutcome {
    /// Task handed to a node
    Dispatched { task_id: String, node_id: String },
    /// Nothing pending
    Idle,
    /// No active node could take the task; it was released
    NoCapacity { task_id: String },
    /// Delivery failed; the task was released
    DispatchFailed { task_id: String, node_id: String },
}

/// Result of one monitor pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorReport {
    pub stats: QueueStats,
    /// Active crawler nodes after eviction
    pub active_crawlers: usize,
    pub evicted: Vec<String>,
    /// Tasks failed back to the queue
    pub recovered: usize,
}

// ============================================================================
// Coordinator
// ============================================================================

/// Cluster coordinator
pub struct Coordinator {
    node: CrawlerNode,
    cluster: ClusterConfig,
    max_retries: u32,
    queue: SharedQueue,
    registry: SharedRegistry,
    transport: SharedTransport,
    frontier: Option<Arc<QueueFrontier>>,
    events: Mutex<broadcast::Receiver<RegistryEvent>>,
    sampler: Mutex<SystemSampler>,
    started_at: Instant,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Coordinator {
    pub fn new(
        config: &Config,
        queue: SharedQueue,
        registry: SharedRegistry,
        transport: SharedTransport,
    ) -> Self {
        let cluster = config.cluster.clone();
        let mut node = CrawlerNode::new(
            cluster.node_id.clone(),
            NodeRole::Coordinator,
            cluster.host.clone(),
            cluster.port,
            0,
        );
        node.capabilities = cluster.capabilities.iter().cloned().collect();

        let events = registry.subscribe();
        let (shutdown, shutdown_rx) = watch::channel(false);

        Self {
            node,
            cluster,
            max_retries: config.crawler.max_retries,
            queue,
            registry,
            transport,
            frontier: None,
            events: Mutex::new(events),
            sampler: Mutex::new(SystemSampler::new()),
            started_at: Instant::now(),
            shutdown,
            shutdown_rx,
        }
    }

    /// Expand completed tasks' links through `frontier`
    pub fn with_frontier(mut self, frontier: Arc<QueueFrontier>) -> Self {
        self.frontier = Some(frontier);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn frontier(&self) -> Option<&Arc<QueueFrontier>> {
        self.frontier.as_ref()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Register with role Coordinator
    pub async fn register_self(&self) -> CoordinatorResult<()> {
        self.registry.register(self.node.clone()).await?;
        tracing::info!(node = %self.node.id, "Coordinator registered");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------------

    /// Submit URLs at `priority`. Every URL is validated before anything is
    /// enqueued; one malformed URL rejects the whole batch.
    pub async fn submit_urls(&self, urls: &[String], priority: i64) -> CoordinatorResult<Vec<String>> {
        let mut normalized = Vec::with_capacity(urls.len());
        for url in urls {
            if url.trim().is_empty() {
                return Err(CoordinatorError::InvalidUrl {
                    url: url.clone(),
                    reason: "empty URL".to_string(),
                });
            }
            let url = normalize_url(url).ok_or_else(|| CoordinatorError::InvalidUrl {
                url: url.clone(),
                reason: "not an absolute http(s) URL".to_string(),
            })?;
            normalized.push(url);
        }

        let ids = match &self.frontier {
            Some(frontier) => {
                let seeds: Vec<Seed> = normalized.into_iter().map(Seed::new).collect();
                if seeds.is_empty() {
                    Vec::new()
                } else {
                    frontier.seed(&seeds, Some(priority)).await?
                }
            }
            None => {
                let mut ids = Vec::with_capacity(normalized.len());
                for url in normalized {
                    let task = CrawlTask::new(url, priority, 0).with_max_retries(self.max_retries);
                    ids.push(task.id.clone());
                    self.queue.enqueue(task).await?;
                }
                ids
            }
        };

        tracing::info!(submitted = urls.len(), enqueued = ids.len(), priority, "URLs submitted");
        Ok(ids)
    }

    pub async fn queue_stats(&self) -> CoordinatorResult<QueueStats> {
        Ok(self.queue.stats().await?)
    }

    pub async fn registry_stats(&self) -> CoordinatorResult<RegistryStats> {
        Ok(self.registry.stats().await?)
    }

    /// Active nodes, optionally filtered by role
    pub async fn active_nodes(&self, role: Option<NodeRole>) -> CoordinatorResult<Vec<NodeSummary>> {
        Ok(self
            .registry
            .active_nodes(role)
            .await?
            .iter()
            .map(CrawlerNode::summary)
            .collect())
    }

    // ------------------------------------------------------------------------
    // Assignment
    // ------------------------------------------------------------------------

    /// Claim one task and hand it to the best node
    pub async fn assign_once(&self) -> CoordinatorResult<AssignOutcome> {
        let Some(mut task) = self.queue.claim(&self.node.id).await? else {
            return Ok(AssignOutcome::Idle);
        };
        metrics::record_claim();

        let candidates = match self.registry.active_nodes(Some(NodeRole::Crawler)).await {
            Ok(nodes) => nodes,
            Err(e) => {
                self.queue.release(&task.id).await?;
                return Err(e.into());
            }
        };

        let Some(node) = select_node(&candidates, &task) else {
            self.queue.release(&task.id).await?;
            metrics::record_no_capacity();
            tracing::debug!(
                task_id = %task.id,
                candidates = candidates.len(),
                "No node with spare capacity, releasing task"
            );
            return Ok(AssignOutcome::NoCapacity { task_id: task.id });
        };
        let node_id = node.id.clone();

        if self.queue.transfer(&task.id, &node_id).await?.is_ignored() {
            return Ok(AssignOutcome::Idle);
        }
        task.assigned_to = Some(node_id.clone());

        let task_id = task.id.clone();
        let message = NodeMessage::assignment(task, self.node.id.clone());
        if let Err(e) = self.transport.dispatch(&node_id, message).await {
            tracing::warn!(task_id = %task_id, node = %node_id, error = %e, "Dispatch failed, releasing task");
            metrics::record_dispatch_failure();
            self.queue.release(&task_id).await?;
            return Ok(AssignOutcome::DispatchFailed { task_id, node_id });
        }

        if let Err(e) = self.registry.update_counters(&node_id, 1).await {
            tracing::warn!(node = %node_id, error = %e, "Failed to update node counters");
        }
        metrics::record_dispatch(&node_id);
        tracing::debug!(task_id = %task_id, node = %node_id, "Task dispatched");

        Ok(AssignOutcome::Dispatched { task_id, node_id })
    }

    // ------------------------------------------------------------------------
    // Monitoring
    // ------------------------------------------------------------------------

    /// Snapshot, evict, recover, heartbeat
    pub async fn monitor_once(&self) -> CoordinatorResult<MonitorReport> {
        let active = self.registry.active_nodes(Some(NodeRole::Crawler)).await?;
        let evicted = self.drain_evictions().await;

        let recovered = self.recover_tasks(&evicted).await?;
        let stats = self.queue.stats().await?;

        tracing::info!(
            pending = stats.pending,
            assigned = stats.assigned,
            completed = stats.completed,
            failed = stats.failed,
            active_crawlers = active.len(),
            evicted = evicted.len(),
            recovered,
            "Cluster status"
        );
        metrics::update_cluster_gauges(&stats, active.len());
        metrics::record_evictions(evicted.len());

        self.send_heartbeat().await?;

        let mut evicted: Vec<String> = evicted.into_iter().collect();
        evicted.sort();
        Ok(MonitorReport {
            stats,
            active_crawlers: active.len(),
            evicted,
            recovered,
        })
    }

    /// Node ids evicted since the last pass
    async fn drain_evictions(&self) -> HashSet<String> {
        let mut events = self.events.lock().await;
        let mut evicted = HashSet::new();
        loop {
            match events.try_recv() {
                Ok(RegistryEvent::Evicted { node_id, .. }) => {
                    evicted.insert(node_id);
                }
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Registry events lagged, relying on stuck-task scan");
                }
                Err(_) => break,
            }
        }
        evicted
    }

    /// Fail back stuck tasks and tasks held by evicted nodes
    async fn recover_tasks(&self, evicted: &HashSet<String>) -> CoordinatorResult<usize> {
        let now = Utc::now();
        let stuck_after = chrono_threshold(self.cluster.stuck_task_timeout());
        let mut recovered = 0;

        for task in self.queue.assigned_tasks().await? {
            let held_by_evicted = task
                .assigned_to
                .as_ref()
                .is_some_and(|node| evicted.contains(node));
            let stuck = task
                .assignment_age(now)
                .is_some_and(|age| age > stuck_after);

            let (reason, error) = if held_by_evicted {
                ("evicted", EVICTED_NODE_ERROR)
            } else if stuck {
                ("stuck", STUCK_TASK_ERROR)
            } else {
                continue;
            };

            let transition = self.queue.fail(&task.id, error).await?;
            if transition.is_ignored() {
                continue;
            }
            recovered += 1;
            metrics::record_recovery(reason);
            tracing::warn!(
                task_id = %task.id,
                node = task.assigned_to.as_deref().unwrap_or("-"),
                reason = error,
                ?transition,
                "Recovered assigned task"
            );
        }

        Ok(recovered)
    }

    async fn send_heartbeat(&self) -> CoordinatorResult<()> {
        let mut metrics = crate::models::PerformanceMetrics::default();
        {
            let mut sampler = self.sampler.lock().await;
            let (cpu, memory) = sampler.sample();
            metrics.cpu_usage = cpu;
            metrics.memory_usage = memory;
        }

        match self
            .registry
            .heartbeat(&self.node.id, HeartbeatReport::new(metrics))
            .await
        {
            Ok(()) => Ok(()),
            Err(RegistryError::NodeNotFound(_)) => {
                tracing::warn!(node = %self.node.id, "Coordinator was evicted, re-registering");
                self.register_self().await
            }
            Err(e) => Err(e.into()),
        }
    }

    // ------------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------------

    /// Register and start the background loops
    pub async fn run(self: Arc<Self>) -> CoordinatorResult<CoordinatorHandle> {
        self.register_self().await?;

        let assignment = tokio::spawn(Arc::clone(&self).assignment_loop());
        let monitor = tokio::spawn(Arc::clone(&self).monitor_loop());
        let frontier = self
            .frontier
            .clone()
            .map(|frontier| tokio::spawn(Arc::clone(&self).frontier_loop(frontier)));

        tracing::info!(node = %self.node.id, "Coordinator started");
        Ok(CoordinatorHandle {
            assignment,
            monitor,
            frontier,
            shutdown: self.shutdown.clone(),
        })
    }

    /// Ask every loop to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn assignment_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let pause = match self.assign_once().await {
                Ok(AssignOutcome::Dispatched { .. }) => None,
                Ok(AssignOutcome::Idle) | Ok(AssignOutcome::DispatchFailed { .. }) => {
                    Some(self.cluster.idle_poll())
                }
                Ok(AssignOutcome::NoCapacity { .. }) => Some(self.cluster.no_capacity_backoff()),
                Err(e) => {
                    tracing::error!(error = %e, "Assignment pass failed");
                    Some(self.cluster.no_capacity_backoff())
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        }

        tracing::info!("Assignment loop shutting down");
    }

    async fn monitor_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(self.cluster.monitor_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.monitor_once().await {
                        tracing::error!(error = %e, "Monitor pass failed");
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        if let Err(e) = self.registry.remove(&self.node.id).await {
            tracing::warn!(node = %self.node.id, error = %e, "Failed to deregister coordinator");
        }
        tracing::info!("Monitor loop shutting down");
    }

    async fn frontier_loop(self: Arc<Self>, frontier: Arc<QueueFrontier>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(self.cluster.idle_poll());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = frontier.pump().await {
                        tracing::error!(error = %e, "Frontier expansion failed");
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        tracing::info!("Frontier loop shutting down");
    }
}

// ============================================================================
// Coordinator Handle
// ============================================================================

/// Handle to the running coordinator loops
pub struct CoordinatorHandle {
    assignment: JoinHandle<()>,
    monitor: JoinHandle<()>,
    frontier: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl CoordinatorHandle {
    /// Wait for all loops to finish
    pub async fn wait(self) {
        let _ = tokio::join!(self.assignment, self.monitor);
        if let Some(frontier) = self.frontier {
            let _ = frontier.await;
        }
    }

    /// Signal shutdown and wait
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.wait().await;
    }

    pub fn is_running(&self) -> bool {
        !self.assignment.is_finished() && !self.monitor.is_finished()
    }
}
