//! Worker node: receives assignments and executes them
//!
//! A worker opens its inbox, registers, then runs two loops:
//!
//! - **listener**: receives assignments and runs each one on a bounded pool.
//!   A worker that is already full hands the task straight back to the queue.
//! - **heartbeat**: reports resource usage and the in-flight count.
//!
//! Every accepted task ends in `complete` or `fail`, and the registry counter
//! the coordinator bumped on dispatch is always corrected afterwards.

pub mod heartbeat;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;

use crate::config::{ClusterConfig, Config};
use crate::error::{ErrorCategory, FleetErrorTrait};
use crate::fetcher::{FetchError, SharedVisitor};
use crate::metrics;
use crate::models::{CrawlTask, CrawlerNode, NodeRole, PerformanceMetrics};
use crate::queue::{QueueError, SharedQueue, Transition};
use crate::registry::{RegistryError, SharedRegistry};
use crate::transport::{AssignmentInbox, NodeMessage, SharedTransport, TransportError};

// ============================================================================
// Errors
// ============================================================================

/// Worker errors
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Fetch stack could not be built
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl FleetErrorTrait for WorkerError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Queue(e) => e.is_recoverable(),
            Self::Registry(e) => e.is_recoverable(),
            Self::Transport(e) => e.is_recoverable(),
            Self::Fetch(e) => e.is_recoverable(),
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Queue(e) => e.category(),
            Self::Registry(e) => e.category(),
            Self::Transport(e) => e.category(),
            Self::Fetch(e) => e.category(),
        }
    }
}

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

// ============================================================================
// Statistics
// ============================================================================

/// Running totals reported in heartbeats
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_refused: u64,
    /// Total execution time of finished tasks, in seconds
    pub total_task_secs: f64,
}

impl WorkerStats {
    fn record(&mut self, success: bool, secs: f64) {
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        self.total_task_secs += secs;
    }

    pub fn tasks_finished(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Mean execution time in seconds
    pub fn avg_task_time(&self) -> f64 {
        match self.tasks_finished() {
            0 => 0.0,
            n => self.total_task_secs / n as f64,
        }
    }

    pub fn success_rate(&self) -> f64 {
        match self.tasks_finished() {
            0 => 1.0,
            n => self.tasks_completed as f64 / n as f64,
        }
    }

    /// Metrics without the resource samples
    pub fn performance_metrics(&self) -> PerformanceMetrics {
        PerformanceMetrics {
            tasks_completed: self.tasks_completed,
            avg_task_time: self.avg_task_time(),
            success_rate: self.success_rate(),
            ..Default::default()
        }
    }
}

/// How a task execution ended
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed,
    /// Completed without fetching (robots.txt)
    Skipped,
    Failed { error: String, transition: Transition },
    /// The task was no longer assigned when execution began
    Ignored,
}

// ============================================================================
// In-flight Guard
// ============================================================================

/// Counts a task as in flight until dropped
struct InFlightGuard {
    counter: Arc<AtomicU32>,
    node_id: String,
}

impl InFlightGuard {
    fn enter(counter: Arc<AtomicU32>, node_id: &str) -> Self {
        let current = counter.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_in_flight(node_id, current);
        Self {
            counter,
            node_id: node_id.to_string(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let current = self.counter.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::set_in_flight(&self.node_id, current);
    }
}

// ============================================================================
// Worker Node
// ============================================================================

/// Crawler node executing assigned tasks
pub struct WorkerNode {
    node: CrawlerNode,
    cluster: ClusterConfig,
    queue: SharedQueue,
    registry: SharedRegistry,
    transport: SharedTransport,
    visitor: SharedVisitor,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicU32>,
    stats: RwLock<WorkerStats>,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerNode {
    pub fn new(
        config: &Config,
        queue: SharedQueue,
        registry: SharedRegistry,
        transport: SharedTransport,
        visitor: SharedVisitor,
    ) -> Self {
        let cluster = config.cluster.clone();
        let mut node = CrawlerNode::new(
            cluster.node_id.clone(),
            NodeRole::Crawler,
            cluster.host.clone(),
            cluster.port,
            cluster.max_concurrent_tasks,
        );
        node.capabilities = cluster.capabilities.iter().cloned().collect();

        let (shutdown, shutdown_rx) = watch::channel(false);

        Self {
            permits: Arc::new(Semaphore::new(cluster.max_concurrent_tasks as usize)),
            node,
            cluster,
            queue,
            registry,
            transport,
            visitor,
            in_flight: Arc::new(AtomicU32::new(0)),
            stats: RwLock::new(WorkerStats::default()),
            shutdown,
            shutdown_rx,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    /// Tasks currently executing
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> WorkerStats {
        self.stats.read().await.clone()
    }

    /// Register (or re-register) with the current in-flight count
    pub async fn register(&self) -> Result<(), RegistryError> {
        let mut node = self.node.clone();
        node.current_tasks = self.in_flight();
        node.performance_metrics = self.stats().await.performance_metrics();
        self.registry.register(node).await
    }

    /// Open the inbox, register and start the loops
    pub async fn run(self: Arc<Self>) -> WorkerResult<WorkerHandle> {
        let inbox = self.transport.open_inbox(self.node_id()).await?;
        self.register().await?;

        let listener = tokio::spawn(Arc::clone(&self).listen(inbox));
        let heartbeat = tokio::spawn(Arc::clone(&self).heartbeat_loop());

        tracing::info!(
            node = %self.node_id(),
            max_concurrent_tasks = self.node.max_concurrent_tasks,
            "Worker started"
        );
        Ok(WorkerHandle {
            worker: self,
            listener,
            heartbeat,
        })
    }

    // ------------------------------------------------------------------------
    // Listener
    // ------------------------------------------------------------------------

    async fn listen(self: Arc<Self>, mut inbox: Box<dyn AssignmentInbox>) {
        let shutdown_rx = self.shutdown_rx.clone();
        let wait = self.cluster.idle_poll();

        // recv is never cancelled: a Redis inbox may already have popped the
        // message, so shutdown is checked between bounded waits
        while !*shutdown_rx.borrow() {
            match inbox.recv(wait).await {
                Ok(Some(NodeMessage::TaskAssignment(assignment))) => {
                    self.accept(assignment.task).await;
                }
                Ok(None) => {}
                Err(TransportError::Closed) => {
                    tracing::warn!(node = %self.node_id(), "Inbox closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(node = %self.node_id(), error = %e, "Failed to receive assignment");
                    tokio::time::sleep(wait).await;
                }
            }
        }

        tracing::info!(node = %self.node_id(), "Listener shutting down");
    }

    /// Run `task` on the pool, or hand it back when the pool is full
    async fn accept(self: &Arc<Self>, task: CrawlTask) {
        if *self.shutdown_rx.borrow() {
            self.refuse(&task, "shutting down").await;
            return;
        }

        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                tracing::debug!(task_id = %task.id, node = %self.node_id(), "Task accepted");
                tokio::spawn(Arc::clone(self).execute(task, permit));
            }
            Err(_) => self.refuse(&task, "at capacity").await,
        }
    }

    async fn refuse(&self, task: &CrawlTask, reason: &str) {
        tracing::info!(task_id = %task.id, node = %self.node_id(), reason, "Refusing task");
        if let Err(e) = self.queue.release(&task.id).await {
            tracing::error!(task_id = %task.id, error = %e, "Failed to release refused task");
        }
        self.release_slot().await;
        self.stats.write().await.tasks_refused += 1;
        metrics::record_refusal(self.node_id());
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    async fn execute(self: Arc<Self>, task: CrawlTask, _permit: OwnedSemaphorePermit) {
        {
            let _guard = InFlightGuard::enter(Arc::clone(&self.in_flight), self.node_id());
            if let Err(e) = self.run_task(&task).await {
                tracing::error!(task_id = %task.id, node = %self.node_id(), error = %e, "Task bookkeeping failed");
            }
        }
        self.release_slot().await;
    }

    /// Execute one task to `complete` or `fail`
    pub async fn run_task(&self, task: &CrawlTask) -> WorkerResult<TaskOutcome> {
        if self.queue.start(&task.id).await?.is_ignored() {
            tracing::debug!(task_id = %task.id, "Task no longer assigned, skipping");
            return Ok(TaskOutcome::Ignored);
        }

        let _timer = metrics::start_task_timer(self.node_id());
        let started = Instant::now();
        let visit = self.visitor.visit(&task.url, task.depth).await;
        let secs = started.elapsed().as_secs_f64();

        match visit {
            Ok(visit) => {
                let skipped = visit.is_skipped();
                let transition = self.queue.complete(&task.id, visit.into_result()).await?;
                if transition.is_ignored() {
                    tracing::warn!(task_id = %task.id, "Task was reassigned before it completed");
                }
                self.stats.write().await.record(true, secs);
                metrics::record_task_outcome(self.node_id(), true);
                tracing::debug!(task_id = %task.id, url = %task.url, skipped, "Task completed");
                Ok(if skipped {
                    TaskOutcome::Skipped
                } else {
                    TaskOutcome::Completed
                })
            }
            Err(e) => {
                let error = e.to_string();
                let transition = self.queue.fail(&task.id, &error).await?;
                self.stats.write().await.record(false, secs);
                metrics::record_task_outcome(self.node_id(), false);
                tracing::warn!(
                    task_id = %task.id,
                    url = %task.url,
                    error = %error,
                    ?transition,
                    "Task failed"
                );
                Ok(TaskOutcome::Failed { error, transition })
            }
        }
    }

    /// Undo the coordinator's optimistic +1
    async fn release_slot(&self) {
        if let Err(e) = self.registry.update_counters(self.node_id(), -1).await {
            tracing::debug!(node = %self.node_id(), error = %e, "Failed to decrement task counter");
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Deregister and stop accepting assignments
    pub async fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.registry.remove(self.node_id()).await {
            tracing::warn!(node = %self.node_id(), error = %e, "Failed to deregister worker");
        }
    }

    /// Wait until every in-flight task has finished
    pub async fn drain(&self) {
        let all = self.node.max_concurrent_tasks;
        if let Ok(permits) = self.permits.acquire_many(all).await {
            drop(permits);
        }
        tracing::info!(node = %self.node_id(), "Worker drained");
    }
}

// ============================================================================
// Worker Handle
// ============================================================================

/// Handle to a running worker
pub struct WorkerHandle {
    worker: Arc<WorkerNode>,
    listener: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn worker(&self) -> &Arc<WorkerNode> {
        &self.worker
    }

    /// Wait for the loops to finish
    pub async fn wait(self) {
        let _ = tokio::join!(self.listener, self.heartbeat);
    }

    /// Deregister, stop listening, then drain in-flight tasks
    pub async fn shutdown(self) {
        self.worker.begin_shutdown().await;
        let _ = tokio::join!(self.listener, self.heartbeat);
        self.worker.drain().await;
    }

    pub fn is_running(&self) -> bool {
        !self.listener.is_finished() && !self.heartbeat.is_finished()
    }
}
