//! Distributed task queue
//!
//! The queue is the sole writer of [`CrawlTask`] state. Tasks live in exactly
//! one of four partitions (pending, assigned, completed, failed) and every
//! transition between them is atomic:
//!
//! ```text
//!            enqueue            claim              complete
//!  (new) ──────────▶ pending ──────────▶ assigned ──────────▶ completed
//!                      ▲  ▲                │  │
//!                      │  └──── release ───┘  │ fail (retries exhausted)
//!                      └──── fail (retry) ────┤
//!                                             ▼
//!                                           failed
//! ```
//!
//! Pending tasks are ordered by priority (descending), FIFO among equal
//! priorities.
//!
//! Two backends are provided: [`InMemoryQueue`] for single-process use and
//! [`RedisQueue`], whose mutations run as server-side Lua scripts so that
//! claims stay exclusive across processes.

pub mod memory;
pub mod redis;

pub use memory::InMemoryQueue;
pub use redis::RedisQueue;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{ErrorCategory, FleetErrorTrait};
use crate::models::{CrawlTask, TaskResult};
use crate::redis_pool::PoolError;

// ============================================================================
// Errors
// ============================================================================

/// Queue operation errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Redis error during '{operation}': {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: ::redis::RedisError,
    },

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Serialization error for task {task_id}: {reason}")]
    Serialization { task_id: String, reason: String },

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Unexpected script reply: {0}")]
    Protocol(String),
}

impl FleetErrorTrait for QueueError {
    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Pool(_))
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Storage { .. } | Self::Pool(_) | Self::Protocol(_) => ErrorCategory::Storage,
            Self::Serialization { .. } => ErrorCategory::Serialization,
            Self::InvalidTask(_) => ErrorCategory::Input,
        }
    }
}

impl From<deadpool_redis::PoolError> for QueueError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

impl From<PoolError> for QueueError {
    fn from(err: PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

// ============================================================================
// Operation Outcomes
// ============================================================================

/// Result of an enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Task added to pending
    Inserted,
    /// A task with the same id already exists; nothing changed
    Duplicate,
    /// Task could not be serialized and was recorded as failed
    Quarantined,
}

/// Partition move performed by a mutating operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Claimed task handed to a node
    Transferred,
    /// Worker began executing the task
    Started,
    /// Assigned → completed
    Completed,
    /// Assigned → pending with a consumed retry
    Retrying { retry_count: u32, priority: i64 },
    /// Assigned → failed, retries exhausted
    Failed { retry_count: u32 },
    /// Assigned → pending without consuming a retry
    Released,
    /// Task was not in the assigned partition; nothing changed
    Ignored,
}

impl Transition {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignored)
    }
}

/// Partition sizes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub assigned: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.assigned + self.completed + self.failed
    }

    /// No task is waiting or in flight
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.assigned == 0
    }
}

/// Slice of the completed feed
#[derive(Debug, Clone, Default)]
pub struct CompletedBatch {
    pub tasks: Vec<CrawlTask>,
    /// Cursor for the next read. Counts every entry read, including records
    /// that could not be loaded.
    pub next_cursor: usize,
}

// ============================================================================
// Queue Trait
// ============================================================================

/// Priority task queue with atomic claims
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Insert a task into pending. Idempotent on duplicate ids.
    async fn enqueue(&self, task: CrawlTask) -> QueueResult<EnqueueOutcome>;

    /// Atomically move the highest-priority pending task to assigned
    async fn claim(&self, node_id: &str) -> QueueResult<Option<CrawlTask>>;

    /// Record the node an assigned task was dispatched to
    async fn transfer(&self, task_id: &str, node_id: &str) -> QueueResult<Transition>;

    /// Mark an assigned task as running on its worker
    async fn start(&self, task_id: &str) -> QueueResult<Transition>;

    /// Move an assigned task to completed, storing the result in metadata
    async fn complete(&self, task_id: &str, result: TaskResult) -> QueueResult<Transition>;

    /// Consume a retry; re-enqueue with demoted priority or move to failed
    async fn fail(&self, task_id: &str, error: &str) -> QueueResult<Transition>;

    /// Undo a claim without consuming a retry
    async fn release(&self, task_id: &str) -> QueueResult<Transition>;

    async fn stats(&self) -> QueueResult<QueueStats>;

    async fn get(&self, task_id: &str) -> QueueResult<Option<CrawlTask>>;

    /// Snapshot of the assigned partition
    async fn assigned_tasks(&self) -> QueueResult<Vec<CrawlTask>>;

    /// Completed tasks in completion order, starting at `cursor`
    async fn completed_since(&self, cursor: usize, limit: usize) -> QueueResult<CompletedBatch>;
}

/// Shared handle to a queue backend
pub type SharedQueue = Arc<dyn TaskQueue>;

/// Build the queue backend selected by the storage configuration
pub async fn build_queue(config: &StorageConfig) -> QueueResult<SharedQueue> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(InMemoryQueue::new())),
        StorageBackend::Redis => {
            let pool = crate::redis_pool::connect(config).await?;
            Ok(Arc::new(RedisQueue::new(pool, &config.key_prefix)))
        }
    }
}

/// Reject tasks that could never be fetched
fn validate_task(task: &CrawlTask) -> QueueResult<()> {
    if task.id.trim().is_empty() {
        return Err(QueueError::InvalidTask("task id is empty".to_string()));
    }
    if task.url.trim().is_empty() {
        return Err(QueueError::InvalidTask(format!(
            "task {} has an empty url",
            task.id
        )));
    }
    Ok(())
}

fn warn_not_assigned(operation: &str, task_id: &str) {
    tracing::warn!(
        task_id = %task_id,
        operation,
        "Task is not assigned, ignoring"
    );
}
