//! Node registry for tracking crawler nodes
//!
//! This module manages the registration and liveness of every node in the
//! fleet. A node is stale once its heartbeat age reaches twice the heartbeat
//! interval; stale nodes are evicted by [`NodeRegistry::evict_stale`] and each
//! eviction is published as a [`RegistryEvent`] so the coordinator can
//! recover the tasks the node was holding.

pub mod memory;
pub mod redis;

pub use memory::InMemoryRegistry;
pub use redis::RedisRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{ErrorCategory, FleetErrorTrait};
use crate::models::{CrawlerNode, NodeRole, NodeStatus, PerformanceMetrics};

/// Capacity of the registry event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Events & Reports
// ============================================================================

/// Membership change published by the registry
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Registered {
        node_id: String,
        role: NodeRole,
    },
    /// Node removed because its heartbeat went stale
    Evicted {
        node_id: String,
        last_heartbeat: DateTime<Utc>,
        current_tasks: u32,
    },
    /// Node deregistered itself
    Removed {
        node_id: String,
    },
}

/// Payload of a heartbeat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub metrics: PerformanceMetrics,

    /// Authoritative in-flight count from the node itself
    pub current_tasks: Option<u32>,
}

impl HeartbeatReport {
    pub fn new(metrics: PerformanceMetrics) -> Self {
        Self {
            metrics,
            current_tasks: None,
        }
    }

    pub fn with_current_tasks(mut self, current_tasks: u32) -> Self {
        self.current_tasks = Some(current_tasks);
        self
    }
}

// ============================================================================
// Registry Stats
// ============================================================================

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_nodes: usize,
    pub crawlers: usize,
    pub active_tasks: u64,
    pub total_capacity: u64,
}

impl RegistryStats {
    pub fn from_nodes(nodes: &[CrawlerNode]) -> Self {
        let crawlers: Vec<&CrawlerNode> = nodes
            .iter()
            .filter(|n| n.role == NodeRole::Crawler)
            .collect();
        Self {
            total_nodes: nodes.len(),
            crawlers: crawlers.len(),
            active_tasks: crawlers.iter().map(|n| n.current_tasks as u64).sum(),
            total_capacity: crawlers.iter().map(|n| n.max_concurrent_tasks as u64).sum(),
        }
    }

    /// Fraction of crawler task slots in use, in percent
    pub fn utilization(&self) -> f64 {
        if self.total_capacity == 0 {
            0.0
        } else {
            (self.active_tasks as f64 / self.total_capacity as f64) * 100.0
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Registry errors
#[derive(Debug)]
pub enum RegistryError {
    /// Node not found
    NodeNotFound(String),

    /// Node record is missing required fields
    InvalidNode(String),

    /// Redis command failed
    Storage {
        operation: &'static str,
        source: ::redis::RedisError,
    },

    /// Connection pool failure
    Pool(String),

    /// Stored record could not be decoded
    Serialization { node_id: String, reason: String },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NodeNotFound(id) => write!(f, "Node not found: {}", id),
            Self::InvalidNode(reason) => write!(f, "Invalid node: {}", reason),
            Self::Storage { operation, source } => {
                write!(f, "Redis error during '{}': {}", operation, source)
            }
            Self::Pool(reason) => write!(f, "Connection pool error: {}", reason),
            Self::Serialization { node_id, reason } => {
                write!(f, "Cannot decode node {}: {}", node_id, reason)
            }
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl FleetErrorTrait for RegistryError {
    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Pool(_))
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::NodeNotFound(_) | Self::InvalidNode(_) => ErrorCategory::Input,
            Self::Storage { .. } | Self::Pool(_) => ErrorCategory::Storage,
            Self::Serialization { .. } => ErrorCategory::Serialization,
        }
    }
}

impl From<deadpool_redis::PoolError> for RegistryError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

impl From<crate::redis_pool::PoolError> for RegistryError {
    fn from(err: crate::redis_pool::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

// ============================================================================
// Registry Trait
// ============================================================================

/// Liveness-tracked directory of nodes
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Insert or replace a node; its heartbeat is set to now
    async fn register(&self, node: CrawlerNode) -> RegistryResult<()>;

    /// Refresh the heartbeat and metrics of a registered node
    async fn heartbeat(&self, node_id: &str, report: HeartbeatReport) -> RegistryResult<()>;

    /// Adjust `current_tasks` by `delta` (floored at 0), returning the new value
    async fn update_counters(&self, node_id: &str, delta: i64) -> RegistryResult<u32>;

    /// All registered nodes, with `status` computed against the staleness threshold
    async fn snapshot(&self) -> RegistryResult<Vec<CrawlerNode>>;

    /// Remove every stale node, publishing an event per eviction
    async fn evict_stale(&self) -> RegistryResult<Vec<CrawlerNode>>;

    /// Graceful deregistration
    async fn remove(&self, node_id: &str) -> RegistryResult<Option<CrawlerNode>>;

    async fn get(&self, node_id: &str) -> RegistryResult<Option<CrawlerNode>>;

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;

    fn heartbeat_interval(&self) -> Duration;

    /// Heartbeat age at which a node counts as stale
    fn staleness_threshold(&self) -> Duration {
        self.heartbeat_interval() * 2
    }

    /// Live nodes, optionally filtered by role. Stale nodes are evicted first.
    async fn active_nodes(&self, role: Option<NodeRole>) -> RegistryResult<Vec<CrawlerNode>> {
        self.evict_stale().await?;
        Ok(self
            .snapshot()
            .await?
            .into_iter()
            .filter(|n| n.status == NodeStatus::Active)
            .filter(|n| role.map_or(true, |r| n.role == r))
            .collect())
    }

    async fn stats(&self) -> RegistryResult<RegistryStats> {
        Ok(RegistryStats::from_nodes(&self.snapshot().await?))
    }
}

/// Shared handle to a registry backend
pub type SharedRegistry = Arc<dyn NodeRegistry>;

/// Build the registry backend selected by the storage configuration
pub async fn build_registry(
    config: &StorageConfig,
    heartbeat_interval: Duration,
) -> RegistryResult<SharedRegistry> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(InMemoryRegistry::new(heartbeat_interval))),
        StorageBackend::Redis => {
            let pool = crate::redis_pool::connect(config).await?;
            Ok(Arc::new(RedisRegistry::new(
                pool,
                &config.key_prefix,
                heartbeat_interval,
            )))
        }
    }
}

/// Convert a std duration for comparisons against chrono timestamps
pub(crate) fn chrono_threshold(threshold: Duration) -> chrono::Duration {
    chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Stamp `status` on a node record
pub(crate) fn apply_status(node: &mut CrawlerNode, now: DateTime<Utc>, threshold: chrono::Duration) {
    node.status = if node.is_stale_at(now, threshold) {
        NodeStatus::Stale
    } else {
        NodeStatus::Active
    };
}

fn validate_node(node: &CrawlerNode) -> RegistryResult<()> {
    if node.id.trim().is_empty() {
        return Err(RegistryError::InvalidNode("node id is empty".to_string()));
    }
    Ok(())
}
