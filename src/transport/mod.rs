//! Inter-node assignment channel
//!
//! The coordinator delivers [`NodeMessage`]s to a per-node inbox. Messages
//! are explicit tagged structs carrying a schema version:
//!
//! ```json
//! {"type": "task_assignment", "schema_version": 1, "task": {...},
//!  "assigned_by": "coordinator-1", "timestamp": "2024-01-01T00:00:00Z"}
//! ```

pub mod local;
pub mod redis;

pub use local::LocalTransport;
pub use redis::RedisTransport;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{ErrorCategory, FleetErrorTrait};
use crate::models::CrawlTask;

/// Current wire schema version
pub const SCHEMA_VERSION: u16 = 1;

// ============================================================================
// Messages
// ============================================================================

/// Assignment of one task to one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub schema_version: u16,
    pub task: CrawlTask,
    pub assigned_by: String,
    pub timestamp: DateTime<Utc>,
}

/// Message delivered to a node inbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeMessage {
    TaskAssignment(TaskAssignment),
}

impl NodeMessage {
    /// Build an assignment stamped with the current schema version
    pub fn assignment(task: CrawlTask, assigned_by: impl Into<String>) -> Self {
        Self::TaskAssignment(TaskAssignment {
            schema_version: SCHEMA_VERSION,
            task,
            assigned_by: assigned_by.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn schema_version(&self) -> u16 {
        match self {
            Self::TaskAssignment(a) => a.schema_version,
        }
    }

    pub fn encode(&self) -> TransportResult<String> {
        serde_json::to_string(self).map_err(|e| TransportError::Encode(e.to_string()))
    }

    /// Decode a message, rejecting schema versions this build does not know
    pub fn decode(raw: &str) -> TransportResult<Self> {
        let message: Self =
            serde_json::from_str(raw).map_err(|e| TransportError::Decode(e.to_string()))?;
        if message.schema_version() != SCHEMA_VERSION {
            return Err(TransportError::UnsupportedVersion(message.schema_version()));
        }
        Ok(message)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No inbox for node {0}")]
    UnknownNode(String),

    #[error("Inbox closed")]
    Closed,

    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Unsupported message schema version {0}")]
    UnsupportedVersion(u16),

    #[error("Redis error during '{operation}': {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: ::redis::RedisError,
    },

    #[error("Connection pool error: {0}")]
    Pool(String),
}

impl FleetErrorTrait for TransportError {
    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnknownNode(_) | Self::Storage { .. } | Self::Pool(_)
        )
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownNode(_) | Self::Closed => ErrorCategory::Network,
            Self::Encode(_) | Self::Decode(_) | Self::UnsupportedVersion(_) => {
                ErrorCategory::Serialization
            }
            Self::Storage { .. } | Self::Pool(_) => ErrorCategory::Storage,
        }
    }
}

impl From<deadpool_redis::PoolError> for TransportError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

impl From<crate::redis_pool::PoolError> for TransportError {
    fn from(err: crate::redis_pool::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

// ============================================================================
// Traits
// ============================================================================

/// Sending side, used by the coordinator
#[async_trait]
pub trait AssignmentTransport: Send + Sync {
    /// Deliver a message to a node's inbox
    async fn dispatch(&self, node_id: &str, message: NodeMessage) -> TransportResult<()>;

    /// Open (or reopen) the inbox of a node
    async fn open_inbox(&self, node_id: &str) -> TransportResult<Box<dyn AssignmentInbox>>;
}

/// Receiving side, owned by a worker
#[async_trait]
pub trait AssignmentInbox: Send {
    /// Wait up to `wait` for the next message. `Ok(None)` means nothing arrived.
    ///
    /// Callers poll with a bounded wait rather than dropping the future, since
    /// a Redis inbox may already have popped the message.
    async fn recv(&mut self, wait: Duration) -> TransportResult<Option<NodeMessage>>;
}

/// Shared handle to a transport
pub type SharedTransport = Arc<dyn AssignmentTransport>;

/// Build the transport matching the storage backend
pub async fn build_transport(config: &StorageConfig) -> TransportResult<SharedTransport> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(LocalTransport::default())),
        StorageBackend::Redis => {
            let pool = crate::redis_pool::connect(config).await?;
            Ok(Arc::new(RedisTransport::new(pool, &config.key_prefix)))
        }
    }
}
