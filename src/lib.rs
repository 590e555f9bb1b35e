//! fleetcrawl - distributed web-crawl coordinator
//!
//! A coordinator hands crawl tasks from a shared priority queue to a fleet of
//! worker nodes, tracks node liveness through heartbeats and recovers tasks
//! from nodes that stall or disappear.
//!
//! # Architecture
//!
//! - [`queue`] - Priority task queue with pending/assigned/completed/failed partitions
//! - [`registry`] - Node registry with heartbeats and stale-node eviction
//! - [`balancer`] - Capacity and performance aware node selection
//! - [`transport`] - Per-node assignment inboxes
//! - [`coordinator`] - Assignment and monitor loops, HTTP control API
//! - [`worker`] - Task listener, execution pool and heartbeat sender
//! - [`frontier`] - BFS, DFS, priority and adaptive traversal policies
//! - [`fetcher`] - HTTP fetching, robots.txt and politeness
//! - [`cluster`] - One coordinator and N workers in a single process
//!
//! Queue, registry and transport each have an in-memory backend and a Redis
//! backend selected by [`config::StorageConfig`].
//!
//! # Example
//!
//! ```no_run
//! use fleetcrawl::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let visitor = Arc::new(PoliteFetcher::from_config(&config.crawler)?);
//!     let cluster = LocalCluster::start(&config, 4, visitor).await?;
//!     cluster.seed(&[Seed::new("https://example.com/")]).await?;
//!     cluster
//!         .wait_until_drained(Duration::from_millis(200), Duration::from_secs(600))
//!         .await?;
//!     cluster.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod balancer;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod frontier;
pub mod metrics;
pub mod models;
pub mod politeness;
pub mod queue;
pub mod redis_pool;
pub mod registry;
pub mod transport;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::LocalCluster;
    pub use crate::config::Config;
    pub use crate::coordinator::Coordinator;
    pub use crate::error::{Error, ErrorCategory, FleetErrorTrait, Result};
    pub use crate::fetcher::{PageVisitor, PoliteFetcher};
    pub use crate::frontier::{Seed, TraversalStrategy};
    pub use crate::models::{CrawlTask, CrawlerNode, NodeRole, TaskStatus};
    pub use crate::queue::{QueueStats, TaskQueue};
    pub use crate::registry::NodeRegistry;
    pub use crate::worker::WorkerNode;
}

// Direct re-exports for convenience
pub use models::{CrawlTask, CrawlerNode, NodeRole, TaskStatus};
