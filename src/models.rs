//! Core data structures shared by the queue, registry, coordinator and workers
//!
//! These are plain records: every state transition of a [`CrawlTask`] is
//! performed by a [`TaskQueue`](crate::queue::TaskQueue) backend and every
//! mutation of a [`CrawlerNode`] by a [`NodeRegistry`](crate::registry::NodeRegistry).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// Metadata key holding the most recent error message of a task
pub const META_LAST_ERROR: &str = "last_error";

/// Metadata key holding the result summary of a completed task
pub const META_RESULT: &str = "result";

/// Metadata key holding the links discovered by a completed task
pub const META_LINKS: &str = "links";

/// Metadata key listing the node capabilities a task requires
pub const META_REQUIRES: &str = "requires";

/// Default retry budget for new tasks
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ============================================================================
// Task Status
// ============================================================================

/// Lifecycle state of a crawl task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the pending partition
    Pending,
    /// Claimed and dispatched to a node
    Assigned,
    /// Picked up by the worker it was dispatched to
    Running,
    /// Finished successfully
    Completed,
    /// Retry budget exhausted
    Failed,
    /// Failed at least once and waiting in pending again
    Retry,
}

impl TaskStatus {
    /// Queue partition a task in this state must live in
    pub fn partition(&self) -> Partition {
        match self {
            Self::Pending | Self::Retry => Partition::Pending,
            Self::Assigned | Self::Running => Partition::Assigned,
            Self::Completed => Partition::Completed,
            Self::Failed => Partition::Failed,
        }
    }

    /// Whether the task can no longer change state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retry => "retry",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four logical partitions of the task queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Pending,
    Assigned,
    Completed,
    Failed,
}

impl Partition {
    pub fn all() -> [Partition; 4] {
        [Self::Pending, Self::Assigned, Self::Completed, Self::Failed]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

// ============================================================================
// Crawl Task
// ============================================================================

/// A single URL to crawl, tracked through the queue partitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlTask {
    /// Unique task identifier
    pub id: String,

    /// URL to fetch
    pub url: String,

    /// Scheduling priority (higher = more urgent)
    pub priority: i64,

    /// Distance from the seed URL
    pub depth: u32,

    /// Lifecycle state
    pub status: TaskStatus,

    /// Node the task is currently assigned to
    pub assigned_to: Option<String>,

    pub created_at: DateTime<Utc>,

    pub assigned_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Number of failed attempts so far
    pub retry_count: u32,

    /// Failed attempts allowed before the task is moved to failed
    pub max_retries: u32,

    /// Task whose page linked to this URL
    pub parent_task_id: Option<String>,

    /// Open bag for last error, result summary and discovered links
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CrawlTask {
    /// Create a new pending task with a random id
    pub fn new(url: impl Into<String>, priority: i64, depth: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.into(),
            priority,
            depth,
            status: TaskStatus::Pending,
            assigned_to: None,
            created_at: Utc::now(),
            assigned_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            parent_task_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Set an explicit id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Record the task that discovered this URL
    pub fn with_parent(mut self, parent_task_id: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent_task_id.into());
        self
    }

    /// Require node capabilities (e.g. `"browser"`) for this task
    pub fn with_requirements<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let caps: Vec<serde_json::Value> = capabilities
            .into_iter()
            .map(|c| serde_json::Value::String(c.into()))
            .collect();
        self.metadata
            .insert(META_REQUIRES.to_string(), serde_json::Value::Array(caps));
        self
    }

    /// Capabilities a node must advertise to run this task
    pub fn requirements(&self) -> Vec<String> {
        string_list(self.metadata.get(META_REQUIRES))
    }

    /// Links recorded when the task completed
    pub fn links(&self) -> Vec<String> {
        string_list(self.metadata.get(META_LINKS))
    }

    /// Most recent error message
    pub fn last_error(&self) -> Option<&str> {
        self.metadata.get(META_LAST_ERROR).and_then(|v| v.as_str())
    }

    /// Partition implied by the current status
    pub fn partition(&self) -> Partition {
        self.status.partition()
    }

    /// Time since the task was assigned, if it is assigned
    pub fn assignment_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.assigned_at.map(|at| now - at)
    }

    /// Priority after one retry demotion.
    ///
    /// Positive priorities drop by one and stop at zero; zero and negative
    /// priorities (depth-derived BFS priorities) are left untouched.
    pub fn demoted_priority(&self) -> i64 {
        if self.priority > 0 {
            self.priority - 1
        } else {
            self.priority
        }
    }
}

/// Read a JSON array of strings, tolerating missing or malformed values
fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Outcome reported by a worker when a task finishes successfully
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// HTTP status of the fetched page
    pub status_code: u16,

    /// Size of the fetched body in bytes
    pub content_length: usize,

    /// Wall-clock time spent on the fetch
    pub elapsed_ms: u64,

    /// Links discovered on the page
    #[serde(default)]
    pub links: Vec<String>,

    /// Reason the fetch was skipped (e.g. robots.txt)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

impl TaskResult {
    /// Result summary stored under [`META_RESULT`] (links are stored separately)
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "status_code": self.status_code,
            "content_length": self.content_length,
            "elapsed_ms": self.elapsed_ms,
            "links_found": self.links.len(),
            "skipped": self.skipped,
        })
    }
}

// ============================================================================
// Crawler Node
// ============================================================================

/// Role a node plays in the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Coordinator,
    Crawler,
    Parser,
    Storage,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Crawler => "crawler",
            Self::Parser => "parser",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "coordinator" => Ok(Self::Coordinator),
            "crawler" | "worker" => Ok(Self::Crawler),
            "parser" => Ok(Self::Parser),
            "storage" => Ok(Self::Storage),
            other => Err(format!(
                "unknown node role '{other}' (expected coordinator, crawler, parser or storage)"
            )),
        }
    }
}

/// Liveness of a node as seen by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Stale,
}

/// Self-reported performance figures carried by heartbeats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// CPU usage in percent (0-100)
    pub cpu_usage: f64,

    /// Memory usage in percent (0-100)
    pub memory_usage: f64,

    /// Tasks completed since the node started
    pub tasks_completed: u64,

    /// Mean task execution time in seconds
    pub avg_task_time: f64,

    /// Fraction of executed tasks that succeeded (0-1)
    pub success_rate: f64,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            cpu_usage: 0.0,
            memory_usage: 0.0,
            tasks_completed: 0,
            avg_task_time: 0.0,
            success_rate: 1.0,
        }
    }
}

/// A worker or coordinator process known to the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlerNode {
    pub id: String,

    pub role: NodeRole,

    pub host: String,

    pub port: u16,

    pub status: NodeStatus,

    /// Free-form capability tags (e.g. `"http"`, `"browser"`)
    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    pub max_concurrent_tasks: u32,

    pub current_tasks: u32,

    pub last_heartbeat: DateTime<Utc>,

    #[serde(default)]
    pub performance_metrics: PerformanceMetrics,
}

impl CrawlerNode {
    /// Create a node record with default metrics
    pub fn new(
        id: impl Into<String>,
        role: NodeRole,
        host: impl Into<String>,
        port: u16,
        max_concurrent_tasks: u32,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            host: host.into(),
            port,
            status: NodeStatus::Active,
            capabilities: BTreeSet::new(),
            max_concurrent_tasks,
            current_tasks: 0,
            last_heartbeat: Utc::now(),
            performance_metrics: PerformanceMetrics::default(),
        }
    }

    /// Add a capability tag
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Whether the node can accept another task
    pub fn has_capacity(&self) -> bool {
        self.current_tasks < self.max_concurrent_tasks
    }

    /// Age of the most recent heartbeat
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_heartbeat
    }

    /// A node is stale once its heartbeat age reaches the threshold
    pub fn is_stale_at(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.heartbeat_age(now) >= threshold
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Operator-facing view of the node
    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            id: self.id.clone(),
            role: self.role,
            address: self.address(),
            status: self.status,
            current_tasks: self.current_tasks,
            max_concurrent_tasks: self.max_concurrent_tasks,
            last_heartbeat: self.last_heartbeat,
            seconds_since_heartbeat: self.heartbeat_age(Utc::now()).num_seconds(),
            performance_metrics: self.performance_metrics.clone(),
        }
    }
}

/// Summary of a node returned by the control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: String,
    pub role: NodeRole,
    pub address: String,
    pub status: NodeStatus,
    pub current_tasks: u32,
    pub max_concurrent_tasks: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub seconds_since_heartbeat: i64,
    pub performance_metrics: PerformanceMetrics,
}
