//! Configuration management for fleetcrawl
//!
//! Configuration is built once at startup (from a TOML file or `FLEET_*`
//! environment variables), validated, and injected into every component.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::error::{ErrorCategory, FleetErrorTrait};
use crate::frontier::TraversalStrategy;
use crate::models::NodeRole;

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config file {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl FleetErrorTrait for ConfigError {
    fn is_recoverable(&self) -> bool {
        false
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Config
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Crawl behaviour (politeness, limits, fetch settings)
    pub crawler: CrawlerConfig,

    /// Node identity and cluster timing
    pub cluster: ClusterConfig,

    /// Shared state backend
    pub storage: StorageConfig,

    /// Control API
    pub api: ApiConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Crawler-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Concurrency limit for single-process traversal
    pub max_concurrency: usize,

    /// Minimum delay between two requests to the same host
    pub delay_ms: u64,

    /// Consult robots.txt before fetching
    pub respect_robots: bool,

    /// Deepest link depth admitted to the frontier
    pub max_depth: u32,

    /// Total pages admitted to the frontier per run
    pub max_pages: usize,

    /// Retry budget given to new tasks
    pub max_retries: u32,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Per-task execution timeout on workers
    pub task_timeout_secs: u64,

    /// User agent string
    pub user_agent: String,

    /// Global request rate limit per process
    pub requests_per_second: u32,

    /// Traversal policy used by the frontier
    pub strategy: TraversalStrategy,

    /// Substrings marking high-value URLs for the adaptive policy
    pub high_value_patterns: Vec<String>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            delay_ms: 1000,
            respect_robots: true,
            max_depth: 3,
            max_pages: 1000,
            max_retries: 3,
            request_timeout_secs: 30,
            task_timeout_secs: 60,
            user_agent: format!("fleetcrawl/{}", env!("CARGO_PKG_VERSION")),
            requests_per_second: 10,
            strategy: TraversalStrategy::Bfs,
            high_value_patterns: Vec::new(),
        }
    }
}

impl CrawlerConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

/// Node identity and cluster timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Unique node id (generated when absent)
    pub node_id: String,

    pub node_role: NodeRole,

    /// Address advertised in the registry
    pub host: String,

    pub port: u16,

    pub heartbeat_interval_secs: u64,

    pub monitor_interval_secs: u64,

    /// Age after which an assigned task is considered stuck
    pub stuck_task_timeout_secs: u64,

    /// Assignment loop back-off when no node has capacity
    pub no_capacity_backoff_ms: u64,

    /// Assignment loop sleep when the queue is empty
    pub idle_poll_ms: u64,

    /// Worker concurrency (also advertised to the registry)
    pub max_concurrent_tasks: u32,

    pub capabilities: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", uuid::Uuid::new_v4().simple()),
            node_role: NodeRole::Crawler,
            host: String::from("127.0.0.1"),
            port: 0,
            heartbeat_interval_secs: 30,
            monitor_interval_secs: 30,
            stuck_task_timeout_secs: 300,
            no_capacity_backoff_ms: 5000,
            idle_poll_ms: 100,
            max_concurrent_tasks: 10,
            capabilities: vec![String::from("http")],
        }
    }
}

impl ClusterConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Heartbeat age at which a node is evicted (2x the interval)
    pub fn staleness_threshold(&self) -> Duration {
        self.heartbeat_interval() * 2
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn stuck_task_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_task_timeout_secs)
    }

    pub fn no_capacity_backoff(&self) -> Duration {
        Duration::from_millis(self.no_capacity_backoff_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

/// Shared state backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Single-process, in-memory queue and registry
    Memory,
    /// Redis-backed queue, registry and inboxes
    Redis,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    pub redis_url: String,

    /// Maximum pool size
    pub pool_size: usize,

    /// Prefix for every Redis key
    pub key_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            redis_url: String::from("redis://127.0.0.1:6379"),
            pool_size: 16,
            key_prefix: String::from("fleetcrawl"),
        }
    }
}

/// Control API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,

    pub enable_cors: bool,

    pub enable_request_logging: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: String::from("0.0.0.0:8080"),
            enable_cors: true,
            enable_request_logging: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

impl Config {
    /// Load configuration from `FLEET_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let crawler = &mut config.crawler;
        if let Some(v) = env_parse("FLEET_MAX_CONCURRENCY") {
            crawler.max_concurrency = v;
        }
        if let Some(v) = env_parse("FLEET_DELAY_MS") {
            crawler.delay_ms = v;
        }
        if let Some(v) = env_bool("FLEET_RESPECT_ROBOTS") {
            crawler.respect_robots = v;
        }
        if let Some(v) = env_parse("FLEET_MAX_DEPTH") {
            crawler.max_depth = v;
        }
        if let Some(v) = env_parse("FLEET_MAX_PAGES") {
            crawler.max_pages = v;
        }
        if let Some(v) = env_parse("FLEET_MAX_RETRIES") {
            crawler.max_retries = v;
        }
        if let Some(v) = env_parse("FLEET_REQUEST_TIMEOUT") {
            crawler.request_timeout_secs = v;
        }
        if let Some(v) = env_parse("FLEET_TASK_TIMEOUT") {
            crawler.task_timeout_secs = v;
        }
        if let Ok(v) = std::env::var("FLEET_USER_AGENT") {
            crawler.user_agent = v;
        }
        if let Some(v) = env_parse("FLEET_REQUESTS_PER_SECOND") {
            crawler.requests_per_second = v;
        }
        if let Ok(v) = std::env::var("FLEET_STRATEGY") {
            crawler.strategy = v.parse().map_err(|reason| ConfigError::InvalidValue {
                field: "strategy",
                reason,
            })?;
        }
        if let Some(v) = env_list("FLEET_HIGH_VALUE_PATTERNS") {
            crawler.high_value_patterns = v;
        }

        let cluster = &mut config.cluster;
        if let Ok(v) = std::env::var("FLEET_NODE_ID") {
            cluster.node_id = v;
        }
        if let Ok(v) = std::env::var("FLEET_NODE_ROLE") {
            cluster.node_role = v.parse().map_err(|reason| ConfigError::InvalidValue {
                field: "node_role",
                reason,
            })?;
        }
        if let Ok(v) = std::env::var("FLEET_HOST") {
            cluster.host = v;
        }
        if let Some(v) = env_parse("FLEET_PORT") {
            cluster.port = v;
        }
        if let Some(v) = env_parse("FLEET_HEARTBEAT_INTERVAL") {
            cluster.heartbeat_interval_secs = v;
        }
        if let Some(v) = env_parse("FLEET_MONITOR_INTERVAL") {
            cluster.monitor_interval_secs = v;
        }
        if let Some(v) = env_parse("FLEET_STUCK_TASK_TIMEOUT") {
            cluster.stuck_task_timeout_secs = v;
        }
        if let Some(v) = env_parse("FLEET_NO_CAPACITY_BACKOFF_MS") {
            cluster.no_capacity_backoff_ms = v;
        }
        if let Some(v) = env_parse("FLEET_IDLE_POLL_MS") {
            cluster.idle_poll_ms = v;
        }
        if let Some(v) = env_parse("FLEET_MAX_CONCURRENT_TASKS") {
            cluster.max_concurrent_tasks = v;
        }
        if let Some(v) = env_list("FLEET_CAPABILITIES") {
            cluster.capabilities = v;
        }

        let storage = &mut config.storage;
        if let Ok(v) = std::env::var("FLEET_STORAGE_BACKEND") {
            storage.backend = match v.to_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                "redis" => StorageBackend::Redis,
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: "storage.backend",
                        reason: format!("unknown backend '{other}'"),
                    })
                }
            };
        }
        if let Ok(v) = std::env::var("REDIS_URL").or_else(|_| std::env::var("FLEET_REDIS_URL")) {
            storage.redis_url = v;
        }
        if let Some(v) = env_parse("FLEET_REDIS_POOL_SIZE") {
            storage.pool_size = v;
        }
        if let Ok(v) = std::env::var("FLEET_KEY_PREFIX") {
            storage.key_prefix = v;
        }

        if let Ok(v) = std::env::var("FLEET_API_BIND") {
            config.api.bind_address = v;
        }
        if let Some(v) = env_bool("FLEET_API_CORS") {
            config.api.enable_cors = v;
        }

        if let Ok(v) = std::env::var("FLEET_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("FLEET_LOG_FORMAT") {
            config.logging.format = v;
        }

        Ok(config)
    }

    /// Load configuration from a TOML file; missing sections take defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> ConfigError {
            ConfigError::InvalidValue {
                field,
                reason: reason.to_string(),
            }
        }

        if self.crawler.max_concurrency == 0 {
            return Err(invalid("max_concurrency", "must be greater than 0"));
        }
        if self.crawler.max_pages == 0 {
            return Err(invalid("max_pages", "must be greater than 0"));
        }
        if self.crawler.requests_per_second == 0 {
            return Err(invalid("requests_per_second", "must be greater than 0"));
        }
        if self.crawler.task_timeout_secs == 0 {
            return Err(invalid("task_timeout_secs", "must be greater than 0"));
        }
        if self.cluster.node_id.trim().is_empty() {
            return Err(invalid("node_id", "must not be empty"));
        }
        if self.cluster.heartbeat_interval_secs == 0 {
            return Err(invalid("heartbeat_interval_secs", "must be greater than 0"));
        }
        if self.cluster.monitor_interval_secs == 0 {
            return Err(invalid("monitor_interval_secs", "must be greater than 0"));
        }
        // the coordinator heartbeats from its monitor pass
        if self.cluster.monitor_interval_secs >= 2 * self.cluster.heartbeat_interval_secs {
            return Err(invalid(
                "monitor_interval_secs",
                "must be shorter than twice heartbeat_interval_secs",
            ));
        }
        if self.cluster.max_concurrent_tasks == 0 && self.cluster.node_role == NodeRole::Crawler {
            return Err(invalid(
                "max_concurrent_tasks",
                "crawler nodes need at least one task slot",
            ));
        }
        if self.storage.backend == StorageBackend::Redis {
            if self.storage.pool_size == 0 {
                return Err(invalid("pool_size", "must be greater than 0"));
            }
            if !self.storage.redis_url.starts_with("redis://")
                && !self.storage.redis_url.starts_with("rediss://")
            {
                return Err(invalid("redis_url", "must start with redis:// or rediss://"));
            }
        }

        Ok(())
    }
}
