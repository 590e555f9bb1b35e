//! Redis registry backend
//!
//! Each node is a hash at `{prefix}:node:{id}` with the fields
//! `record` (node JSON at registration), `current_tasks`, `heartbeat_ms`
//! and `metrics` (JSON). The set `{prefix}:nodes` indexes node ids.
//! Read-modify-write steps are Lua scripts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::Pool;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tokio::sync::broadcast;

use super::{
    apply_status, chrono_threshold, validate_node, HeartbeatReport, NodeRegistry, RegistryError,
    RegistryEvent, RegistryResult, EVENT_CHANNEL_CAPACITY,
};
use crate::models::{CrawlerNode, NodeStatus, PerformanceMetrics};
use crate::redis_pool::key;

const HEARTBEAT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], 'heartbeat_ms', ARGV[1], 'metrics', ARGV[2])
if ARGV[3] ~= '' then
  redis.call('HSET', KEYS[1], 'current_tasks', ARGV[3])
end
return 1
"#;

const COUNTER_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -1
end
local value = redis.call('HINCRBY', KEYS[1], 'current_tasks', ARGV[1])
if value < 0 then
  redis.call('HSET', KEYS[1], 'current_tasks', 0)
  value = 0
end
return value
"#;

// Returns flat groups of (id, record, current_tasks, heartbeat_ms, metrics)
const EVICT_SCRIPT: &str = r#"
local evicted = {}
local now = tonumber(ARGV[2])
local threshold = tonumber(ARGV[3])
for _, id in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  local node_key = ARGV[1] .. id
  local fields = redis.call('HMGET', node_key, 'record', 'current_tasks', 'heartbeat_ms', 'metrics')
  local heartbeat = tonumber(fields[3] or '0') or 0
  if now - heartbeat >= threshold then
    redis.call('DEL', node_key)
    redis.call('SREM', KEYS[1], id)
    table.insert(evicted, id)
    table.insert(evicted, fields[1] or '')
    table.insert(evicted, fields[2] or '0')
    table.insert(evicted, fields[3] or '0')
    table.insert(evicted, fields[4] or '')
  end
end
return evicted
"#;

type NodeFields = (
    Option<String>,
    Option<u32>,
    Option<i64>,
    Option<String>,
);

fn storage(operation: &'static str) -> impl FnOnce(redis::RedisError) -> RegistryError {
    move |source| RegistryError::Storage { operation, source }
}

/// Multi-process registry backed by Redis
pub struct RedisRegistry {
    pool: Pool,
    prefix: String,
    nodes_key: String,
    heartbeat_interval: Duration,
    events: broadcast::Sender<RegistryEvent>,
    heartbeat_script: Script,
    counter_script: Script,
    evict_script: Script,
}

impl RedisRegistry {
    pub fn new(pool: Pool, prefix: &str, heartbeat_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            pool,
            prefix: prefix.to_string(),
            nodes_key: key(prefix, "nodes"),
            heartbeat_interval,
            events,
            heartbeat_script: Script::new(HEARTBEAT_SCRIPT),
            counter_script: Script::new(COUNTER_SCRIPT),
            evict_script: Script::new(EVICT_SCRIPT),
        }
    }

    fn node_key_prefix(&self) -> String {
        key(&self.prefix, "node:")
    }

    fn node_key(&self, node_id: &str) -> String {
        format!("{}{}", self.node_key_prefix(), node_id)
    }

    /// Rebuild a node from its stored hash fields
    fn assemble(node_id: &str, fields: NodeFields) -> RegistryResult<Option<CrawlerNode>> {
        let (record, current_tasks, heartbeat_ms, metrics) = fields;
        let Some(record) = record.filter(|r| !r.is_empty()) else {
            return Ok(None);
        };

        let decode_err = |e: serde_json::Error| RegistryError::Serialization {
            node_id: node_id.to_string(),
            reason: e.to_string(),
        };
        let mut node: CrawlerNode = serde_json::from_str(&record).map_err(decode_err)?;

        node.current_tasks = current_tasks.unwrap_or(0);
        if let Some(ms) = heartbeat_ms {
            node.last_heartbeat = DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(node.last_heartbeat);
        }
        if let Some(metrics) = metrics.filter(|m| !m.is_empty()) {
            node.performance_metrics =
                serde_json::from_str::<PerformanceMetrics>(&metrics).map_err(decode_err)?;
        }
        Ok(Some(node))
    }

    fn publish(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl NodeRegistry for RedisRegistry {
    async fn register(&self, node: CrawlerNode) -> RegistryResult<()> {
        validate_node(&node)?;

        let mut node = node;
        node.last_heartbeat = Utc::now();
        node.status = NodeStatus::Active;

        let encode_err = |e: serde_json::Error| RegistryError::Serialization {
            node_id: node.id.clone(),
            reason: e.to_string(),
        };
        let record = serde_json::to_string(&node).map_err(encode_err)?;
        let metrics = serde_json::to_string(&node.performance_metrics).map_err(encode_err)?;

        let mut conn = self.pool.get().await?;
        let _: () = redis::pipe()
            .atomic()
            .del(self.node_key(&node.id))
            .ignore()
            .hset_multiple(
                self.node_key(&node.id),
                &[
                    ("record", record),
                    ("current_tasks", node.current_tasks.to_string()),
                    ("heartbeat_ms", node.last_heartbeat.timestamp_millis().to_string()),
                    ("metrics", metrics),
                ],
            )
            .ignore()
            .sadd(&self.nodes_key, &node.id)
            .ignore()
            .query_async(&mut *conn)
            .await
            .map_err(storage("register"))?;

        tracing::info!(node = %node.id, role = %node.role, "Node registered");
        self.publish(RegistryEvent::Registered {
            node_id: node.id.clone(),
            role: node.role,
        });
        Ok(())
    }

    async fn heartbeat(&self, node_id: &str, report: HeartbeatReport) -> RegistryResult<()> {
        let metrics =
            serde_json::to_string(&report.metrics).map_err(|e| RegistryError::Serialization {
                node_id: node_id.to_string(),
                reason: e.to_string(),
            })?;

        let mut conn = self.pool.get().await?;
        let updated: i64 = self
            .heartbeat_script
            .key(self.node_key(node_id))
            .arg(Utc::now().timestamp_millis())
            .arg(metrics)
            .arg(report.current_tasks.map(|c| c.to_string()).unwrap_or_default())
            .invoke_async(&mut *conn)
            .await
            .map_err(storage("heartbeat"))?;

        if updated == 0 {
            return Err(RegistryError::NodeNotFound(node_id.to_string()));
        }
        Ok(())
    }

    async fn update_counters(&self, node_id: &str, delta: i64) -> RegistryResult<u32> {
        let mut conn = self.pool.get().await?;
        let value: i64 = self
            .counter_script
            .key(self.node_key(node_id))
            .arg(delta)
            .invoke_async(&mut *conn)
            .await
            .map_err(storage("update_counters"))?;

        if value < 0 {
            return Err(RegistryError::NodeNotFound(node_id.to_string()));
        }
        Ok(u32::try_from(value).unwrap_or(u32::MAX))
    }

    async fn snapshot(&self) -> RegistryResult<Vec<CrawlerNode>> {
        let mut conn = self.pool.get().await?;
        let ids: Vec<String> = conn
            .smembers(&self.nodes_key)
            .await
            .map_err(storage("snapshot"))?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.cmd("HMGET")
                .arg(self.node_key(id))
                .arg("record")
                .arg("current_tasks")
                .arg("heartbeat_ms")
                .arg("metrics");
        }
        let rows: Vec<NodeFields> = pipe
            .query_async(&mut *conn)
            .await
            .map_err(storage("snapshot"))?;

        let now = Utc::now();
        let threshold = chrono_threshold(self.staleness_threshold());
        let mut nodes = Vec::with_capacity(ids.len());
        for (id, fields) in ids.iter().zip(rows) {
            match Self::assemble(id, fields) {
                Ok(Some(mut node)) => {
                    apply_status(&mut node, now, threshold);
                    nodes.push(node);
                }
                Ok(None) => {}
                Err(e) => tracing::error!(node = %id, error = %e, "Skipping undecodable node"),
            }
        }
        Ok(nodes)
    }

    async fn evict_stale(&self) -> RegistryResult<Vec<CrawlerNode>> {
        let threshold_ms = i64::try_from(self.staleness_threshold().as_millis()).unwrap_or(i64::MAX);

        let mut conn = self.pool.get().await?;
        let flat: Vec<String> = self
            .evict_script
            .key(&self.nodes_key)
            .arg(self.node_key_prefix())
            .arg(Utc::now().timestamp_millis())
            .arg(threshold_ms)
            .invoke_async(&mut *conn)
            .await
            .map_err(storage("evict_stale"))?;

        let mut evicted = Vec::new();
        for group in flat.chunks(5) {
            let [id, record, current, heartbeat, metrics] = group else {
                continue;
            };
            let fields: NodeFields = (
                Some(record.clone()),
                current.parse().ok(),
                heartbeat.parse().ok(),
                Some(metrics.clone()),
            );
            let node = match Self::assemble(id, fields) {
                Ok(Some(mut node)) => {
                    node.status = NodeStatus::Stale;
                    node
                }
                Ok(None) | Err(_) => {
                    let mut node = CrawlerNode::new(
                        id.clone(),
                        crate::models::NodeRole::Crawler,
                        "",
                        0,
                        0,
                    );
                    node.status = NodeStatus::Stale;
                    node
                }
            };

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
            evicted.push(node);
        }
        Ok(evicted)
    }

    async fn remove(&self, node_id: &str) -> RegistryResult<Option<CrawlerNode>> {
        let existing = self.get(node_id).await?;

        let mut conn = self.pool.get().await?;
        let (deleted, _): (i64, i64) = redis::pipe()
            .atomic()
            .del(self.node_key(node_id))
            .srem(&self.nodes_key, node_id)
            .query_async(&mut *conn)
            .await
            .map_err(storage("remove"))?;

        if deleted > 0 {
            tracing::info!(node = %node_id, "Node deregistered");
            self.publish(RegistryEvent::Removed {
                node_id: node_id.to_string(),
            });
        }
        Ok(existing)
    }

    async fn get(&self, node_id: &str) -> RegistryResult<Option<CrawlerNode>> {
        let mut conn = self.pool.get().await?;
        let fields: NodeFields = redis::cmd("HMGET")
            .arg(self.node_key(node_id))
            .arg("record")
            .arg("current_tasks")
            .arg("heartbeat_ms")
            .arg("metrics")
            .query_async(&mut *conn)
            .await
            .map_err(storage("get"))?;

        let now = Utc::now();
        let threshold = chrono_threshold(self.staleness_threshold());
        Ok(Self::assemble(node_id, fields)?.map(|mut node| {
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
