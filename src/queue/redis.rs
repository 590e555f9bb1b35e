//! Redis queue backend
//!
//! Layout (all keys under the configured prefix):
//!
//! | key                | type | content                                  |
//! |--------------------|------|------------------------------------------|
//! | `{p}:tasks`        | hash | task id → task JSON                      |
//! | `{p}:pending`      | zset | `{seq:020}:{id}` scored by `-priority`   |
//! | `{p}:assigned`     | hash | task id → claim time (ms)                |
//! | `{p}:completed`    | list | task ids in completion order             |
//! | `{p}:failed`       | set  | task ids                                 |
//! | `{p}:seq`          | str  | submission counter                       |
//! | `{p}:order`        | hash | live task id → its pending member        |
//! | `{p}:errors`       | hash | task id → quarantine reason              |
//!
//! Equal scores in a sorted set are ordered lexicographically by member, so
//! the zero-padded sequence prefix gives FIFO order within a priority.
//! Every mutation is a Lua script and therefore atomic on the server.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use deadpool_redis::Pool;
use redis::{AsyncCommands, Script, ScriptInvocation};

use super::{
    validate_task, warn_not_assigned, CompletedBatch, EnqueueOutcome, QueueError, QueueResult,
    QueueStats, TaskQueue, Transition,
};
use crate::models::{CrawlTask, TaskResult, TaskStatus, META_LAST_ERROR};
use crate::redis_pool::key;

/// Claims skipped over for orphaned or corrupt entries before giving up
const MAX_CLAIM_SKIPS: usize = 16;

// KEYS: tasks, pending, assigned, completed, failed, seq, order, errors

const ENQUEUE_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
  return 0
end
local seq = redis.call('INCR', KEYS[6])
local member = string.format('%020d', seq) .. ':' .. ARGV[1]
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[7], ARGV[1], member)
redis.call('ZADD', KEYS[2], -tonumber(ARGV[3]), member)
return 1
"#;

const CLAIM_SCRIPT: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[2])
if #popped == 0 then
  return false
end
local id = string.sub(popped[1], 22)
local raw = redis.call('HGET', KEYS[1], id)
if not raw then
  return {id, ''}
end
redis.call('HSET', KEYS[3], id, ARGV[3])
local ok, task = pcall(cjson.decode, raw)
if not ok then
  return {id, raw}
end
task['status'] = 'assigned'
task['assigned_to'] = ARGV[1]
task['assigned_at'] = ARGV[2]
local encoded = cjson.encode(task)
redis.call('HSET', KEYS[1], id, encoded)
return {id, encoded}
"#;

const TRANSFER_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[3], ARGV[1]) == 0 then
  return 0
end
local task = cjson.decode(redis.call('HGET', KEYS[1], ARGV[1]))
if ARGV[2] ~= '' then
  task['assigned_to'] = ARGV[2]
end
if ARGV[3] ~= '' then
  task['status'] = ARGV[3]
end
redis.call('HSET', KEYS[1], ARGV[1], cjson.encode(task))
return 1
"#;

const COMPLETE_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[3], ARGV[1]) == 0 then
  return 0
end
local task = cjson.decode(redis.call('HGET', KEYS[1], ARGV[1]))
if type(task['metadata']) ~= 'table' then
  task['metadata'] = {}
end
task['status'] = 'completed'
task['completed_at'] = ARGV[2]
task['metadata']['result'] = cjson.decode(ARGV[3])
if ARGV[4] ~= '' then
  task['metadata']['links'] = cjson.decode(ARGV[4])
end
redis.call('HSET', KEYS[1], ARGV[1], cjson.encode(task))
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[7], ARGV[1])
redis.call('RPUSH', KEYS[4], ARGV[1])
return 1
"#;

const FAIL_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[3], ARGV[1]) == 0 then
  return {0, 0, 0}
end
local task = cjson.decode(redis.call('HGET', KEYS[1], ARGV[1]))
if type(task['metadata']) ~= 'table' then
  task['metadata'] = {}
end
redis.call('HDEL', KEYS[3], ARGV[1])
task['retry_count'] = task['retry_count'] + 1
task['metadata']['last_error'] = ARGV[2]
if task['retry_count'] < task['max_retries'] then
  if task['priority'] > 0 then
    task['priority'] = task['priority'] - 1
  end
  task['status'] = 'retry'
  task['assigned_to'] = cjson.null
  task['assigned_at'] = cjson.null
  local seq = redis.call('INCR', KEYS[6])
  local member = string.format('%020d', seq) .. ':' .. ARGV[1]
  redis.call('HSET', KEYS[1], ARGV[1], cjson.encode(task))
  redis.call('HSET', KEYS[7], ARGV[1], member)
  redis.call('ZADD', KEYS[2], -task['priority'], member)
  return {1, task['retry_count'], task['priority']}
end
task['status'] = 'failed'
task['completed_at'] = ARGV[3]
redis.call('HSET', KEYS[1], ARGV[1], cjson.encode(task))
redis.call('HDEL', KEYS[7], ARGV[1])
redis.call('SADD', KEYS[5], ARGV[1])
return {2, task['retry_count'], task['priority']}
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[3], ARGV[1]) == 0 then
  return 0
end
local task = cjson.decode(redis.call('HGET', KEYS[1], ARGV[1]))
task['status'] = 'pending'
task['assigned_to'] = cjson.null
task['assigned_at'] = cjson.null
local member = redis.call('HGET', KEYS[7], ARGV[1])
if not member then
  local seq = redis.call('INCR', KEYS[6])
  member = string.format('%020d', seq) .. ':' .. ARGV[1]
  redis.call('HSET', KEYS[7], ARGV[1], member)
end
redis.call('HSET', KEYS[1], ARGV[1], cjson.encode(task))
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZADD', KEYS[2], -task['priority'], member)
return 1
"#;

const QUARANTINE_SCRIPT: &str = r#"
redis.call('HDEL', KEYS[3], ARGV[1])
if ARGV[3] ~= '' then
  redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[3])
end
redis.call('HDEL', KEYS[7], ARGV[1])
redis.call('SADD', KEYS[5], ARGV[1])
redis.call('HSET', KEYS[8], ARGV[1], ARGV[2])
return 1
"#;

struct QueueKeys {
    tasks: String,
    pending: String,
    assigned: String,
    completed: String,
    failed: String,
    seq: String,
    order: String,
    errors: String,
}

impl QueueKeys {
    fn new(prefix: &str) -> Self {
        Self {
            tasks: key(prefix, "tasks"),
            pending: key(prefix, "pending"),
            assigned: key(prefix, "assigned"),
            completed: key(prefix, "completed"),
            failed: key(prefix, "failed"),
            seq: key(prefix, "seq"),
            order: key(prefix, "order"),
            errors: key(prefix, "errors"),
        }
    }

    /// Keys in the order every script expects them
    fn ordered(&self) -> [&str; 8] {
        [
            &self.tasks,
            &self.pending,
            &self.assigned,
            &self.completed,
            &self.failed,
            &self.seq,
            &self.order,
            &self.errors,
        ]
    }
}

struct Scripts {
    enqueue: Script,
    claim: Script,
    transfer: Script,
    complete: Script,
    fail: Script,
    release: Script,
    quarantine: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE_SCRIPT),
            claim: Script::new(CLAIM_SCRIPT),
            transfer: Script::new(TRANSFER_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
            fail: Script::new(FAIL_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            quarantine: Script::new(QUARANTINE_SCRIPT),
        }
    }
}

fn storage(operation: &'static str) -> impl FnOnce(redis::RedisError) -> QueueError {
    move |source| QueueError::Storage { operation, source }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Multi-process queue backed by Redis
pub struct RedisQueue {
    pool: Pool,
    keys: QueueKeys,
    scripts: Scripts,
}

impl RedisQueue {
    pub fn new(pool: Pool, prefix: &str) -> Self {
        Self {
            pool,
            keys: QueueKeys::new(prefix),
            scripts: Scripts::load(),
        }
    }

    fn invocation<'a>(&self, script: &'a Script) -> ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        for k in self.keys.ordered() {
            invocation.key(k);
        }
        invocation
    }

    fn decode(task_id: &str, raw: &str) -> QueueResult<CrawlTask> {
        serde_json::from_str(raw).map_err(|e| QueueError::Serialization {
            task_id: task_id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Move a task straight to failed, recording why
    async fn quarantine(&self, task_id: &str, reason: &str, record: Option<&str>) -> QueueResult<()> {
        tracing::error!(task_id = %task_id, reason = %reason, "Moving undecodable task to failed");
        let mut conn = self.pool.get().await?;
        let mut invocation = self.invocation(&self.scripts.quarantine);
        invocation.arg(task_id).arg(reason).arg(record.unwrap_or(""));
        let _: i64 = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(storage("quarantine"))?;
        Ok(())
    }

    async fn update_assigned(
        &self,
        operation: &'static str,
        task_id: &str,
        node_id: Option<&str>,
        status: Option<TaskStatus>,
    ) -> QueueResult<bool> {
        let mut conn = self.pool.get().await?;
        let mut invocation = self.invocation(&self.scripts.transfer);
        invocation
            .arg(task_id)
            .arg(node_id.unwrap_or(""))
            .arg(status.map(|s| s.as_str()).unwrap_or(""));
        let updated: i64 = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(storage(operation))?;
        Ok(updated == 1)
    }

    /// Fetch and decode task records, logging the ones that fail to decode
    async fn load_many(&self, ids: &[String]) -> QueueResult<Vec<CrawlTask>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await?;
        let raws: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&self.keys.tasks)
            .arg(ids)
            .query_async(&mut *conn)
            .await
            .map_err(storage("load"))?;

        let mut tasks = Vec::with_capacity(ids.len());
        for (id, raw) in ids.iter().zip(raws) {
            match raw.as_deref().map(|r| Self::decode(id, r)) {
                Some(Ok(task)) => tasks.push(task),
                Some(Err(e)) => tracing::error!(task_id = %id, error = %e, "Skipping undecodable task"),
                None => tracing::warn!(task_id = %id, "Task record missing"),
            }
        }
        Ok(tasks)
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn enqueue(&self, task: CrawlTask) -> QueueResult<EnqueueOutcome> {
        validate_task(&task)?;

        let mut task = task;
        task.status = TaskStatus::Pending;
        task.assigned_to = None;
        task.assigned_at = None;

        let json = match serde_json::to_string(&task) {
            Ok(json) => json,
            Err(e) => {
                let reason = format!("serialization error: {e}");
                let mut stub = task.clone();
                stub.metadata.clear();
                stub.metadata
                    .insert(META_LAST_ERROR.to_string(), serde_json::json!(reason));
                stub.status = TaskStatus::Failed;
                let record = serde_json::to_string(&stub).map_err(|e| QueueError::Serialization {
                    task_id: task.id.clone(),
                    reason: e.to_string(),
                })?;
                self.quarantine(&task.id, &reason, Some(&record)).await?;
                return Ok(EnqueueOutcome::Quarantined);
            }
        };

        let mut conn = self.pool.get().await?;
        let mut invocation = self.invocation(&self.scripts.enqueue);
        invocation.arg(&task.id).arg(json).arg(task.priority);
        let inserted: i64 = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(storage("enqueue"))?;

        if inserted == 1 {
            Ok(EnqueueOutcome::Inserted)
        } else {
            tracing::debug!(task_id = %task.id, "Duplicate task id, skipping enqueue");
            Ok(EnqueueOutcome::Duplicate)
        }
    }

    async fn claim(&self, node_id: &str) -> QueueResult<Option<CrawlTask>> {
        for _ in 0..MAX_CLAIM_SKIPS {
            let reply: Option<(String, String)> = {
                let mut conn = self.pool.get().await?;
                let now = Utc::now();
                let mut invocation = self.invocation(&self.scripts.claim);
                invocation
                    .arg(node_id)
                    .arg(now.to_rfc3339_opts(SecondsFormat::Micros, true))
                    .arg(now.timestamp_millis());
                invocation
                    .invoke_async(&mut *conn)
                    .await
                    .map_err(storage("claim"))?
            };

            let Some((task_id, raw)) = reply else {
                return Ok(None);
            };
            if raw.is_empty() {
                tracing::warn!(task_id = %task_id, "Dropping pending entry without a task record");
                continue;
            }
            match Self::decode(&task_id, &raw) {
                Ok(task) => return Ok(Some(task)),
                Err(e) => {
                    self.quarantine(&task_id, &e.to_string(), None).await?;
                }
            }
        }
        Err(QueueError::Protocol(format!(
            "claim skipped {MAX_CLAIM_SKIPS} unusable entries"
        )))
    }

    async fn transfer(&self, task_id: &str, node_id: &str) -> QueueResult<Transition> {
        if self
            .update_assigned("transfer", task_id, Some(node_id), None)
            .await?
        {
            Ok(Transition::Transferred)
        } else {
            warn_not_assigned("transfer", task_id);
            Ok(Transition::Ignored)
        }
    }

    async fn start(&self, task_id: &str) -> QueueResult<Transition> {
        if self
            .update_assigned("start", task_id, None, Some(TaskStatus::Running))
            .await?
        {
            Ok(Transition::Started)
        } else {
            warn_not_assigned("start", task_id);
            Ok(Transition::Ignored)
        }
    }

    async fn complete(&self, task_id: &str, result: TaskResult) -> QueueResult<Transition> {
        let summary = result.summary().to_string();
        let links = if result.links.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&result.links).map_err(|e| QueueError::Serialization {
                task_id: task_id.to_string(),
                reason: e.to_string(),
            })?
        };

        let mut conn = self.pool.get().await?;
        let mut invocation = self.invocation(&self.scripts.complete);
        invocation
            .arg(task_id)
            .arg(now_rfc3339())
            .arg(summary)
            .arg(links);
        let moved: i64 = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(storage("complete"))?;

        if moved == 1 {
            Ok(Transition::Completed)
        } else {
            warn_not_assigned("complete", task_id);
            Ok(Transition::Ignored)
        }
    }

    async fn fail(&self, task_id: &str, error: &str) -> QueueResult<Transition> {
        let mut conn = self.pool.get().await?;
        let mut invocation = self.invocation(&self.scripts.fail);
        invocation.arg(task_id).arg(error).arg(now_rfc3339());
        let reply: (i64, i64, i64) = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(storage("fail"))?;

        match reply {
            (0, _, _) => {
                warn_not_assigned("fail", task_id);
                Ok(Transition::Ignored)
            }
            (1, retry_count, priority) => Ok(Transition::Retrying {
                retry_count: retry_count as u32,
                priority,
            }),
            (2, retry_count, _) => Ok(Transition::Failed {
                retry_count: retry_count as u32,
            }),
            (code, _, _) => Err(QueueError::Protocol(format!(
                "fail script returned code {code}"
            ))),
        }
    }

    async fn release(&self, task_id: &str) -> QueueResult<Transition> {
        let mut conn = self.pool.get().await?;
        let mut invocation = self.invocation(&self.scripts.release);
        invocation.arg(task_id);
        let released: i64 = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(storage("release"))?;

        if released == 1 {
            Ok(Transition::Released)
        } else {
            warn_not_assigned("release", task_id);
            Ok(Transition::Ignored)
        }
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.pool.get().await?;
        let (pending, assigned, completed, failed): (usize, usize, usize, usize) = redis::pipe()
            .zcard(&self.keys.pending)
            .hlen(&self.keys.assigned)
            .llen(&self.keys.completed)
            .scard(&self.keys.failed)
            .query_async(&mut *conn)
            .await
            .map_err(storage("stats"))?;

        Ok(QueueStats {
            pending,
            assigned,
            completed,
            failed,
        })
    }

    async fn get(&self, task_id: &str) -> QueueResult<Option<CrawlTask>> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = conn
            .hget(&self.keys.tasks, task_id)
            .await
            .map_err(storage("get"))?;
        raw.map(|r| Self::decode(task_id, &r)).transpose()
    }

    async fn assigned_tasks(&self) -> QueueResult<Vec<CrawlTask>> {
        let ids: Vec<String> = {
            let mut conn = self.pool.get().await?;
            conn.hkeys(&self.keys.assigned)
                .await
                .map_err(storage("assigned_tasks"))?
        };
        self.load_many(&ids).await
    }

    async fn completed_since(&self, cursor: usize, limit: usize) -> QueueResult<CompletedBatch> {
        if limit == 0 {
            return Ok(CompletedBatch {
                tasks: Vec::new(),
                next_cursor: cursor,
            });
        }
        let ids: Vec<String> = {
            let mut conn = self.pool.get().await?;
            let start = cursor as isize;
            let stop = (cursor + limit - 1) as isize;
            conn.lrange(&self.keys.completed, start, stop)
                .await
                .map_err(storage("completed_since"))?
        };
        Ok(CompletedBatch {
            tasks: self.load_many(&ids).await?,
            next_cursor: cursor + ids.len(),
        })
    }
}
