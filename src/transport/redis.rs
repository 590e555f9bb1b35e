//! Redis transport: one list per node at `{prefix}:inbox:{node_id}`

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::time::Duration;

use super::{AssignmentInbox, AssignmentTransport, NodeMessage, TransportError, TransportResult};
use crate::redis_pool::key;

/// Shortest blocking wait sent to BRPOP (0 would block forever)
const MIN_WAIT_SECS: f64 = 0.01;

fn inbox_key(prefix: &str, node_id: &str) -> String {
    key(prefix, &format!("inbox:{node_id}"))
}

fn storage(operation: &'static str) -> impl FnOnce(redis::RedisError) -> TransportError {
    move |source| TransportError::Storage { operation, source }
}

/// Multi-process transport backed by Redis lists
pub struct RedisTransport {
    pool: Pool,
    prefix: String,
}

impl RedisTransport {
    pub fn new(pool: Pool, prefix: &str) -> Self {
        Self {
            pool,
            prefix: prefix.to_string(),
        }
    }
}

#[async_trait]
impl AssignmentTransport for RedisTransport {
    async fn dispatch(&self, node_id: &str, message: NodeMessage) -> TransportResult<()> {
        let payload = message.encode()?;
        let mut conn = self.pool.get().await?;
        let _: i64 = conn
            .lpush(inbox_key(&self.prefix, node_id), payload)
            .await
            .map_err(storage("dispatch"))?;
        Ok(())
    }

    async fn open_inbox(&self, node_id: &str) -> TransportResult<Box<dyn AssignmentInbox>> {
        Ok(Box::new(RedisInbox {
            pool: self.pool.clone(),
            key: inbox_key(&self.prefix, node_id),
        }))
    }
}

/// Receiving end of a Redis inbox
pub struct RedisInbox {
    pool: Pool,
    key: String,
}

#[async_trait]
impl AssignmentInbox for RedisInbox {
    async fn recv(&mut self, wait: Duration) -> TransportResult<Option<NodeMessage>> {
        let mut conn = self.pool.get().await?;
        let timeout = wait.as_secs_f64().max(MIN_WAIT_SECS);
        let popped: Option<(String, String)> = conn
            .brpop(&self.key, timeout)
            .await
            .map_err(storage("recv"))?;

        match popped {
            Some((_, payload)) => NodeMessage::decode(&payload).map(Some),
            None => Ok(None),
        }
    }
}
