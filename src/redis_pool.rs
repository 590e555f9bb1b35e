//! Shared Redis connection pool used by the queue, registry and transport
//! backends

use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use thiserror::Error;

use crate::config::StorageConfig;

/// Errors raised while building or checking the pool
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Failed to create Redis pool for {url}: {reason}")]
    Build { url: String, reason: String },

    #[error("Failed to get Redis connection: {0}")]
    Connection(#[from] deadpool_redis::PoolError),

    #[error("Failed to ping Redis: {0}")]
    Ping(#[from] redis::RedisError),
}

/// Build a pool from the storage configuration and verify it with a PING
pub async fn connect(config: &StorageConfig) -> Result<Pool, PoolError> {
    let pool = PoolConfig::from_url(&config.redis_url)
        .builder()
        .map_err(|e| PoolError::Build {
            url: config.redis_url.clone(),
            reason: e.to_string(),
        })?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| PoolError::Build {
            url: config.redis_url.clone(),
            reason: e.to_string(),
        })?;

    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut *conn).await?;

    tracing::info!(url = %config.redis_url, pool_size = config.pool_size, "Connected to Redis");

    Ok(pool)
}

/// Build a namespaced key (`{prefix}:{suffix}`)
pub fn key(prefix: &str, suffix: &str) -> String {
    format!("{prefix}:{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_namespacing() {
        assert_eq!(key("fleetcrawl", "pending"), "fleetcrawl:pending");
        assert_eq!(key("a:b", "inbox:n1"), "a:b:inbox:n1");
    }
}
