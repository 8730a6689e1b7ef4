//! Redis implementation of the [`Store`] trait.
//!
//! Ordinary commands go through a [`ConnectionManager`], which reconnects
//! automatically. Blocking pops run on dedicated connections: a BRPOP parks
//! the connection it runs on, and sharing the manager would stall every other
//! command issued by the process until the pop returns.
//!
//! Dedicated connections are kept in a small idle pool. A popper takes one
//! (or opens one when the pool is empty) and hands it back once the BRPOP
//! answers, so a worker polling in a loop reuses the same connection. A
//! connection that saw an error is dropped instead of returned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;

use super::{Store, StoreError, StoreResult};

/// Number of keys requested per SCAN round-trip.
const SCAN_BATCH: usize = 200;

/// Shortest BRPOP timeout sent to the server, in seconds.
///
/// BRPOP treats 0 as "wait forever", so shorter timeouts are rounded up.
const MIN_BLOCK_SECS: f64 = 0.01;

/// Idle blocking connections kept for reuse.
const MAX_IDLE_BLOCKING: usize = 8;

/// Store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    /// Client used to open dedicated connections for blocking pops.
    client: redis::Client,
    /// Shared, self-healing connection for everything else.
    redis: ConnectionManager,
    /// Idle dedicated connections for blocking pops.
    blocking: Arc<Mutex<Vec<MultiplexedConnection>>>,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the connection fails.
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            redis,
            blocking: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Number of blocking connections waiting for reuse.
    pub fn idle_blocking_connections(&self) -> usize {
        self.blocking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn take_blocking(&self) -> StoreResult<MultiplexedConnection> {
        let idle = self
            .blocking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string())),
        }
    }

    fn give_back_blocking(&self, conn: MultiplexedConnection) {
        let mut idle = self.blocking.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_BLOCKING {
            idle.push(conn);
        }
    }
}

/// BRPOP timeout argument for `timeout`, keeping sub-second precision.
fn block_secs(timeout: Duration) -> f64 {
    timeout.as_secs_f64().max(MIN_BLOCK_SECS)
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn push(&self, list: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(list, value).await?;
        Ok(())
    }

    async fn blocking_pop(&self, list: &str, timeout: Duration) -> StoreResult<Option<String>> {
        let mut conn = self.take_blocking().await?;

        let result: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(list)
            .arg(block_secs(timeout))
            .query_async(&mut conn)
            .await?;

        self.give_back_blocking(conn);
        Ok(result.map(|(_, value)| value))
    }

    async fn list_len(&self, list: &str) -> StoreResult<usize> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(list).await?;
        Ok(len)
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        conn.hset_multiple::<_, _, _, ()>(key, fields).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once across iterations.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.redis.clone();
        let removed: usize = conn.del(key).await?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_secs_keeps_fractions() {
        assert!((block_secs(Duration::from_millis(1900)) - 1.9).abs() < 1e-9);
        assert!((block_secs(Duration::from_millis(200)) - 0.2).abs() < 1e-9);
        assert!((block_secs(Duration::from_secs(5)) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_block_secs_never_sends_zero() {
        assert_eq!(block_secs(Duration::ZERO), MIN_BLOCK_SECS);
        assert_eq!(block_secs(Duration::from_micros(10)), MIN_BLOCK_SECS);
    }
}
