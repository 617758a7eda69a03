#![forbid(unsafe_code)]

// Redis-backed state store.
//
// `MultiplexedConnection` is cheap to clone and safe to use concurrently, so
// every operation clones it instead of sharing one behind a lock.

use super::{ttl_secs, StateStore, StoreError, StoreResult};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info, warn};

/// Hash field compare-and-swap.
///
/// - KEYS[1]: hash key
/// - ARGV[1]: field
/// - ARGV[2]: expected current value
/// - ARGV[3]: new value
///
/// Returns 1 when written, 0 when the field no longer holds the expected value.
const HSET_IF_EQ: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if current == ARGV[2] then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
    return 1
end
return 0
"#;

#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    hset_if_eq_script: Script,
}

fn command_error(op: &'static str, key: &str, e: redis::RedisError) -> StoreError {
    warn!("Redis {} failed for {}: {}", op, key, e);
    StoreError::Command(format!("{op} {key}: {e}"))
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Errors
    /// Returns `StoreError::Connection` if the URL is invalid or the server unreachable
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        // the URL may carry credentials, keep it out of logs
        let client = Client::open(redis_url).map_err(|e| {
            error!("Failed to open Redis client: {}", e);
            StoreError::Connection(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client.get_multiplexed_async_connection().await.map_err(|e| {
            error!("Failed to connect to Redis: {}", e);
            StoreError::Connection(format!("Failed to connect to Redis: {e}"))
        })?;

        info!("Connected to Redis");
        Ok(Self {
            connection,
            hset_if_eq_script: Script::new(HSET_IF_EQ),
        })
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        match ttl {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl)).await,
            None => conn.set::<_, _, ()>(key, value).await,
        }
        .map_err(|e| command_error("SET", key, e))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection.clone();
        conn.get(key).await.map_err(|e| command_error("GET", key, e))
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key).await.map_err(|e| command_error("DEL", key, e))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(|e| command_error("HSET", key, e))
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection.clone();
        conn.hget(key, field).await.map_err(|e| command_error("HGET", key, e))
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let removed: usize = conn.hdel(key, field).await.map_err(|e| command_error("HDEL", key, e))?;
        Ok(removed > 0)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.connection.clone();
        conn.hgetall(key).await.map_err(|e| command_error("HGETALL", key, e))
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.connection.clone();
        conn.hlen(key).await.map_err(|e| command_error("HLEN", key, e))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let secs = i64::try_from(ttl_secs(ttl)).unwrap_or(i64::MAX);
        conn.expire::<_, ()>(key, secs)
            .await
            .map_err(|e| command_error("EXPIRE", key, e))
    }

    async fn persist(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        conn.persist::<_, ()>(key)
            .await
            .map_err(|e| command_error("PERSIST", key, e))
    }

    async fn hset_if_eq(&self, key: &str, field: &str, expected: &str, value: &str) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let written: i64 = self
            .hset_if_eq_script
            .key(key)
            .arg(field)
            .arg(expected)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("HSET_IF_EQ", key, e))?;
        Ok(written == 1)
    }
}
