#![forbid(unsafe_code)]

// Shared state store - durable room and participant records
//
// Key layout:
// - `voice:room:{channelId}` - room record (JSON string)
// - `voice:room:{channelId}:participants` - hash of userId -> participant record (JSON)

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Store command failed: {0}")]
    Command(String),

    #[error("Malformed record: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub fn room_key(channel_id: &str) -> String {
    format!("voice:room:{channel_id}")
}

pub fn participants_key(channel_id: &str) -> String {
    format!("voice:room:{channel_id}:participants")
}

/// Key/value and hash operations the room store needs from its backend.
///
/// Semantics follow Redis: a hash key disappears with its last field, `set`
/// without a TTL clears any previous TTL, and `expire`/`persist` on a
/// missing key are no-ops.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn del(&self, key: &str) -> StoreResult<()>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Returns whether the field existed
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn hlen(&self, key: &str) -> StoreResult<usize>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    async fn persist(&self, key: &str) -> StoreResult<()>;

    /// Writes `value` only if the field currently holds exactly `expected`.
    /// Returns false, writing nothing, when the field changed or is gone.
    async fn hset_if_eq(&self, key: &str, field: &str, expected: &str, value: &str) -> StoreResult<bool>;
}

/// Seconds for a store TTL; Redis rejects zero
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
