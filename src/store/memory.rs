#![forbid(unsafe_code)]

// In-process state store for single-instance deployments and tests

use super::{ttl_secs, StateStore, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::time::Instant;

enum Value {
    String(String),
    Hash(HashMap<String, String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

/// Redis-like key space held in memory. Expired keys are purged lazily on access.
#[derive(Default)]
pub struct MemoryStore {
    entries: StdMutex<HashMap<String, Entry>>,
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!("WRONGTYPE operation against key {key}"))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        f(&mut entries)
    }

    fn with_hash<T>(
        &self,
        key: &str,
        f: impl FnOnce(Option<&HashMap<String, String>>) -> T,
    ) -> StoreResult<T> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(f(None)),
            Some(Entry { value: Value::Hash(hash), .. }) => Ok(f(Some(hash))),
            Some(_) => Err(wrong_type(key)),
        })
    }

    /// Remaining TTL of a key, if it has one
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.with_entries(|entries| {
            entries
                .get(key)
                .and_then(|entry| entry.expires_at)
                .map(|at| at.saturating_duration_since(Instant::now()))
        })
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::String(value.to_string()),
                    expires_at: ttl.map(|ttl| Instant::now() + Duration::from_secs(ttl_secs(ttl))),
                },
            );
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(None),
            Some(Entry { value: Value::String(value), .. }) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.with_entries(|entries| entries.remove(key));
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Hash(hash) => {
                    hash.insert(field.to_string(), value.to_string());
                    Ok(())
                }
                Value::String(_) => Err(wrong_type(key)),
            }
        })
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.with_hash(key, |hash| hash.and_then(|h| h.get(field).cloned()))
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.with_entries(|entries| {
            let Some(entry) = entries.get_mut(key) else {
                return Ok(false);
            };
            let Value::Hash(hash) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            let removed = hash.remove(field).is_some();
            if hash.is_empty() {
                entries.remove(key);
            }
            Ok(removed)
        })
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.with_hash(key, |hash| hash.cloned().unwrap_or_default())
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        self.with_hash(key, |hash| hash.map_or(0, HashMap::len))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.with_entries(|entries| {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs(ttl)));
            }
        });
        Ok(())
    }

    async fn persist(&self, key: &str) -> StoreResult<()> {
        self.with_entries(|entries| {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = None;
            }
        });
        Ok(())
    }

    async fn hset_if_eq(&self, key: &str, field: &str, expected: &str, value: &str) -> StoreResult<bool> {
        self.with_entries(|entries| {
            let Some(entry) = entries.get_mut(key) else {
                return Ok(false);
            };
            let Value::Hash(hash) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            match hash.get_mut(field) {
                Some(current) if current == expected => {
                    *current = value.to_string();
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expired_keys_disappear() {
        let store = MemoryStore::new();
        store.set("room", "{}", Some(Duration::from_secs(300))).await.unwrap();
        store.hset("room:participants", "u1", "{}").await.unwrap();
        store.expire("room:participants", Duration::from_secs(300)).await.unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(store.get("room").await.unwrap().is_some());
        assert_eq!(store.hlen("room:participants").await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("room").await.unwrap().is_none());
        assert_eq!(store.hlen("room:participants").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn persist_clears_ttl() {
        let store = MemoryStore::new();
        store.set("room", "{}", Some(Duration::from_secs(10))).await.unwrap();
        assert!(store.ttl("room").is_some());

        store.persist("room").await.unwrap();
        assert!(store.ttl("room").is_none());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(store.get("room").await.unwrap().as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn hash_disappears_with_last_field() {
        let store = MemoryStore::new();
        store.hset("h", "a", "1").await.unwrap();
        store.hset("h", "b", "2").await.unwrap();

        assert!(store.hdel("h", "a").await.unwrap());
        assert!(!store.hdel("h", "a").await.unwrap());
        assert_eq!(store.hgetall("h").await.unwrap().len(), 1);

        assert!(store.hdel("h", "b").await.unwrap());
        store.expire("h", Duration::from_secs(5)).await.unwrap();
        assert!(store.ttl("h").is_none());
    }

    #[tokio::test]
    async fn compare_and_swap_only_writes_expected_value() {
        let store = MemoryStore::new();
        store.hset("h", "u1", "v1").await.unwrap();

        assert!(!store.hset_if_eq("h", "u1", "stale", "v2").await.unwrap());
        assert!(store.hset_if_eq("h", "u1", "v1", "v2").await.unwrap());
        assert_eq!(store.hget("h", "u1").await.unwrap().as_deref(), Some("v2"));
        assert!(!store.hset_if_eq("h", "missing", "v1", "v2").await.unwrap());
        assert!(store.hget("h", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn type_mismatch_is_an_error() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert!(matches!(store.hset("k", "f", "v").await, Err(StoreError::Command(_))));
        assert!(matches!(store.hgetall("k").await, Err(StoreError::Command(_))));
    }
}
