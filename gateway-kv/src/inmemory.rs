use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{KvError, KvStore};

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// `DashMap`-backed fake used by unit tests so `gateway-concurrency`,
/// `gateway-scheduler`, and `gateway-refresh` can be exercised without a
/// live Redis instance.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: DashMap<String, Entry>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn incr_if_below(&self, key: &str, limit: i64, ttl: Duration) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: now + ttl,
        });

        let current: i64 = if entry.is_live(now) {
            entry.value.parse().unwrap_or(0)
        } else {
            0
        };

        if current >= limit {
            return Ok(false);
        }

        entry.value = (current + 1).to_string();
        entry.expires_at = now + ttl;
        Ok(true)
    }

    async fn decr_clamped(&self, key: &str) -> Result<(), KvError> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            let current: i64 = entry.value.parse().unwrap_or(0);
            entry.value = current.saturating_sub(1).max(0).to_string();
        }
        Ok(())
    }

    async fn get_counter(&self, key: &str) -> Result<i64, KvError> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.value.parse().ok())
            .unwrap_or(0))
    }

    async fn reset_counter(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = Instant::now();
        Ok(self.entries.get(key).filter(|e| e.is_live(now)).map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        self.entries.insert(
            key.to_string(),
            Entry { value: value.to_string(), expires_at: Instant::now() + ttl },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) if e.get().is_live(now) => Ok(false),
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                e.insert(Entry { value: "1".to_string(), expires_at: now + ttl });
                Ok(true)
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(Entry { value: "1".to_string(), expires_at: now + ttl });
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_if_below_blocks_at_limit() {
        let kv = InMemoryKvStore::new();
        let ttl = Duration::from_secs(60);
        assert!(kv.incr_if_below("user:1", 2, ttl).await.unwrap());
        assert!(kv.incr_if_below("user:1", 2, ttl).await.unwrap());
        assert!(!kv.incr_if_below("user:1", 2, ttl).await.unwrap());
        assert_eq!(kv.get_counter("user:1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn decr_clamps_at_zero() {
        let kv = InMemoryKvStore::new();
        let ttl = Duration::from_secs(60);
        kv.incr_if_below("acc:1", 5, ttl).await.unwrap();
        kv.decr_clamped("acc:1").await.unwrap();
        kv.decr_clamped("acc:1").await.unwrap();
        kv.decr_clamped("acc:1").await.unwrap();
        assert_eq!(kv.get_counter("acc:1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_counter_resets_transparently() {
        let kv = InMemoryKvStore::new();
        kv.incr_if_below("acc:2", 1, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get_counter("acc:2").await.unwrap(), 0);
        assert!(kv.incr_if_below("acc:2", 1, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn try_lock_is_exclusive_until_ttl_elapses() {
        let kv = InMemoryKvStore::new();
        assert!(kv.try_lock("refresh:acc-1", Duration::from_millis(20)).await.unwrap());
        assert!(!kv.try_lock("refresh:acc-1", Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(kv.try_lock("refresh:acc-1", Duration::from_millis(20)).await.unwrap());
    }
}
