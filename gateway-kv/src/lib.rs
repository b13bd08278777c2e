//! Ephemeral key-value store abstraction. Backs concurrency slot counters,
//! scheduler waitlists/session affinity, the pricing cache, and per-account
//! refresh locks — anything with a TTL that doesn't belong in the
//! relational store.

mod inmemory;
mod redis_backend;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use inmemory::InMemoryKvStore;
pub use redis_backend::RedisKvStore;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
}

/// Implemented by both the in-memory fake (used in unit tests across
/// `gateway-concurrency`, `gateway-scheduler`, `gateway-refresh`) and the
/// Redis-backed production store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomically increments the counter at `key` if its current value is
    /// strictly below `limit`, refreshing the TTL to `ttl`. Returns `true`
    /// if the increment happened.
    async fn incr_if_below(&self, key: &str, limit: i64, ttl: Duration) -> Result<bool, KvError>;

    /// Decrements the counter at `key`, clamped at zero. A missing key is a
    /// no-op, matching the "crashed request already swept" case.
    async fn decr_clamped(&self, key: &str) -> Result<(), KvError>;

    /// Reads the current counter value, or 0 if absent.
    async fn get_counter(&self, key: &str) -> Result<i64, KvError>;

    /// Unconditionally resets a counter to zero, used by the slot sweeper.
    async fn reset_counter(&self, key: &str) -> Result<(), KvError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// SET-if-not-exists with a TTL; used for per-account refresh locks and
    /// pricing-refresh dedup. Returns `true` if the lock was acquired.
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;
}
