use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::{KvError, KvStore};

/// Production backend. Holds a `ConnectionManager` which transparently
/// reconnects, so callers never have to notice a dropped connection.
pub struct RedisKvStore {
    conn: ConnectionManager,
}

impl RedisKvStore {
    pub async fn connect(redis_url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(redis_url).map_err(|e| KvError::Backend(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn incr_if_below(&self, key: &str, limit: i64, ttl: Duration) -> Result<bool, KvError> {
        // Lua keeps the read-increment-expire sequence atomic under concurrent callers.
        const SCRIPT: &str = r#"
            local current = tonumber(redis.call('GET', KEYS[1]) or '0')
            if current >= tonumber(ARGV[1]) then
                return 0
            end
            local new = redis.call('INCR', KEYS[1])
            redis.call('PEXPIRE', KEYS[1], ARGV[2])
            return new
        "#;
        let mut conn = self.conn.clone();
        let result: i64 = redis::Script::new(SCRIPT)
            .key(key)
            .arg(limit)
            .arg(ttl.as_millis() as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(result != 0)
    }

    async fn decr_clamped(&self, key: &str) -> Result<(), KvError> {
        const SCRIPT: &str = r#"
            local current = tonumber(redis.call('GET', KEYS[1]) or '0')
            if current <= 0 then
                return 0
            end
            return redis.call('DECR', KEYS[1])
        "#;
        let mut conn = self.conn.clone();
        let _: i64 = redis::Script::new(SCRIPT)
            .key(key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_counter(&self, key: &str) -> Result<i64, KvError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> =
            conn.get(key).await.map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(value.unwrap_or(0))
    }

    async fn reset_counter(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await.map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(|e| KvError::Backend(e.to_string()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await.map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let acquired: bool = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as i64)
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?
            .is_some();
        Ok(acquired)
    }
}
