use std::collections::HashMap;

use async_trait::async_trait;
use gateway_core::SettingsSnapshot;
use sqlx::{PgPool, Row};

use crate::error::StoreError;

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn snapshot(&self) -> Result<SettingsSnapshot, StoreError>;

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError>;
}

pub struct PgSettingsRepository {
    pool: PgPool,
}

impl PgSettingsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsRepository for PgSettingsRepository {
    async fn snapshot(&self) -> Result<SettingsSnapshot, StoreError> {
        let rows = sqlx::query("SELECT key, value FROM settings").fetch_all(&self.pool).await?;
        let mut values = HashMap::new();
        for row in rows {
            let key: String = row.try_get("key")?;
            let value: serde_json::Value = row.try_get("value")?;
            values.insert(key, value);
        }
        Ok(SettingsSnapshot { values })
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES ($1, $2, now()) ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
