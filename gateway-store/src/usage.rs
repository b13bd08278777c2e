use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use gateway_core::{BillingUsageEntry, UsageLog};
use sqlx::{PgPool, Row};

use crate::error::StoreError;

/// Whether an idempotent insert actually wrote a new row, or found a prior
/// row from a duplicate delivery and did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Inserts `log`, keyed uniquely by (request_id, api_key_id). A
    /// duplicate delivery of the same request is a no-op — this is the
    /// sole idempotency gate the billing pipeline relies on.
    async fn insert_usage_log(&self, log: &UsageLog) -> Result<InsertOutcome, StoreError>;

    async fn insert_billing_entry(&self, entry: &BillingUsageEntry) -> Result<InsertOutcome, StoreError>;
}

pub struct PgUsageStore {
    pool: PgPool,
}

impl PgUsageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageStore for PgUsageStore {
    async fn insert_usage_log(&self, log: &UsageLog) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO usage_logs (
                id, request_id, api_key_id, account_id, model, group_id, subscription_id,
                input_tokens, output_tokens, cache_creation_tokens, cache_creation_5m_tokens,
                cache_creation_1h_tokens, cache_read_tokens,
                input_cost, output_cost, cache_creation_cost, cache_read_cost, total_cost, actual_cost,
                billing_type, stream, duration_ms, first_token_ms, created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23,$24)
            ON CONFLICT (request_id, api_key_id) DO NOTHING
            "#,
        )
        .bind(log.id.as_str())
        .bind(log.request_id.as_str())
        .bind(log.api_key_id.as_str())
        .bind(log.account_id.as_str())
        .bind(&log.model)
        .bind(log.group_id.as_ref().map(|g| g.as_str()))
        .bind(log.subscription_id.as_ref().map(|s| s.as_str()))
        .bind(log.usage.input_tokens)
        .bind(log.usage.output_tokens)
        .bind(log.usage.cache_creation_tokens)
        .bind(log.usage.cache_creation_5m_tokens)
        .bind(log.usage.cache_creation_1h_tokens)
        .bind(log.usage.cache_read_tokens)
        .bind(log.input_cost)
        .bind(log.output_cost)
        .bind(log.cache_creation_cost)
        .bind(log.cache_read_cost)
        .bind(log.total_cost)
        .bind(log.actual_cost)
        .bind(log.billing_type.to_string())
        .bind(log.stream)
        .bind(log.duration_ms)
        .bind(log.first_token_ms)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 { InsertOutcome::Inserted } else { InsertOutcome::AlreadyExists })
    }

    async fn insert_billing_entry(&self, entry: &BillingUsageEntry) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO billing_usage_entries
                (usage_log_id, user_id, api_key_id, subscription_id, billing_type, applied, delta_usd)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            ON CONFLICT (usage_log_id) DO NOTHING
            "#,
        )
        .bind(entry.usage_log_id.as_str())
        .bind(entry.user_id.as_str())
        .bind(entry.api_key_id.as_str())
        .bind(entry.subscription_id.as_ref().map(|s| s.as_str()))
        .bind(entry.billing_type.to_string())
        .bind(entry.applied)
        .bind(entry.delta_usd)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 { InsertOutcome::Inserted } else { InsertOutcome::AlreadyExists })
    }
}

/// Table-based fake keeping just the uniqueness keys, enough to exercise
/// `gateway-billing`'s idempotency logic without a database.
#[derive(Default)]
pub struct InMemoryUsageStore {
    usage_keys: Mutex<HashSet<(String, String)>>,
    billing_keys: Mutex<HashSet<String>>,
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn insert_usage_log(&self, log: &UsageLog) -> Result<InsertOutcome, StoreError> {
        let key = (log.request_id.as_str().to_string(), log.api_key_id.as_str().to_string());
        let mut keys = self.usage_keys.lock().unwrap();
        if keys.contains(&key) {
            Ok(InsertOutcome::AlreadyExists)
        } else {
            keys.insert(key);
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn insert_billing_entry(&self, entry: &BillingUsageEntry) -> Result<InsertOutcome, StoreError> {
        let key = entry.usage_log_id.as_str().to_string();
        let mut keys = self.billing_keys.lock().unwrap();
        if keys.contains(&key) {
            Ok(InsertOutcome::AlreadyExists)
        } else {
            keys.insert(key);
            Ok(InsertOutcome::Inserted)
        }
    }
}
