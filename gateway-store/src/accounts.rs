use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_core::{
    Account, AccountCredentials, AccountId, AccountStatus, AccountType, GroupId, Platform,
    SessionWindowStatus,
};
use gateway_crypto::MasterKey;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};

use crate::error::StoreError;

/// Account Registry operations. A `sqlx::PgPool`-backed
/// implementation serves production traffic; `InMemoryAccountRepository`
/// (a `Mutex<Vec<Account>>` with linear scans) backs unit tests for the
/// scheduler and proxy engine without a live database.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn list_schedulable(
        &self,
        platform: Platform,
        allowed_group_ids: &[GroupId],
        now: DateTime<Utc>,
    ) -> Result<Vec<Account>, StoreError>;

    async fn get(&self, id: &AccountId) -> Result<Option<Account>, StoreError>;

    async fn mark_rate_limited(&self, id: &AccountId, reset_at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn mark_overload(&self, id: &AccountId, until: DateTime<Utc>) -> Result<(), StoreError>;

    async fn mark_temp_unschedulable(
        &self,
        id: &AccountId,
        until: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), StoreError>;

    async fn clear_error(&self, id: &AccountId) -> Result<(), StoreError>;

    /// Credentials rejected by upstream (401/403): moves the account out of
    /// rotation until a refresh or admin action clears it.
    async fn mark_error(&self, id: &AccountId, message: &str) -> Result<(), StoreError>;

    async fn touch_last_used(&self, id: &AccountId, t: DateTime<Utc>) -> Result<(), StoreError>;

    async fn update_session_window(
        &self,
        id: &AccountId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        status: SessionWindowStatus,
    ) -> Result<(), StoreError>;

    /// Group-local priority for `account_id` within the first matching
    /// group of `group_ids`, if the account belongs to any of them.
    async fn group_priority(
        &self,
        account_id: &AccountId,
        group_ids: &[GroupId],
    ) -> Result<Option<i32>, StoreError>;

    async fn update_credentials(
        &self,
        id: &AccountId,
        credentials: AccountCredentials,
    ) -> Result<(), StoreError>;

    /// Active OAuth accounts whose credential expiry falls at or before
    /// `before` — the refresh service's due-for-refresh query.
    async fn list_expiring_oauth(&self, before: DateTime<Utc>) -> Result<Vec<Account>, StoreError>;
}

pub struct PgAccountRepository {
    pool: PgPool,
    master_key: MasterKey,
}

impl PgAccountRepository {
    pub fn new(pool: PgPool, master_key: MasterKey) -> Self {
        Self { pool, master_key }
    }

    fn decrypt(&self, value: Option<String>) -> Result<Option<String>, StoreError> {
        value.map(|v| gateway_crypto::decrypt(&self.master_key, &v)).transpose().map_err(Into::into)
    }

    fn row_to_account(&self, row: PgRow) -> Result<Account, StoreError> {
        let platform: String = row.try_get("platform").map_err(StoreError::Database)?;
        let account_type: String = row.try_get("account_type").map_err(StoreError::Database)?;
        let status: String = row.try_get("status").map_err(StoreError::Database)?;
        let session_window_status: Option<String> =
            row.try_get("session_window_status").map_err(StoreError::Database)?;
        let extras: serde_json::Value = row.try_get("extras").map_err(StoreError::Database)?;

        Ok(Account {
            id: AccountId::from(row.try_get::<String, _>("id").map_err(StoreError::Database)?),
            name: row.try_get("name").map_err(StoreError::Database)?,
            platform: parse_platform(&platform)?,
            account_type: parse_account_type(&account_type)?,
            credentials: AccountCredentials {
                access_token: self.decrypt(row.try_get("access_token").map_err(StoreError::Database)?)?,
                refresh_token: self
                    .decrypt(row.try_get("refresh_token").map_err(StoreError::Database)?)?,
                api_key: self.decrypt(row.try_get("api_key").map_err(StoreError::Database)?)?,
                expires_at: row.try_get("token_expires_at").map_err(StoreError::Database)?,
                extras: serde_json::from_value(extras).unwrap_or_default(),
            },
            proxy_id: row
                .try_get::<Option<String>, _>("proxy_id")
                .map_err(StoreError::Database)?
                .map(Into::into),
            priority: row.try_get("priority").map_err(StoreError::Database)?,
            concurrency_limit: row.try_get("concurrency_limit").map_err(StoreError::Database)?,
            status: parse_account_status(&status)?,
            error_message: row.try_get("error_message").map_err(StoreError::Database)?,
            schedulable: row.try_get("schedulable").map_err(StoreError::Database)?,
            rate_limited_at: row.try_get("rate_limited_at").map_err(StoreError::Database)?,
            rate_limit_reset_at: row.try_get("rate_limit_reset_at").map_err(StoreError::Database)?,
            overload_until: row.try_get("overload_until").map_err(StoreError::Database)?,
            temp_unschedulable_until: row
                .try_get("temp_unschedulable_until")
                .map_err(StoreError::Database)?,
            temp_unschedulable_reason: row
                .try_get("temp_unschedulable_reason")
                .map_err(StoreError::Database)?,
            session_window_start: row.try_get("session_window_start").map_err(StoreError::Database)?,
            session_window_end: row.try_get("session_window_end").map_err(StoreError::Database)?,
            session_window_status: session_window_status
                .map(|s| parse_session_window_status(&s))
                .transpose()?,
            last_used_at: row.try_get("last_used_at").map_err(StoreError::Database)?,
            created_at: row.try_get("created_at").map_err(StoreError::Database)?,
            updated_at: row.try_get("updated_at").map_err(StoreError::Database)?,
        })
    }
}

fn parse_platform(s: &str) -> Result<Platform, StoreError> {
    match s {
        "claude" => Ok(Platform::Claude),
        "openai" => Ok(Platform::OpenAi),
        "gemini" => Ok(Platform::Gemini),
        "antigravity" => Ok(Platform::Antigravity),
        other => Err(StoreError::Decode(format!("unknown platform {other}"))),
    }
}

fn parse_account_type(s: &str) -> Result<AccountType, StoreError> {
    match s {
        "oauth" => Ok(AccountType::OAuth),
        "apikey" => Ok(AccountType::ApiKey),
        other => Err(StoreError::Decode(format!("unknown account_type {other}"))),
    }
}

fn parse_account_status(s: &str) -> Result<AccountStatus, StoreError> {
    match s {
        "active" => Ok(AccountStatus::Active),
        "error" => Ok(AccountStatus::Error),
        "disabled" => Ok(AccountStatus::Disabled),
        other => Err(StoreError::Decode(format!("unknown account status {other}"))),
    }
}

fn parse_session_window_status(s: &str) -> Result<SessionWindowStatus, StoreError> {
    match s {
        "active" => Ok(SessionWindowStatus::Active),
        "expired" => Ok(SessionWindowStatus::Expired),
        other => Err(StoreError::Decode(format!("unknown session_window_status {other}"))),
    }
}

#[async_trait]
impl AccountRepository for PgAccountRepository {
    async fn list_schedulable(
        &self,
        platform: Platform,
        allowed_group_ids: &[GroupId],
        now: DateTime<Utc>,
    ) -> Result<Vec<Account>, StoreError> {
        let group_ids: Vec<String> = allowed_group_ids.iter().map(|g| g.as_str().to_string()).collect();
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT a.* FROM accounts a
            LEFT JOIN account_groups ag ON ag.account_id = a.id
            WHERE a.platform = $1
              AND a.status = 'active'
              AND a.schedulable = true
              AND (a.rate_limit_reset_at IS NULL OR a.rate_limit_reset_at <= $2)
              AND (a.overload_until IS NULL OR a.overload_until <= $2)
              AND (a.temp_unschedulable_until IS NULL OR a.temp_unschedulable_until <= $2)
              AND (a.session_window_status IS DISTINCT FROM 'active' OR a.session_window_end > $2)
              AND (array_length($3::text[], 1) IS NULL OR ag.group_id = ANY($3))
            "#,
        )
        .bind(platform.to_string())
        .bind(now)
        .bind(&group_ids)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| self.row_to_account(r)).collect()
    }

    async fn get(&self, id: &AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| self.row_to_account(r)).transpose()
    }

    async fn mark_rate_limited(&self, id: &AccountId, reset_at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE accounts SET rate_limited_at = now(), rate_limit_reset_at = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id.as_str())
        .bind(reset_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_overload(&self, id: &AccountId, until: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE accounts SET overload_until = $2, updated_at = now() WHERE id = $1")
            .bind(id.as_str())
            .bind(until)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_temp_unschedulable(
        &self,
        id: &AccountId,
        until: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE accounts SET temp_unschedulable_until = $2, temp_unschedulable_reason = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id.as_str())
        .bind(until)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_error(&self, id: &AccountId) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE accounts SET status = 'active', error_message = NULL, rate_limited_at = NULL, rate_limit_reset_at = NULL, overload_until = NULL, temp_unschedulable_until = NULL, temp_unschedulable_reason = NULL, updated_at = now() WHERE id = $1",
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_last_used(&self, id: &AccountId, t: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE accounts SET last_used_at = $2, updated_at = now() WHERE id = $1")
            .bind(id.as_str())
            .bind(t)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_error(&self, id: &AccountId, message: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE accounts SET status = 'error', error_message = $2, updated_at = now() WHERE id = $1")
            .bind(id.as_str())
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_session_window(
        &self,
        id: &AccountId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        status: SessionWindowStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE accounts SET session_window_start = $2, session_window_end = $3, session_window_status = $4, updated_at = now() WHERE id = $1",
        )
        .bind(id.as_str())
        .bind(start)
        .bind(end)
        .bind(status.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn group_priority(
        &self,
        account_id: &AccountId,
        group_ids: &[GroupId],
    ) -> Result<Option<i32>, StoreError> {
        let ids: Vec<String> = group_ids.iter().map(|g| g.as_str().to_string()).collect();
        let row = sqlx::query(
            "SELECT priority FROM account_groups WHERE account_id = $1 AND group_id = ANY($2) ORDER BY priority ASC LIMIT 1",
        )
        .bind(account_id.as_str())
        .bind(&ids)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get::<i32, _>("priority")).transpose().map_err(StoreError::Database)
    }

    async fn update_credentials(
        &self,
        id: &AccountId,
        credentials: AccountCredentials,
    ) -> Result<(), StoreError> {
        let access = credentials
            .access_token
            .map(|t| gateway_crypto::encrypt(&self.master_key, &t))
            .transpose()?;
        let refresh = credentials
            .refresh_token
            .map(|t| gateway_crypto::encrypt(&self.master_key, &t))
            .transpose()?;
        sqlx::query(
            "UPDATE accounts SET access_token = $2, refresh_token = $3, token_expires_at = $4, updated_at = now() WHERE id = $1",
        )
        .bind(id.as_str())
        .bind(access)
        .bind(refresh)
        .bind(credentials.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_expiring_oauth(&self, before: DateTime<Utc>) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM accounts WHERE status = 'active' AND account_type = 'oauth' AND token_expires_at IS NOT NULL AND token_expires_at <= $1",
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|r| self.row_to_account(r)).collect()
    }
}

/// In-memory fake for unit tests: a `Mutex`-guarded `Vec` with linear
/// scans instead of indexed lookups.
#[derive(Default)]
pub struct InMemoryAccountRepository {
    accounts: Mutex<Vec<Account>>,
    group_priorities: Mutex<HashMap<(AccountId, GroupId), i32>>,
}

impl InMemoryAccountRepository {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self { accounts: Mutex::new(accounts), group_priorities: Mutex::new(HashMap::new()) }
    }

    pub fn with_group_priority(self, account_id: AccountId, group_id: GroupId, priority: i32) -> Self {
        self.group_priorities.lock().unwrap().insert((account_id, group_id), priority);
        self
    }
}

#[async_trait]
impl AccountRepository for InMemoryAccountRepository {
    async fn list_schedulable(
        &self,
        platform: Platform,
        _allowed_group_ids: &[GroupId],
        now: DateTime<Utc>,
    ) -> Result<Vec<Account>, StoreError> {
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.platform == platform && a.is_eligible(now))
            .cloned()
            .collect())
    }

    async fn get(&self, id: &AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.lock().unwrap().iter().find(|a| &a.id == id).cloned())
    }

    async fn mark_rate_limited(&self, id: &AccountId, reset_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.mutate(id, |a| {
            a.rate_limited_at = Some(Utc::now());
            a.rate_limit_reset_at = Some(reset_at);
        })
    }

    async fn mark_overload(&self, id: &AccountId, until: DateTime<Utc>) -> Result<(), StoreError> {
        self.mutate(id, |a| a.overload_until = Some(until))
    }

    async fn mark_temp_unschedulable(
        &self,
        id: &AccountId,
        until: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.mutate(id, |a| {
            a.temp_unschedulable_until = Some(until);
            a.temp_unschedulable_reason = Some(reason.to_string());
        })
    }

    async fn clear_error(&self, id: &AccountId) -> Result<(), StoreError> {
        self.mutate(id, |a| {
            a.status = AccountStatus::Active;
            a.error_message = None;
            a.rate_limited_at = None;
            a.rate_limit_reset_at = None;
            a.overload_until = None;
            a.temp_unschedulable_until = None;
            a.temp_unschedulable_reason = None;
        })
    }

    async fn touch_last_used(&self, id: &AccountId, t: DateTime<Utc>) -> Result<(), StoreError> {
        self.mutate(id, |a| a.last_used_at = Some(t))
    }

    async fn mark_error(&self, id: &AccountId, message: &str) -> Result<(), StoreError> {
        self.mutate(id, |a| {
            a.status = AccountStatus::Error;
            a.error_message = Some(message.to_string());
        })
    }

    async fn update_session_window(
        &self,
        id: &AccountId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        status: SessionWindowStatus,
    ) -> Result<(), StoreError> {
        self.mutate(id, |a| {
            a.session_window_start = Some(start);
            a.session_window_end = Some(end);
            a.session_window_status = Some(status);
        })
    }

    async fn group_priority(
        &self,
        account_id: &AccountId,
        group_ids: &[GroupId],
    ) -> Result<Option<i32>, StoreError> {
        let priorities = self.group_priorities.lock().unwrap();
        Ok(group_ids.iter().find_map(|g| priorities.get(&(account_id.clone(), g.clone())).copied()))
    }

    async fn update_credentials(
        &self,
        id: &AccountId,
        credentials: AccountCredentials,
    ) -> Result<(), StoreError> {
        self.mutate(id, |a| a.credentials = credentials.clone())
    }

    async fn list_expiring_oauth(&self, before: DateTime<Utc>) -> Result<Vec<Account>, StoreError> {
        let accounts = self.accounts.lock().unwrap();
        Ok(accounts
            .iter()
            .filter(|a| {
                a.status == AccountStatus::Active
                    && a.account_type == AccountType::OAuth
                    && a.credentials.expires_at.is_some_and(|exp| exp <= before)
            })
            .cloned()
            .collect())
    }
}

impl InMemoryAccountRepository {
    fn mutate(&self, id: &AccountId, f: impl FnOnce(&mut Account)) -> Result<(), StoreError> {
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts.iter_mut().find(|a| &a.id == id).ok_or(StoreError::NotFound)?;
        f(account);
        account.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use gateway_core::{AccountCredentials as Creds, AccountType};

    fn account(id: &str, platform: Platform) -> Account {
        let now = Utc::now();
        Account {
            id: AccountId::from(id.to_string()),
            name: id.to_string(),
            platform,
            account_type: AccountType::OAuth,
            credentials: Creds { access_token: None, refresh_token: None, api_key: None, expires_at: None, extras: Default::default() },
            proxy_id: None,
            priority: 1,
            concurrency_limit: 1,
            status: AccountStatus::Active,
            error_message: None,
            schedulable: true,
            rate_limited_at: None,
            rate_limit_reset_at: None,
            overload_until: None,
            temp_unschedulable_until: None,
            temp_unschedulable_reason: None,
            session_window_start: None,
            session_window_end: None,
            session_window_status: None,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn list_schedulable_excludes_rate_limited_accounts() {
        let repo = InMemoryAccountRepository::new(vec![account("a1", Platform::Claude)]);
        let now = Utc::now();
        repo.mark_rate_limited(&AccountId::from("a1".to_string()), now + ChronoDuration::seconds(30))
            .await
            .unwrap();
        let schedulable = repo.list_schedulable(Platform::Claude, &[], now).await.unwrap();
        assert!(schedulable.is_empty());

        let schedulable_later =
            repo.list_schedulable(Platform::Claude, &[], now + ChronoDuration::seconds(31)).await.unwrap();
        assert_eq!(schedulable_later.len(), 1);
    }

    #[tokio::test]
    async fn clear_error_restores_eligibility() {
        let repo = InMemoryAccountRepository::new(vec![account("a1", Platform::Claude)]);
        let id = AccountId::from("a1".to_string());
        repo.mark_overload(&id, Utc::now() + ChronoDuration::minutes(5)).await.unwrap();
        repo.clear_error(&id).await.unwrap();
        let schedulable = repo.list_schedulable(Platform::Claude, &[], Utc::now()).await.unwrap();
        assert_eq!(schedulable.len(), 1);
    }
}
