use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use gateway_core::{
    ApiKey, ApiKeyId, GroupId, User, UserId, UserStatus, UserSubscription,
};
use sqlx::{PgPool, Row};

use crate::error::StoreError;

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get(&self, id: &UserId) -> Result<Option<User>, StoreError>;

    async fn allowed_group_ids(&self, id: &UserId) -> Result<Vec<GroupId>, StoreError>;

    /// Applies `delta` (negative for a debit) to the user's balance.
    /// Implementations must do this as a single atomic update so concurrent
    /// debits never interleave lost updates.
    async fn apply_balance_delta(&self, id: &UserId, delta: f64) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    async fn find_active_by_hash(&self, token_hash: &str) -> Result<Option<ApiKey>, StoreError>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn find_active(
        &self,
        user_id: &UserId,
        group_id: &GroupId,
        now: DateTime<Utc>,
    ) -> Result<Option<UserSubscription>, StoreError>;

    /// Rotates any rolling window whose anchor has fallen behind `now` back
    /// to the start of its period, then applies `cost` to all three
    /// counters. A daily anchor 25h in the past rotates to the
    /// start of today before the new usage is added.
    async fn apply_usage(
        &self,
        subscription_id: &gateway_core::SubscriptionId,
        cost: f64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn get(&self, id: &UserId) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT id, balance_usd, concurrency_limit, status, role FROM users WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let status: String = r.try_get("status")?;
            Ok(User {
                id: UserId::from(r.try_get::<String, _>("id")?),
                balance_usd: r.try_get("balance_usd")?,
                concurrency_limit: r.try_get("concurrency_limit")?,
                status: if status == "active" { UserStatus::Active } else { UserStatus::Disabled },
                role: r.try_get("role")?,
            })
        })
        .transpose()
        .map_err(StoreError::Database)
    }

    async fn allowed_group_ids(&self, id: &UserId) -> Result<Vec<GroupId>, StoreError> {
        let rows = sqlx::query("SELECT group_id FROM user_allowed_groups WHERE user_id = $1")
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| r.try_get::<String, _>("group_id").map(Into::into))
            .collect::<Result<_, _>>()
            .map_err(StoreError::Database)
    }

    async fn apply_balance_delta(&self, id: &UserId, delta: f64) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET balance_usd = balance_usd + $2 WHERE id = $1")
            .bind(id.as_str())
            .bind(delta)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub struct PgApiKeyRepository {
    pool: PgPool,
}

impl PgApiKeyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApiKeyRepository for PgApiKeyRepository {
    async fn find_active_by_hash(&self, token_hash: &str) -> Result<Option<ApiKey>, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, bound_group_id, prefix, token_hash, active FROM api_keys WHERE token_hash = $1 AND active = true",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(ApiKey {
                id: ApiKeyId::from(r.try_get::<String, _>("id")?),
                user_id: UserId::from(r.try_get::<String, _>("user_id")?),
                bound_group_id: r.try_get::<Option<String>, _>("bound_group_id")?.map(Into::into),
                prefix: r.try_get("prefix")?,
                token_hash: r.try_get("token_hash")?,
                active: r.try_get("active")?,
            })
        })
        .transpose()
        .map_err(StoreError::Database)
    }
}

pub struct PgSubscriptionRepository {
    pool: PgPool,
}

impl PgSubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionRepository for PgSubscriptionRepository {
    async fn find_active(
        &self,
        user_id: &UserId,
        group_id: &GroupId,
        now: DateTime<Utc>,
    ) -> Result<Option<UserSubscription>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM user_subscriptions WHERE user_id = $1 AND group_id = $2 AND expires_at > $3",
        )
        .bind(user_id.as_str())
        .bind(group_id.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_subscription).transpose()
    }

    async fn apply_usage(
        &self,
        subscription_id: &gateway_core::SubscriptionId,
        cost: f64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE user_subscriptions SET
                daily_used_usd = CASE WHEN daily_anchor < date_trunc('day', $2) THEN $3 ELSE daily_used_usd + $3 END,
                weekly_used_usd = CASE WHEN weekly_anchor < date_trunc('week', $2) THEN $3 ELSE weekly_used_usd + $3 END,
                monthly_used_usd = CASE WHEN monthly_anchor < date_trunc('month', $2) THEN $3 ELSE monthly_used_usd + $3 END,
                daily_anchor = GREATEST(daily_anchor, date_trunc('day', $2)),
                weekly_anchor = GREATEST(weekly_anchor, date_trunc('week', $2)),
                monthly_anchor = GREATEST(monthly_anchor, date_trunc('month', $2))
            WHERE id = $1
            "#,
        )
        .bind(subscription_id.as_str())
        .bind(now)
        .bind(cost)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_subscription(row: sqlx::postgres::PgRow) -> Result<UserSubscription, StoreError> {
    Ok(UserSubscription {
        id: row.try_get::<String, _>("id").map_err(StoreError::Database)?.into(),
        user_id: row.try_get::<String, _>("user_id").map_err(StoreError::Database)?.into(),
        group_id: row.try_get::<String, _>("group_id").map_err(StoreError::Database)?.into(),
        expires_at: row.try_get("expires_at").map_err(StoreError::Database)?,
        daily_cap_usd: row.try_get("daily_cap_usd").map_err(StoreError::Database)?,
        weekly_cap_usd: row.try_get("weekly_cap_usd").map_err(StoreError::Database)?,
        monthly_cap_usd: row.try_get("monthly_cap_usd").map_err(StoreError::Database)?,
        daily_used_usd: row.try_get("daily_used_usd").map_err(StoreError::Database)?,
        weekly_used_usd: row.try_get("weekly_used_usd").map_err(StoreError::Database)?,
        monthly_used_usd: row.try_get("monthly_used_usd").map_err(StoreError::Database)?,
        daily_anchor: row.try_get("daily_anchor").map_err(StoreError::Database)?,
        weekly_anchor: row.try_get("weekly_anchor").map_err(StoreError::Database)?,
        monthly_anchor: row.try_get("monthly_anchor").map_err(StoreError::Database)?,
    })
}

/// In-memory fakes for the billing pipeline's unit tests.
#[derive(Default)]
pub struct InMemoryUserRepository {
    users: Mutex<HashMap<UserId, User>>,
    allowed_groups: Mutex<HashMap<UserId, Vec<GroupId>>>,
}

impl InMemoryUserRepository {
    pub fn new(users: Vec<User>) -> Self {
        let map = users.into_iter().map(|u| (u.id.clone(), u)).collect();
        Self { users: Mutex::new(map), allowed_groups: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn get(&self, id: &UserId) -> Result<Option<User>, StoreError> {
        Ok(self.users.lock().unwrap().get(id).cloned())
    }

    async fn allowed_group_ids(&self, id: &UserId) -> Result<Vec<GroupId>, StoreError> {
        Ok(self.allowed_groups.lock().unwrap().get(id).cloned().unwrap_or_default())
    }

    async fn apply_balance_delta(&self, id: &UserId, delta: f64) -> Result<(), StoreError> {
        let mut users = self.users.lock().unwrap();
        let user = users.get_mut(id).ok_or(StoreError::NotFound)?;
        user.balance_usd += delta;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryApiKeyRepository {
    keys: Mutex<HashMap<String, ApiKey>>,
}

impl InMemoryApiKeyRepository {
    pub fn new(keys: Vec<ApiKey>) -> Self {
        let map = keys.into_iter().map(|k| (k.token_hash.clone(), k)).collect();
        Self { keys: Mutex::new(map) }
    }
}

#[async_trait]
impl ApiKeyRepository for InMemoryApiKeyRepository {
    async fn find_active_by_hash(&self, token_hash: &str) -> Result<Option<ApiKey>, StoreError> {
        Ok(self.keys.lock().unwrap().get(token_hash).filter(|k| k.active).cloned())
    }
}

#[derive(Default)]
pub struct InMemorySubscriptionRepository {
    subscriptions: Mutex<HashMap<gateway_core::SubscriptionId, UserSubscription>>,
}

impl InMemorySubscriptionRepository {
    pub fn new(subscriptions: Vec<UserSubscription>) -> Self {
        let map = subscriptions.into_iter().map(|s| (s.id.clone(), s)).collect();
        Self { subscriptions: Mutex::new(map) }
    }
}

#[async_trait]
impl SubscriptionRepository for InMemorySubscriptionRepository {
    async fn find_active(
        &self,
        user_id: &UserId,
        group_id: &GroupId,
        now: DateTime<Utc>,
    ) -> Result<Option<UserSubscription>, StoreError> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .find(|s| &s.user_id == user_id && &s.group_id == group_id && s.expires_at > now)
            .cloned())
    }

    async fn apply_usage(
        &self,
        subscription_id: &gateway_core::SubscriptionId,
        cost: f64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let sub = subscriptions.get_mut(subscription_id).ok_or(StoreError::NotFound)?;
        rotate_and_apply(sub, cost, now);
        Ok(())
    }
}

/// Mirrors the SQL `CASE WHEN anchor < start-of-period THEN reset ELSE
/// accumulate` rotation `PgSubscriptionRepository::apply_usage` performs,
/// for the in-memory fake used in scheduler/billing unit tests.
fn rotate_and_apply(sub: &mut UserSubscription, cost: f64, now: DateTime<Utc>) {
    let day_start = now.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
    let week_start = day_start - chrono::Duration::days(now.date_naive().weekday().num_days_from_monday() as i64);
    let month_start = now.date_naive().with_day(1).unwrap().and_hms_opt(0, 0, 0).unwrap().and_utc();

    if sub.daily_anchor < day_start {
        sub.daily_used_usd = cost;
        sub.daily_anchor = day_start;
    } else {
        sub.daily_used_usd += cost;
    }
    if sub.weekly_anchor < week_start {
        sub.weekly_used_usd = cost;
        sub.weekly_anchor = week_start;
    } else {
        sub.weekly_used_usd += cost;
    }
    if sub.monthly_anchor < month_start {
        sub.monthly_used_usd = cost;
        sub.monthly_anchor = month_start;
    } else {
        sub.monthly_used_usd += cost;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::SubscriptionId;

    fn subscription(daily_anchor: DateTime<Utc>, daily_used: f64) -> UserSubscription {
        UserSubscription {
            id: SubscriptionId::from("sub-1".to_string()),
            user_id: UserId::from("user-1".to_string()),
            group_id: GroupId::from("group-1".to_string()),
            expires_at: Utc::now() + chrono::Duration::days(30),
            daily_cap_usd: 10.0,
            weekly_cap_usd: 50.0,
            monthly_cap_usd: 200.0,
            daily_used_usd: daily_used,
            weekly_used_usd: daily_used,
            monthly_used_usd: daily_used,
            daily_anchor,
            weekly_anchor: daily_anchor,
            monthly_anchor: daily_anchor,
        }
    }

    #[tokio::test]
    async fn stale_daily_anchor_rotates_before_applying_new_usage() {
        let now = Utc::now();
        let stale_anchor = now - chrono::Duration::hours(25);
        let repo = InMemorySubscriptionRepository::new(vec![subscription(stale_anchor, 9.9)]);

        repo.apply_usage(&SubscriptionId::from("sub-1".to_string()), 0.5, now).await.unwrap();

        let sub = repo.find_active(&UserId::from("user-1".to_string()), &GroupId::from("group-1".to_string()), now).await.unwrap().unwrap();
        assert_eq!(sub.daily_used_usd, 0.5);
    }

    #[tokio::test]
    async fn fresh_daily_anchor_accumulates() {
        let now = Utc::now();
        let today_start = now.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
        let repo = InMemorySubscriptionRepository::new(vec![subscription(today_start, 1.0)]);

        repo.apply_usage(&SubscriptionId::from("sub-1".to_string()), 0.5, now).await.unwrap();

        let sub = repo.find_active(&UserId::from("user-1".to_string()), &GroupId::from("group-1".to_string()), now).await.unwrap().unwrap();
        assert_eq!(sub.daily_used_usd, 1.5);
    }
}
