//! Token Refresh Service: a periodic loop that renews
//! OAuth credentials before they expire, with exponential backoff,
//! jitter, and per-account dedup via a KV-store lock so two replicas
//! never refresh the same account concurrently.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use gateway_core::{Account, AccountCredentials, AccountId};
use gateway_kv::KvStore;
use gateway_store::AccountRepository;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("provider refresh call failed: {0}")]
    Provider(String),
}

/// Provider-specific OAuth refresh call. One implementation per platform
/// lives outside this crate (it needs the provider's token endpoint and
/// client credentials); this crate only owns the scheduling loop.
#[async_trait]
pub trait OAuthRefresher: Send + Sync {
    async fn refresh(&self, account: &Account) -> Result<AccountCredentials, RefreshError>;
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub check_interval_minutes: u64,
    pub refresh_before_expiry_hours: i64,
    pub max_retries: u32,
    pub retry_backoff_seconds: u64,
    pub lock_ttl_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            check_interval_minutes: 5,
            refresh_before_expiry_hours: 1,
            max_retries: 3,
            retry_backoff_seconds: 2,
            lock_ttl_secs: 60,
        }
    }
}

pub struct RefreshService {
    accounts: Arc<dyn AccountRepository>,
    kv: Arc<dyn KvStore>,
    refreshers: Vec<Arc<dyn OAuthRefresher>>,
    config: RefreshConfig,
}

impl RefreshService {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        kv: Arc<dyn KvStore>,
        refresher: Arc<dyn OAuthRefresher>,
        config: RefreshConfig,
    ) -> Self {
        Self { accounts, kv, refreshers: vec![refresher], config }
    }

    /// Runs until cancelled. Intended to be spawned once at startup
    /// alongside the concurrency slot sweeper.
    pub async fn run(&self, cancel: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(StdDuration::from_secs(self.config.check_interval_minutes * 60));
        let mut cancel = cancel;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        info!("refresh service stopping");
                        return;
                    }
                }
            }
        }
    }

    pub async fn sweep(&self) {
        let now = Utc::now();
        let deadline = now + chrono::Duration::hours(self.config.refresh_before_expiry_hours);
        let due = match self.accounts.list_expiring_oauth(deadline).await {
            Ok(accounts) => accounts,
            Err(err) => {
                error!(%err, "failed to list accounts due for refresh");
                return;
            }
        };
        for account in due {
            self.refresh_one(&account).await;
        }
    }

    async fn refresh_one(&self, account: &Account) {
        let lock_key = format!("refresh-lock:{}", account.id.as_str());
        let ttl = StdDuration::from_secs(self.config.lock_ttl_secs);
        match self.kv.try_lock(&lock_key, ttl).await {
            Ok(true) => {}
            Ok(false) => {
                info!(account_id = %account.id, "refresh already in progress on another replica");
                return;
            }
            Err(err) => {
                error!(%err, account_id = %account.id, "refresh lock acquisition failed");
                return;
            }
        }

        let result = self.refresh_with_retries(account).await;
        let _ = self.kv.delete(&lock_key).await;

        match result {
            Ok(credentials) => {
                if let Err(err) = self.accounts.update_credentials(&account.id, credentials).await {
                    error!(%err, account_id = %account.id, "failed to persist refreshed credentials");
                }
            }
            Err(err) => {
                warn!(%err, account_id = %account.id, "token refresh exhausted retries, marking account error");
                let _ = self.accounts.mark_error(&account.id, "oauth token refresh failed").await;
            }
        }
    }

    async fn refresh_with_retries(&self, account: &Account) -> Result<AccountCredentials, RefreshError> {
        let refresher = self.refreshers.first().expect("at least one refresher configured");
        let mut attempt = 0u32;
        loop {
            match refresher.refresh(account).await {
                Ok(credentials) => return Ok(credentials),
                Err(err) if attempt >= self.config.max_retries => return Err(err),
                Err(err) => {
                    attempt += 1;
                    let backoff = backoff_duration(self.config.retry_backoff_seconds, attempt);
                    warn!(%err, account_id = %account.id, attempt, backoff_secs = backoff.as_secs(), "refresh attempt failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

/// `retry_backoff_seconds * 2^attempt + jitter`, jitter uniform in
/// `[0, 0.2 * base)`.
fn backoff_duration(base_secs: u64, attempt: u32) -> StdDuration {
    let base = base_secs as f64 * 2f64.powi(attempt as i32);
    let jitter = rand::random::<f64>() * base * 0.2;
    StdDuration::from_secs_f64(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_store::InMemoryAccountRepository;
    use gateway_kv::InMemoryKvStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn oauth_account(id: &str, expires_in_minutes: i64) -> Account {
        let now = Utc::now();
        gateway_core::Account {
            id: AccountId::from(id.to_string()),
            name: id.to_string(),
            platform: gateway_core::Platform::Claude,
            account_type: gateway_core::AccountType::OAuth,
            credentials: AccountCredentials {
                access_token: Some("old-token".into()),
                refresh_token: Some("refresh-token".into()),
                api_key: None,
                expires_at: Some(now + chrono::Duration::minutes(expires_in_minutes)),
                extras: Default::default(),
            },
            proxy_id: None,
            priority: 1,
            concurrency_limit: 1,
            status: gateway_core::AccountStatus::Active,
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

    struct AlwaysSucceeds {
        calls: AtomicU32,
    }

    #[async_trait]
    impl OAuthRefresher for AlwaysSucceeds {
        async fn refresh(&self, _account: &Account) -> Result<AccountCredentials, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AccountCredentials {
                access_token: Some("new-token".into()),
                refresh_token: Some("refresh-token".into()),
                api_key: None,
                expires_at: Some(Utc::now() + chrono::Duration::hours(2)),
                extras: Default::default(),
            })
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl OAuthRefresher for AlwaysFails {
        async fn refresh(&self, _account: &Account) -> Result<AccountCredentials, RefreshError> {
            Err(RefreshError::Provider("invalid_grant".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn due_account_gets_refreshed_and_credentials_updated() {
        let accounts = Arc::new(InMemoryAccountRepository::new(vec![oauth_account("acc-1", 10)]));
        let kv = Arc::new(InMemoryKvStore::default());
        let refresher = Arc::new(AlwaysSucceeds { calls: AtomicU32::new(0) });
        let service = RefreshService::new(
            accounts.clone(),
            kv,
            refresher.clone(),
            RefreshConfig { refresh_before_expiry_hours: 1, ..Default::default() },
        );

        service.sweep().await;

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        let refreshed = accounts.get(&AccountId::from("acc-1".to_string())).await.unwrap().unwrap();
        assert_eq!(refreshed.credentials.access_token.as_deref(), Some("new-token"));
    }

    #[tokio::test(start_paused = true)]
    async fn account_not_due_is_left_untouched() {
        let accounts = Arc::new(InMemoryAccountRepository::new(vec![oauth_account("acc-1", 600)]));
        let kv = Arc::new(InMemoryKvStore::default());
        let refresher = Arc::new(AlwaysSucceeds { calls: AtomicU32::new(0) });
        let service = RefreshService::new(accounts, kv, refresher.clone(), RefreshConfig::default());

        service.sweep().await;

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_failure_marks_account_error() {
        let accounts = Arc::new(InMemoryAccountRepository::new(vec![oauth_account("acc-1", 10)]));
        let kv = Arc::new(InMemoryKvStore::default());
        let refresher = Arc::new(AlwaysFails);
        let service = RefreshService::new(
            accounts.clone(),
            kv,
            refresher,
            RefreshConfig { max_retries: 1, retry_backoff_seconds: 0, refresh_before_expiry_hours: 1, ..Default::default() },
        );

        service.sweep().await;

        let account = accounts.get(&AccountId::from("acc-1".to_string())).await.unwrap().unwrap();
        assert_eq!(account.status, gateway_core::AccountStatus::Error);
    }

    #[tokio::test]
    async fn concurrent_refresh_is_deduplicated_by_lock() {
        let kv = Arc::new(InMemoryKvStore::default());
        let key = "refresh-lock:acc-1";
        let first = kv.try_lock(key, StdDuration::from_secs(30)).await.unwrap();
        let second = kv.try_lock(key, StdDuration::from_secs(30)).await.unwrap();
        assert!(first);
        assert!(!second);
    }
}
