use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gateway_core::{Account, AccountId, GatewaySchedulingConfig, GroupId, Platform, UserId};
use gateway_core::{ErrorKind, GatewayError};
use gateway_concurrency::ConcurrencySlots;
use gateway_kv::KvStore;
use gateway_store::AccountRepository;
use tokio::time::Instant;
use tracing::debug;

use crate::bucket::Bucket;
use crate::lease::Lease;

pub struct ScheduleRequest {
    pub user_id: UserId,
    pub user_concurrency_limit: i64,
    pub platform: Platform,
    pub allowed_group_ids: Vec<GroupId>,
    pub sticky_session_id: Option<String>,
}

fn affinity_key(platform: Platform, sticky_session_id: &str) -> String {
    format!("affinity:{platform}:{sticky_session_id}")
}

/// Releases the per-user slot unless `committed` is set before drop —
/// guarantees step 1's slot is freed on every early-return path, including
/// the caller dropping the whole `acquire` future mid-wait.
struct UserSlotGuard {
    concurrency: Arc<ConcurrencySlots>,
    user_id: UserId,
    committed: bool,
}

impl Drop for UserSlotGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let concurrency = self.concurrency.clone();
            let user_id = self.user_id.clone();
            handle.spawn(async move { concurrency.release_user(&user_id).await });
        }
    }
}

struct AccountCandidate {
    account: Account,
    group_priority: Option<i32>,
}

impl AccountCandidate {
    fn rank_priority(&self) -> i32 {
        self.group_priority.unwrap_or(self.account.priority)
    }
}

pub struct SchedulerInner {
    pub(crate) accounts: Arc<dyn AccountRepository>,
    pub(crate) concurrency: Arc<ConcurrencySlots>,
    pub(crate) kv: Arc<dyn KvStore>,
    pub(crate) config: GatewaySchedulingConfig,
    sticky_buckets: Mutex<HashMap<AccountId, Arc<Bucket>>>,
    fallback_bucket: Arc<Bucket>,
}

impl SchedulerInner {
    fn sticky_bucket_for(&self, account_id: &AccountId) -> Arc<Bucket> {
        let mut buckets = self.sticky_buckets.lock().unwrap();
        buckets
            .entry(account_id.clone())
            .or_insert_with(|| Arc::new(Bucket::new(self.config.sticky_session_max_waiting)))
            .clone()
    }

    pub(crate) async fn release(&self, account_id: &AccountId, user_id: &UserId) {
        self.concurrency.release(account_id, user_id).await;
        let sticky = self.sticky_bucket_for(account_id);
        if sticky.len() > 0 {
            sticky.wake_front();
        } else {
            self.fallback_bucket.wake_front();
        }
    }
}

/// Account Scheduler: sticky-session routing, group-filtered priority
/// ranking, and fair FIFO queueing across two bucket types.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        concurrency: Arc<ConcurrencySlots>,
        kv: Arc<dyn KvStore>,
        config: GatewaySchedulingConfig,
    ) -> Self {
        let fallback_bucket = Arc::new(Bucket::new(config.fallback_max_waiting));
        Self {
            inner: Arc::new(SchedulerInner {
                accounts,
                concurrency,
                kv,
                config,
                sticky_buckets: Mutex::new(HashMap::new()),
                fallback_bucket,
            }),
        }
    }

    pub async fn acquire(&self, req: ScheduleRequest) -> Result<Lease, GatewayError> {
        let inner = &self.inner;

        // Step 1: per-user slot.
        if !inner.concurrency.try_acquire_user(&req.user_id, req.user_concurrency_limit).await {
            return Err(GatewayError::new(
                ErrorKind::NoCapacity,
                "USER_AT_CONCURRENCY_CAP",
                "user has reached their concurrency limit",
            ));
        }
        let mut user_slot =
            UserSlotGuard { concurrency: inner.concurrency.clone(), user_id: req.user_id.clone(), committed: false };

        let now = chrono::Utc::now();
        let candidates = self.resolve_candidates(&req, now).await?;

        // Step 2/3: sticky path.
        if let Some(sticky_id) = &req.sticky_session_id {
            let key = affinity_key(req.platform, sticky_id);
            if let Ok(Some(remembered)) = inner.kv.get(&key).await {
                let remembered_id = AccountId::from(remembered);
                if let Some(candidate) = candidates.iter().find(|c| c.account.id == remembered_id) {
                    if let Some(lease) = self
                        .try_sticky(&req, &candidate.account, &mut user_slot, &key)
                        .await?
                    {
                        return Ok(lease);
                    }
                }
            }
        }

        // Step 4: fallback ranking.
        if let Some(lease) = self.try_fallback_once(&req, &candidates, &mut user_slot).await? {
            return Ok(lease);
        }

        // Step 5: fallback bucket wait, re-evaluating candidates on each wakeup.
        let Some(ticket) = inner.fallback_bucket.try_enqueue() else {
            return Err(GatewayError::new(
                ErrorKind::NoCapacity,
                "FALLBACK_QUEUE_FULL",
                "fallback waitlist is at capacity",
            ));
        };

        let deadline = Instant::now() + Duration::from_secs(inner.config.fallback_wait_timeout_secs);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                inner.fallback_bucket.remove(&ticket);
                return Err(GatewayError::new(ErrorKind::Timeout, "FALLBACK_WAIT_TIMEOUT", "timed out waiting for an account"));
            }
            tokio::select! {
                _ = inner.fallback_bucket.wait_for_wakeup(&ticket) => {}
                _ = tokio::time::sleep(remaining) => {
                    inner.fallback_bucket.remove(&ticket);
                    return Err(GatewayError::new(ErrorKind::Timeout, "FALLBACK_WAIT_TIMEOUT", "timed out waiting for an account"));
                }
            }

            let refreshed = self.resolve_candidates(&req, chrono::Utc::now()).await?;
            if let Some(lease) = self.try_fallback_once(&req, &refreshed, &mut user_slot).await? {
                inner.fallback_bucket.remove(&ticket);
                return Ok(lease);
            }
        }
    }

    async fn resolve_candidates(
        &self,
        req: &ScheduleRequest,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<AccountCandidate>, GatewayError> {
        let accounts = self
            .inner
            .accounts
            .list_schedulable(req.platform, &req.allowed_group_ids, now)
            .await
            .map_err(Into::<GatewayError>::into)?;

        let mut candidates = Vec::with_capacity(accounts.len());
        for account in accounts {
            let group_priority = self
                .inner
                .accounts
                .group_priority(&account.id, &req.allowed_group_ids)
                .await
                .map_err(Into::<GatewayError>::into)?;
            candidates.push(AccountCandidate { account, group_priority });
        }
        Ok(candidates)
    }

    async fn try_sticky(
        &self,
        req: &ScheduleRequest,
        account: &Account,
        user_slot: &mut UserSlotGuard,
        affinity_key: &str,
    ) -> Result<Option<Lease>, GatewayError> {
        let inner = &self.inner;
        if inner.concurrency.try_acquire_account(&account.id, account.concurrency_limit as i64).await {
            return Ok(Some(self.finish(req, account, user_slot, affinity_key).await));
        }

        let bucket = inner.sticky_bucket_for(&account.id);
        let Some(ticket) = bucket.try_enqueue() else {
            return Err(GatewayError::new(
                ErrorKind::NoCapacity,
                "STICKY_QUEUE_FULL",
                "sticky waitlist for this account is at capacity",
            ));
        };

        let deadline = Instant::now() + Duration::from_secs(inner.config.sticky_session_wait_timeout_secs);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bucket.remove(&ticket);
                return Ok(None); // fall through to step 4
            }
            tokio::select! {
                _ = bucket.wait_for_wakeup(&ticket) => {}
                _ = tokio::time::sleep(remaining) => {
                    bucket.remove(&ticket);
                    return Ok(None);
                }
            }
            if inner.concurrency.try_acquire_account(&account.id, account.concurrency_limit as i64).await {
                bucket.remove(&ticket);
                return Ok(Some(self.finish(req, account, user_slot, affinity_key).await));
            }
        }
    }

    async fn try_fallback_once(
        &self,
        req: &ScheduleRequest,
        candidates: &[AccountCandidate],
        user_slot: &mut UserSlotGuard,
    ) -> Result<Option<Lease>, GatewayError> {
        let inner = &self.inner;
        let mut ranked: Vec<&AccountCandidate> = candidates.iter().collect();

        let mut loads: HashMap<AccountId, f64> = HashMap::new();
        if inner.config.load_batch_enabled {
            for c in &ranked {
                let load = inner
                    .concurrency
                    .account_load(&c.account.id, c.account.concurrency_limit as i64)
                    .await;
                loads.insert(c.account.id.clone(), load);
            }
        }

        ranked.sort_by(|a, b| {
            a.rank_priority()
                .cmp(&b.rank_priority())
                .then_with(|| {
                    if inner.config.load_batch_enabled {
                        let la = loads.get(&a.account.id).copied().unwrap_or(0.0);
                        let lb = loads.get(&b.account.id).copied().unwrap_or(0.0);
                        la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
                    } else {
                        std::cmp::Ordering::Equal
                    }
                })
                .then_with(|| a.account.last_used_at.cmp(&b.account.last_used_at))
        });

        for candidate in ranked {
            if inner
                .concurrency
                .try_acquire_account(&candidate.account.id, candidate.account.concurrency_limit as i64)
                .await
            {
                let affinity_key = req
                    .sticky_session_id
                    .as_ref()
                    .map(|s| affinity_key(req.platform, s))
                    .unwrap_or_default();
                return Ok(Some(self.finish(req, &candidate.account, user_slot, &affinity_key).await));
            }
        }
        Ok(None)
    }

    async fn finish(
        &self,
        req: &ScheduleRequest,
        account: &Account,
        user_slot: &mut UserSlotGuard,
        affinity_key: &str,
    ) -> Lease {
        let inner = &self.inner;
        if !affinity_key.is_empty() {
            let _ = inner
                .kv
                .set_ex(
                    affinity_key,
                    account.id.as_str(),
                    Duration::from_secs(inner.config.sticky_affinity_ttl_secs),
                )
                .await;
        }
        let _ = inner.accounts.touch_last_used(&account.id, chrono::Utc::now()).await;
        debug!(account_id = %account.id, user_id = %req.user_id, "lease granted");

        // The lease now owns releasing the user slot too, via the same
        // `SchedulerInner::release` call used for the account slot.
        user_slot.committed = true;

        Lease {
            account_id: account.id.clone(),
            user_id: req.user_id.clone(),
            inner: inner.clone(),
            released: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_concurrency::ConcurrencySlots;
    use gateway_core::{AccountCredentials, AccountStatus, AccountType};
    use gateway_kv::InMemoryKvStore;
    use gateway_store::InMemoryAccountRepository;
    use std::time::Duration as StdDuration;

    fn account(id: &str, priority: i32, concurrency_limit: i32) -> Account {
        let now = chrono::Utc::now();
        Account {
            id: AccountId::from(id.to_string()),
            name: id.to_string(),
            platform: Platform::Claude,
            account_type: AccountType::OAuth,
            credentials: AccountCredentials {
                access_token: None,
                refresh_token: None,
                api_key: None,
                expires_at: None,
                extras: Default::default(),
            },
            proxy_id: None,
            priority,
            concurrency_limit,
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

    fn test_scheduler(accounts: Vec<Account>) -> Scheduler {
        let repo: Arc<dyn AccountRepository> = Arc::new(InMemoryAccountRepository::new(accounts));
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let concurrency = Arc::new(ConcurrencySlots::new(kv.clone(), StdDuration::from_secs(600)));
        let mut config = GatewaySchedulingConfig::default();
        config.sticky_session_wait_timeout_secs = 1;
        config.fallback_wait_timeout_secs = 1;
        Scheduler::new(repo, concurrency, kv, config)
    }

    fn req(sticky: Option<&str>) -> ScheduleRequest {
        ScheduleRequest {
            user_id: UserId::from("user-1".to_string()),
            user_concurrency_limit: 10,
            platform: Platform::Claude,
            allowed_group_ids: vec![],
            sticky_session_id: sticky.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn fallback_ranking_prefers_lower_priority_then_lower_load() {
        let scheduler = test_scheduler(vec![account("a", 1, 2), account("b", 2, 2), account("c", 2, 2)]);
        // Saturate A so it's no longer a candidate this round, and give C one active slot.
        let lease_a1 = scheduler.acquire(req(None)).await.unwrap();
        assert_eq!(lease_a1.account_id().as_str(), "a");
        let lease_a2 = scheduler.acquire(req(None)).await.unwrap();
        assert_eq!(lease_a2.account_id().as_str(), "a");

        let lease_c = scheduler.acquire(req(None)).await.unwrap();
        // B and C tie on priority=2 with zero load; first candidate in insertion
        // order (B) wins since load is equal.
        assert_eq!(lease_c.account_id().as_str(), "b");
    }

    #[tokio::test]
    async fn sticky_session_reuses_prior_account_after_release() {
        let scheduler = test_scheduler(vec![account("a", 1, 1), account("b", 2, 1)]);
        let lease1 = scheduler.acquire(req(Some("sess-1"))).await.unwrap();
        assert_eq!(lease1.account_id().as_str(), "a");
        lease1.release().await;

        let lease2 = scheduler.acquire(req(Some("sess-1"))).await.unwrap();
        assert_eq!(lease2.account_id().as_str(), "a");
    }

    #[tokio::test]
    async fn no_eligible_account_falls_back_to_timeout() {
        let scheduler = test_scheduler(vec![account("a", 1, 1)]);
        let _lease = scheduler.acquire(req(None)).await.unwrap();
        let err = scheduler.acquire(req(None)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn dropping_in_flight_lease_frees_the_account_slot() {
        let scheduler = test_scheduler(vec![account("a", 1, 1)]);
        let lease = scheduler.acquire(req(None)).await.unwrap();
        drop(lease);
        // Give the spawned release task a chance to run.
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        let lease2 = scheduler.acquire(req(None)).await.unwrap();
        assert_eq!(lease2.account_id().as_str(), "a");
    }
}
