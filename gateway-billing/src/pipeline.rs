//! Turns a completed proxy request into cost, a billing route decision,
//! and an idempotent ledger write.

use std::sync::Arc;

use chrono::Utc;
use gateway_core::{
    BillingType, BillingUsageEntry, ErrorKind, GatewayError, GroupId, PriceTableEntry, TokenUsage,
    UsageDraft, UsageLog, UsageLogId, UserId,
};
use gateway_store::{InsertOutcome, SubscriptionRepository, UsageStore, UserRepository};
use tracing::{info, warn};

use crate::pricing::PriceTable;

/// Per-category cost breakdown, computed once and carried through both the
/// stored `UsageLog` and the ledger application step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_creation_cost: f64,
    pub cache_read_cost: f64,
    pub total_cost: f64,
    pub actual_cost: f64,
}

/// Separate 5m/1h multipliers for cache-creation tokens, on top of the
/// baseline per-token rates. `rate_multiplier` is the account group's
/// markup/discount applied on top of the raw total.
///
/// `cache_creation_tokens` is a legacy aggregate some extractors also
/// populate alongside the 5m/1h breakdown (it's ~the sum of both). It is
/// only priced when the breakdown is entirely absent, so a cached request
/// that reports both is never charged twice.
pub fn compute_cost(usage: &TokenUsage, price: &PriceTableEntry, rate_multiplier: f64) -> CostBreakdown {
    let input_cost = usage.input_tokens as f64 * price.input;
    let output_cost = usage.output_tokens as f64 * price.output;
    let cache_creation_cost = if usage.cache_creation_5m_tokens == 0 && usage.cache_creation_1h_tokens == 0 {
        usage.cache_creation_tokens as f64 * price.cache_creation_5m
    } else {
        usage.cache_creation_5m_tokens as f64 * price.cache_creation_5m
            + usage.cache_creation_1h_tokens as f64 * price.cache_creation_1h
    };
    let cache_read_cost = usage.cache_read_tokens as f64 * price.cache_read;
    let total_cost = input_cost + output_cost + cache_creation_cost + cache_read_cost;
    let actual_cost = total_cost * rate_multiplier;

    CostBreakdown { input_cost, output_cost, cache_creation_cost, cache_read_cost, total_cost, actual_cost }
}

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error(transparent)]
    Store(#[from] gateway_store::StoreError),
    #[error("no price table entry for model {0}")]
    UnknownModel(String),
    #[error(transparent)]
    Insufficient(#[from] InsufficientFunds),
}

#[derive(Debug, thiserror::Error)]
#[error("insufficient balance or subscription capacity")]
pub struct InsufficientFunds;

impl From<BillingError> for GatewayError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Insufficient(_) => GatewayError::insufficient_balance(),
            other => GatewayError::new(ErrorKind::Internal, "BILLING_ERROR", other.to_string()),
        }
    }
}

/// Bypasses balance/subscription capacity checks entirely; usage is still
/// logged and the ledger still debited, just never rejected for lack of
/// funds. Useful for self-hosted deployments with no paid tiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct BillingConfig {
    pub simple_mode: bool,
}

pub struct BillingPipeline {
    pub users: Arc<dyn UserRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub usage_store: Arc<dyn UsageStore>,
    pub prices: PriceTable,
    pub config: BillingConfig,
}

/// Which ledger a charge was routed against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingRoute {
    Subscription(gateway_core::SubscriptionId),
    Balance,
}

impl BillingPipeline {
    /// Computes cost, resolves the billing route, and durably records the
    /// request. Idempotent in `draft.request_id` — a duplicate delivery
    /// returns the same outcome without charging twice.
    pub async fn record(&self, draft: UsageDraft) -> Result<UsageLog, BillingError> {
        let price = self.prices.get(&draft.model).ok_or_else(|| BillingError::UnknownModel(draft.model.clone()))?;
        let cost = compute_cost(&draft.usage, &price, draft.rate_multiplier);

        let route = self.resolve_route(&draft.user_id, draft.group_id.as_ref(), cost.actual_cost).await?;

        let log = UsageLog {
            id: UsageLogId::from(uuid::Uuid::new_v4().to_string()),
            request_id: draft.request_id.clone(),
            api_key_id: draft.api_key_id.clone(),
            account_id: draft.account_id.clone(),
            model: draft.model.clone(),
            group_id: draft.group_id.clone(),
            subscription_id: match &route {
                BillingRoute::Subscription(id) => Some(id.clone()),
                BillingRoute::Balance => None,
            },
            usage: draft.usage,
            input_cost: cost.input_cost,
            output_cost: cost.output_cost,
            cache_creation_cost: cost.cache_creation_cost,
            cache_read_cost: cost.cache_read_cost,
            total_cost: cost.total_cost,
            actual_cost: cost.actual_cost,
            billing_type: match route {
                BillingRoute::Subscription(_) => BillingType::Subscription,
                BillingRoute::Balance => BillingType::Balance,
            },
            stream: draft.stream,
            duration_ms: draft.duration_ms,
            first_token_ms: draft.first_token_ms,
            created_at: Utc::now(),
        };

        let outcome = self.usage_store.insert_usage_log(&log).await?;
        if outcome == InsertOutcome::AlreadyExists {
            info!(request_id = %draft.request_id, "duplicate usage delivery, skipping charge");
            return Ok(log);
        }

        self.apply_ledger(&draft.user_id, &log, &route, cost.actual_cost).await?;

        info!(
            request_id = %draft.request_id,
            model = %draft.model,
            actual_cost = cost.actual_cost,
            billing_type = %log.billing_type,
            "usage recorded",
        );

        Ok(log)
    }

    async fn resolve_route(
        &self,
        user_id: &UserId,
        group_id: Option<&GroupId>,
        cost: f64,
    ) -> Result<BillingRoute, BillingError> {
        if let Some(group_id) = group_id {
            if let Some(sub) = self.subscriptions.find_active(user_id, group_id, Utc::now()).await? {
                if sub.has_capacity(cost) {
                    return Ok(BillingRoute::Subscription(sub.id));
                }
            }
        }

        if self.config.simple_mode {
            return Ok(BillingRoute::Balance);
        }

        let user = self.users.get(user_id).await?.ok_or(InsufficientFunds)?;
        if user.balance_usd < cost {
            return Err(InsufficientFunds.into());
        }
        Ok(BillingRoute::Balance)
    }

    async fn apply_ledger(
        &self,
        user_id: &UserId,
        log: &UsageLog,
        route: &BillingRoute,
        cost: f64,
    ) -> Result<(), BillingError> {
        match route {
            BillingRoute::Subscription(sub_id) => {
                self.subscriptions.apply_usage(sub_id, cost, Utc::now()).await?;
            }
            BillingRoute::Balance => {
                self.users.apply_balance_delta(user_id, -cost).await?;
            }
        }

        let entry = BillingUsageEntry {
            usage_log_id: log.id.clone(),
            user_id: user_id.clone(),
            api_key_id: log.api_key_id.clone(),
            subscription_id: log.subscription_id.clone(),
            billing_type: log.billing_type,
            applied: true,
            delta_usd: -cost,
        };

        match self.usage_store.insert_billing_entry(&entry).await? {
            InsertOutcome::Inserted => {}
            InsertOutcome::AlreadyExists => warn!(usage_log_id = %log.id, "billing entry already applied"),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::{
        AccountId, ApiKeyId, RequestId, User, UserStatus, UserSubscription,
    };
    use gateway_store::{InMemorySubscriptionRepository, InMemoryUsageStore, InMemoryUserRepository};

    fn pipeline(users: Vec<User>, subs: Vec<UserSubscription>, simple_mode: bool) -> BillingPipeline {
        let mut prices = std::collections::HashMap::new();
        prices.insert("claude-3-5-sonnet".to_string(), price());
        BillingPipeline {
            users: Arc::new(InMemoryUserRepository::new(users)),
            subscriptions: Arc::new(InMemorySubscriptionRepository::new(subs)),
            usage_store: Arc::new(InMemoryUsageStore::default()),
            prices: PriceTable::new(prices),
            config: BillingConfig { simple_mode },
        }
    }

    fn draft(request_id: &str, usage: TokenUsage) -> UsageDraft {
        UsageDraft {
            request_id: RequestId::from(request_id.to_string()),
            api_key_id: ApiKeyId::from("key-1".to_string()),
            user_id: UserId::from("user-1".to_string()),
            account_id: AccountId::from("acc-1".to_string()),
            model: "claude-3-5-sonnet".to_string(),
            group_id: None,
            usage,
            stream: false,
            duration_ms: 500,
            first_token_ms: Some(120),
            rate_multiplier: 1.0,
        }
    }

    fn flush_usage(input: i64, output: i64) -> TokenUsage {
        TokenUsage { input_tokens: input, output_tokens: output, ..Default::default() }
    }

    fn price() -> PriceTableEntry {
        PriceTableEntry { input: 3.0e-6, output: 15.0e-6, cache_read: 0.3e-6, cache_creation_5m: 3.75e-6, cache_creation_1h: 6.0e-6 }
    }

    #[test]
    fn cache_creation_breakdown_is_not_double_counted_with_legacy_aggregate() {
        // A real Claude cache-creation response sets both the legacy
        // aggregate and the 5m/1h breakdown, with the aggregate roughly
        // equal to their sum.
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            cache_creation_tokens: 1000,
            cache_creation_5m_tokens: 700,
            cache_creation_1h_tokens: 300,
            cache_read_tokens: 0,
        };
        let price = price();
        let breakdown = compute_cost(&usage, &price, 1.0);

        let expected_cache_cost = 700.0 * price.cache_creation_5m + 300.0 * price.cache_creation_1h;
        assert!((breakdown.cache_creation_cost - expected_cache_cost).abs() < 1e-12);

        let expected_total =
            100.0 * price.input + 50.0 * price.output + expected_cache_cost;
        assert!((breakdown.total_cost - expected_total).abs() < 1e-12);
    }

    #[test]
    fn legacy_aggregate_alone_is_priced_at_5m_rate() {
        let usage = TokenUsage { cache_creation_tokens: 1000, ..Default::default() };
        let price = price();
        let breakdown = compute_cost(&usage, &price, 1.0);
        assert!((breakdown.cache_creation_cost - 1000.0 * price.cache_creation_5m).abs() < 1e-12);
    }

    fn user(balance: f64) -> User {
        User { id: UserId::from("user-1".to_string()), balance_usd: balance, concurrency_limit: 5, status: UserStatus::Active, role: "member".into() }
    }

    #[tokio::test]
    async fn balance_route_debits_user_and_logs_cost() {
        let pipe = pipeline(vec![user(10.0)], vec![], false);
        let log = pipe.record(draft("req-1", flush_usage(1000, 500))).await.unwrap();
        assert!(log.actual_cost > 0.0);
        assert_eq!(log.billing_type, BillingType::Balance);

        let remaining = pipe.users.get(&UserId::from("user-1".to_string())).await.unwrap().unwrap();
        assert!((remaining.balance_usd - (10.0 - log.actual_cost)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn duplicate_request_id_does_not_double_charge() {
        let pipe = pipeline(vec![user(10.0)], vec![], false);
        let d = draft("req-dup", flush_usage(1000, 500));

        pipe.record(d.clone()).await.unwrap();
        let balance_after_first = pipe.users.get(&UserId::from("user-1".to_string())).await.unwrap().unwrap().balance_usd;

        pipe.record(d).await.unwrap();
        let balance_after_second = pipe.users.get(&UserId::from("user-1".to_string())).await.unwrap().unwrap().balance_usd;

        assert_eq!(balance_after_first, balance_after_second);
    }

    #[tokio::test]
    async fn insufficient_balance_is_rejected() {
        let pipe = pipeline(vec![user(0.0)], vec![], false);
        let err = pipe.record(draft("req-2", flush_usage(1_000_000, 500_000))).await.unwrap_err();
        assert!(matches!(err, BillingError::Insufficient(_)));
    }

    #[tokio::test]
    async fn simple_mode_bypasses_balance_check() {
        let pipe = pipeline(vec![user(0.0)], vec![], true);
        let log = pipe.record(draft("req-3", flush_usage(1_000_000, 500_000))).await.unwrap();
        assert_eq!(log.billing_type, BillingType::Balance);
    }

    #[tokio::test]
    async fn subscription_with_capacity_is_preferred_over_balance() {
        let sub = UserSubscription {
            id: "sub-1".to_string().into(),
            user_id: UserId::from("user-1".to_string()),
            group_id: "group-1".to_string().into(),
            expires_at: Utc::now() + chrono::Duration::days(30),
            daily_cap_usd: 10.0,
            weekly_cap_usd: 50.0,
            monthly_cap_usd: 100.0,
            daily_used_usd: 0.0,
            weekly_used_usd: 0.0,
            monthly_used_usd: 0.0,
            daily_anchor: Utc::now(),
            weekly_anchor: Utc::now(),
            monthly_anchor: Utc::now(),
        };
        let pipe = pipeline(vec![user(0.0)], vec![sub], false);
        let mut d = draft("req-4", flush_usage(1000, 500));
        d.group_id = Some("group-1".to_string().into());

        let log = pipe.record(d).await.unwrap();
        assert_eq!(log.billing_type, BillingType::Subscription);
    }
}
