use chrono::{DateTime, Utc};
use derive_more::{AsRef, Deref, Display, From, Into};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Newtype identifiers, kept distinct so a `UserId` can never be passed
/// where an `AccountId` is expected.
macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            Hash,
            Display,
            From,
            AsRef,
            Deref,
            Into,
            Serialize,
            Deserialize,
            Default,
        )]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
    };
}

id_newtype!(AccountId);
id_newtype!(UserId);
id_newtype!(ApiKeyId);
id_newtype!(GroupId);
id_newtype!(ProxyId);
id_newtype!(SubscriptionId);
id_newtype!(UsageLogId);
id_newtype!(RequestId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[display("claude")]
    Claude,
    #[display("openai")]
    OpenAi,
    #[display("gemini")]
    Gemini,
    #[display("antigravity")]
    Antigravity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    #[display("oauth")]
    OAuth,
    #[display("apikey")]
    ApiKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[display("active")]
    Active,
    #[display("error")]
    Error,
    #[display("disabled")]
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionWindowStatus {
    #[display("active")]
    Active,
    #[display("expired")]
    Expired,
}

/// Credentials for one upstream account. Secret fields carry the encrypted
/// `enc:`-prefixed wire format produced by `gateway-crypto`; this type never
/// holds plaintext once it has round-tripped through the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCredentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub api_key: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Provider-specific extras: tier id, project id, organization id, etc.
    pub extras: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub platform: Platform,
    pub account_type: AccountType,
    pub credentials: AccountCredentials,
    pub proxy_id: Option<ProxyId>,
    pub priority: i32,
    pub concurrency_limit: i32,
    pub status: AccountStatus,
    pub error_message: Option<String>,
    pub schedulable: bool,
    pub rate_limited_at: Option<DateTime<Utc>>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub overload_until: Option<DateTime<Utc>>,
    pub temp_unschedulable_until: Option<DateTime<Utc>>,
    pub temp_unschedulable_reason: Option<String>,
    pub session_window_start: Option<DateTime<Utc>>,
    pub session_window_end: Option<DateTime<Utc>>,
    pub session_window_status: Option<SessionWindowStatus>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// An account is only schedulable while active and outside every
    /// cooldown window it currently carries.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        if self.status != AccountStatus::Active || !self.schedulable {
            return false;
        }
        if self.rate_limit_reset_at.is_some_and(|t| t > now) {
            return false;
        }
        if self.overload_until.is_some_and(|t| t > now) {
            return false;
        }
        if self.temp_unschedulable_until.is_some_and(|t| t > now) {
            return false;
        }
        if self.session_window_status == Some(SessionWindowStatus::Active)
            && self.session_window_end.is_some_and(|t| t <= now)
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountGroup {
    pub id: GroupId,
    pub name: String,
    pub platform: Platform,
    pub rate_multiplier: f64,
    pub exclusive: bool,
    pub daily_cap_usd: Option<f64>,
    pub weekly_cap_usd: Option<f64>,
    pub monthly_cap_usd: Option<f64>,
}

/// Row of the accounts<->groups join, carrying the group-local priority used
/// by the fallback ranking step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountGroupMembership {
    pub group_priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    #[display("active")]
    Active,
    #[display("disabled")]
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub balance_usd: f64,
    pub concurrency_limit: i32,
    pub status: UserStatus,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub user_id: UserId,
    pub bound_group_id: Option<GroupId>,
    pub prefix: String,
    /// SHA-256 hash of the full token; the plaintext token is never stored.
    pub token_hash: String,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingType {
    #[display("balance")]
    Balance,
    #[display("subscription")]
    Subscription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSubscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub group_id: GroupId,
    pub expires_at: DateTime<Utc>,
    pub daily_cap_usd: f64,
    pub weekly_cap_usd: f64,
    pub monthly_cap_usd: f64,
    pub daily_used_usd: f64,
    pub weekly_used_usd: f64,
    pub monthly_used_usd: f64,
    pub daily_anchor: DateTime<Utc>,
    pub weekly_anchor: DateTime<Utc>,
    pub monthly_anchor: DateTime<Utc>,
}

impl UserSubscription {
    /// True when every one of the three rolling windows still has room for
    /// an additional charge of `cost`.
    pub fn has_capacity(&self, cost: f64) -> bool {
        self.daily_used_usd + cost <= self.daily_cap_usd
            && self.weekly_used_usd + cost <= self.weekly_cap_usd
            && self.monthly_used_usd + cost <= self.monthly_cap_usd
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_creation_5m_tokens: i64,
    pub cache_creation_1h_tokens: i64,
    pub cache_read_tokens: i64,
}

/// What the proxy engine hands the billing pipeline once a request
/// completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageDraft {
    pub request_id: RequestId,
    pub api_key_id: ApiKeyId,
    pub user_id: UserId,
    pub account_id: AccountId,
    pub model: String,
    pub group_id: Option<GroupId>,
    pub usage: TokenUsage,
    pub stream: bool,
    pub duration_ms: i64,
    pub first_token_ms: Option<i64>,
    pub rate_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLog {
    pub id: UsageLogId,
    pub request_id: RequestId,
    pub api_key_id: ApiKeyId,
    pub account_id: AccountId,
    pub model: String,
    pub group_id: Option<GroupId>,
    pub subscription_id: Option<SubscriptionId>,
    pub usage: TokenUsage,
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_creation_cost: f64,
    pub cache_read_cost: f64,
    pub total_cost: f64,
    pub actual_cost: f64,
    pub billing_type: BillingType,
    pub stream: bool,
    pub duration_ms: i64,
    pub first_token_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingUsageEntry {
    pub usage_log_id: UsageLogId,
    pub user_id: UserId,
    pub api_key_id: ApiKeyId,
    pub subscription_id: Option<SubscriptionId>,
    pub billing_type: BillingType,
    pub applied: bool,
    pub delta_usd: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceTableEntry {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_creation_5m: f64,
    pub cache_creation_1h: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub id: ProxyId,
    pub name: String,
    pub url: String,
}

/// A point-in-time, typed view over the mutable settings table (rate
/// refresh interval, jitter bounds, pricing source url, etc). Rebuilt
/// whenever the underlying row set changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    pub values: HashMap<String, serde_json::Value>,
}

impl SettingsSnapshot {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_str())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(|v| v.as_u64())
    }
}
